//! Validate command - check a graph without running it

use crate::cli::args::ValidateArgs;
use crate::error::KilnResult;
use crate::graph::{Graph, OpKind};
use crate::ui::{self, UiContext};
use std::process::ExitCode;

pub async fn execute(args: ValidateArgs) -> KilnResult<ExitCode> {
    let ctx = UiContext::detect();
    let graph = Graph::load(&args.graph)?;
    let plan = graph.validate()?;

    let services = graph
        .operations
        .iter()
        .filter(|op| matches!(op.kind, OpKind::Service(_)))
        .count();
    ui::step_ok_detail(
        &ctx,
        &format!("{} is valid", args.graph.display()),
        &format!(
            "{} operations, {} services, {} roots",
            plan.order.len(),
            services,
            graph.roots.len()
        ),
    );
    for group in plan.service_groups.iter().filter(|g| g.members.len() > 1) {
        let members: Vec<&str> = group.members.iter().map(|m| m.as_str()).collect();
        ui::remark(&ctx, &format!("services started together: {}", members.join(", ")));
    }
    Ok(ExitCode::SUCCESS)
}
