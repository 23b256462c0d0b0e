//! Run command - evaluate a graph document

use crate::cli::args::{OutputFormat, RunArgs};
use crate::cli::debugger::ConsoleDebugger;
use crate::config::{Config, ConfigManager};
use crate::debug::DebugController;
use crate::engine::{Engine, EvaluationReport};
use crate::error::{KilnError, KilnResult};
use crate::graph::{Graph, OperationId};
use crate::runtime::create_runtime;
use crate::ui::{self, EvaluationProgress, TaskSpinner, UiContext};
use std::process::ExitCode;
use tracing::debug;

pub async fn execute(args: RunArgs, config: &Config) -> KilnResult<ExitCode> {
    let ctx = UiContext::detect().with_quiet(args.format == OutputFormat::Json);
    ui::init_theme();

    // Reject a bad document before touching the runtime
    let graph = Graph::load(&args.graph)?;
    graph.validate()?;
    let roots: Vec<OperationId> = args.roots.iter().map(OperationId::new).collect();
    for root in &roots {
        if graph.get(root).is_none() {
            return Err(KilnError::UnknownOperation(root.to_string()));
        }
    }

    ConfigManager::ensure_state_dirs(config).await?;
    let runtime = create_runtime(config, ConfigManager::scratch_dir())?;
    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Checking {}...", runtime.runtime_name()));
    if let Err(e) = runtime.ensure_ready().await {
        spinner.stop_error(&format!("{} is not ready", runtime.runtime_name()));
        return Err(e);
    }
    spinner.stop(&format!("{} ready", runtime.runtime_name()));

    let engine = Engine::open(config.clone(), runtime.clone()).await?;
    let name = args.name.clone().unwrap_or_else(generate_session_name);
    let mut session = engine.session(&name).await?;
    debug!("Session {} ({})", name, session.id());

    let debugger = if args.debug {
        let (handle, controller) = DebugController::channel(engine.audit().clone());
        session = session.with_debugger(handle);
        let front = ConsoleDebugger::new(ctx.clone(), runtime.clone(), config.debug.shell.clone());
        Some(front.spawn(controller))
    } else {
        None
    };

    // The debugger owns the terminal while a node is suspended
    let requested = if roots.is_empty() {
        graph.roots.len()
    } else {
        roots.len()
    };
    let progress = (!args.debug).then(|| EvaluationProgress::start(&ctx, requested));
    let outcome = tokio::select! {
        result = session.evaluate(&graph, &roots) => result,
        _ = tokio::signal::ctrl_c() => Err(KilnError::Cancelled),
    };
    if let Some(progress) = &progress {
        progress.finish();
    }

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            session.close().await?;
            engine.close().await?;
            return Err(e);
        }
    };

    print_report(&ctx, args.format, &report)?;

    let services: Vec<_> = report
        .succeeded()
        .filter_map(|(root, out)| out.service().map(|s| (root.clone(), s.clone())))
        .collect();
    if !services.is_empty() && report.is_success() {
        for (root, endpoint) in &services {
            for port in &endpoint.ports {
                ui::step_info(
                    &ctx,
                    &format!("{} port {} at {}", root, port.service_port, port.host),
                );
            }
        }
        ui::remark(&ctx, "Services are running; press Ctrl-C to stop");
        let _ = tokio::signal::ctrl_c().await;
    }
    // Endpoints hold their services; release them before closing
    let success = report.is_success();
    drop(services);
    drop(report);
    session.close().await?;
    engine.close().await?;
    if let Some(debugger) = debugger {
        if let Ok(inspected) = debugger.await {
            debug!("Inspected {} suspended node(s)", inspected);
        }
    }

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(ctx: &UiContext, format: OutputFormat, report: &EvaluationReport) -> KilnResult<()> {
    let summary = report.summary();
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Plain => {
            for line in &summary {
                let detail = line
                    .result
                    .as_deref()
                    .or(line.origin.as_deref())
                    .unwrap_or("-");
                println!("{}\t{}\t{}", line.root, line.status, detail);
            }
        }
        OutputFormat::Table => {
            let width = summary.iter().map(|l| l.root.len()).max().unwrap_or(4).max(4);
            println!();
            println!("{:<width$}  {:<6}  {}", "ROOT", "STATUS", "RESULT", width = width);
            for line in &summary {
                let status =
                    ui::status_style(line.status == "ok").apply_to(format!("{:<6}", line.status));
                let detail = match (&line.result, &line.origin) {
                    (Some(result), _) => result.clone(),
                    (None, Some(origin)) => format!("failed at {}", origin),
                    (None, None) => "-".to_string(),
                };
                println!("{:<width$}  {}  {}", line.root, status, detail, width = width);
            }
            println!();

            // One note per failing node, not per affected root
            let mut shown: Vec<&OperationId> = Vec::new();
            for (_, failure) in report.failed() {
                if shown.contains(&&failure.origin) {
                    continue;
                }
                shown.push(&failure.origin);
                ui::note(ctx, failure.origin.as_str(), &failure.error.to_string());
            }
            if report.is_success() {
                ui::outro_success(ctx, "Evaluation complete");
            } else {
                ui::outro_error(
                    ctx,
                    &format!("{} of {} roots failed", report.failed().count(), report.roots.len()),
                );
            }
        }
    }
    Ok(())
}

fn generate_session_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("run-{}", &id[..8])
}
