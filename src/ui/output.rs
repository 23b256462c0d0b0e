//! Status lines for the CLI

use super::context::UiContext;
use console::{style, Style};

/// Route a message to cliclack or a plain line; nothing in quiet mode
fn emit(ctx: &UiContext, fancy: impl FnOnce() -> std::io::Result<()>, plain: impl FnOnce()) {
    if ctx.is_quiet() {
        return;
    }
    if ctx.use_fancy_output() {
        // A broken terminal is not worth failing a build over
        let _ = fancy();
    } else {
        plain();
    }
}

pub fn intro(ctx: &UiContext, title: &str) {
    emit(
        ctx,
        || cliclack::intro(style(title).yellow().bold()),
        || println!("{}\n", style(title).yellow().bold()),
    );
}

pub fn outro_success(ctx: &UiContext, message: &str) {
    emit(
        ctx,
        || cliclack::outro(style(message).green().bold()),
        || println!("\n{} {}", style("[OK]").green(), message),
    );
}

pub fn outro_error(ctx: &UiContext, message: &str) {
    emit(
        ctx,
        || cliclack::outro(style(message).red().bold()),
        || println!("\n{} {}", style("[ERROR]").red(), message),
    );
}

/// A boxed block of text, e.g. captured output of a failed node
pub fn note(ctx: &UiContext, title: &str, message: &str) {
    emit(
        ctx,
        || cliclack::note(title, message),
        || println!("{}:\n{}", style(title).bold(), message),
    );
}

pub fn section(ctx: &UiContext, title: &str) {
    emit(
        ctx,
        || cliclack::log::info(style(title).bold()),
        || println!("\n{}", style(title).bold()),
    );
}

pub fn step_ok(ctx: &UiContext, message: &str) {
    emit(
        ctx,
        || cliclack::log::success(message),
        || println!("  {} {}", style("[OK]").green(), message),
    );
}

pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    emit(
        ctx,
        || cliclack::log::success(format!("{} ({})", message, style(detail).dim())),
        || println!("  {} {} ({})", style("[OK]").green(), message, detail),
    );
}

pub fn step_warn(ctx: &UiContext, message: &str) {
    emit(
        ctx,
        || cliclack::log::warning(message),
        || println!("  {} {}", style("[WARN]").yellow(), message),
    );
}

pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    emit(
        ctx,
        || cliclack::log::warning(format!("{} - {}", message, style(hint).dim())),
        || println!("  {} {} - {}", style("[WARN]").yellow(), message, hint),
    );
}

pub fn step_error(ctx: &UiContext, message: &str) {
    emit(
        ctx,
        || cliclack::log::error(message),
        || println!("  {} {}", style("[FAIL]").red(), message),
    );
}

pub fn step_error_detail(ctx: &UiContext, message: &str, detail: &str) {
    emit(
        ctx,
        || cliclack::log::error(format!("{}: {}", message, style(detail).red())),
        || println!("  {} {}: {}", style("[FAIL]").red(), message, detail),
    );
}

pub fn step_info(ctx: &UiContext, message: &str) {
    emit(
        ctx,
        || cliclack::log::info(message),
        || println!("  {} {}", style("[INFO]").cyan(), message),
    );
}

pub fn remark(ctx: &UiContext, message: &str) {
    emit(
        ctx,
        || cliclack::log::remark(message),
        || println!("  {}", style(message).dim()),
    );
}

pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.is_quiet() {
        return;
    }
    println!("  {}: {}", style(key).dim(), value);
}

pub fn key_value_status(ctx: &UiContext, key: &str, value: &str, ok: bool) {
    if ctx.is_quiet() {
        return;
    }
    if ctx.use_fancy_output() {
        let colour = if ok {
            Style::new().green()
        } else {
            Style::new().yellow()
        };
        println!("  {}: {}", style(key).dim(), colour.apply_to(value));
    } else {
        let prefix = if ok { "[OK]" } else { "[WARN]" };
        println!("  {} {}: {}", prefix, key, value);
    }
}
