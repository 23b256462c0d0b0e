//! Status command - runtime health and engine state

use super::cache::open_cache;
use crate::audit::{AuditEvent, AuditLog};
use crate::cache::{format_bytes, CacheSizeStatus};
use crate::config::{Config, ConfigManager};
use crate::error::KilnResult;
use crate::runtime::{create_runtime, Platform};
use crate::session::Session;
use crate::ui::{self, UiContext};
use std::process::ExitCode;

const RECENT_EVENTS: usize = 5;

pub async fn execute(config: &Config) -> KilnResult<ExitCode> {
    let ctx = UiContext::detect();
    ui::intro(&ctx, "Kiln status");

    let mut all_ok = true;
    let platform = Platform::detect();
    ui::section(&ctx, "Runtime");
    ui::key_value(&ctx, "platform", platform.name());
    match create_runtime(config, ConfigManager::scratch_dir()) {
        Ok(runtime) => match runtime.is_available().await {
            Ok(true) => ui::step_ok(&ctx, &format!("{} available", runtime.runtime_name())),
            Ok(false) => {
                all_ok = false;
                ui::step_warn_hint(
                    &ctx,
                    &format!("{} not found", runtime.runtime_name()),
                    "Install Podman: https://podman.io/docs/installation",
                );
            }
            Err(e) => {
                all_ok = false;
                ui::step_error_detail(&ctx, "Runtime check failed", &e.to_string());
            }
        },
        Err(e) => {
            all_ok = false;
            ui::step_error_detail(&ctx, "No runtime", &e.to_string());
        }
    }

    ui::section(&ctx, "Storage");
    ui::key_value(&ctx, "state", &ConfigManager::state_dir().display().to_string());
    ConfigManager::ensure_state_dirs(config).await?;
    let (store, cache) = open_cache(config).await?;
    let usage = store.usage().await?;
    ui::key_value(
        &ctx,
        "store",
        &format!("{} objects, {}", usage.objects, format_bytes(usage.bytes)),
    );
    let stats = cache.stats();
    let limit = cache.limits().max_total_bytes;
    ui::key_value_status(
        &ctx,
        "cache",
        &format!(
            "{} entries, {} ({:.0}% of limit){}",
            stats.entries,
            format_bytes(stats.total_bytes),
            CacheSizeStatus::percentage(stats.total_bytes, limit),
            if config.cache.enabled { "" } else { ", disabled" }
        ),
        CacheSizeStatus::from_usage(stats.total_bytes, limit) == CacheSizeStatus::Ok,
    );

    ui::section(&ctx, "Sessions");
    let sessions_dir = ConfigManager::sessions_dir();
    let sessions = if sessions_dir.is_dir() {
        Session::list_all(&sessions_dir).await?
    } else {
        Vec::new()
    };
    if sessions.is_empty() {
        ui::remark(&ctx, "No open sessions");
    }
    for session in &sessions {
        ui::key_value(
            &ctx,
            &session.name,
            &format!(
                "{:?} (pid {}, since {})",
                session.status,
                session.pid,
                session.created_at.format("%Y-%m-%d %H:%M")
            ),
        );
    }

    let recent = AuditLog::new(config).recent(RECENT_EVENTS).await;
    if !recent.is_empty() {
        ui::section(&ctx, "Recent audit events");
        for record in &recent {
            ui::key_value(
                &ctx,
                &record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                &describe(&record.event),
            );
        }
    }

    if all_ok {
        ui::outro_success(&ctx, "Ready");
    } else {
        ui::outro_error(&ctx, "Runtime unavailable; `kiln run` will fail");
    }
    Ok(ExitCode::SUCCESS)
}

fn describe(event: &AuditEvent) -> String {
    match event {
        AuditEvent::SecretResolved { scheme, digest } => {
            format!("resolved {}:// secret ({})", scheme, digest)
        }
        AuditEvent::ServiceStarted { operation, hostname, .. } => {
            format!("started {} as {}", operation, hostname)
        }
        AuditEvent::ServiceStopped { operation, hostname, .. } => {
            format!("stopped {} ({})", operation, hostname)
        }
        AuditEvent::DebugAttached { operation, reason } => {
            format!("suspended {}: {}", operation, reason)
        }
        AuditEvent::DebugAnswered { operation, resumed } => format!(
            "{} {}",
            if *resumed { "resumed" } else { "aborted" },
            operation
        ),
        AuditEvent::CacheCorrupt { fingerprint, .. } => {
            format!("dropped corrupt cache entry {}", &fingerprint[..12.min(fingerprint.len())])
        }
    }
}
