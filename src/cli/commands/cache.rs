//! Cache command - inspect and maintain the operation cache

use crate::cache::{format_bytes, mb_to_bytes, CacheLimits, CacheSizeStatus, OperationCache};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::KilnResult;
use crate::store::ContentStore;
use crate::ui::{self, TaskSpinner, UiContext};
use serde_json::json;
use std::process::ExitCode;
use std::sync::Arc;

pub async fn execute(args: CacheArgs, config: &Config) -> KilnResult<ExitCode> {
    let ctx = UiContext::detect();
    ConfigManager::ensure_state_dirs(config).await?;
    let (store, cache) = open_cache(config).await?;

    match args.action {
        CacheAction::Stats { format } => stats(&ctx, config, &store, &cache, format).await?,
        CacheAction::Gc { days } => {
            let days = days.unwrap_or(config.cache.gc_days);
            let removed = cache.gc(days).await?;
            if removed == 0 {
                ui::step_ok(&ctx, &format!("No entries older than {} days", days));
            } else {
                ui::step_ok(&ctx, &format!("Removed {} entries older than {} days", removed, days));
            }
        }
        CacheAction::Verify => {
            let mut spinner = TaskSpinner::new(&ctx);
            spinner.start("Verifying cached results...");
            let (checked, removed) = cache.verify_all().await?;
            if removed == 0 {
                spinner.stop(&format!("{} entries verified", checked));
            } else {
                spinner.stop_error(&format!(
                    "{} of {} entries were corrupt and have been removed",
                    removed, checked
                ));
            }
        }
        CacheAction::Clear { yes } => {
            let ctx = ctx.with_auto_yes(yes);
            let entries = cache.stats().entries;
            if entries == 0 {
                ui::step_ok(&ctx, "Cache is already empty");
            } else if ui::confirm(&ctx, &format!("Remove all {} cache entries?", entries), false).await? {
                let removed = cache.clear().await?;
                ui::step_ok(&ctx, &format!("Removed {} entries", removed));
            } else {
                ui::step_warn_hint(&ctx, "Nothing removed", "Pass --yes to skip the prompt");
            }
        }
    }

    cache.flush().await?;
    Ok(ExitCode::SUCCESS)
}

/// Open the store and cache configured for this machine
pub(crate) async fn open_cache(config: &Config) -> KilnResult<(Arc<ContentStore>, OperationCache)> {
    let store = Arc::new(ContentStore::open(ConfigManager::store_dir(config)).await?);
    let limits = CacheLimits {
        max_entries: config.cache.max_entries,
        max_total_bytes: mb_to_bytes(config.cache.max_total_mb),
    };
    let cache = OperationCache::open(ConfigManager::cache_dir(config), limits, store.clone()).await?;
    Ok((store, cache))
}

async fn stats(
    ctx: &UiContext,
    config: &Config,
    store: &ContentStore,
    cache: &OperationCache,
    format: OutputFormat,
) -> KilnResult<()> {
    let stats = cache.stats();
    let usage = store.usage().await?;
    let limits = cache.limits();
    let status = CacheSizeStatus::from_usage(stats.total_bytes, limits.max_total_bytes);

    match format {
        OutputFormat::Json => {
            let report = json!({
                "enabled": config.cache.enabled,
                "entries": stats.entries,
                "cached_bytes": stats.total_bytes,
                "max_entries": limits.max_entries,
                "max_total_bytes": limits.max_total_bytes,
                "store_objects": usage.objects,
                "store_bytes": usage.bytes,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Plain => {
            println!("entries\t{}", stats.entries);
            println!("cached_bytes\t{}", stats.total_bytes);
            println!("store_objects\t{}", usage.objects);
            println!("store_bytes\t{}", usage.bytes);
        }
        OutputFormat::Table => {
            ui::section(ctx, "Operation cache");
            ui::key_value(
                ctx,
                "entries",
                &format!("{} (max {})", stats.entries, limits.max_entries),
            );
            ui::key_value_status(
                ctx,
                "size",
                &format!(
                    "{} of {} ({:.0}%)",
                    format_bytes(stats.total_bytes),
                    format_bytes(limits.max_total_bytes),
                    CacheSizeStatus::percentage(stats.total_bytes, limits.max_total_bytes)
                ),
                status == CacheSizeStatus::Ok,
            );
            if !config.cache.enabled {
                ui::step_warn_hint(ctx, "Cache is disabled", "Set cache.enabled = true");
            }
            ui::section(ctx, "Content store");
            ui::key_value(ctx, "objects", &usage.objects.to_string());
            ui::key_value(ctx, "size", &format_bytes(usage.bytes));
        }
    }
    Ok(())
}
