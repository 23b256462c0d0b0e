//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager, LOCAL_CONFIG_FILE};
use crate::error::{KilnError, KilnResult};
use crate::ui::{self, UiContext};
use std::path::Path;
use std::process::ExitCode;
use tokio::fs;

/// Keys accepted by `config set`
const KEYS: &[&str] = &[
    "general.log_format",
    "general.audit_log",
    "engine.default_module",
    "engine.max_parallel",
    "store.path",
    "cache.enabled",
    "cache.path",
    "cache.max_entries",
    "cache.max_total_mb",
    "cache.gc_days",
    "services.grace_period_secs",
    "services.health_max_attempts",
    "services.health_interval_ms",
    "services.health_max_interval_ms",
    "services.health_timeout_ms",
    "secrets.timeout_secs",
    "secrets.vault.address",
    "secrets.vault.token_env",
    "secrets.vault.namespace",
    "secrets.aws.profile",
    "secrets.aws.region",
    "secrets.gcp.project",
    "runtime.podman",
    "runtime.name_prefix",
    "runtime.cap_drop",
    "runtime.security_opt",
    "runtime.pids_limit",
    "debug.on_failure",
    "debug.shell",
];

/// Keys that hold comma-separated lists
const LIST_KEYS: &[&str] = &["runtime.cap_drop", "runtime.security_opt"];

pub async fn execute(
    args: ConfigArgs,
    manager: &ConfigManager,
    config: &Config,
) -> KilnResult<ExitCode> {
    let ctx = UiContext::detect();

    match args.action {
        None | Some(ConfigAction::Show) => println!("{}", toml::to_string_pretty(config)?),
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(&ctx, manager, force).await?,
        Some(ConfigAction::Set { key, value, local }) => {
            if !KEYS.contains(&key.as_str()) {
                ui::step_error_detail(&ctx, "Unknown config key", &key);
                for known in KEYS {
                    eprintln!("  {}", known);
                }
                return Ok(ExitCode::FAILURE);
            }
            let path = if local {
                std::env::current_dir()
                    .map_err(|e| KilnError::io("getting current directory", e))?
                    .join(LOCAL_CONFIG_FILE)
            } else {
                manager.path().to_path_buf()
            };
            set_in_file(&path, &key, &value).await?;
            ui::step_ok(&ctx, &format!("Set {} = {} in {}", key, value, path.display()));
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn init_config(ctx: &UiContext, manager: &ConfigManager, force: bool) -> KilnResult<()> {
    let path = manager.path();
    if path.exists() && !force {
        ui::step_warn_hint(
            ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(ctx, "Configuration initialized", &path.display().to_string());
    Ok(())
}

/// Set one key in a config file, keeping every other key as written
///
/// The result must still parse as a [`Config`]; a value of the wrong type
/// is rejected before anything is written.
async fn set_in_file(path: &Path, key: &str, value: &str) -> KilnResult<()> {
    let mut table = if path.exists() {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?;
        content
            .parse::<toml::Table>()
            .map_err(|e| KilnError::ConfigInvalid {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
    } else {
        toml::Table::new()
    };

    set_key(&mut table, key, parse_value(key, value))?;
    toml::Value::Table(table.clone())
        .try_into::<Config>()
        .map_err(|e| KilnError::User(format!("Invalid value for {}: {}", key, e)))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| KilnError::io(format!("creating {}", parent.display()), e))?;
    }
    fs::write(path, toml::to_string_pretty(&table)?)
        .await
        .map_err(|e| KilnError::io(format!("writing {}", path.display()), e))
}

fn parse_value(key: &str, value: &str) -> toml::Value {
    if LIST_KEYS.contains(&key) {
        return toml::Value::Array(
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_string()))
                .collect(),
        );
    }
    match value {
        "true" => toml::Value::Boolean(true),
        "false" => toml::Value::Boolean(false),
        _ => value
            .parse::<i64>()
            .map(toml::Value::Integer)
            .unwrap_or_else(|_| toml::Value::String(value.to_string())),
    }
}

/// Insert at a dotted path, creating intermediate tables
fn set_key(table: &mut toml::Table, key: &str, value: toml::Value) -> KilnResult<()> {
    let (parents, leaf) = match key.rsplit_once('.') {
        Some((parents, leaf)) => (parents.split('.').collect::<Vec<_>>(), leaf),
        None => (Vec::new(), key),
    };

    let mut current = table;
    for part in parents {
        current = current
            .entry(part)
            .or_insert_with(|| toml::Value::Table(toml::Table::new()))
            .as_table_mut()
            .ok_or_else(|| KilnError::User(format!("{} is not a table", part)))?;
    }
    current.insert(leaf.to_string(), value);
    Ok(())
}
