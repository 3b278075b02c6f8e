//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{MemoError, MemoResult};
use crate::config::schema::ShimKind;
use crate::memo::OrphanPolicy;
use crate::ui::{self, UiContext};
use std::path::PathBuf;

/// Keys accepted by `config set`
const VALID_KEYS: [&str; 16] = [
    "general.log_format",
    "general.audit_log",
    "store.root",
    "memo.root",
    "memo.pipeline_id",
    "memo.negative_cache_ttl_secs",
    "memo.orphan_policy",
    "memo.lock_invocations",
    "memo.lock_wait_secs",
    "lock.expire_secs",
    "lock.acquire_margin_secs",
    "lock.poll_interval_ms",
    "lock.max_poll_interval_ms",
    "shim.kind",
    "shim.program",
    "shim.args",
];

/// Execute the config command
pub async fn execute(args: ConfigArgs, config: &Config, manager: &ConfigManager) -> MemoResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => set_value(manager, config, &key, &value).await?,
    }

    Ok(())
}

fn show_config(config: &Config) -> MemoResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> MemoResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(&ctx, "Configuration initialized", &path.display().to_string());

    Ok(())
}

async fn set_value(
    manager: &ConfigManager,
    config: &Config,
    key: &str,
    value: &str,
) -> MemoResult<()> {
    let ctx = UiContext::detect();
    let mut config = config.clone();
    apply(&mut config, key, value)?;

    // Reject combinations the lock would refuse at runtime
    crate::runner::lock_options(&config).validate()?;

    manager.save(&config).await?;
    ui::step_ok(&ctx, &format!("Set {} = {}", key, value));

    Ok(())
}

/// Set one dot-separated key on `config`
fn apply(config: &mut Config, key: &str, value: &str) -> MemoResult<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["general", "log_format"] => match value {
            "text" | "json" => config.general.log_format = value.to_string(),
            _ => return Err(MemoError::User(format!("Invalid log format: {}. Use text/json", value))),
        },
        ["general", "audit_log"] => config.general.audit_log = parse_bool(value)?,

        ["store", "root"] => config.store.root = Some(PathBuf::from(value)),

        ["memo", "root"] => config.memo.root = value.to_string(),
        ["memo", "pipeline_id"] => config.memo.pipeline_id = value.to_string(),
        ["memo", "negative_cache_ttl_secs"] => config.memo.negative_cache_ttl_secs = parse_u64(value)?,
        ["memo", "orphan_policy"] => {
            config.memo.orphan_policy = match value {
                "recompute" => OrphanPolicy::Recompute,
                "warn" => OrphanPolicy::Warn,
                "fail" => OrphanPolicy::Fail,
                _ => {
                    return Err(MemoError::User(format!(
                        "Invalid orphan policy: {}. Use recompute/warn/fail",
                        value
                    )))
                }
            }
        }
        ["memo", "lock_invocations"] => config.memo.lock_invocations = parse_bool(value)?,
        ["memo", "lock_wait_secs"] => config.memo.lock_wait_secs = parse_u64(value)?,

        ["lock", "expire_secs"] => config.lock.expire_secs = parse_f64(value)?,
        ["lock", "acquire_margin_secs"] => config.lock.acquire_margin_secs = parse_f64(value)?,
        ["lock", "poll_interval_ms"] => config.lock.poll_interval_ms = parse_u64(value)?,
        ["lock", "max_poll_interval_ms"] => config.lock.max_poll_interval_ms = parse_u64(value)?,

        ["shim", "kind"] => {
            config.shim.kind = match value {
                "thread" => ShimKind::Thread,
                "subprocess" => ShimKind::Subprocess,
                _ => {
                    return Err(MemoError::User(format!(
                        "Invalid shim kind: {}. Use thread/subprocess",
                        value
                    )))
                }
            }
        }
        ["shim", "program"] => config.shim.program = Some(PathBuf::from(value)),
        ["shim", "args"] => {
            config.shim.args = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        _ => {
            return Err(MemoError::User(format!(
                "Unknown config key: {}. Valid keys: {}",
                key,
                VALID_KEYS.join(", ")
            )))
        }
    }

    Ok(())
}

fn parse_bool(value: &str) -> MemoResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(MemoError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}

fn parse_u64(value: &str) -> MemoResult<u64> {
    value
        .parse()
        .map_err(|_| MemoError::User(format!("Invalid number: {}", value)))
}

fn parse_f64(value: &str) -> MemoResult<f64> {
    value
        .parse()
        .map_err(|_| MemoError::User(format!("Invalid number: {}", value)))
}
