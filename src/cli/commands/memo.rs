//! Memo command - inspect and manage memoized results

use crate::cli::args::{MemoAction, MemoArgs};
use crate::cli::commands::open_store;
use crate::config::{Config, ConfigManager};
use crate::error::MemoResult;
use crate::memo::control::names;
use crate::memo::{ControlFiles, ControlRecord, Invocation, NegativeCache};
use crate::store::{read_optional, BlobStore, BlobUri};
use crate::ui::{self, UiContext};
use console::style;
use std::sync::Arc;

/// Execute the memo command
pub async fn execute(args: MemoArgs, config: &Config) -> MemoResult<()> {
    let store = open_store(config).await?;

    match args.action {
        MemoAction::Inspect { address, payload } => {
            inspect(store, &address.parse()?, payload).await
        }
        MemoAction::Invalidate { address } => invalidate(store, config, &address.parse()?).await,
        MemoAction::List { prefix } => {
            let prefix = prefix.unwrap_or_else(|| config.memo.root.clone());
            list(store, &prefix.parse()?).await
        }
        MemoAction::ClearNegative => clear_negative(config).await,
    }
}

async fn inspect(store: Arc<dyn BlobStore>, address: &BlobUri, show_payload: bool) -> MemoResult<()> {
    let ctx = UiContext::detect();
    ui::section(&ctx, &format!("Memospace {}", address));

    let invocation_uri = address.child(names::INVOCATION)?;
    match read_optional(store.as_ref(), &invocation_uri).await? {
        Some(data) => {
            let invocation: Invocation = serde_json::from_slice(&data)?;
            ui::key_value(&ctx, names::INVOCATION, "present");
            ui::key_value(&ctx, "invoked_at", &invocation.invoked_at.to_rfc3339());
            ui::key_value(&ctx, "invoked_by", &invocation.writer);
            ui::key_value(&ctx, "args", &serde_json::to_string(&invocation.args)?);
        }
        None => ui::key_value(&ctx, names::INVOCATION, "absent"),
    }

    let mut terminal = false;
    for name in [names::RESULT, names::EXCEPTION] {
        let uri = address.child(name)?;
        let Some(data) = read_optional(store.as_ref(), &uri).await? else {
            continue;
        };
        terminal = true;

        let record = ControlRecord::decode(&uri, data)?;
        ui::key_value_status(&ctx, name, "present", name == names::RESULT);
        ui::key_value(&ctx, "written_at", &record.header.written_at.to_rfc3339());
        ui::key_value(&ctx, "writer", &record.header.writer);
        ui::key_value(
            &ctx,
            "function",
            &format!("{}@{}", record.header.function, record.header.logic_key),
        );
        ui::key_value(&ctx, "crate_version", &record.header.crate_version);
        ui::key_value(&ctx, "payload_bytes", &record.payload.len().to_string());

        if show_payload {
            println!("{}", String::from_utf8_lossy(&record.payload));
        }
    }

    if !terminal {
        ui::step_warn(&ctx, "No result or exception recorded");
    }
    Ok(())
}

async fn invalidate(store: Arc<dyn BlobStore>, config: &Config, address: &BlobUri) -> MemoResult<()> {
    let ctx = UiContext::detect();
    let control = ControlFiles::new(store, negative_cache(config));
    control.invalidate(address).await?;

    ui::step_ok(&ctx, &format!("Invalidated {}", address));
    Ok(())
}

async fn list(store: Arc<dyn BlobStore>, prefix: &BlobUri) -> MemoResult<()> {
    let children = store.list_children(prefix).await?;

    if children.is_empty() {
        let ctx = UiContext::detect();
        ui::step_info(&ctx, &format!("Nothing under {}", prefix));
        return Ok(());
    }

    for child in children {
        if store.exists(&child).await? {
            println!("{}", child);
        } else {
            println!("{}/", style(child).bold());
        }
    }
    Ok(())
}

async fn clear_negative(config: &Config) -> MemoResult<()> {
    let ctx = UiContext::detect();
    negative_cache(config).clear().await?;
    ui::step_ok(&ctx, "Negative cache cleared");
    Ok(())
}

fn negative_cache(config: &Config) -> NegativeCache {
    NegativeCache::new(
        ConfigManager::negative_cache_dir(config),
        std::time::Duration::from_secs(config.memo.negative_cache_ttl_secs),
    )
}
