//! Audit trail for memoization and lock events
//!
//! One JSON object per line in the state directory's `audit.log`:
//! `memo.hit`, `memo.replayed`, `memo.computed` and `memo.failed` from the
//! runner, `lock.acquired` and `lock.stolen` from lock workers.

use crate::config::{schema::Config, ConfigManager};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Serialize)]
struct Entry<'a> {
    timestamp: DateTime<Utc>,
    event: &'a str,
    data: &'a Value,
}

/// Appends audit events to a file, or drops them when disabled
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Audit log at the default location, if `general.audit_log` is on
    pub fn new(config: &Config) -> Self {
        Self {
            path: config
                .general
                .audit_log
                .then(ConfigManager::audit_log_path),
        }
    }

    /// Audit log writing to an explicit file
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one event
    ///
    /// IO failures are logged and the event is dropped; the caller's work
    /// carries on.
    pub async fn log(&self, event: &str, data: &Value) {
        let Some(path) = &self.path else {
            return;
        };

        let entry = Entry {
            timestamp: Utc::now(),
            event,
            data,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line + "\n",
            Err(e) => {
                warn!("Dropping audit event {}: {}", event, e);
                return;
            }
        };

        if let Err(e) = append(path, &line).await {
            warn!("Dropping audit event {} ({}): {}", event, path.display(), e);
        }
    }
}

async fn append(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}
