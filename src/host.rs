//! Identity of the current process, recorded in control files and lock records

use std::sync::OnceLock;

/// Hostname of this machine, or `unknown-host` when it cannot be read
pub fn hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        ::hostname::get()
            .map(|h| h.to_string_lossy().trim().to_string())
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown-host".to_string())
    })
}

/// `host:pid` of the current process
pub fn writer_identity() -> String {
    format!("{}:{}", hostname(), std::process::id())
}
