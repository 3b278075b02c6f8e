//! Lock command - stress, verify and inspect lease locks

use crate::audit::AuditLog;
use crate::cli::args::{LeaseArgs, LockAction, LockArgs};
use crate::cli::commands::open_store;
use crate::config::{Config, ConfigManager};
use crate::error::{MemoError, MemoResult};
use crate::host;
use crate::lock::{acquire, epoch_now, read_lock_record, LockOptions, LockRecord};
use crate::runner::{lock_options, output_tail};
use crate::store::BlobUri;
use crate::ui::{self, StressProgress, TaskSpinner, UiContext};
use chrono::DateTime;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Suffix of per-worker window files
const WINDOW_EXT: &str = "jsonl";

/// One exclusive hold as observed by its worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub worker: String,
    pub acquired_at: f64,
    pub released_at: f64,
}

/// Execute the lock command
pub async fn execute(args: LockArgs, config: &Config) -> MemoResult<()> {
    match args.action {
        LockAction::Stress {
            processes,
            duration_secs,
            hold_ms,
            out,
            lock,
            lease,
        } => stress(config, processes, duration_secs, hold_ms, &out, &lock, &lease).await,
        LockAction::Worker {
            lock,
            duration_secs,
            hold_ms,
            output,
            lease,
        } => worker(config, &lock, duration_secs, hold_ms, &output, &lease).await,
        LockAction::Verify { dir } => verify(&dir).await,
        LockAction::Show { address } => show(config, &address).await,
    }
}

/// Lease options from config with command-line overrides
fn lease_options(config: &Config, lease: &LeaseArgs) -> MemoResult<LockOptions> {
    let mut options = lock_options(config);
    if let Some(expire) = lease.expire_secs {
        options.expire_secs = expire;
    }
    if let Some(margin) = lease.margin_secs {
        options.acquire_margin_secs = margin;
    }
    options.validate()?;
    Ok(options)
}

async fn stress(
    config: &Config,
    processes: usize,
    duration_secs: u64,
    hold_ms: u64,
    out: &Path,
    lock: &str,
    lease: &LeaseArgs,
) -> MemoResult<()> {
    let ctx = UiContext::detect();
    if processes == 0 {
        return Err(MemoError::User("--processes must be at least 1".to_string()));
    }
    let options = lease_options(config, lease)?;
    let address: BlobUri = lock.parse()?;

    fs::create_dir_all(out)
        .await
        .map_err(|e| MemoError::io(format!("creating {}", out.display()), e))?;
    for stale in window_files(out).await? {
        fs::remove_file(&stale)
            .await
            .map_err(|e| MemoError::io(format!("removing {}", stale.display()), e))?;
    }

    let exe = std::env::current_exe().map_err(|e| MemoError::io("locating current executable", e))?;
    let store_root = ConfigManager::store_root(config);

    ui::intro(&ctx, &format!("Lock stress on {}", address));
    ui::key_value(&ctx, "store", &store_root.display().to_string());
    ui::key_value(
        &ctx,
        "lease",
        &format!(
            "expire {}s, margin {}s, hold {}ms",
            options.expire_secs, options.acquire_margin_secs, hold_ms
        ),
    );

    let mut children = Vec::with_capacity(processes);
    for i in 0..processes {
        let output = out.join(format!("worker-{}.{}", i, WINDOW_EXT));
        let child = Command::new(&exe)
            .arg("--store-root")
            .arg(&store_root)
            .args(["lock", "worker", "--lock", lock])
            .arg("--duration-secs")
            .arg(duration_secs.to_string())
            .arg("--hold-ms")
            .arg(hold_ms.to_string())
            .arg("--output")
            .arg(&output)
            .arg("--expire-secs")
            .arg(options.expire_secs.to_string())
            .arg("--margin-secs")
            .arg(options.acquire_margin_secs.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MemoError::command_failed(format!("{} lock worker", exe.display()), e))?;
        debug!("Spawned lock worker {} (pid {:?})", i, child.id());
        children.push(child);
    }

    let progress = StressProgress::new(&ctx, processes, Duration::from_secs(duration_secs));
    let started = Instant::now();
    let outputs = join_all(children.into_iter().map(|c| c.wait_with_output()));
    tokio::pin!(outputs);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));

    let outputs = loop {
        tokio::select! {
            outputs = &mut outputs => break outputs,
            _ = ticker.tick() => progress.update(started.elapsed()),
        }
    };
    progress.finish();

    let mut failures = Vec::new();
    for (i, output) in outputs.into_iter().enumerate() {
        let output = output.map_err(|e| MemoError::io(format!("waiting for worker {}", i), e))?;
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            failures.push(format!(
                "worker {} exited with {}\n{}",
                i,
                output.status,
                output_tail(&stdout, &stderr)
            ));
        }
    }
    if !failures.is_empty() {
        for failure in &failures {
            ui::step_error(&ctx, failure);
        }
        return Err(MemoError::User(format!("{} of {} workers failed", failures.len(), processes)));
    }

    let windows = load_windows(out).await?;
    let mut per_worker: BTreeMap<&str, usize> = BTreeMap::new();
    for window in &windows {
        *per_worker.entry(window.worker.as_str()).or_default() += 1;
    }
    for (worker, count) in &per_worker {
        ui::key_value(&ctx, worker, &format!("{} acquisitions", count));
    }

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Checking {} windows for overlap", windows.len()));
    if let Err(e) = check_windows(windows) {
        spinner.stop_error("Overlapping windows found");
        return Err(e);
    }
    spinner.stop("Windows checked");

    ui::outro_success(&ctx, "No overlapping windows");
    Ok(())
}

async fn worker(
    config: &Config,
    lock: &str,
    duration_secs: u64,
    hold_ms: u64,
    output: &Path,
    lease: &LeaseArgs,
) -> MemoResult<()> {
    let options = lease_options(config, lease)?;
    let address: BlobUri = lock.parse()?;
    let store = open_store(config).await?;
    let audit = AuditLog::new(config);
    let worker_id = host::writer_identity();

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .await
        .map_err(|e| MemoError::io(format!("opening {}", output.display()), e))?;

    let deadline = Instant::now() + Duration::from_secs(duration_secs);
    let hold = Duration::from_millis(hold_ms);
    let mut acquisitions = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let attempt = options.clone().blocking(remaining);
        let Some(handle) = acquire(store.clone(), &address, &attempt).await? else {
            break;
        };
        let acquired_at = epoch_now();
        audit
            .log("lock.acquired", &json!({"address": lock, "writer_id": handle.writer_id()}))
            .await;

        sleep(hold).await;
        let held = handle.maintain().await;
        let released_at = epoch_now();
        handle.release().await?;

        let window = Window {
            worker: worker_id.clone(),
            acquired_at,
            released_at,
        };
        let mut line = serde_json::to_string(&window)?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| MemoError::io(format!("writing {}", output.display()), e))?;
        acquisitions += 1;

        if let Err(e) = held {
            if let MemoError::LockStolen { current, .. } = &e {
                audit
                    .log("lock.stolen", &json!({"address": lock, "current": current}))
                    .await;
            }
            return Err(e);
        }
    }

    file.flush()
        .await
        .map_err(|e| MemoError::io(format!("writing {}", output.display()), e))?;
    info!("Worker {} finished with {} acquisitions", worker_id, acquisitions);
    Ok(())
}

async fn verify(dir: &Path) -> MemoResult<()> {
    let ctx = UiContext::detect();
    let windows = load_windows(dir).await?;
    let count = windows.len();

    check_windows(windows)?;
    ui::step_ok(&ctx, &format!("{} windows, none overlapping", count));
    Ok(())
}

async fn show(config: &Config, address: &str) -> MemoResult<()> {
    let ctx = UiContext::detect();
    let address: BlobUri = address.parse()?;
    let store = open_store(config).await?;

    let Some(record) = read_lock_record(store.as_ref(), &address).await? else {
        ui::step_info(&ctx, &format!("No lock at {}", address));
        return Ok(());
    };

    let margin = config.lock.acquire_margin_secs;
    print_record(&ctx, &address, &record, record.is_available(epoch_now(), margin));
    Ok(())
}

fn print_record(ctx: &UiContext, address: &BlobUri, record: &LockRecord, available: bool) {
    ui::section(ctx, &format!("Lock {}", address));
    ui::key_value(ctx, "writer_id", &record.writer_id);
    if !record.writer_host.is_empty() {
        ui::key_value(ctx, "writer_host", &record.writer_host);
    }
    ui::key_value(ctx, "first_acquired_at", &format_epoch(record.first_acquired_at));
    ui::key_value(ctx, "last_written_at", &format_epoch(record.last_written_at));
    ui::key_value(ctx, "expire_s", &record.expire_s.to_string());
    ui::key_value(ctx, "write_count", &record.write_count.to_string());

    let status = match record.released_at {
        Some(at) => format!("released at {}", format_epoch(at)),
        None if available => "lapsed".to_string(),
        None => format!("held until {}", format_epoch(record.expires_at())),
    };
    ui::key_value_status(ctx, "status", &status, available);
}

fn format_epoch(secs: f64) -> String {
    DateTime::from_timestamp_micros((secs * 1_000_000.0) as i64)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

/// Window files in `dir`, sorted
async fn window_files(dir: &Path) -> MemoResult<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| MemoError::io(format!("reading {}", dir.display()), e))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| MemoError::io(format!("reading {}", dir.display()), e))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(WINDOW_EXT) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Every window recorded under `dir`
pub async fn load_windows(dir: &Path) -> MemoResult<Vec<Window>> {
    let mut windows = Vec::new();
    for path in window_files(dir).await? {
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| MemoError::io(format!("reading {}", path.display()), e))?;

        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let window: Window = serde_json::from_str(line).map_err(|e| {
                MemoError::User(format!("{}:{}: {}", path.display(), n + 1, e))
            })?;
            windows.push(window);
        }
    }

    if windows.is_empty() {
        warn!("No windows recorded under {}", dir.display());
    }
    Ok(windows)
}

/// First pair of windows whose holds overlap, if any
///
/// Windows are sorted by acquisition; each one is compared against the
/// latest release seen so far, so a long window overlapping a later short
/// one is still caught.
pub fn find_overlap(mut windows: Vec<Window>) -> Option<(Window, Window)> {
    windows.sort_by(|a, b| a.acquired_at.total_cmp(&b.acquired_at));

    let mut latest: Option<Window> = None;
    for window in windows {
        if let Some(ref held) = latest {
            if window.acquired_at < held.released_at {
                return Some((held.clone(), window));
            }
        }
        if latest.as_ref().map_or(true, |held| window.released_at > held.released_at) {
            latest = Some(window);
        }
    }
    None
}

fn check_windows(windows: Vec<Window>) -> MemoResult<()> {
    match find_overlap(windows) {
        None => Ok(()),
        Some((first, second)) => Err(MemoError::WindowsOverlap {
            first: describe(&first),
            second: describe(&second),
        }),
    }
}

fn describe(window: &Window) -> String {
    format!(
        "{} [{:.6}, {:.6}]",
        window.worker, window.acquired_at, window.released_at
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn window(worker: &str, acquired_at: f64, released_at: f64) -> Window {
        Window {
            worker: worker.to_string(),
            acquired_at,
            released_at,
        }
    }

    #[test]
    fn disjoint_windows_pass() {
        let windows = vec![
            window("b", 2.0, 3.0),
            window("a", 0.0, 1.0),
            window("c", 3.0, 4.0),
        ];
        assert!(find_overlap(windows).is_none());
    }

    #[test]
    fn adjacent_overlap_detected() {
        let windows = vec![window("a", 0.0, 1.5), window("b", 1.0, 2.0)];
        let (first, second) = find_overlap(windows).unwrap();
        assert_eq!(first.worker, "a");
        assert_eq!(second.worker, "b");
    }

    #[test]
    fn overlap_with_earlier_long_window_detected() {
        let windows = vec![
            window("long", 0.0, 10.0),
            window("short", 1.0, 2.0),
            window("late", 5.0, 6.0),
        ];
        let (first, _) = find_overlap(windows).unwrap();
        assert_eq!(first.worker, "long");
    }

    #[tokio::test]
    async fn load_windows_reads_all_files() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("worker-0.jsonl"),
            "{\"worker\":\"a\",\"acquired_at\":0.0,\"released_at\":1.0}\n\n",
        )
        .await
        .unwrap();
        fs::write(
            dir.path().join("worker-1.jsonl"),
            "{\"worker\":\"b\",\"acquired_at\":1.0,\"released_at\":2.0}\n",
        )
        .await
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();

        let windows = load_windows(dir.path()).await.unwrap();
        assert_eq!(windows.len(), 2);
        assert!(check_windows(windows).is_ok());
    }

    #[tokio::test]
    async fn load_windows_reports_bad_lines() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("worker-0.jsonl"), "not json\n")
            .await
            .unwrap();

        let err = load_windows(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("worker-0.jsonl:1"));
    }

    #[test]
    fn overlap_error_names_both_windows() {
        let err = check_windows(vec![window("a", 0.0, 2.0), window("b", 1.0, 3.0)]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("a ["));
        assert!(message.contains("b ["));
        assert!(err.hint().is_some());
    }

    #[test]
    fn lease_overrides_apply() {
        let config = Config::default();
        let options = lease_options(
            &config,
            &LeaseArgs {
                expire_secs: Some(2.0),
                margin_secs: Some(0.1),
            },
        )
        .unwrap();
        assert_eq!(options.expire_secs, 2.0);
        assert_eq!(options.acquire_margin_secs, 0.1);

        let invalid = lease_options(
            &config,
            &LeaseArgs {
                expire_secs: Some(21.0),
                margin_secs: Some(20.0),
            },
        );
        assert!(matches!(invalid, Err(MemoError::Configuration(_))));
    }
}
