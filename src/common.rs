use anyhow::{Context, Result};
use reqwest::StatusCode;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

pub fn delete_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed deleting {}", path.display()))?;
    }
    Ok(())
}

pub fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Sibling `<name>.tmp` path used for write-then-rename output.
pub fn tmp_path_for(path: &Path, fallback_name: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or(fallback_name);
    path.with_file_name(format!("{file_name}.tmp"))
}

pub fn replace_file(tmp_path: &Path, output_path: &Path) -> Result<()> {
    fs::rename(tmp_path, output_path).with_context(|| {
        format!(
            "Failed moving {} to {}",
            tmp_path.display(),
            output_path.display()
        )
    })
}

pub fn sql_escape_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "''")
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let value = value?.to_str().ok()?.trim();
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

pub fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    let max_len = 300usize;
    match trimmed.char_indices().nth(max_len) {
        None => trimmed.to_string(),
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
    }
}

pub fn min_interval_for_rate(requests_per_second: f64) -> Duration {
    if requests_per_second <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(1.0 / requests_per_second)
    }
}

pub async fn wait_for_rate_slot(next_slot: &Arc<Mutex<Instant>>, min_interval: Duration) {
    if min_interval.is_zero() {
        return;
    }
    let mut guard = next_slot.lock().await;
    let now = Instant::now();
    if *guard > now {
        sleep(*guard - now).await;
    }
    *guard = Instant::now() + min_interval;
}

pub fn install_ctrlc_handler(shutdown_requested: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let was_set = shutdown_requested.swap(true, Ordering::SeqCst);
            if !was_set {
                tracing::warn!(
                    "Received Ctrl-C. Finishing the current page, saving progress, and exiting..."
                );
            }
        }
    });
}
