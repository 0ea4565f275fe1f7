//! Hot reload of the on-disk configuration file.
//!
//! Watches the directory containing the config file rather than the file
//! itself, so atomic replace/rename patterns used by editors and
//! orchestration tooling still produce events for the tracked name. Raw
//! filesystem events are debounced, and reloads are additionally throttled
//! to at most one per [`MIN_RELOAD_INTERVAL`] to absorb rapid successive
//! writes from a single logical change.

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, DebouncedEventKind, Debouncer};
use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Debounce window for raw filesystem events.
const DEBOUNCE_DURATION: Duration = Duration::from_millis(500);

/// Minimum interval between two applied reloads.
pub const MIN_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

/// Background watcher that triggers a reload callback when the tracked
/// configuration file changes.
///
/// Dropping the watcher stops event delivery and lets the background task
/// exit.
pub struct ConfigWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl ConfigWatcher {
    /// Start watching `config_path` and invoke `on_change` for qualifying
    /// events. A failing callback is logged and the watcher keeps running;
    /// the previously active configuration simply stays in effect.
    pub fn spawn<F, Fut>(config_path: PathBuf, on_change: F) -> Result<Self>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let config_path = config_path.canonicalize().unwrap_or(config_path);
        let watch_dir = config_path
            .parent()
            .context("config path has no parent directory")?
            .to_path_buf();
        let file_name: OsString = config_path
            .file_name()
            .context("config path has no file name")?
            .to_os_string();

        let (tx, rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(
            DEBOUNCE_DURATION,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if event.kind == DebouncedEventKind::Any {
                            let _ = tx.send(event.path);
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Config watcher error");
                }
            },
        )
        .context("Failed to create config file watcher")?;

        debouncer
            .watcher()
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config directory {}", watch_dir.display()))?;

        info!(path = %config_path.display(), "Watching config file for changes");

        tokio::spawn(reload_loop(rx, file_name, on_change));

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

/// Receives debounced paths, filters them against the tracked file name,
/// applies the reload throttle, and invokes the callback.
async fn reload_loop<F, Fut>(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    file_name: OsString,
    on_change: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut last_reload: Option<Instant> = None;

    while let Some(changed) = rx.recv().await {
        if !should_reload(&changed, &file_name, last_reload) {
            debug!(path = %changed.display(), "Ignoring filesystem event");
            continue;
        }

        info!(path = %changed.display(), "Config file changed, reloading");
        match on_change().await {
            Ok(()) => {
                last_reload = Some(Instant::now());
                info!("Configuration reloaded");
            }
            Err(e) => {
                error!(error = %e, "Failed to reload configuration, keeping previous");
            }
        }
    }
}

/// A change qualifies when it names the tracked file and the throttle
/// interval has elapsed since the last applied reload.
fn should_reload(changed: &PathBuf, tracked: &OsStr, last_reload: Option<Instant>) -> bool {
    if changed.file_name() != Some(tracked) {
        return false;
    }
    match last_reload {
        Some(at) => at.elapsed() >= MIN_RELOAD_INTERVAL,
        None => true,
    }
}
