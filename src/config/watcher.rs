//! Configuration file watcher for hot reload.
//!
//! Editors often save by writing a temp file and renaming it over the
//! original, so the parent directory is watched and events are filtered by
//! file name. Bursts of events are collapsed into one reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};

use crate::config::loader::load_config;
use crate::config::schema::PipelineConfig;

/// Watches one configuration file and emits validated reloads.
pub struct ConfigWatcher {
    path: PathBuf,
    debounce: Duration,
}

impl ConfigWatcher {
    pub fn new(path: &Path, debounce: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            debounce,
        }
    }

    /// Start watching. The returned `RecommendedWatcher` must be kept alive
    /// for as long as reloads are wanted.
    pub fn spawn(
        self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<PipelineConfig>), notify::Error> {
        let (dirty_tx, mut dirty_rx) = mpsc::unbounded_channel::<()>();
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if ours && (event.kind.is_modify() || event.kind.is_create()) {
                        let _ = dirty_tx.send(());
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %self.path.display(), "Config watcher started");

        let path = self.path;
        let debounce = self.debounce;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = dirty_rx.recv() => {
                        if signal.is_none() {
                            break;
                        }
                        tokio::time::sleep(debounce).await;
                        while dirty_rx.try_recv().is_ok() {}

                        match load_config(&path) {
                            Ok(config) => {
                                tracing::info!(path = %path.display(), "Configuration reloaded");
                                if update_tx.send(config).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::error!(
                                    error = %e,
                                    "Rejected config reload, keeping current configuration"
                                );
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            tracing::debug!("Config watcher stopped");
        });

        Ok((watcher, update_rx))
    }
}
