//! External configuration change notifications.
//!
//! The master subscribes once at startup. Each item received on the returned
//! channel is treated as a reload trigger.

use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to stat {}: {source}", path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config source unavailable: {0}")]
    Unavailable(String),
}

/// Source of configuration change notifications.
#[async_trait]
pub trait ConfigWatcher: Send + Sync {
    /// Subscribe to changes. Dropping the receiver ends the subscription.
    async fn watch(&self) -> Result<mpsc::Receiver<()>, WatchError>;
}

/// Polls a file's modification time.
#[derive(Debug, Clone)]
pub struct FileWatcher {
    path: PathBuf,
    interval: Duration,
}

impl FileWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    async fn modified(&self) -> Result<SystemTime, WatchError> {
        let stat_err = |source| WatchError::Stat {
            path: self.path.clone(),
            source,
        };
        tokio::fs::metadata(&self.path)
            .await
            .map_err(stat_err)?
            .modified()
            .map_err(stat_err)
    }
}

#[async_trait]
impl ConfigWatcher for FileWatcher {
    async fn watch(&self) -> Result<mpsc::Receiver<()>, WatchError> {
        let mut last = self.modified().await?;
        let (tx, rx) = mpsc::channel(1);
        let watcher = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watcher.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                match watcher.modified().await {
                    Ok(mtime) if mtime != last => {
                        last = mtime;
                        tracing::debug!(path = %watcher.path.display(), "Config file changed");
                        // A pending notification already covers this change.
                        let _ = tx.try_send(());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to poll config file");
                    }
                }
            }
            tracing::debug!(path = %watcher.path.display(), "Config file watch stopped");
        });

        Ok(rx)
    }
}
