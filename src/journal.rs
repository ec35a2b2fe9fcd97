use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use crate::error::PersistenceError;
use crate::image::ImageKind;

pub const FEED_CAPACITY: usize = 256;

pub struct PortLog {
    port: u16,
    logs_dir: PathBuf,
    images_dir: PathBuf,
    feed: broadcast::Sender<String>,
    // session tasks append concurrently
    file_lock: Mutex<()>,
}

impl PortLog {
    pub fn new(port: u16, data_dir: &Path, feed: broadcast::Sender<String>) -> Self {
        let base = port_dir(data_dir, port);

        Self {
            port,
            logs_dir: base.join("logs"),
            images_dir: base.join("images"),
            feed,
            file_lock: Mutex::new(()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Publishes a line on the operator feed only.
    pub fn event<S: Into<String>>(&self, line: S) {
        let line = line.into();

        info!(port = self.port, "{line}");

        let _ = self.feed.send(line);
    }

    /// Publishes a line on the feed and appends it to today's log file.
    /// A failed write is reported on the feed and otherwise ignored.
    pub async fn record<S: Into<String>>(&self, line: S) {
        let line = line.into();

        self.event(line.clone());

        if let Err(err) = self.append(&line).await {
            warn!(port = self.port, error = %err, "log write failed");
            let _ = self.feed.send(format!("Could not write log: {err}"));
        }
    }

    pub fn log_file(&self) -> PathBuf {
        let day = chrono::Local::now().format("%Y%m%d");

        self.logs_dir.join(format!("log_{day}.txt"))
    }

    pub async fn append(&self, line: &str) -> Result<(), PersistenceError> {
        let _guard = self.file_lock.lock().await;

        let path = self.log_file();
        let fail = |source| PersistenceError {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.logs_dir).await.map_err(fail)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(fail)?;

        file.write_all(format!("{line}\n").as_bytes()).await.map_err(fail)?;
        file.flush().await.map_err(fail)?;

        Ok(())
    }

    /// Stores a decoded image and returns its path.
    pub async fn save_image(&self, user: &str, bytes: &[u8]) -> Result<PathBuf, PersistenceError> {
        let ext = ImageKind::detect(bytes).extension();
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");

        let path = self
            .images_dir
            .join(format!("{stamp}_{}.{ext}", file_safe(user)));
        let fail = |source| PersistenceError {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.images_dir).await.map_err(fail)?;
        tokio::fs::write(&path, bytes).await.map_err(fail)?;

        Ok(path)
    }
}

pub fn port_dir(data_dir: &Path, port: u16) -> PathBuf {
    data_dir.join(format!("port_{port}"))
}

/// Keeps `[A-Za-z0-9_.-]`, everything else becomes `_`.
pub fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
