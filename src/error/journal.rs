//! Append-only JSON-lines journal for severe entries.
//!
//! Lines are handed to a single writer task over a `flume` channel, so
//! recording an error never touches the filesystem on the caller's thread
//! and lines land in the order they were recorded.

use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::warn;

enum Command {
    Line(String),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug)]
pub(crate) struct ErrorJournal {
    path: PathBuf,
    writer: Mutex<Option<flume::Sender<Command>>>,
}

impl ErrorJournal {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: Mutex::new(None),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Queues `line` for the writer task. Outside a tokio runtime there is no
    /// worker to stall, so the line is appended in place.
    pub(crate) fn append(&self, line: String) {
        let Ok(handle) = Handle::try_current() else {
            if let Err(e) = append_blocking(&self.path, &line) {
                warn!("Could not append to error log {}: {}", self.path.display(), e);
            }
            return;
        };

        let mut writer = self.writer.lock();
        let command = match writer.as_ref() {
            Some(tx) => match tx.send(Command::Line(line)) {
                Ok(()) => return,
                // the runtime that owned the writer is gone
                Err(flume::SendError(command)) => command,
            },
            None => Command::Line(line),
        };

        let (tx, rx) = flume::unbounded();
        handle.spawn(run_writer(self.path.clone(), rx));
        let _ = tx.send(command);
        *writer = Some(tx);
    }

    /// Resolves once every line queued before the call is on disk.
    pub(crate) async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        let sent = match self.writer.lock().as_ref() {
            Some(tx) => tx.send(Command::Flush(done)).is_ok(),
            None => false,
        };
        if sent {
            let _ = wait.await;
        }
    }
}

async fn run_writer(path: PathBuf, rx: flume::Receiver<Command>) {
    while let Ok(command) = rx.recv_async().await {
        match command {
            Command::Line(line) => {
                if let Err(e) = append_async(&path, &line).await {
                    warn!("Could not append to error log {}: {}", path.display(), e);
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn append_async(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(format!("{line}\n").as_bytes()).await?;
    file.flush().await
}

fn append_blocking(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
