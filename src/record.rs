use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

/// Record file path for a session: `BASE.<session>`
pub fn record_path(base: &Path, session_id: u64) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{session_id}"));
    PathBuf::from(name)
}

/// Session record sink.
///
/// Relayed chunks are handed off through an unbounded channel to a
/// dedicated writer task, so recording never blocks the relay loop or
/// reorders traffic. The writer drains and flushes when the recorder
/// is dropped.
#[derive(Debug)]
pub struct SessionRecorder {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl SessionRecorder {
    /// Open `BASE.<session>` for appending and start the writer task
    pub async fn create(base: &Path, session_id: u64) -> io::Result<Self> {
        let path = record_path(base, session_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if let Err(e) = file.write_all(&chunk).await {
                    warn!(path = %path.display(), "session record write failed: {e}");
                    break;
                }
            }
            let _ = file.flush().await;
        });

        Ok(Self { tx })
    }

    /// Append a relayed chunk to the record file.
    ///
    /// Never blocks; a closed writer task drops the chunk silently since
    /// recording failures must not tear down the session.
    pub fn record(&self, chunk: Bytes) {
        let _ = self.tx.send(chunk);
    }
}
