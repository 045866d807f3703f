use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use hearth_core::chain::ChainId;
use hearth_core::error::Result;
use hearth_core::record::ExecutionRecord;
use hearth_core::traits::RecordSink;

/// JSONL export of sealed execution records.
///
/// Each record is appended as one line to `{dir}/chain-{chain_id}.jsonl`.
/// Lines are flushed as they are written, so a crash never truncates an
/// earlier record.
pub struct JsonlRecordSink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlRecordSink {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, chain_id: ChainId) -> PathBuf {
        self.dir.join(format!("chain-{}.jsonl", chain_id))
    }

    async fn write(&self, record: &ExecutionRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        // One writer at a time keeps concurrent runs from interleaving lines.
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(record.chain_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(run_id = %record.run_id, path = %path.display(), "Exported execution record");
        Ok(())
    }
}

impl RecordSink for JsonlRecordSink {
    fn append<'a>(&'a self, record: &'a ExecutionRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write(record))
    }
}
