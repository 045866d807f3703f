use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use hearth_core::chain::{Chain, ChainDefinition, ChainId};
use hearth_core::error::{HearthError, Result};
use hearth_core::record::ExecutionRecord;
use hearth_core::traits::{ChainSource, RecordSink};

/// In-memory chain source.
#[derive(Default)]
pub struct MemoryChainSource {
    chains: HashMap<ChainId, ChainDefinition>,
}

impl MemoryChainSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, definition: ChainDefinition) -> Self {
        self.chains.insert(definition.id(), definition);
        self
    }
}

impl ChainSource for MemoryChainSource {
    fn load_chain(&self, id: ChainId) -> BoxFuture<'_, Result<ChainDefinition>> {
        let found = self.chains.get(&id).cloned();
        Box::pin(async move { found.ok_or(HearthError::ChainNotFound(id.0)) })
    }

    fn list_chains(&self) -> BoxFuture<'_, Result<Vec<Chain>>> {
        let mut chains: Vec<Chain> = self.chains.values().map(|d| d.chain.clone()).collect();
        chains.sort_by_key(|c| c.id);
        Box::pin(async move { Ok(chains) })
    }
}

/// In-memory record sink that keeps every appended record.
#[derive(Default)]
pub struct MemoryRecordSink {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl RecordSink for MemoryRecordSink {
    fn append<'a>(&'a self, record: &'a ExecutionRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.records
                .lock()
                .map_err(|e| HearthError::Database(e.to_string()))?
                .push(record.clone());
            Ok(())
        })
    }
}
