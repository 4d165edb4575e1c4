//! Usage accounting for completed generations.
//!
//! The server notifies a [`UsageSink`] after every non-streaming completion,
//! successful or not, and whenever an upstream call fails outright.
//! [`JsonlUsageSink`] keeps a bounded in-memory ledger and appends each
//! record to a JSONL file.

use crate::canonical::Usage;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAX_LEDGER_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub status: String,
    pub latency_ms: u64,
}

impl UsageRecord {
    pub fn new(
        model_id: impl Into<String>,
        usage: Option<Usage>,
        status: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            model_id: model_id.into(),
            usage,
            status: status.into(),
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Fire-and-forget notification target. Called concurrently from independent requests.
pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Emits every record as a structured `tracing` event.
#[derive(Debug, Clone, Default)]
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, record: UsageRecord) {
        let (prompt, completion) = record
            .usage
            .map_or((0, 0), |u| (u.prompt_tokens, u.completion_tokens));
        tracing::info!(
            model = %record.model_id,
            status = %record.status,
            prompt_tokens = prompt,
            completion_tokens = completion,
            latency_ms = record.latency_ms,
            "Generation finished"
        );
    }
}

/// Ring-buffer ledger persisted as JSONL.
pub struct UsageLedger {
    entries: VecDeque<UsageRecord>,
    file_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl UsageLedger {
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();

        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = VecDeque::with_capacity(MAX_LEDGER_ENTRIES);
        let mut dropped = 0usize;

        if file_path.exists() {
            let reader = BufReader::new(File::open(&file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                match serde_json::from_str::<UsageRecord>(&line) {
                    Ok(record) => {
                        if entries.len() >= MAX_LEDGER_ENTRIES {
                            entries.pop_front();
                            dropped += 1;
                        }
                        entries.push_back(record);
                    }
                    Err(_) => dropped += 1,
                }
            }
        }

        let mut ledger = Self {
            entries,
            file_path,
            writer: None,
        };
        // Keep the file bounded to what the ledger retains.
        if dropped > 0 {
            tracing::info!(
                dropped,
                kept = ledger.entries.len(),
                path = %ledger.file_path.display(),
                "Compacting usage log"
            );
            ledger.compact()?;
        } else {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&ledger.file_path)?;
            ledger.writer = Some(BufWriter::new(file));
        }
        Ok(ledger)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, record: UsageRecord) {
        if let Some(ref mut writer) = self.writer {
            match serde_json::to_string(&record) {
                Ok(json) => {
                    if let Err(e) = writeln!(writer, "{json}").and_then(|()| writer.flush()) {
                        tracing::warn!(error = %e, "Failed to persist usage record");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize usage record"),
            }
        }
        if self.entries.len() >= MAX_LEDGER_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    /// Most recent records first.
    #[cfg(test)]
    fn recent(&self, limit: usize) -> Vec<UsageRecord> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Rewrite the file so it holds only the records still in memory.
    fn compact(&mut self) -> std::io::Result<()> {
        self.writer = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.file_path)?;
        let mut writer = BufWriter::new(file);
        for record in &self.entries {
            if let Ok(json) = serde_json::to_string(record) {
                writeln!(writer, "{json}")?;
            }
        }
        writer.flush()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }
}

#[derive(Clone)]
pub struct JsonlUsageSink(Arc<Mutex<UsageLedger>>);

impl JsonlUsageSink {
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let ledger = UsageLedger::open(file_path)?;
        tracing::debug!(records = ledger.len(), "Opened usage ledger");
        Ok(Self(Arc::new(Mutex::new(ledger))))
    }

    #[cfg(test)]
    fn recent(&self, limit: usize) -> Vec<UsageRecord> {
        self.0.lock().map(|l| l.recent(limit)).unwrap_or_default()
    }
}

impl UsageSink for JsonlUsageSink {
    fn record(&self, record: UsageRecord) {
        match self.0.lock() {
            Ok(mut ledger) => ledger.append(record),
            Err(_) => tracing::warn!(
                model = %record.model_id,
                status = %record.status,
                "Usage ledger lock poisoned, dropping record"
            ),
        }
    }
}
