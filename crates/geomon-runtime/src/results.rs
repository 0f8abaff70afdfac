//! Result tables.
//!
//! Three fixed-schema tables summarize a run: the dataset shape, the
//! total communication of each network, and the geometric-method
//! protocol counters. Rows are serialized as JSON lines into whatever
//! sink the caller installed; emission is triggered by the RESULTS
//! lifecycle event. Sinks are flushed and closed on simulation
//! teardown, including the fatal-error path.

use crate::channels::{ChannelTable, Endpoint, Leg};
use crate::source::DsMetadata;
use serde::Serialize;
use std::io::Write;
use tracing::warn;

/// Shape of the dataset that drove the run.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetRow {
    pub dset_name: String,
    pub dset_window: i64,
    pub dset_warmup: usize,
    pub dset_size: usize,
    pub dset_duration: i64,
    pub dset_streams: usize,
    pub dset_hosts: usize,
    pub dset_bytes: usize,
}

impl DatasetRow {
    pub fn from_metadata(meta: &DsMetadata) -> Self {
        Self {
            dset_name: meta.name.clone(),
            dset_window: meta.window,
            dset_warmup: meta.warmup,
            dset_size: meta.size,
            dset_duration: meta.duration(),
            dset_streams: meta.streams.len(),
            dset_hosts: meta.sources.len(),
            dset_bytes: meta.bytes(),
        }
    }
}

/// Total traffic of one simulated network.
#[derive(Debug, Clone, Serialize)]
pub struct CommRow {
    pub total_msg: usize,
    pub total_bytes: usize,
    pub traffic_pct: f64,
}

impl CommRow {
    /// Summarize a channel table against the raw trace volume.
    pub fn from_channels(channels: &ChannelTable, dset_bytes: usize) -> Self {
        let total_bytes = channels.total_bytes();
        Self {
            total_msg: channels.total_msgs(),
            total_bytes,
            traffic_pct: if dset_bytes > 0 {
                100.0 * total_bytes as f64 / dset_bytes as f64
            } else {
                0.0
            },
        }
    }
}

/// Protocol counters of one geometric-method network.
#[derive(Debug, Clone, Serialize)]
pub struct GmRow {
    pub name: String,
    pub protocol: String,
    pub max_error: f64,
    pub statevec_size: usize,
    pub sites: usize,
    pub sid: u64,
    pub rounds: usize,
    pub subrounds: usize,
    pub sz_sent: usize,
    pub total_rbl_size: usize,
    pub bytes_get_drift: usize,
}

impl GmRow {
    /// Bytes received by the coordinator over `get_drift` responses.
    pub fn drift_bytes(channels: &ChannelTable) -> usize {
        channels.endpoint_bytes(Endpoint::GetDrift, Leg::Response)
    }
}

/// Destination of one table's rows.
#[derive(Default)]
pub enum RowSink {
    /// Discard rows.
    #[default]
    Null,
    /// Keep serialized rows in memory (tests, determinism checks).
    Memory(Vec<String>),
    /// Append JSON lines to a writer.
    Writer(Box<dyn Write>),
}

impl RowSink {
    pub fn memory() -> Self {
        RowSink::Memory(Vec::new())
    }

    pub fn writer(w: impl Write + 'static) -> Self {
        RowSink::Writer(Box::new(w))
    }

    /// Rows captured by a memory sink.
    pub fn rows(&self) -> &[String] {
        match self {
            RowSink::Memory(rows) => rows,
            _ => &[],
        }
    }

    fn emit<T: Serialize>(&mut self, row: &T) {
        let line = match serde_json::to_string(row) {
            Ok(l) => l,
            Err(e) => {
                warn!("failed to serialize result row: {e}");
                return;
            }
        };
        match self {
            RowSink::Null => {}
            RowSink::Memory(rows) => rows.push(line),
            RowSink::Writer(w) => {
                if let Err(e) = writeln!(w, "{line}") {
                    warn!("failed to write result row: {e}");
                }
            }
        }
    }

    fn close(&mut self) {
        if let RowSink::Writer(w) = self {
            if let Err(e) = w.flush() {
                warn!("failed to flush result sink: {e}");
            }
        }
    }
}

/// The three result tables of a simulation.
#[derive(Default)]
pub struct ResultSet {
    pub dataset: RowSink,
    pub comm: RowSink,
    pub gm: RowSink,
}

impl ResultSet {
    pub fn emit_dataset(&mut self, row: &DatasetRow) {
        self.dataset.emit(row);
    }

    pub fn emit_comm(&mut self, row: &CommRow) {
        self.comm.emit(row);
    }

    pub fn emit_gm(&mut self, row: &GmRow) {
        self.gm.emit(row);
    }

    /// Flush and close every sink. Safe to call more than once.
    pub fn close_all(&mut self) {
        self.dataset.close();
        self.comm.close();
        self.gm.close();
    }
}

impl Drop for ResultSet {
    fn drop(&mut self) {
        self.close_all();
    }
}
