//! Data sources and the dataset builder.
//!
//! A data source is a cursor over stream records: `valid`/`get`/
//! `advance`. Shaping combinators mirror the trace-preparation pipeline:
//! truncation, id folding by modulo, sliding time windows that expire
//! records, and buffered replay. The [`Dataset`] builder applies the
//! configured shaping, splits off the warmup prefix and installs the
//! feed into a [`Sim`](crate::context::Sim).

use crate::context::{Sim, SimEvent};
use crate::results::DatasetRow;
use geomon_core::types::{Key, Record, SourceId, StreamId, StreamOp, Timestamp, RECORD_WIRE_SIZE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Zipf};
use std::collections::{BTreeSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("dataset has no source loaded")]
    NoSource,

    #[error("dataset is empty after shaping")]
    EmptyDataset,

    #[error("warmup size {warmup} exceeds dataset size {size}")]
    WarmupExceedsDataset { warmup: usize, size: usize },

    #[error("invalid generator config: {0}")]
    InvalidGenerator(String),
}

/// Cursor over a stream of records. While `valid()` holds, `get()`
/// returns the current record; `advance()` moves to the next one.
pub trait DataSource {
    fn valid(&self) -> bool;
    fn get(&self) -> Record;
    fn advance(&mut self);
}

/// Applies a shaping function to the records of an inner source. The
/// function may rewrite the record in place; returning `false` ends the
/// stream.
pub struct FilteredSource<F> {
    sub: Box<dyn DataSource>,
    func: F,
    rec: Record,
    is_valid: bool,
}

impl<F: FnMut(&mut Record) -> bool> FilteredSource<F> {
    pub fn new(sub: Box<dyn DataSource>, func: F) -> Self {
        let mut s = Self {
            sub,
            func,
            rec: Record::new(0, 0, 0, 0, StreamOp::Insert),
            is_valid: true,
        };
        s.advance();
        s
    }
}

impl<F: FnMut(&mut Record) -> bool> DataSource for FilteredSource<F> {
    fn valid(&self) -> bool {
        self.is_valid
    }

    fn get(&self) -> Record {
        self.rec
    }

    fn advance(&mut self) {
        if !self.is_valid {
            return;
        }
        if self.sub.valid() {
            self.rec = self.sub.get();
            self.is_valid = (self.func)(&mut self.rec);
            self.sub.advance();
        } else {
            self.is_valid = false;
        }
    }
}

/// Shaping function: pass at most `n` records, then end the stream.
pub fn max_length(n: usize) -> impl FnMut(&mut Record) -> bool {
    let mut left = n;
    move |_| {
        if left > 0 {
            left -= 1;
            true
        } else {
            false
        }
    }
}

/// Shaping function: fold stream ids into `0..h` by modulo.
pub fn hash_streams(h: StreamId) -> impl FnMut(&mut Record) -> bool {
    move |rec| {
        rec.sid %= h;
        true
    }
}

/// Shaping function: fold source ids into `0..h` by modulo.
pub fn hash_sources(h: SourceId) -> impl FnMut(&mut Record) -> bool {
    move |rec| {
        rec.hid %= h;
        true
    }
}

/// Sliding time window: every record passes through and its inverse is
/// re-emitted `tw` time units later, so downstream state reflects only
/// the last `tw` units of the trace. Outputs stay in timestamp order.
pub struct TimeWindowSource {
    sub: Box<dyn DataSource>,
    tw: Timestamp,
    window: VecDeque<Record>,
    rec: Record,
    is_valid: bool,
}

impl TimeWindowSource {
    pub fn new(sub: Box<dyn DataSource>, tw: Timestamp) -> Self {
        let mut s = Self {
            sub,
            tw,
            window: VecDeque::new(),
            rec: Record::new(0, 0, 0, 0, StreamOp::Insert),
            is_valid: true,
        };
        s.advance();
        s
    }

    pub fn delay(&self) -> Timestamp {
        self.tw
    }
}

impl DataSource for TimeWindowSource {
    fn valid(&self) -> bool {
        self.is_valid
    }

    fn get(&self) -> Record {
        self.rec
    }

    fn advance(&mut self) {
        let take_sub = self.sub.valid()
            && self
                .window
                .front()
                .map_or(true, |front| self.sub.get().ts <= front.ts);
        if take_sub {
            self.rec = self.sub.get();
            self.window.push_back(self.rec.inverse_at(self.rec.ts + self.tw));
            self.sub.advance();
            self.is_valid = true;
        } else if let Some(front) = self.window.pop_front() {
            self.rec = front;
            self.is_valid = true;
        } else {
            self.is_valid = false;
        }
    }
}

/// In-memory source over a vector of records. Rewindable for replay.
pub struct BufferedSource {
    records: Vec<Record>,
    pos: usize,
}

impl BufferedSource {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records, pos: 0 }
    }

    /// Restart the replay from the first record.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }
}

impl DataSource for BufferedSource {
    fn valid(&self) -> bool {
        self.pos < self.records.len()
    }

    fn get(&self) -> Record {
        self.records[self.pos]
    }

    fn advance(&mut self) {
        self.pos += 1;
    }
}

/// Configuration of the deterministic synthetic generator.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub length: usize,
    pub streams: StreamId,
    pub sources: SourceId,
    pub key_domain: Key,
    /// Zipf exponent; 0 draws keys uniformly.
    pub skew: f64,
    pub seed: u64,
}

/// Seeded synthetic workload: uniform stream/site assignment, uniform or
/// Zipfian keys, monotone timestamps. Two generators with the same
/// config produce identical traces.
pub struct SyntheticSource {
    cfg: GeneratorConfig,
    rng: StdRng,
    zipf: Option<Zipf<f64>>,
    produced: usize,
    rec: Record,
    is_valid: bool,
}

impl SyntheticSource {
    pub fn new(cfg: GeneratorConfig) -> Result<Self, SourceError> {
        if cfg.length == 0 || cfg.streams == 0 || cfg.sources == 0 || cfg.key_domain == 0 {
            return Err(SourceError::InvalidGenerator(
                "length, streams, sources and key_domain must be positive".into(),
            ));
        }
        let zipf = if cfg.skew > 0.0 {
            Some(
                Zipf::new(cfg.key_domain as u64, cfg.skew)
                    .map_err(|e| SourceError::InvalidGenerator(e.to_string()))?,
            )
        } else {
            None
        };
        let rng = StdRng::seed_from_u64(cfg.seed);
        let mut s = Self {
            cfg,
            rng,
            zipf,
            produced: 0,
            rec: Record::new(0, 0, 0, 0, StreamOp::Insert),
            is_valid: true,
        };
        s.advance();
        Ok(s)
    }

    fn draw_key(&mut self) -> Key {
        match &self.zipf {
            Some(z) => z.sample(&mut self.rng) as Key - 1,
            None => self.rng.gen_range(0..self.cfg.key_domain),
        }
    }
}

impl DataSource for SyntheticSource {
    fn valid(&self) -> bool {
        self.is_valid
    }

    fn get(&self) -> Record {
        self.rec
    }

    fn advance(&mut self) {
        if self.produced >= self.cfg.length {
            self.is_valid = false;
            return;
        }
        let sid = self.rng.gen_range(0..self.cfg.streams);
        let hid = self.rng.gen_range(0..self.cfg.sources);
        let key = self.draw_key();
        self.rec = Record::new(self.produced as Timestamp, sid, hid, key, StreamOp::Insert);
        self.produced += 1;
    }
}

/// Summary of an installed dataset, filled when the dataset is created.
#[derive(Debug, Clone, Default)]
pub struct DsMetadata {
    pub name: String,
    pub size: usize,
    pub mintime: Timestamp,
    pub maxtime: Timestamp,
    pub streams: BTreeSet<StreamId>,
    pub sources: BTreeSet<SourceId>,
    pub warmup: usize,
    pub window: Timestamp,
}

impl DsMetadata {
    pub fn duration(&self) -> Timestamp {
        self.maxtime - self.mintime
    }

    /// Raw size of the trace on the wire; the denominator of traffic
    /// percentages.
    pub fn bytes(&self) -> usize {
        self.size * RECORD_WIRE_SIZE
    }

    /// Number of sites observed in the trace.
    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    fn analyze(name: String, records: &[Record], warmup: usize, window: Timestamp) -> Self {
        let mut meta = DsMetadata {
            name,
            size: records.len(),
            mintime: records.first().map_or(0, |r| r.ts),
            maxtime: records.last().map_or(0, |r| r.ts),
            warmup,
            window,
            ..Default::default()
        };
        for r in records {
            meta.streams.insert(r.sid);
            meta.sources.insert(r.hid);
        }
        meta
    }
}

/// Builder that shapes a raw source and installs it into a simulation.
pub struct Dataset {
    name: String,
    src: Option<Box<dyn DataSource>>,
    max_length: Option<usize>,
    hash_streams: Option<StreamId>,
    hash_sources: Option<SourceId>,
    time_window: Option<Timestamp>,
    warmup_size: usize,
}

impl Dataset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            src: None,
            max_length: None,
            hash_streams: None,
            hash_sources: None,
            time_window: None,
            warmup_size: 0,
        }
    }

    pub fn load(mut self, src: Box<dyn DataSource>) -> Self {
        self.src = Some(src);
        self
    }

    pub fn set_max_length(mut self, n: usize) -> Self {
        self.max_length = Some(n);
        self
    }

    pub fn set_hash_streams(mut self, h: StreamId) -> Self {
        self.hash_streams = Some(h);
        self
    }

    pub fn set_hash_sources(mut self, h: SourceId) -> Self {
        self.hash_sources = Some(h);
        self
    }

    pub fn set_time_window(mut self, tw: Timestamp) -> Self {
        self.time_window = Some(tw);
        self
    }

    pub fn set_warmup_size(mut self, n: usize) -> Self {
        self.warmup_size = n;
        self
    }

    /// Apply the configured shaping, split off the warmup prefix,
    /// install the feed and metadata into `sim`, and register the
    /// dataset result row for emission on RESULTS.
    pub fn create(mut self, sim: &Sim) -> Result<DsMetadata, SourceError> {
        let mut src = self.src.take().ok_or(SourceError::NoSource)?;
        if let Some(n) = self.max_length {
            src = Box::new(FilteredSource::new(src, max_length(n)));
        }
        if let Some(h) = self.hash_streams {
            src = Box::new(FilteredSource::new(src, hash_streams(h)));
        }
        if let Some(h) = self.hash_sources {
            src = Box::new(FilteredSource::new(src, hash_sources(h)));
        }
        if let Some(tw) = self.time_window {
            src = Box::new(TimeWindowSource::new(src, tw));
        }

        let mut records = Vec::new();
        while src.valid() {
            records.push(src.get());
            src.advance();
        }
        if records.is_empty() {
            return Err(SourceError::EmptyDataset);
        }
        if self.warmup_size > records.len() {
            return Err(SourceError::WarmupExceedsDataset {
                warmup: self.warmup_size,
                size: records.len(),
            });
        }

        let meta = DsMetadata::analyze(
            self.name,
            &records,
            self.warmup_size,
            self.time_window.unwrap_or(0),
        );

        let rest = records.split_off(self.warmup_size);
        sim.set_warmup(records);
        sim.set_metadata(meta.clone());
        sim.data_feed(Box::new(BufferedSource::new(rest)));

        let row = DatasetRow::from_metadata(&meta);
        sim.on(SimEvent::Results, move |sim| {
            sim.with_outputs(|out| out.emit_dataset(&row));
        });

        Ok(meta)
    }
}
