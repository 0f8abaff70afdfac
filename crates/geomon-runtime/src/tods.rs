//! The TODS continuous monitoring method.
//!
//! A norm-threshold baseline: each site keeps, per monitored stream, the
//! last state `E` it shipped to the coordinator and the local residual
//! `dE` accumulated since. While `‖dE‖² < (θ²/k)·‖E + dE‖²` the residual
//! stays local; once the condition breaks, the site pushes `dE` to the
//! coordinator and folds it into `E`. The coordinator's per-stream
//! totals answer inner-product queries on demand.

use crate::channels::{ChannelTable, Endpoint, Host};
use crate::context::{RuleHandle, Sim, SimEvent};
use crate::results::CommRow;
use geomon_core::agms::{self, Projection};
use geomon_core::types::{Key, Record, SourceId, StreamId};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Per-site, per-stream monitoring state.
struct StreamState {
    proj: Projection,
    e: Vec<f64>,
    de: Vec<f64>,
    delta_updates: usize,
    norm_de_2: f64,
    norm_x_2: f64,
    theta_2_over_k: f64,
}

impl StreamState {
    fn new(proj: Projection, theta: f64, k: usize) -> Self {
        let size = proj.size();
        Self {
            proj,
            e: vec![0.0; size],
            de: vec![0.0; size],
            delta_updates: 0,
            norm_de_2: 0.0,
            norm_x_2: 0.0,
            theta_2_over_k: theta * theta / k as f64,
        }
    }

    fn update(&mut self, key: Key, w: f64) {
        let delta = self.proj.update_vec(&mut self.de, 0, key, w);
        // ‖dE‖² and ‖E + dE‖² move by the same delta, shifted by E.
        self.norm_de_2 = delta.norm2_inc(self.norm_de_2);
        for entry in &delta {
            let x_old = self.e[entry.index] + entry.old;
            let x_new = self.e[entry.index] + entry.new;
            self.norm_x_2 += x_new * x_new - x_old * x_old;
        }
        self.delta_updates += 1;
    }

    fn local_condition(&self) -> bool {
        self.norm_de_2 < self.theta_2_over_k * self.norm_x_2
    }

    /// Fold the residual into the shipped state and reset it.
    fn flush(&mut self) {
        agms::add_assign(&mut self.e, &self.de);
        // Not mathematically necessary, but keeps the norm accurate.
        self.norm_x_2 = agms::dot(&self.e, &self.e);
        self.de.fill(0.0);
        self.norm_de_2 = 0.0;
        self.delta_updates = 0;
    }

    /// Wire size of a residual push: the smaller of the sketch and the
    /// raw update log.
    fn byte_size(&self) -> usize {
        (self.de.len() * 4).min(self.delta_updates * 4)
    }
}

/// One TODS network over a set of monitored streams.
pub struct TodsNetwork {
    name: String,
    proj: Projection,
    theta: f64,
    streams: Vec<StreamId>,
    k: usize,
    site_index: FxHashMap<SourceId, usize>,
    /// `nodes[site][stream]` state, keyed by stream id.
    nodes: Vec<FxHashMap<StreamId, StreamState>>,
    /// Coordinator totals per stream.
    totals: FxHashMap<StreamId, Vec<f64>>,
    channels: ChannelTable,
    handles: Vec<RuleHandle>,
}

impl TodsNetwork {
    pub fn new(
        name: impl Into<String>,
        proj: Projection,
        theta: f64,
        streams: Vec<StreamId>,
        sources: impl IntoIterator<Item = SourceId>,
    ) -> Self {
        let site_index: FxHashMap<SourceId, usize> = sources
            .into_iter()
            .enumerate()
            .map(|(i, hid)| (hid, i))
            .collect();
        let k = site_index.len();
        assert!(k > 0, "network needs at least one site");
        let nodes = (0..k)
            .map(|_| {
                streams
                    .iter()
                    .map(|&sid| (sid, StreamState::new(proj.clone(), theta, k)))
                    .collect()
            })
            .collect();
        let totals = streams
            .iter()
            .map(|&sid| (sid, vec![0.0; proj.size()]))
            .collect();
        Self {
            name: name.into(),
            proj,
            theta,
            streams,
            k,
            site_index,
            nodes,
            totals,
            channels: ChannelTable::new(),
            handles: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    /// Worst-case error of the answered queries: sketch error plus the
    /// staleness allowed by the local condition.
    pub fn maximum_error(&self) -> f64 {
        let eps = self.proj.epsilon();
        eps + (1.0 + eps) * (1.0 + eps) * (2.0 * self.theta + self.theta * self.theta)
    }

    /// Self-join estimate of a stream from the coordinator totals.
    pub fn self_join_estimate(&self, sid: StreamId) -> Option<f64> {
        self.totals
            .get(&sid)
            .map(|e| agms::self_join_estimate(&self.proj, e))
    }

    /// Join estimate between two streams from the coordinator totals.
    pub fn join_estimate(&self, sid1: StreamId, sid2: StreamId) -> Option<f64> {
        let e1 = self.totals.get(&sid1)?;
        let e2 = self.totals.get(&sid2)?;
        Some(agms::inner_product_estimate(&self.proj, e1, e2))
    }

    pub fn process_record(&mut self, sim: &Sim) {
        let rec = sim.stream_record();
        if !self.streams.contains(&rec.sid) {
            return;
        }
        let Some(&site) = self.site_index.get(&rec.hid) else {
            return;
        };
        let state = self.nodes[site]
            .get_mut(&rec.sid)
            .expect("stream state exists for every monitored stream");
        state.update(rec.key, rec.weight());
        if !state.local_condition() {
            self.channels.oneway(
                Host::Site(site),
                Host::Coordinator,
                Endpoint::Update,
                state.byte_size(),
            );
            let total = self
                .totals
                .get_mut(&rec.sid)
                .expect("coordinator total exists for every monitored stream");
            agms::add_assign(total, &state.de);
            state.flush();
        }
    }

    fn output_results(&self, sim: &Sim) {
        let meta = sim.metadata();
        let comm = CommRow::from_channels(&self.channels, meta.bytes());
        debug!(
            name = %self.name,
            max_error = self.maximum_error(),
            total_bytes = comm.total_bytes,
            "TODS results"
        );
        sim.with_outputs(|out| out.emit_comm(&comm));
    }

    fn dismantle(&mut self, sim: &Sim) {
        for handle in self.handles.drain(..) {
            sim.cancel(handle);
        }
    }

    pub fn install(net: Rc<RefCell<TodsNetwork>>, sim: &Sim) {
        let handles = vec![
            sim.on(SimEvent::StartRecord, {
                let net = Rc::clone(&net);
                move |sim| net.borrow_mut().process_record(sim)
            }),
            sim.on(SimEvent::Results, {
                let net = Rc::clone(&net);
                move |sim| net.borrow().output_results(sim)
            }),
            sim.on(SimEvent::Done, {
                let net = Rc::clone(&net);
                move |sim| net.borrow_mut().dismantle(sim)
            }),
        ];
        net.borrow_mut().handles = handles;
    }
}
