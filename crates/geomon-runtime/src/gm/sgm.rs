//! The set-based geometric method (SGM).
//!
//! Each site tracks a local drift vector `U` inside a safe zone built
//! around the shared reference `E`. When a site's zeta goes non-positive
//! it signals the coordinator, which either rebalances a subset of sites
//! (a sub-round) or collects every drift, moves `E`, and opens a new
//! round.

use crate::channels::{ChannelTable, Endpoint, Host};
use crate::context::{RuleHandle, Sim, SimEvent};
use crate::gm::{CompressedState, GmProtocol, Rebalancing};
use crate::query::{ContinuousQuery, QueryState};
use crate::results::{CommRow, GmRow};
use geomon_core::agms::{add_assign, scale};
use geomon_core::szone::SafeZone;
use geomon_core::types::{Record, SourceId, SIGNAL_WIRE_SIZE};
use indexmap::IndexSet;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Per-site protocol state. Nodes are owned by the network and receive
/// records routed by source id.
pub struct Node {
    site: usize,
    u: Vec<f64>,
    szone: SafeZone,
    zeta: f64,
    update_count: usize,
    round_local_updates: usize,
}

impl Node {
    fn new(site: usize, state_size: usize) -> Self {
        Self {
            site,
            u: vec![0.0; state_size],
            szone: SafeZone::nil(),
            zeta: f64::NAN,
            update_count: 0,
            round_local_updates: 0,
        }
    }

    pub fn zeta(&self) -> f64 {
        self.zeta
    }

    pub fn drift(&self) -> &[f64] {
        &self.u
    }

    pub fn update_count(&self) -> usize {
        self.update_count
    }

    pub fn round_local_updates(&self) -> usize {
        self.round_local_updates
    }

    /// New-round reset: zero the drift, adopt the new safe zone, and
    /// re-evaluate zeta, which must be positive at the origin.
    fn reset(&mut self, szone: SafeZone) {
        self.szone = szone;
        self.u.fill(0.0);
        self.update_count = 0;
        self.round_local_updates = 0;
        self.zeta = self.szone.zeta(&self.u);
        assert!(
            self.zeta > 0.0,
            "site {}: safe zone inadmissible after reset (zeta = {})",
            self.site,
            self.zeta
        );
    }

    /// Snapshot the drift and zero the update counter. The drift vector
    /// itself is not cleared.
    fn get_drift(&mut self) -> CompressedState {
        let updates = self.update_count;
        self.update_count = 0;
        CompressedState {
            vec: self.u.clone(),
            updates,
        }
    }

    /// Adopt a rebalanced drift. The transmitted update count serves
    /// byte accounting only; the local counter keeps accruing.
    fn set_drift(&mut self, state: &CompressedState) {
        self.u.copy_from_slice(&state.vec);
        self.zeta = self.szone.zeta(&self.u);
        assert!(
            self.zeta > 0.0,
            "site {}: rebalanced drift outside safe zone (zeta = {})",
            self.site,
            self.zeta
        );
    }

    /// Apply one record. Returns whether the site entered violation.
    fn on_record(&mut self, query: &dyn ContinuousQuery, rec: &Record) -> bool {
        let delta = query.delta_update(&mut self.u, rec);
        if delta.is_empty() {
            return false;
        }
        self.update_count += 1;
        self.round_local_updates += 1;
        self.zeta = self.szone.zeta_inc(&delta, &self.u);
        self.zeta <= 0.0
    }
}

/// One SGM network: the coordinator state machine plus its owned sites.
pub struct SgmNetwork {
    name: String,
    query: Box<dyn ContinuousQuery>,
    state: Box<dyn QueryState>,
    rebalancing: Rebalancing,
    k: usize,
    site_index: FxHashMap<SourceId, usize>,
    nodes: Vec<Node>,
    channels: ChannelTable,
    /// The coordinator's own copy of the round's safe zone.
    zone: SafeZone,
    b: IndexSet<usize>,
    bcompl: IndexSet<usize>,
    ubal: Vec<f64>,
    ubal_updates: usize,
    num_rounds: usize,
    num_subrounds: usize,
    sz_sent: usize,
    total_rbl_size: usize,
    round_total_b: usize,
    total_updates: usize,
    largest_rebalance: usize,
    rng: StdRng,
    handles: Vec<RuleHandle>,
}

impl SgmNetwork {
    /// Build a network over the sites observed in the dataset. All
    /// pseudo-random choices derive from `seed`.
    pub fn new(
        name: impl Into<String>,
        query: Box<dyn ContinuousQuery>,
        rebalancing: Rebalancing,
        sources: impl IntoIterator<Item = SourceId>,
        seed: u64,
    ) -> Self {
        let site_index: FxHashMap<SourceId, usize> = sources
            .into_iter()
            .enumerate()
            .map(|(i, hid)| (hid, i))
            .collect();
        let k = site_index.len();
        assert!(k > 0, "network needs at least one site");
        let size = query.state_vector_size();
        let state = query.create_query_state();
        Self {
            name: name.into(),
            query,
            state,
            rebalancing,
            k,
            site_index,
            nodes: (0..k).map(|i| Node::new(i, size)).collect(),
            channels: ChannelTable::new(),
            zone: SafeZone::nil(),
            b: IndexSet::new(),
            bcompl: IndexSet::new(),
            ubal: vec![0.0; size],
            ubal_updates: 0,
            num_rounds: 0,
            num_subrounds: 0,
            sz_sent: 0,
            total_rbl_size: 0,
            round_total_b: 0,
            total_updates: 0,
            largest_rebalance: 0,
            rng: StdRng::seed_from_u64(seed),
            handles: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sites(&self) -> usize {
        self.k
    }

    /// Global query estimate. The reference tracks the site-average
    /// state and both query forms are quadratic, so the global value
    /// scales by `k²`.
    pub fn estimate(&self) -> f64 {
        (self.k * self.k) as f64 * self.state.estimate()
    }

    pub fn node(&self, site: usize) -> &Node {
        &self.nodes[site]
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn num_rounds(&self) -> usize {
        self.num_rounds
    }

    pub fn num_subrounds(&self) -> usize {
        self.num_subrounds
    }

    pub fn sz_sent(&self) -> usize {
        self.sz_sent
    }

    pub fn total_rbl_size(&self) -> usize {
        self.total_rbl_size
    }

    pub fn total_updates(&self) -> usize {
        self.total_updates
    }

    /// Size of the largest committed balancing set so far.
    pub fn largest_rebalance(&self) -> usize {
        self.largest_rebalance
    }

    /// Replay the warmup prefix straight into the reference, split
    /// evenly across sites.
    pub fn warmup(&mut self, sim: &Sim) {
        let mut de = vec![0.0; self.query.state_vector_size()];
        sim.with_warmup(|records| {
            for rec in records {
                self.query.update(&mut de, rec);
            }
        });
        scale(&mut de, 1.0 / self.k as f64);
        self.state.update_estimate(&de);
        debug!(name = %self.name, qest = self.state.estimate(), "warmup applied");
    }

    /// Route the record under dispatch to the owning site.
    pub fn process_record(&mut self, sim: &Sim) {
        let rec = sim.stream_record();
        let Some(&site) = self.site_index.get(&rec.hid) else {
            return;
        };
        if self.nodes[site].on_record(self.query.as_ref(), &rec) {
            self.channels.oneway(
                Host::Site(site),
                Host::Coordinator,
                Endpoint::LocalViolation,
                SIGNAL_WIRE_SIZE,
            );
            self.on_local_violation(site);
        }
    }

    /// Flush outstanding drifts into the estimate at end of stream.
    pub fn finish_rounds(&mut self) {
        self.b.clear();
        self.ubal.fill(0.0);
        self.rebalance_none();
    }

    fn fetch_updates(&mut self, site: usize) {
        let cs = self.nodes[site].get_drift();
        self.channels.round_trip(
            Host::Coordinator,
            Host::Site(site),
            Endpoint::GetDrift,
            0,
            cs.byte_size(),
        );
        self.on_drift_report(site, cs);
    }

    /// `Z(Ubal / |B|)` evaluated with the coordinator's zone copy.
    fn zeta_of_mean(&mut self) -> f64 {
        let mut mean = self.ubal.clone();
        scale(&mut mean, 1.0 / self.b.len() as f64);
        self.zone.zeta(&mean)
    }

    fn rebalance_none(&mut self) {
        self.bcompl.clear();
        for i in 0..self.k {
            self.bcompl.insert(i);
        }
        self.finish_round();
    }

    /// Grow the balancing set in a deterministic random order until the
    /// mean drift re-enters the zone. Returns whether it did; the
    /// remaining sites end up in `bcompl`.
    fn grow_balance_set(&mut self, violator: usize) -> bool {
        self.bcompl.clear();
        self.b.insert(violator);
        self.fetch_updates(violator);
        debug_assert!(self.zeta_of_mean() <= 0.0, "violation signal without breach");

        let mut others: Vec<usize> = (0..self.k).filter(|i| !self.b.contains(i)).collect();
        others.shuffle(&mut self.rng);

        let mut admissible = false;
        for site in others {
            if admissible {
                self.bcompl.insert(site);
            } else {
                self.b.insert(site);
                self.fetch_updates(site);
                admissible = self.zeta_of_mean() > 0.0;
            }
        }
        debug_assert_eq!(self.b.len() + self.bcompl.len(), self.k);
        admissible
    }

    fn rebalance_random(&mut self, violator: usize) {
        let admissible = self.grow_balance_set(violator);
        if !self.bcompl.is_empty() {
            debug_assert!(admissible);
            self.commit_rebalance();
        } else {
            self.finish_round();
        }
    }

    /// Like `rebalance_random`, with ad-hoc limits on the balancing-set
    /// size: at most `(k+3)/2` sites per sub-round and at most `k`
    /// rebalanced sites per round in total.
    fn rebalance_random_limits(&mut self, violator: usize) {
        let admissible = self.grow_balance_set(violator);
        let mut finish = self.bcompl.is_empty();
        finish = finish || self.b.len() > (self.k + 3) / 2;
        finish = finish || self.round_total_b + self.b.len() > self.k;
        if !finish {
            debug_assert!(admissible);
            self.commit_rebalance();
        } else {
            self.finish_round();
        }
    }

    /// Commit a sub-round: push the mean drift to every site of the
    /// balancing set.
    fn commit_rebalance(&mut self) {
        scale(&mut self.ubal, 1.0 / self.b.len() as f64);
        let zeta = self.zone.zeta(&self.ubal);
        assert!(zeta > 0.0, "rebalanced drift outside safe zone (zeta = {zeta})");

        let payload = CompressedState {
            vec: self.ubal.clone(),
            updates: self.ubal_updates,
        };
        let members: Vec<usize> = self.b.iter().copied().collect();
        for site in members {
            self.channels.oneway(
                Host::Coordinator,
                Host::Site(site),
                Endpoint::SetDrift,
                payload.byte_size(),
            );
            self.nodes[site].set_drift(&payload);
        }

        self.round_total_b += self.b.len();
        self.largest_rebalance = self.largest_rebalance.max(self.b.len());
        self.num_subrounds += 1;
        self.total_rbl_size += self.b.len();
        debug_assert!(self.nodes.iter().all(|n| n.zeta > 0.0));
        debug!(
            name = %self.name,
            balanced = self.b.len(),
            subround = self.num_subrounds,
            "rebalanced"
        );
    }

    fn dismantle(&mut self, sim: &Sim) {
        for handle in self.handles.drain(..) {
            sim.cancel(handle);
        }
    }

    fn output_results(&self, sim: &Sim) {
        let meta = sim.metadata();
        let comm = CommRow::from_channels(&self.channels, meta.bytes());
        let gm = GmRow {
            name: self.name.clone(),
            protocol: self.protocol_name().to_string(),
            max_error: self.query.max_error(),
            statevec_size: self.query.projection().size(),
            sites: self.k,
            sid: self.query.streams()[0] as u64,
            rounds: self.num_rounds,
            subrounds: self.num_subrounds,
            sz_sent: self.sz_sent,
            total_rbl_size: self.total_rbl_size,
            bytes_get_drift: GmRow::drift_bytes(&self.channels),
        };
        sim.with_outputs(|out| {
            out.emit_comm(&comm);
            out.emit_gm(&gm);
        });
    }

    /// Wire a network into a simulation. The network reacts to INIT
    /// (warmup and first round), START_RECORD (dispatch), END_STREAM
    /// (final round flush), REPORT, RESULTS and DONE (teardown).
    pub fn install(net: Rc<RefCell<SgmNetwork>>, sim: &Sim) {
        let handles = vec![
            sim.on(SimEvent::Init, {
                let net = Rc::clone(&net);
                move |sim| {
                    let mut n = net.borrow_mut();
                    n.warmup(sim);
                    n.start_round();
                }
            }),
            sim.on(SimEvent::StartRecord, {
                let net = Rc::clone(&net);
                move |sim| net.borrow_mut().process_record(sim)
            }),
            sim.on(SimEvent::EndStream, {
                let net = Rc::clone(&net);
                move |_| net.borrow_mut().finish_rounds()
            }),
            sim.on(SimEvent::Report, {
                let net = Rc::clone(&net);
                move |_| {
                    let n = net.borrow();
                    debug!(name = %n.name, qest = n.estimate(), rounds = n.num_rounds, "report");
                }
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

impl GmProtocol for SgmNetwork {
    fn protocol_name(&self) -> &'static str {
        "SGM"
    }

    fn start_round(&mut self) {
        self.zone = self.state.safezone();
        for site in 0..self.k {
            self.sz_sent += 1;
            self.channels.oneway(
                Host::Coordinator,
                Host::Site(site),
                Endpoint::Reset,
                self.zone.byte_size(),
            );
            let zone = self.zone.clone();
            self.nodes[site].reset(zone);
        }
        self.num_rounds += 1;
        self.num_subrounds += 1;
        self.round_total_b = 0;
        // Zeroed here only; sub-round rebalances zero just Ubal.
        self.ubal_updates = 0;
        debug!(
            name = %self.name,
            round = self.num_rounds,
            qest = self.state.estimate(),
            "start round"
        );
    }

    fn on_local_violation(&mut self, site: usize) {
        self.b.clear();
        self.ubal.fill(0.0);
        if self.k > 1 {
            match self.rebalancing {
                Rebalancing::None => self.rebalance_none(),
                Rebalancing::Random => self.rebalance_random(site),
                Rebalancing::RandomLimits => self.rebalance_random_limits(site),
            }
        } else {
            self.rebalance_none();
        }
    }

    fn on_drift_report(&mut self, _site: usize, state: CompressedState) {
        add_assign(&mut self.ubal, &state.vec);
        self.ubal_updates += state.updates;
        self.total_updates += state.updates;
    }

    fn finish_round(&mut self) {
        let pending: Vec<usize> = self.bcompl.iter().copied().collect();
        for site in pending {
            self.fetch_updates(site);
        }
        scale(&mut self.ubal, 1.0 / self.k as f64);
        self.state.update_estimate(&self.ubal);
        self.start_round();
    }
}
