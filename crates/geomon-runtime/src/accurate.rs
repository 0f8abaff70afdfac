//! Exact and single-site baseline estimators.
//!
//! These components answer the same queries as the distributed protocols
//! but centrally: the exact methods over plain frequency histograms, the
//! AGMS methods over a single incrementally maintained sketch. They
//! serve as ground truth in tests and as reference methods in runs.

use crate::context::{RuleHandle, Sim, SimEvent};
use geomon_core::agms::{lower_median, Projection, Sketch};
use geomon_core::types::{Key, Record, StreamId};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Exact self-join: `Σ_k f(k)²` maintained incrementally over a
/// frequency histogram.
pub struct SelfJoinExact {
    name: String,
    sid: StreamId,
    hist: FxHashMap<Key, f64>,
    curest: f64,
}

impl SelfJoinExact {
    pub fn new(name: impl Into<String>, sid: StreamId) -> Self {
        Self {
            name: name.into(),
            sid,
            hist: FxHashMap::default(),
            curest: 0.0,
        }
    }

    pub fn current_estimate(&self) -> f64 {
        self.curest
    }

    fn apply(&mut self, rec: &Record) {
        if rec.sid != self.sid {
            return;
        }
        let w = rec.weight();
        let f = self.hist.entry(rec.key).or_insert(0.0);
        // (f + w)² − f²
        self.curest += w * (2.0 * *f + w);
        *f += w;
    }

    pub fn install(me: Rc<RefCell<Self>>, sim: &Sim) {
        install_query_method(me, sim, |m, rec| m.apply(rec), |m| (m.name.clone(), m.curest));
    }
}

/// Exact two-way join: `Σ_k f1(k)·f2(k)` over two histograms.
pub struct TwoWayJoinExact {
    name: String,
    sid1: StreamId,
    sid2: StreamId,
    hist1: FxHashMap<Key, f64>,
    hist2: FxHashMap<Key, f64>,
    curest: f64,
}

impl TwoWayJoinExact {
    pub fn new(name: impl Into<String>, sid1: StreamId, sid2: StreamId) -> Self {
        Self {
            name: name.into(),
            sid1,
            sid2,
            hist1: FxHashMap::default(),
            hist2: FxHashMap::default(),
            curest: 0.0,
        }
    }

    pub fn current_estimate(&self) -> f64 {
        self.curest
    }

    fn apply(&mut self, rec: &Record) {
        let (own, other) = if rec.sid == self.sid1 {
            (&mut self.hist1, &self.hist2)
        } else if rec.sid == self.sid2 {
            (&mut self.hist2, &self.hist1)
        } else {
            return;
        };
        let w = rec.weight();
        self.curest += w * other.get(&rec.key).copied().unwrap_or(0.0);
        *own.entry(rec.key).or_insert(0.0) += w;
    }

    pub fn install(me: Rc<RefCell<Self>>, sim: &Sim) {
        install_query_method(me, sim, |m, rec| m.apply(rec), |m| (m.name.clone(), m.curest));
    }
}

/// Single-site AGMS self-join estimator with per-row scalars maintained
/// incrementally from deltas.
pub struct SelfJoinAgms {
    name: String,
    sid: StreamId,
    sketch: Sketch,
    row_norms: Vec<f64>,
    curest: f64,
}

impl SelfJoinAgms {
    pub fn new(name: impl Into<String>, sid: StreamId, proj: Projection) -> Self {
        let depth = proj.depth();
        Self {
            name: name.into(),
            sid,
            sketch: Sketch::new(proj),
            row_norms: vec![0.0; depth],
            curest: 0.0,
        }
    }

    pub fn current_estimate(&self) -> f64 {
        self.curest
    }

    fn apply(&mut self, rec: &Record) {
        if rec.sid != self.sid {
            return;
        }
        let width = self.sketch.projection().width();
        let delta = self.sketch.update(rec.key, rec.weight());
        for entry in &delta {
            self.row_norms[entry.index / width] += entry.new * entry.new - entry.old * entry.old;
        }
        let mut rows = self.row_norms.clone();
        self.curest = lower_median(&mut rows);
    }

    pub fn install(me: Rc<RefCell<Self>>, sim: &Sim) {
        install_query_method(me, sim, |m, rec| m.apply(rec), |m| (m.name.clone(), m.curest));
    }
}

/// Single-site AGMS two-way join estimator over one sketch per stream,
/// with per-row dot products maintained incrementally.
pub struct TwoWayJoinAgms {
    name: String,
    sid1: StreamId,
    sid2: StreamId,
    sketch1: Sketch,
    sketch2: Sketch,
    row_dots: Vec<f64>,
    curest: f64,
}

impl TwoWayJoinAgms {
    pub fn new(name: impl Into<String>, sid1: StreamId, sid2: StreamId, proj: Projection) -> Self {
        let depth = proj.depth();
        Self {
            name: name.into(),
            sid1,
            sid2,
            sketch1: Sketch::new(proj.clone()),
            sketch2: Sketch::new(proj),
            row_dots: vec![0.0; depth],
            curest: 0.0,
        }
    }

    pub fn current_estimate(&self) -> f64 {
        self.curest
    }

    fn apply(&mut self, rec: &Record) {
        let (own, other) = if rec.sid == self.sid1 {
            (&mut self.sketch1, &self.sketch2)
        } else if rec.sid == self.sid2 {
            (&mut self.sketch2, &self.sketch1)
        } else {
            return;
        };
        let width = own.projection().width();
        let delta = own.update(rec.key, rec.weight());
        for entry in &delta {
            // The other sketch is untouched by this record, so the row
            // dot product moves by (new − old) times its counter.
            self.row_dots[entry.index / width] +=
                (entry.new - entry.old) * other.as_slice()[entry.index];
        }
        let mut rows = self.row_dots.clone();
        self.curest = lower_median(&mut rows);
    }

    pub fn install(me: Rc<RefCell<Self>>, sim: &Sim) {
        install_query_method(me, sim, |m, rec| m.apply(rec), |m| (m.name.clone(), m.curest));
    }
}

/// Shared wiring of a baseline: replay the warmup on INIT, apply every
/// record, log the estimate on REPORT, release rules on DONE.
fn install_query_method<M: 'static>(
    me: Rc<RefCell<M>>,
    sim: &Sim,
    apply: impl Fn(&mut M, &Record) + Copy + 'static,
    report: impl Fn(&M) -> (String, f64) + 'static,
) {
    let handles: Rc<RefCell<Vec<RuleHandle>>> = Rc::new(RefCell::new(Vec::new()));
    let hs = vec![
        sim.on(SimEvent::Init, {
            let me = Rc::clone(&me);
            move |sim| {
                let mut m = me.borrow_mut();
                sim.with_warmup(|records| {
                    for rec in records {
                        apply(&mut *m, rec);
                    }
                });
            }
        }),
        sim.on(SimEvent::StartRecord, {
            let me = Rc::clone(&me);
            move |sim| {
                let rec = sim.stream_record();
                apply(&mut *me.borrow_mut(), &rec);
            }
        }),
        sim.on(SimEvent::Report, {
            let me = Rc::clone(&me);
            move |_| {
                let (name, est) = report(&me.borrow());
                debug!(name = %name, estimate = est, "baseline estimate");
            }
        }),
        sim.on(SimEvent::Done, {
            let handles = Rc::clone(&handles);
            move |sim| {
                for h in handles.borrow_mut().drain(..) {
                    sim.cancel(h);
                }
            }
        }),
    ];
    *handles.borrow_mut() = hs;
}
