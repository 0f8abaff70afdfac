//! Continuous queries over sketched streams.
//!
//! A continuous query binds a monitored function (self-join or two-way
//! join) to sketch dimensions and knows how to apply a record to a
//! sketch-shaped state vector. Its query state carries the global
//! reference `E`, the current estimate `Q(E)`, and builds the safe zone
//! around `E` that the protocol ships to the sites.

use crate::gm::ProtocolConfig;
use geomon_core::agms::{self, Projection};
use geomon_core::szone::{SafeZone, SelfJoinZone, TwoWayJoinZone};
use geomon_core::types::{Record, StreamId};
use geomon_core::Delta;
use std::sync::Arc;

/// A query monitored by a geometric-method network.
pub trait ContinuousQuery {
    /// Length of the state vector the query operates on.
    fn state_vector_size(&self) -> usize;

    /// The stream ids this query listens to.
    fn streams(&self) -> Vec<StreamId>;

    /// Safe-zone width parameter.
    fn theta(&self) -> f64;

    fn projection(&self) -> &Projection;

    fn config(&self) -> &ProtocolConfig;

    /// Apply a record to the state vector and return the delta of
    /// changed counters. Records of foreign streams leave the state
    /// untouched and yield an empty delta.
    fn delta_update(&self, state: &mut [f64], rec: &Record) -> Delta;

    /// Apply a record, discarding the delta; returns whether the record
    /// touched the state.
    fn update(&self, state: &mut [f64], rec: &Record) -> bool {
        !self.delta_update(state, rec).is_empty()
    }

    /// Fresh query state with `E = 0`.
    fn create_query_state(&self) -> Box<dyn QueryState>;

    /// Worst-case combined error of sketching plus safe-zone width.
    fn max_error(&self) -> f64 {
        let eps = self.projection().epsilon();
        let theta = self.theta();
        eps + (1.0 + eps) * (1.0 + eps) * (2.0 * theta + theta * theta)
    }
}

/// The global reference state of one query.
pub trait QueryState {
    /// Current estimate `Q(E)`.
    fn estimate(&self) -> f64;

    /// The reference vector `E`.
    fn reference(&self) -> &[f64];

    /// Shift the reference by an aggregated drift and refresh the
    /// estimate and bounds.
    fn update_estimate(&mut self, du: &[f64]);

    /// Build the safe zone around the current reference.
    fn safezone(&self) -> SafeZone;
}

/// Self-join (second frequency moment) on one stream.
pub struct SelfJoinQuery {
    pub sid: StreamId,
    pub proj: Projection,
    pub theta: f64,
    pub config: ProtocolConfig,
}

impl ContinuousQuery for SelfJoinQuery {
    fn state_vector_size(&self) -> usize {
        self.proj.size()
    }

    fn streams(&self) -> Vec<StreamId> {
        vec![self.sid]
    }

    fn theta(&self) -> f64 {
        self.theta
    }

    fn projection(&self) -> &Projection {
        &self.proj
    }

    fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    fn delta_update(&self, state: &mut [f64], rec: &Record) -> Delta {
        if rec.sid != self.sid {
            return Delta::new();
        }
        self.proj.update_vec(state, 0, rec.key, rec.weight())
    }

    fn create_query_state(&self) -> Box<dyn QueryState> {
        Box::new(SelfJoinState {
            proj: self.proj.clone(),
            theta: self.theta,
            eikonal: self.config.eikonal,
            e: vec![0.0; self.proj.size()],
            qest: 0.0,
        })
    }
}

struct SelfJoinState {
    proj: Projection,
    theta: f64,
    eikonal: bool,
    e: Vec<f64>,
    qest: f64,
}

impl QueryState for SelfJoinState {
    fn estimate(&self) -> f64 {
        self.qest
    }

    fn reference(&self) -> &[f64] {
        &self.e
    }

    fn update_estimate(&mut self, du: &[f64]) {
        agms::add_assign(&mut self.e, du);
        self.qest = agms::self_join_estimate(&self.proj, &self.e);
    }

    fn safezone(&self) -> SafeZone {
        let t_low = (1.0 - self.theta) * self.qest;
        let t_high = (1.0 + self.theta) * self.qest;
        SafeZone::new(Arc::new(SelfJoinZone::new(
            self.proj.clone(),
            self.e.clone(),
            t_low,
            t_high,
            self.eikonal,
        )))
    }
}

/// Two-way join between two streams. The state vector is the
/// concatenation of one sketch per stream; a record updates exactly the
/// half its stream id selects.
pub struct TwoWayJoinQuery {
    pub sid1: StreamId,
    pub sid2: StreamId,
    pub proj: Projection,
    pub theta: f64,
    pub config: ProtocolConfig,
}

impl ContinuousQuery for TwoWayJoinQuery {
    fn state_vector_size(&self) -> usize {
        2 * self.proj.size()
    }

    fn streams(&self) -> Vec<StreamId> {
        vec![self.sid1, self.sid2]
    }

    fn theta(&self) -> f64 {
        self.theta
    }

    fn projection(&self) -> &Projection {
        &self.proj
    }

    fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    fn delta_update(&self, state: &mut [f64], rec: &Record) -> Delta {
        let base = if rec.sid == self.sid1 {
            0
        } else if rec.sid == self.sid2 {
            self.proj.size()
        } else {
            return Delta::new();
        };
        self.proj.update_vec(state, base, rec.key, rec.weight())
    }

    fn create_query_state(&self) -> Box<dyn QueryState> {
        Box::new(TwoWayJoinState {
            proj: self.proj.clone(),
            theta: self.theta,
            eikonal: self.config.eikonal,
            e: vec![0.0; 2 * self.proj.size()],
            qest: 0.0,
        })
    }
}

struct TwoWayJoinState {
    proj: Projection,
    theta: f64,
    eikonal: bool,
    e: Vec<f64>,
    qest: f64,
}

impl TwoWayJoinState {
    /// Natural scale of the join: `√(SJ(E1)·SJ(E2))`, the Cauchy-Schwarz
    /// bound the sketch error is relative to.
    fn scale(&self) -> f64 {
        let half = self.proj.size();
        let sj1 = agms::self_join_estimate(&self.proj, &self.e[..half]);
        let sj2 = agms::self_join_estimate(&self.proj, &self.e[half..]);
        (sj1.max(0.0) * sj2.max(0.0)).sqrt()
    }
}

impl QueryState for TwoWayJoinState {
    fn estimate(&self) -> f64 {
        self.qest
    }

    fn reference(&self) -> &[f64] {
        &self.e
    }

    fn update_estimate(&mut self, du: &[f64]) {
        agms::add_assign(&mut self.e, du);
        let half = self.proj.size();
        self.qest = agms::inner_product_estimate(&self.proj, &self.e[..half], &self.e[half..]);
    }

    fn safezone(&self) -> SafeZone {
        let width = self.theta * self.scale();
        SafeZone::new(Arc::new(TwoWayJoinZone::new(
            self.proj.clone(),
            self.e.clone(),
            self.qest - width,
            self.qest + width,
            self.eikonal,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geomon_core::types::StreamOp;

    fn proj() -> Projection {
        Projection::new(5, 16, 1138)
    }

    fn rec(sid: StreamId, key: u32) -> Record {
        Record::new(0, sid, 0, key, StreamOp::Insert)
    }

    #[test]
    fn foreign_stream_leaves_state_untouched() {
        let q = SelfJoinQuery {
            sid: 3,
            proj: proj(),
            theta: 0.1,
            config: ProtocolConfig::default(),
        };
        let mut state = vec![0.0; q.state_vector_size()];
        let delta = q.delta_update(&mut state, &rec(5, 42));
        assert!(delta.is_empty());
        assert!(state.iter().all(|&c| c == 0.0));
        assert!(!q.update(&mut state, &rec(5, 42)));
    }

    #[test]
    fn two_way_updates_exactly_one_half() {
        let q = TwoWayJoinQuery {
            sid1: 1,
            sid2: 2,
            proj: proj(),
            theta: 0.1,
            config: ProtocolConfig::default(),
        };
        let half = q.proj.size();
        let mut state = vec![0.0; q.state_vector_size()];

        let d1 = q.delta_update(&mut state, &rec(1, 7));
        assert!(d1.iter().all(|e| e.index < half));
        assert!(state[half..].iter().all(|&c| c == 0.0));

        let d2 = q.delta_update(&mut state, &rec(2, 7));
        assert!(d2.iter().all(|e| e.index >= half));
    }

    #[test]
    fn fresh_state_is_zero() {
        let q = SelfJoinQuery {
            sid: 0,
            proj: proj(),
            theta: 0.1,
            config: ProtocolConfig::default(),
        };
        let state = q.create_query_state();
        assert_eq!(state.estimate(), 0.0);
        assert!(state.reference().iter().all(|&c| c == 0.0));
    }

    #[test]
    fn update_estimate_tracks_single_key_mass() {
        let q = SelfJoinQuery {
            sid: 0,
            proj: proj(),
            theta: 0.1,
            config: ProtocolConfig::default(),
        };
        let mut qs = q.create_query_state();
        let mut du = vec![0.0; q.state_vector_size()];
        for _ in 0..100 {
            q.update(&mut du, &rec(0, 42));
        }
        qs.update_estimate(&du);
        assert_eq!(qs.estimate(), 10_000.0);
        let mut zone = qs.safezone();
        assert!(zone.zeta(&vec![0.0; q.state_vector_size()]) > 0.0);
    }

    #[test]
    fn max_error_combines_epsilon_and_theta() {
        let q = SelfJoinQuery {
            sid: 0,
            proj: Projection::new(5, 1600, 1),
            theta: 0.1,
            config: ProtocolConfig::default(),
        };
        let eps = q.projection().epsilon();
        let expected = eps + (1.0 + eps) * (1.0 + eps) * (2.0 * 0.1 + 0.01);
        assert_eq!(q.max_error(), expected);
    }
}
