//! Safe-zone functions over sketch space.
//!
//! A safe zone is a function `Z` of the drift vector `U`, built around a
//! reference state `E`, with `Z(0) > 0` and the property that the
//! monitored estimate stays within its accuracy bounds while the average
//! of per-site drifts keeps `Z` positive. Zones come in two flavours:
//! the *non-eikonal* ones are plain quadratic forms, the *eikonal* ones
//! take square roots (distances), which is tighter but costlier.
//!
//! Every zone supports full evaluation and an O(depth) incremental
//! evaluation driven by a [`Delta`], using per-row scalar caches kept in
//! a [`Scratch`] owned by whoever holds the zone.

use crate::agms::{dot, lower_median, Projection};
use crate::delta::Delta;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Per-holder incremental-evaluation state: two scalar summaries per
/// sketch row. Invalid scratch is rebuilt by the next full evaluation.
#[derive(Debug, Clone, Default)]
pub struct Scratch {
    a: Vec<f64>,
    b: Vec<f64>,
    valid: bool,
}

impl Scratch {
    fn ensure(&mut self, depth: usize) {
        if self.a.len() != depth {
            self.a = vec![0.0; depth];
            self.b = vec![0.0; depth];
            self.valid = false;
        }
    }
}

/// An immutable safe-zone function definition. Holders evaluate it
/// through a [`SafeZone`] wrapper that owns the mutable scratch.
pub trait SafeZoneFn: fmt::Debug + Send + Sync {
    /// Full evaluation of `Z(U)`. Rebuilds the scratch caches.
    fn compute_zeta(&self, scratch: &mut Scratch, u: &[f64]) -> f64;

    /// Incremental evaluation given the delta of the latest update and
    /// the already-updated `U`. Falls back to a full evaluation when the
    /// scratch is not yet primed.
    fn compute_zeta_inc(&self, scratch: &mut Scratch, delta: &Delta, u: &[f64]) -> f64;

    /// Allocate scratch sized for this zone.
    fn alloc_scratch(&self) -> Scratch;

    /// Number of float32 words this zone occupies on the wire.
    fn zeta_size(&self) -> usize;
}

/// Value-semantics wrapper around a safe-zone function: a shared
/// reference to the immutable definition plus owned scratch. Scratch is
/// allocated lazily on first evaluation; clones share the definition and
/// allocate their own scratch on demand; moves carry the scratch along.
/// Dropping the wrapper releases the scratch.
#[derive(Debug, Default)]
pub struct SafeZone {
    func: Option<Arc<dyn SafeZoneFn>>,
    scratch: Option<Scratch>,
}

impl SafeZone {
    /// The null zone. Evaluates to NaN.
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn new(func: Arc<dyn SafeZoneFn>) -> Self {
        Self {
            func: Some(func),
            scratch: None,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.func.is_none()
    }

    /// `Z(U)`, full evaluation.
    pub fn zeta(&mut self, u: &[f64]) -> f64 {
        match &self.func {
            Some(f) => {
                let scratch = self.scratch.get_or_insert_with(|| f.alloc_scratch());
                f.compute_zeta(scratch, u)
            }
            None => f64::NAN,
        }
    }

    /// `Z(U)` after `delta` was applied to `U`, incremental evaluation.
    pub fn zeta_inc(&mut self, delta: &Delta, u: &[f64]) -> f64 {
        match &self.func {
            Some(f) => {
                let scratch = self.scratch.get_or_insert_with(|| f.alloc_scratch());
                f.compute_zeta_inc(scratch, delta, u)
            }
            None => f64::NAN,
        }
    }

    /// Wire size of the zone in bytes (float32 words).
    pub fn byte_size(&self) -> usize {
        self.func.as_ref().map_or(0, |f| f.zeta_size() * 4)
    }
}

impl Clone for SafeZone {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
            scratch: None,
        }
    }
}

type RowVals = SmallVec<[f64; 16]>;

/// Safe zone monitoring a self-join estimate within `[t_low, t_high]`
/// around the reference `E`.
///
/// Per row `d`, with `X_d = E_d + U_d`, the scratch carries `‖X_d‖²` and
/// `X_d · E_d`. The upper-bound piece compares `‖X_d‖` (eikonal) or
/// `‖X_d‖²` (quadratic) against the bound; the lower-bound piece uses
/// the projection of `X_d` onto `E_d` (eikonal) or its tangent-plane
/// linearization at `E` (quadratic). Rows combine by lower median,
/// mirroring the estimator, and the zone value is the minimum of the two
/// bound pieces.
pub struct SelfJoinZone {
    proj: Projection,
    e: Vec<f64>,
    e_row_norm: Vec<f64>,
    t_low: f64,
    t_high: f64,
    eikonal: bool,
}

impl SelfJoinZone {
    pub fn new(proj: Projection, e: Vec<f64>, t_low: f64, t_high: f64, eikonal: bool) -> Self {
        assert_eq!(e.len(), proj.size());
        assert!(t_high >= t_low);
        let width = proj.width();
        let e_row_norm = (0..proj.depth())
            .map(|d| dot(&e[d * width..(d + 1) * width], &e[d * width..(d + 1) * width]).sqrt())
            .collect();
        Self {
            proj,
            e,
            e_row_norm,
            t_low,
            t_high,
            eikonal,
        }
    }

    fn refill(&self, scratch: &mut Scratch, u: &[f64]) {
        let (depth, width) = (self.proj.depth(), self.proj.width());
        for d in 0..depth {
            let mut norm2 = 0.0;
            let mut proj_e = 0.0;
            for j in d * width..(d + 1) * width {
                let x = self.e[j] + u[j];
                norm2 += x * x;
                proj_e += x * self.e[j];
            }
            scratch.a[d] = norm2;
            scratch.b[d] = proj_e;
        }
        scratch.valid = true;
    }

    fn combine(&self, scratch: &Scratch) -> f64 {
        let depth = self.proj.depth();
        let mut upper: RowVals = SmallVec::with_capacity(depth);
        let mut lower: RowVals = SmallVec::with_capacity(depth);
        for d in 0..depth {
            let norm2 = scratch.a[d].max(0.0);
            if self.eikonal {
                upper.push(self.t_high.max(0.0).sqrt() - norm2.sqrt());
            } else {
                upper.push(self.t_high - norm2);
            }
            if self.t_low <= 0.0 {
                // The estimate is non-negative; the lower bound is inert.
                lower.push(f64::INFINITY);
            } else if self.eikonal {
                let en = self.e_row_norm[d];
                let support = if en > 0.0 {
                    scratch.b[d] / en
                } else {
                    norm2.sqrt()
                };
                lower.push(support - self.t_low.sqrt());
            } else {
                let en = self.e_row_norm[d];
                lower.push(2.0 * scratch.b[d] - en * en - self.t_low);
            }
        }
        lower_median(&mut upper).min(lower_median(&mut lower))
    }
}

impl fmt::Debug for SelfJoinZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfJoinZone")
            .field("t_low", &self.t_low)
            .field("t_high", &self.t_high)
            .field("eikonal", &self.eikonal)
            .finish()
    }
}

impl SafeZoneFn for SelfJoinZone {
    fn compute_zeta(&self, scratch: &mut Scratch, u: &[f64]) -> f64 {
        debug_assert_eq!(u.len(), self.e.len());
        scratch.ensure(self.proj.depth());
        self.refill(scratch, u);
        self.combine(scratch)
    }

    fn compute_zeta_inc(&self, scratch: &mut Scratch, delta: &Delta, u: &[f64]) -> f64 {
        scratch.ensure(self.proj.depth());
        if !scratch.valid {
            return self.compute_zeta(scratch, u);
        }
        let width = self.proj.width();
        for entry in delta {
            let d = entry.index / width;
            let e_val = self.e[entry.index];
            let x_old = e_val + entry.old;
            let x_new = e_val + entry.new;
            scratch.a[d] += x_new * x_new - x_old * x_old;
            scratch.b[d] += (entry.new - entry.old) * e_val;
        }
        self.combine(scratch)
    }

    fn alloc_scratch(&self) -> Scratch {
        let mut s = Scratch::default();
        s.ensure(self.proj.depth());
        s
    }

    fn zeta_size(&self) -> usize {
        self.proj.size() + 2
    }
}

/// Safe zone monitoring a two-way join estimate within `[t_low, t_high]`
/// around the concatenated reference `E = [E1; E2]`.
///
/// Per row `d`, with `X1, X2` the two halves at `E + U`, the scratch
/// carries `P_d = ‖X1_d + X2_d‖²` and `M_d = ‖X1_d − X2_d‖²`; the row
/// estimate is `(P_d − M_d)/4`. Bound pieces follow the same
/// eikonal/quadratic split as the self-join zone, rows combine by lower
/// median, and the zone value is the minimum over the two bounds.
pub struct TwoWayJoinZone {
    proj: Projection,
    e: Vec<f64>,
    t_low: f64,
    t_high: f64,
    eikonal: bool,
}

impl TwoWayJoinZone {
    pub fn new(proj: Projection, e: Vec<f64>, t_low: f64, t_high: f64, eikonal: bool) -> Self {
        assert_eq!(e.len(), 2 * proj.size());
        assert!(t_high >= t_low);
        Self {
            proj,
            e,
            t_low,
            t_high,
            eikonal,
        }
    }

    fn half(&self) -> usize {
        self.proj.size()
    }

    fn refill(&self, scratch: &mut Scratch, u: &[f64]) {
        let (depth, width) = (self.proj.depth(), self.proj.width());
        let half = self.half();
        for d in 0..depth {
            let mut p = 0.0;
            let mut m = 0.0;
            for j in d * width..(d + 1) * width {
                let x1 = self.e[j] + u[j];
                let x2 = self.e[half + j] + u[half + j];
                p += (x1 + x2) * (x1 + x2);
                m += (x1 - x2) * (x1 - x2);
            }
            scratch.a[d] = p;
            scratch.b[d] = m;
        }
        scratch.valid = true;
    }

    fn combine(&self, scratch: &Scratch) -> f64 {
        let depth = self.proj.depth();
        let mut upper: RowVals = SmallVec::with_capacity(depth);
        let mut lower: RowVals = SmallVec::with_capacity(depth);
        for d in 0..depth {
            let p = scratch.a[d].max(0.0);
            let m = scratch.b[d].max(0.0);
            if self.eikonal {
                let hi = 4.0 * self.t_high + m;
                upper.push(if hi < 0.0 {
                    // p ≥ 0 always exceeds the bound here; the row is out.
                    f64::NEG_INFINITY
                } else {
                    hi.sqrt() - p.sqrt()
                });
                let lo = 4.0 * self.t_low + m;
                lower.push(if lo <= 0.0 {
                    f64::INFINITY
                } else {
                    p.sqrt() - lo.sqrt()
                });
            } else {
                upper.push(4.0 * self.t_high - (p - m));
                lower.push((p - m) - 4.0 * self.t_low);
            }
        }
        lower_median(&mut upper).min(lower_median(&mut lower))
    }
}

impl fmt::Debug for TwoWayJoinZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoWayJoinZone")
            .field("t_low", &self.t_low)
            .field("t_high", &self.t_high)
            .field("eikonal", &self.eikonal)
            .finish()
    }
}

impl SafeZoneFn for TwoWayJoinZone {
    fn compute_zeta(&self, scratch: &mut Scratch, u: &[f64]) -> f64 {
        debug_assert_eq!(u.len(), self.e.len());
        scratch.ensure(self.proj.depth());
        self.refill(scratch, u);
        self.combine(scratch)
    }

    fn compute_zeta_inc(&self, scratch: &mut Scratch, delta: &Delta, u: &[f64]) -> f64 {
        scratch.ensure(self.proj.depth());
        if !scratch.valid {
            return self.compute_zeta(scratch, u);
        }
        let width = self.proj.width();
        let half = self.half();
        for entry in delta {
            let (pos, partner) = if entry.index < half {
                (entry.index, half + entry.index)
            } else {
                (entry.index - half, entry.index - half)
            };
            let d = pos / width;
            let x_old = self.e[entry.index] + entry.old;
            let x_new = self.e[entry.index] + entry.new;
            let other = self.e[partner] + u[partner];
            scratch.a[d] += (x_new + other) * (x_new + other) - (x_old + other) * (x_old + other);
            scratch.b[d] += (x_new - other) * (x_new - other) - (x_old - other) * (x_old - other);
        }
        self.combine(scratch)
    }

    fn alloc_scratch(&self) -> Scratch {
        let mut s = Scratch::default();
        s.ensure(self.proj.depth());
        s
    }

    fn zeta_size(&self) -> usize {
        2 * self.proj.size() + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agms::Sketch;

    fn seeded_state(n: usize) -> (Projection, Vec<f64>, f64) {
        let proj = Projection::new(5, 16, 1138);
        let mut sk = Sketch::new(proj.clone());
        for _ in 0..n {
            sk.update(42, 1.0);
        }
        let qest = sk.self_join_estimate();
        (proj, sk.as_slice().to_vec(), qest)
    }

    fn self_join_zone(theta: f64, eikonal: bool) -> (SafeZone, Projection) {
        let (proj, e, qest) = seeded_state(100);
        let zone = SelfJoinZone::new(
            proj.clone(),
            e,
            (1.0 - theta) * qest,
            (1.0 + theta) * qest,
            eikonal,
        );
        (SafeZone::new(Arc::new(zone)), proj)
    }

    #[test]
    fn admissible_at_zero_drift() {
        for eikonal in [true, false] {
            let (mut zone, proj) = self_join_zone(0.1, eikonal);
            let u = vec![0.0; proj.size()];
            assert!(zone.zeta(&u) > 0.0, "eikonal={eikonal}");
        }
    }

    #[test]
    fn upper_bound_breach_flips_sign() {
        // Single-key state: the estimate is exactly (100 + n)², so the
        // zone must go non-positive once (100+n)² > 1.1 · 100².
        for eikonal in [true, false] {
            let (mut zone, proj) = self_join_zone(0.1, eikonal);
            let mut u = vec![0.0; proj.size()];
            let mut n = 0;
            loop {
                proj.update_vec(&mut u, 0, 42, 1.0);
                n += 1;
                let breached = ((100.0 + n as f64).powi(2)) > 1.1 * 10_000.0;
                let zeta = zone.zeta(&u);
                if breached {
                    assert!(zeta <= 0.0, "eikonal={eikonal} n={n} zeta={zeta}");
                    break;
                }
                assert!(zeta > 0.0, "eikonal={eikonal} n={n} zeta={zeta}");
            }
        }
    }

    #[test]
    fn lower_bound_breach_flips_sign() {
        for eikonal in [true, false] {
            let (mut zone, proj) = self_join_zone(0.1, eikonal);
            let mut u = vec![0.0; proj.size()];
            // Deleting enough mass pushes the estimate under 0.9 · 100².
            for _ in 0..10 {
                proj.update_vec(&mut u, 0, 42, -1.0);
            }
            assert!(zone.zeta(&u) <= 0.0, "eikonal={eikonal}");
        }
    }

    #[test]
    fn incremental_matches_full() {
        for eikonal in [true, false] {
            let (mut inc_zone, proj) = self_join_zone(0.2, eikonal);
            let mut full_zone = inc_zone.clone();
            let mut u = vec![0.0; proj.size()];
            // Prime the incremental scratch.
            inc_zone.zeta(&u);
            for k in 0..200u32 {
                let delta = proj.update_vec(&mut u, 0, k % 17, 1.0);
                let zi = inc_zone.zeta_inc(&delta, &u);
                let zf = full_zone.zeta(&u);
                assert!(
                    (zi - zf).abs() <= 1e-9 * zf.abs().max(1.0),
                    "eikonal={eikonal} k={k}: {zi} vs {zf}"
                );
            }
        }
    }

    #[test]
    fn clone_reallocates_scratch() {
        let (mut zone, proj) = self_join_zone(0.1, true);
        let u = vec![0.0; proj.size()];
        let z0 = zone.zeta(&u);
        let mut copy = zone.clone();
        assert_eq!(copy.zeta(&u), z0);
    }

    #[test]
    fn nil_zone_is_nan() {
        let mut zone = SafeZone::nil();
        assert!(zone.zeta(&[]).is_nan());
        assert_eq!(zone.byte_size(), 0);
    }

    #[test]
    fn byte_size_counts_float32_words() {
        let (zone, proj) = self_join_zone(0.1, true);
        assert_eq!(zone.byte_size(), (proj.size() + 2) * 4);
    }

    #[test]
    fn two_way_zone_tracks_join_bounds() {
        let proj = Projection::new(5, 32, 7);
        let size = proj.size();
        let mut e = vec![0.0; 2 * size];
        // Both halves carry the same single key: join estimate 50·50.
        for _ in 0..50 {
            proj.update_vec(&mut e, 0, 9, 1.0);
            proj.update_vec(&mut e, size, 9, 1.0);
        }
        let qest = 2500.0;
        let width = 0.2 * qest;
        for eikonal in [true, false] {
            let zone = TwoWayJoinZone::new(
                proj.clone(),
                e.clone(),
                qest - width,
                qest + width,
                eikonal,
            );
            let mut zone = SafeZone::new(Arc::new(zone));
            let mut u = vec![0.0; 2 * size];
            assert!(zone.zeta(&u) > 0.0, "eikonal={eikonal}");

            // Growing one side: estimate is (50+n)·50, breaches at n ≥ 11.
            for _ in 0..11 {
                proj.update_vec(&mut u, 0, 9, 1.0);
            }
            assert!(zone.zeta(&u) <= 0.0, "eikonal={eikonal}");
        }
    }

    #[test]
    fn two_way_incremental_matches_full() {
        let proj = Projection::new(5, 32, 7);
        let size = proj.size();
        let mut e = vec![0.0; 2 * size];
        for k in 0..20u32 {
            proj.update_vec(&mut e, 0, k, 1.0);
            proj.update_vec(&mut e, size, k % 5, 1.0);
        }
        let zone: Arc<dyn SafeZoneFn> =
            Arc::new(TwoWayJoinZone::new(proj.clone(), e, -500.0, 500.0, true));
        let mut inc_zone = SafeZone::new(zone.clone());
        let mut full_zone = SafeZone::new(zone);
        let mut u = vec![0.0; 2 * size];
        inc_zone.zeta(&u);
        for k in 0..100u32 {
            let base = if k % 2 == 0 { 0 } else { size };
            let delta = proj.update_vec(&mut u, base, k % 13, 1.0);
            let zi = inc_zone.zeta_inc(&delta, &u);
            let zf = full_zone.zeta(&u);
            assert!(
                (zi - zf).abs() <= 1e-9 * zf.abs().max(1.0),
                "k={k}: {zi} vs {zf}"
            );
        }
    }
}
