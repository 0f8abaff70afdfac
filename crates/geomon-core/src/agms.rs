//! AGMS sketches.
//!
//! An AGMS sketch summarizes a frequency vector into `depth · width`
//! counters. Each of the `depth` rows hashes a key to one bucket and a
//! 4-wise independent ±1 sign; the inner product of two sketches over the
//! same projection estimates the inner product of the underlying
//! frequency vectors, with the median across rows controlling the
//! failure probability and the width controlling the variance.

use crate::delta::Delta;
use crate::types::Key;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// The Mersenne prime 2³¹ − 1 used by the polynomial hash families.
const MERSENNE_31: u64 = (1 << 31) - 1;

/// Reduce a value below 2⁶² modulo 2³¹ − 1.
#[inline]
fn mod31(x: u64) -> u64 {
    let r = (x >> 31) + (x & MERSENNE_31);
    let r = (r >> 31) + (r & MERSENNE_31);
    if r >= MERSENNE_31 {
        r - MERSENNE_31
    } else {
        r
    }
}

/// One hash family row: a pairwise-independent bucket hash and a 4-wise
/// independent sign hash, both polynomials over GF(2³¹ − 1).
#[derive(Debug, Clone, Copy)]
struct HashRow {
    bucket_a: u64,
    bucket_b: u64,
    sign: [u64; 4],
}

impl HashRow {
    fn draw(rng: &mut StdRng) -> Self {
        let mut coeff = || rng.gen_range(1..MERSENNE_31);
        Self {
            bucket_a: coeff(),
            bucket_b: coeff(),
            sign: [coeff(), coeff(), coeff(), coeff()],
        }
    }

    #[inline]
    fn bucket(&self, width: usize, key: Key) -> usize {
        (mod31(self.bucket_a.wrapping_mul(key as u64) + self.bucket_b) % width as u64) as usize
    }

    #[inline]
    fn sign(&self, key: Key) -> f64 {
        // Cubic polynomial in the key, evaluated by Horner's rule; the
        // low bit decides the sign.
        let x = key as u64;
        let mut r = self.sign[0];
        for &c in &self.sign[1..] {
            r = mod31(r.wrapping_mul(x) + c);
        }
        if r & 1 == 1 {
            1.0
        } else {
            -1.0
        }
    }
}

#[derive(Debug)]
struct ProjectionInner {
    depth: usize,
    width: usize,
    seed: u64,
    rows: Vec<HashRow>,
}

/// Hash-family parameters of a sketch: `depth` rows of `width` buckets,
/// seeded deterministically. Cheap to clone and immutable for its whole
/// lifetime; two sketches over equal projections are pointwise
/// comparable.
#[derive(Debug, Clone)]
pub struct Projection {
    inner: Arc<ProjectionInner>,
}

impl Projection {
    pub fn new(depth: usize, width: usize, seed: u64) -> Self {
        assert!(depth > 0 && width > 0, "projection must have depth and width");
        let mut rng = StdRng::seed_from_u64(seed);
        let rows = (0..depth).map(|_| HashRow::draw(&mut rng)).collect();
        Self {
            inner: Arc::new(ProjectionInner {
                depth,
                width,
                seed,
                rows,
            }),
        }
    }

    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    pub fn width(&self) -> usize {
        self.inner.width
    }

    pub fn seed(&self) -> u64 {
        self.inner.seed
    }

    /// Length of the flat state vector: `depth · width`.
    pub fn size(&self) -> usize {
        self.inner.depth * self.inner.width
    }

    /// Bucket index of `key` in row `d`.
    pub fn bucket(&self, d: usize, key: Key) -> usize {
        self.inner.rows[d].bucket(self.inner.width, key)
    }

    /// ±1 sign of `key` in row `d`.
    pub fn sign(&self, d: usize, key: Key) -> f64 {
        self.inner.rows[d].sign(key)
    }

    /// Standard error bound of the estimator at this width.
    pub fn epsilon(&self) -> f64 {
        4.0 / (self.inner.width as f64).sqrt()
    }

    /// Apply a single key update of weight `w` to a sketch-shaped state
    /// vector stored at `base` inside `v`, returning the delta of the
    /// `depth` changed counters.
    pub fn update_vec(&self, v: &mut [f64], base: usize, key: Key, w: f64) -> Delta {
        let (depth, width) = (self.inner.depth, self.inner.width);
        debug_assert!(base + depth * width <= v.len());
        let mut delta = Delta::with_capacity(depth);
        for (d, row) in self.inner.rows.iter().enumerate() {
            let idx = base + d * width + row.bucket(width, key);
            let old = v[idx];
            let new = old + w * row.sign(key);
            v[idx] = new;
            delta.push(idx, old, new);
        }
        delta
    }
}

impl PartialEq for Projection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.depth == other.inner.depth
            && self.inner.width == other.inner.width
            && self.inner.seed == other.inner.seed
    }
}

impl Eq for Projection {}

/// Lower median of a set of values: the middle element for odd lengths,
/// the lower of the two middle elements for even lengths.
pub fn lower_median(vals: &mut [f64]) -> f64 {
    assert!(!vals.is_empty(), "median of empty set");
    let mid = (vals.len() - 1) / 2;
    let (_, m, _) = vals.select_nth_unstable_by(mid, f64::total_cmp);
    *m
}

/// Estimate the inner product of the frequency vectors summarized by two
/// sketch-shaped state vectors: row-wise dot products, combined by the
/// lower median. Symmetric in its arguments.
pub fn inner_product_estimate(proj: &Projection, x: &[f64], y: &[f64]) -> f64 {
    let (depth, width) = (proj.depth(), proj.width());
    assert_eq!(x.len(), proj.size());
    assert_eq!(y.len(), proj.size());
    let mut rows: Vec<f64> = (0..depth)
        .map(|d| {
            let lo = d * width;
            dot(&x[lo..lo + width], &y[lo..lo + width])
        })
        .collect();
    lower_median(&mut rows)
}

/// Estimate the self-join (second frequency moment) of the summarized
/// stream.
pub fn self_join_estimate(proj: &Projection, x: &[f64]) -> f64 {
    inner_product_estimate(proj, x, x)
}

/// Full dot product of two equally long state vectors.
pub fn dot(x: &[f64], y: &[f64]) -> f64 {
    debug_assert_eq!(x.len(), y.len());
    x.iter().zip(y).map(|(a, b)| a * b).sum()
}

/// `dst += src`, elementwise.
pub fn add_assign(dst: &mut [f64], src: &[f64]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

/// `dst *= c`, elementwise.
pub fn scale(dst: &mut [f64], c: f64) {
    for d in dst.iter_mut() {
        *d *= c;
    }
}

/// An AGMS sketch: a projection together with its counters.
#[derive(Debug, Clone)]
pub struct Sketch {
    proj: Projection,
    data: Vec<f64>,
}

impl Sketch {
    pub fn new(proj: Projection) -> Self {
        let data = vec![0.0; proj.size()];
        Self { proj, data }
    }

    pub fn projection(&self) -> &Projection {
        &self.proj
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Counters of row `d`.
    pub fn row(&self, d: usize) -> &[f64] {
        let width = self.proj.width();
        &self.data[d * width..(d + 1) * width]
    }

    /// Add `w` occurrences of `key` and return the delta of changed
    /// counters.
    pub fn update(&mut self, key: Key, w: f64) -> Delta {
        self.proj.update_vec(&mut self.data, 0, key, w)
    }

    pub fn self_join_estimate(&self) -> f64 {
        self_join_estimate(&self.proj, &self.data)
    }

    pub fn inner_product_estimate(&self, other: &Sketch) -> f64 {
        assert!(
            self.proj == other.proj,
            "sketches over different projections are not comparable"
        );
        inner_product_estimate(&self.proj, &self.data, &other.data)
    }

    /// `‖S‖²` recomputed from scratch.
    pub fn norm2(&self) -> f64 {
        dot(&self.data, &self.data)
    }
}
