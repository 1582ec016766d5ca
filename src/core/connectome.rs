#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "simd")]
use wide::f64x4;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Backend used for the dense coupling mat-vec.
///
/// - `Scalar`: single-threaded baseline, works everywhere
/// - `Simd`: 4-lane `f64` dot products (requires `simd` feature)
/// - `Parallel`: rows split across the rayon pool (requires `parallel` feature)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExecutionTier {
    #[default]
    Scalar,
    Simd,
    Parallel,
}

impl ExecutionTier {
    /// The tier that will actually run, given compile-time features.
    pub fn effective(self) -> ExecutionTier {
        match self {
            ExecutionTier::Scalar => ExecutionTier::Scalar,
            ExecutionTier::Simd => {
                #[cfg(feature = "simd")]
                {
                    ExecutionTier::Simd
                }
                #[cfg(not(feature = "simd"))]
                {
                    ExecutionTier::Scalar
                }
            }
            ExecutionTier::Parallel => {
                #[cfg(feature = "parallel")]
                {
                    ExecutionTier::Parallel
                }
                #[cfg(not(feature = "parallel"))]
                {
                    ExecutionTier::Scalar
                }
            }
        }
    }
}

/// Number of strictly-upper-triangular entries of an `n`×`n` matrix.
#[inline]
pub fn edge_count(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

/// Dense, symmetric, zero-diagonal region-to-region coupling matrix.
///
/// Stored row-major. Immutable once built; the engine keeps its own
/// normalized copy.
#[derive(Debug, Clone, PartialEq)]
pub struct CouplingMatrix {
    n: usize,
    data: Vec<f64>,
}

impl CouplingMatrix {
    /// Build from the strictly-upper-triangular entries in row-major order.
    ///
    /// The vector must hold exactly `n(n-1)/2` finite values; shorter or
    /// longer input is rejected rather than truncated.
    pub fn from_upper_triangle(vec: &[f64], n: usize) -> SimResult<Self> {
        if n == 0 {
            return Err(SimError::InvalidParameter(
                "region count must be at least 1".to_string(),
            ));
        }
        let expected = edge_count(n);
        if vec.len() != expected {
            return Err(SimError::DimensionMismatch {
                expected,
                actual: vec.len(),
            });
        }
        if let Some((idx, w)) = vec.iter().enumerate().find(|(_, w)| !w.is_finite()) {
            return Err(SimError::InvalidParameter(format!(
                "coupling entry {idx} is not finite: {w}"
            )));
        }

        let mut data = vec![0.0f64; n * n];
        let mut values = vec.iter();
        for i in 0..n {
            for j in (i + 1)..n {
                if let Some(&w) = values.next() {
                    data[i * n + j] = w;
                }
            }
        }

        // W + W^T, then zero the diagonal.
        for i in 0..n {
            for j in (i + 1)..n {
                let s = data[i * n + j] + data[j * n + i];
                data[i * n + j] = s;
                data[j * n + i] = s;
            }
            data[i * n + i] = 0.0;
        }

        Ok(Self { n, data })
    }

    /// All-zero coupling between `n` regions.
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n..(i + 1) * self.n]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Largest absolute entry (0.0 for an empty or all-zero matrix).
    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0f64, |m, &w| m.max(w.abs()))
    }

    pub fn is_symmetric(&self, tol: f64) -> bool {
        (0..self.n).all(|i| {
            ((i + 1)..self.n).all(|j| (self.get(i, j) - self.get(j, i)).abs() <= tol)
        })
    }

    /// Flatten back to the upper-triangle vector the builder consumes.
    pub fn upper_triangle(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(edge_count(self.n));
        for i in 0..self.n {
            out.extend_from_slice(&self.row(i)[i + 1..]);
        }
        out
    }

    /// Scale so the largest absolute entry becomes `scale`.
    ///
    /// `eps` keeps an all-zero matrix at zero instead of dividing by zero.
    pub fn normalized(&self, scale: f64, eps: f64) -> Self {
        let factor = scale / (self.max_abs() + eps);
        Self {
            n: self.n,
            data: self.data.iter().map(|&w| w * factor).collect(),
        }
    }

    /// `out = W · x`.
    pub fn mul_vec(&self, x: &[f64], out: &mut [f64], tier: ExecutionTier) {
        debug_assert_eq!(x.len(), self.n);
        debug_assert_eq!(out.len(), self.n);
        match tier.effective() {
            ExecutionTier::Scalar => self.mul_vec_scalar(x, out),
            ExecutionTier::Simd => self.mul_vec_simd(x, out),
            ExecutionTier::Parallel => self.mul_vec_parallel(x, out),
        }
    }

    fn mul_vec_scalar(&self, x: &[f64], out: &mut [f64]) {
        for (i, o) in out.iter_mut().enumerate() {
            *o = dot_scalar(self.row(i), x);
        }
    }

    #[cfg(feature = "simd")]
    fn mul_vec_simd(&self, x: &[f64], out: &mut [f64]) {
        for (i, o) in out.iter_mut().enumerate() {
            *o = dot_simd(self.row(i), x);
        }
    }

    #[cfg(not(feature = "simd"))]
    fn mul_vec_simd(&self, x: &[f64], out: &mut [f64]) {
        self.mul_vec_scalar(x, out);
    }

    #[cfg(feature = "parallel")]
    fn mul_vec_parallel(&self, x: &[f64], out: &mut [f64]) {
        out.par_iter_mut()
            .zip(self.data.par_chunks(self.n))
            .for_each(|(o, row)| *o = dot_scalar(row, x));
    }

    #[cfg(not(feature = "parallel"))]
    fn mul_vec_parallel(&self, x: &[f64], out: &mut [f64]) {
        self.mul_vec_scalar(x, out);
    }
}

#[inline]
fn dot_scalar(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(feature = "simd")]
fn dot_simd(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len();
    let simd_end = n - (n % 4);
    let mut acc = f64x4::splat(0.0);
    for i in (0..simd_end).step_by(4) {
        let va = f64x4::from([a[i], a[i + 1], a[i + 2], a[i + 3]]);
        let vb = f64x4::from([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        acc = acc + va * vb;
    }
    let mut sum = acc.reduce_add();
    for i in simd_end..n {
        sum += a[i] * b[i];
    }
    sum
}
