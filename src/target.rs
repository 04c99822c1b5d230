//! Target-density contracts and reference targets.
//!
//! A target is an unnormalized log-density: a pure function of a point,
//! finite almost everywhere, allowed to return −∞ for infeasible
//! configurations. The SMC machinery never differentiates it.

use ndarray::{Array1, ArrayView1, ArrayView2};

/// An unnormalized target log-density over flat `f32` vectors.
pub trait TargetDensity {
    /// Event-space dimension.
    fn dim(&self) -> usize;

    /// Unnormalized log-density at one point. May return −∞; must not panic.
    fn log_prob(&self, x: &ArrayView1<f32>) -> f32;

    /// Row-wise [`Self::log_prob`] over a batch.
    fn log_prob_batch(&self, xs: &ArrayView2<f32>) -> Array1<f32> {
        let mut out = Array1::<f32>::zeros(xs.nrows());
        for i in 0..xs.nrows() {
            out[i] = self.log_prob(&xs.row(i));
        }
        out
    }
}

/// Diagonal Gaussian target. Mainly for tests and well-conditioned demos.
#[derive(Debug, Clone)]
pub struct DiagGaussianTarget {
    pub mean: Array1<f32>,
    pub std: Array1<f32>,
}

impl DiagGaussianTarget {
    pub fn new(mean: Array1<f32>, std: Array1<f32>) -> Self {
        assert_eq!(mean.len(), std.len());
        assert!(std.iter().all(|&s| s > 0.0 && s.is_finite()));
        Self { mean, std }
    }

    /// Standard normal in `dim` dimensions.
    pub fn standard(dim: usize) -> Self {
        Self::new(Array1::zeros(dim), Array1::from_elem(dim, 1.0))
    }
}

impl TargetDensity for DiagGaussianTarget {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn log_prob(&self, x: &ArrayView1<f32>) -> f32 {
        debug_assert_eq!(x.len(), self.mean.len());
        let mut lp = 0.0f32;
        for k in 0..self.mean.len() {
            let z = (x[k] - self.mean[k]) / self.std[k];
            lp += -0.5 * z * z - self.std[k].ln();
        }
        lp
    }
}

/// Many-particle double-well target over pairwise distances.
///
/// A point is a flat vector viewed as `n_vertices × vertex_dim` positions;
/// the energy sums a quartic double-well potential over all ordered vertex
/// pairs:
/// \[
/// E(x) = \frac{1}{2\tau} \sum_{i,j}
///   a\,(d_{ij} - d_0) + b\,(d_{ij} - d_0)^2 + c\,(d_{ij} - d_0)^4,
/// \]
/// and the log-density is −E. With the default coefficients (b < 0 < c) each
/// pair distance has two stable wells, which makes the density multimodal
/// enough to need annealing.
#[derive(Debug, Clone)]
pub struct DoubleWellTarget {
    pub n_vertices: usize,
    pub vertex_dim: usize,
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d0: f32,
    pub tau: f32,
}

impl DoubleWellTarget {
    /// Default hyper-parameters: a=0, b=−4, c=0.9, d0=4, τ=1.
    pub fn new(n_vertices: usize, vertex_dim: usize) -> Self {
        assert!(n_vertices >= 2);
        assert!(vertex_dim >= 1);
        Self {
            n_vertices,
            vertex_dim,
            a: 0.0,
            b: -4.0,
            c: 0.9,
            d0: 4.0,
            tau: 1.0,
        }
    }

    fn energy(&self, x: &ArrayView1<f32>) -> f32 {
        let (n, d) = (self.n_vertices, self.vertex_dim);
        debug_assert_eq!(x.len(), n * d);
        let mut e = 0.0f32;
        for i in 0..n {
            for j in 0..n {
                let mut sq = 0.0f32;
                for k in 0..d {
                    let diff = x[i * d + k] - x[j * d + k];
                    sq += diff * diff;
                }
                let dd = sq.sqrt() - self.d0;
                let dd2 = dd * dd;
                e += self.a * dd + self.b * dd2 + self.c * dd2 * dd2;
            }
        }
        e / self.tau / 2.0
    }
}

impl TargetDensity for DoubleWellTarget {
    fn dim(&self) -> usize {
        self.n_vertices * self.vertex_dim
    }

    fn log_prob(&self, x: &ArrayView1<f32>) -> f32 {
        -self.energy(x)
    }
}
