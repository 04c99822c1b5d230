//! First-order optimizers for the flow parameters.
//!
//! A deliberately small capability: `init` builds state for a flat parameter
//! vector, `update` applies one step in place. Variants are selected at
//! construction — plain SGD, Adam, optional global-norm gradient clipping,
//! and an optional NaN guard that skips (rather than applies) a non-finite
//! update and counts the skip, so training survives isolated numerical
//! blow-ups without hiding them.

use ndarray::{Array1, ArrayView1};

use crate::{Error, Result};

/// Parameter-update rule.
#[derive(Debug, Clone, Copy)]
pub enum OptMethod {
    /// Plain gradient descent.
    Sgd,
    /// Adam with the usual bias correction.
    Adam { beta1: f32, beta2: f32, eps: f32 },
}

impl OptMethod {
    /// Adam with the standard defaults.
    pub fn adam() -> Self {
        Self::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Optimizer configuration.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerConfig {
    pub method: OptMethod,
    pub learning_rate: f32,
    /// Clip the gradient to this global L2 norm before the update.
    pub max_grad_norm: Option<f32>,
    /// Skip non-finite gradients instead of applying them.
    pub skip_non_finite: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            method: OptMethod::adam(),
            learning_rate: 1e-3,
            max_grad_norm: Some(10.0),
            skip_non_finite: true,
        }
    }
}

/// Mutable optimizer state for one flat parameter vector.
#[derive(Debug, Clone)]
pub struct OptState {
    m: Array1<f32>,
    v: Array1<f32>,
    t: u64,
    /// Number of updates skipped because the gradient was not finite.
    pub ignored_grad_count: u64,
}

/// Outcome of one `update` call.
#[derive(Debug, Clone, Copy)]
pub struct UpdateInfo {
    /// Global L2 norm of the raw (pre-clip) gradient.
    pub grad_norm: f32,
    /// True when the update was skipped by the NaN guard.
    pub skipped: bool,
}

/// The optimizer capability: `init` + in-place `update`.
#[derive(Debug, Clone)]
pub struct Optimizer {
    cfg: OptimizerConfig,
}

impl Optimizer {
    pub fn new(cfg: OptimizerConfig) -> Result<Self> {
        if !(cfg.learning_rate > 0.0) || !cfg.learning_rate.is_finite() {
            return Err(Error::Config("learning_rate must be positive and finite"));
        }
        if let Some(c) = cfg.max_grad_norm {
            if !(c > 0.0) || !c.is_finite() {
                return Err(Error::Config("max_grad_norm must be positive and finite"));
            }
        }
        if let OptMethod::Adam { beta1, beta2, eps } = cfg.method {
            if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) || !(eps > 0.0) {
                return Err(Error::Config("adam moments must satisfy 0 <= beta < 1, eps > 0"));
            }
        }
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.cfg
    }

    pub fn init(&self, n_params: usize) -> OptState {
        OptState {
            m: Array1::zeros(n_params),
            v: Array1::zeros(n_params),
            t: 0,
            ignored_grad_count: 0,
        }
    }

    /// Apply one step of the configured rule to `params` in place.
    pub fn update(
        &self,
        grad: &ArrayView1<f32>,
        state: &mut OptState,
        params: &mut Array1<f32>,
    ) -> UpdateInfo {
        debug_assert_eq!(grad.len(), params.len());
        debug_assert_eq!(state.m.len(), params.len());

        let mut norm_sq = 0.0f32;
        for &g in grad {
            norm_sq += g * g;
        }
        let grad_norm = norm_sq.sqrt();

        if self.cfg.skip_non_finite && !grad_norm.is_finite() {
            state.ignored_grad_count += 1;
            return UpdateInfo {
                grad_norm,
                skipped: true,
            };
        }

        let scale = match self.cfg.max_grad_norm {
            Some(c) if grad_norm > c => c / grad_norm,
            _ => 1.0,
        };
        let lr = self.cfg.learning_rate;

        match self.cfg.method {
            OptMethod::Sgd => {
                for k in 0..params.len() {
                    params[k] -= lr * scale * grad[k];
                }
            }
            OptMethod::Adam { beta1, beta2, eps } => {
                state.t += 1;
                let bc1 = 1.0 - beta1.powi(state.t as i32);
                let bc2 = 1.0 - beta2.powi(state.t as i32);
                for k in 0..params.len() {
                    let g = scale * grad[k];
                    state.m[k] = beta1 * state.m[k] + (1.0 - beta1) * g;
                    state.v[k] = beta2 * state.v[k] + (1.0 - beta2) * g * g;
                    let m_hat = state.m[k] / bc1;
                    let v_hat = state.v[k] / bc2;
                    params[k] -= lr * m_hat / (v_hat.sqrt() + eps);
                }
            }
        }

        UpdateInfo {
            grad_norm,
            skipped: false,
        }
    }
}
