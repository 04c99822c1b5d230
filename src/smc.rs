//! Annealed sequential Monte Carlo forward pass.
//!
//! One run drives a particle batch from the flow (β=0) to the bootstrap
//! target (β=1) through the annealing schedule: per stage the particles are
//! **propagated** by Metropolis sweeps targeting π_β, **reweighted** by the
//! log-density ratio between consecutive stages, and **resampled** when the
//! effective sample size collapses below a configured fraction.
//!
//! Degenerate weight sets (every particle at −∞) are reported through
//! [`SmcDiagnostics`], never as an error: the caller decides whether a batch
//! is worth keeping.
//!
//! Adaptive state (per-stage proposal scales and their last acceptance
//! rates) is explicit in [`SmcState`] and threaded through every run, so a
//! training process can checkpoint and replay it deterministically.

use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::flow::FlowModel;
use crate::metropolis::{random_walk_sweeps, MetropolisConfig};
use crate::schedule::AnnealingSchedule;
use crate::target::TargetDensity;
use crate::{Error, Result};

/// Configuration of one SMC sampler.
#[derive(Debug, Clone)]
pub struct SmcConfig {
    /// Particles per forward pass.
    pub n_particles: usize,
    /// Annealing β grid and bootstrap power α.
    pub schedule: AnnealingSchedule,
    /// MCMC kernel knobs.
    pub mcmc: MetropolisConfig,
    /// Resample when ESS drops below this fraction of the particle count.
    /// Zero disables resampling entirely.
    pub ess_threshold_frac: f32,
}

/// Per-run adaptive state: proposal scale and last acceptance rate for each
/// annealing stage. Created once, updated by every forward pass.
#[derive(Debug, Clone)]
pub struct SmcState {
    pub step_sizes: Vec<f32>,
    pub accept_rates: Vec<f32>,
}

/// Per-pass diagnostics.
#[derive(Debug, Clone, Default)]
pub struct SmcDiagnostics {
    /// ESS after each stage's reweighting (before any resampling).
    pub ess_history: Vec<f32>,
    /// Acceptance rate of each stage's propagate step.
    pub accept_rates: Vec<f32>,
    /// Number of stages that triggered resampling.
    pub n_resamples: usize,
    /// True when the pass finished with no finite weight left.
    pub degenerate: bool,
}

/// Result of one forward pass.
#[derive(Debug, Clone)]
pub struct SmcOutput {
    /// Final particle batch (n × d).
    pub samples: Array2<f32>,
    /// Final unnormalized log importance weights.
    pub log_w: Array1<f32>,
    /// Flow log-density of each final particle (the β=0 proposal component,
    /// needed by the replay buffer's priority bookkeeping).
    pub log_q: Array1<f32>,
    pub diagnostics: SmcDiagnostics,
}

/// The annealed SMC sampler.
#[derive(Debug, Clone)]
pub struct SmcSampler {
    cfg: SmcConfig,
}

impl SmcSampler {
    pub fn new(cfg: SmcConfig) -> Result<Self> {
        if cfg.n_particles == 0 {
            return Err(Error::Config("n_particles must be >= 1"));
        }
        if !(0.0..=1.0).contains(&cfg.ess_threshold_frac) || !cfg.ess_threshold_frac.is_finite() {
            return Err(Error::Config("ess_threshold_frac must be in [0, 1]"));
        }
        cfg.mcmc.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &SmcConfig {
        &self.cfg
    }

    /// Fresh adaptive state: every stage starts at the configured initial
    /// proposal scale.
    pub fn init_state(&self) -> SmcState {
        let k = self.cfg.schedule.n_stages();
        SmcState {
            step_sizes: vec![self.cfg.mcmc.init_step_size; k],
            accept_rates: vec![0.0; k],
        }
    }

    /// One forward pass: flow samples in, annealed weighted particles out.
    pub fn run<F: FlowModel, T: TargetDensity>(
        &self,
        flow: &F,
        params: &ArrayView1<f32>,
        target: &T,
        state: &mut SmcState,
        rng: &mut ChaCha8Rng,
    ) -> Result<SmcOutput> {
        if flow.dim() != target.dim() {
            return Err(Error::Shape("flow and target dimensions must match"));
        }
        let k_stages = self.cfg.schedule.n_stages();
        if state.step_sizes.len() != k_stages || state.accept_rates.len() != k_stages {
            return Err(Error::Shape("SmcState does not match the schedule length"));
        }

        let n = self.cfg.n_particles;
        let (mut x, mut log_q) = flow.sample_and_log_prob(params, rng, n);
        let mut log_p = target.log_prob_batch(&x.view());
        let mut log_w = Array1::<f32>::zeros(n);
        let mut diag = SmcDiagnostics::default();

        let mut prev_beta = 0.0f32;
        for k in 0..k_stages {
            let beta = self.cfg.schedule.beta(k + 1);

            // Propagate: Metropolis sweeps leave π_β invariant; adapt the
            // stage's proposal scale from its observed acceptance rate.
            let stats = random_walk_sweeps(
                &self.cfg.mcmc,
                state.step_sizes[k],
                &self.cfg.schedule,
                beta,
                flow,
                params,
                target,
                &mut x,
                &mut log_q,
                &mut log_p,
                rng,
            );
            let rate = stats.accept_rate();
            state.step_sizes[k] = self.cfg.mcmc.adapt(state.step_sizes[k], rate);
            state.accept_rates[k] = rate;
            diag.accept_rates.push(rate);

            // Reweight by the bridge ratio between consecutive stages. Any
            // NaN/+∞ outcome is masked to −∞ so it can never win resampling.
            for i in 0..n {
                let incr = self.cfg.schedule.interpolate(beta, log_q[i], log_p[i])
                    - self.cfg.schedule.interpolate(prev_beta, log_q[i], log_p[i]);
                let w = log_w[i] + incr;
                log_w[i] = if w.is_nan() || w == f32::INFINITY {
                    f32::NEG_INFINITY
                } else {
                    w
                };
            }

            // Resample when the weight set degenerates.
            let ess = effective_sample_size(&log_w.view());
            diag.ess_history.push(ess);
            if ess > 0.0 && ess < self.cfg.ess_threshold_frac * n as f32 {
                if let Some(probs) = normalized_weights(&log_w.view()) {
                    let picks = systematic_resample_indices(&probs, n, rng);
                    let mut new_x = Array2::<f32>::zeros(x.raw_dim());
                    let mut new_log_q = Array1::<f32>::zeros(n);
                    let mut new_log_p = Array1::<f32>::zeros(n);
                    for (row, &src) in picks.iter().enumerate() {
                        for c in 0..x.ncols() {
                            new_x[[row, c]] = x[[src, c]];
                        }
                        new_log_q[row] = log_q[src];
                        new_log_p[row] = log_p[src];
                    }
                    x = new_x;
                    log_q = new_log_q;
                    log_p = new_log_p;
                    log_w.fill(0.0);
                    diag.n_resamples += 1;
                }
            }

            prev_beta = beta;
        }

        diag.degenerate = !log_w.iter().any(|w| w.is_finite());
        Ok(SmcOutput {
            samples: x,
            log_w,
            log_q,
            diagnostics: diag,
        })
    }
}

/// Numerically stable log Σ exp. Returns −∞ when no finite entry exists.
pub fn log_sum_exp(xs: &ArrayView1<f32>) -> f32 {
    let mut m = f32::NEG_INFINITY;
    for &v in xs {
        if v.is_finite() && v > m {
            m = v;
        }
    }
    if m == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    let mut s = 0.0f32;
    for &v in xs {
        if v.is_finite() {
            s += (v - m).exp();
        }
    }
    m + s.ln()
}

/// ESS of an unnormalized log-weight vector: \(1 / \sum \bar w_i^2\).
/// Zero when every weight is invalid.
pub fn effective_sample_size(log_w: &ArrayView1<f32>) -> f32 {
    let lse = log_sum_exp(log_w);
    if !lse.is_finite() {
        return 0.0;
    }
    let mut sum_sq = 0.0f32;
    for &w in log_w {
        if w.is_finite() {
            let nw = (w - lse).exp();
            sum_sq += nw * nw;
        }
    }
    if sum_sq > 0.0 {
        1.0 / sum_sq
    } else {
        0.0
    }
}

/// Normalized probabilities from log-weights; `None` when all mass is gone.
fn normalized_weights(log_w: &ArrayView1<f32>) -> Option<Vec<f32>> {
    let lse = log_sum_exp(log_w);
    if !lse.is_finite() {
        return None;
    }
    let probs = log_w
        .iter()
        .map(|&w| if w.is_finite() { (w - lse).exp() } else { 0.0 })
        .collect();
    Some(probs)
}

/// Systematic resampling: one uniform offset, `n_out` evenly spaced points
/// through the cumulative weight function. Low variance, O(n).
fn systematic_resample_indices(probs: &[f32], n_out: usize, rng: &mut ChaCha8Rng) -> Vec<usize> {
    debug_assert!(!probs.is_empty());
    let step = 1.0 / n_out as f32;
    let mut u = rng.random::<f32>() * step;
    let mut picks = Vec::with_capacity(n_out);
    let mut cum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cum += p;
        while picks.len() < n_out && u < cum {
            picks.push(i);
            u += step;
        }
    }
    // Float round-off can leave the last few points past the cumulative sum.
    while picks.len() < n_out {
        picks.push(probs.len() - 1);
    }
    picks
}
