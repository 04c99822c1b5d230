//! The FAB training protocol: annealed SMC into a prioritised buffer,
//! replayed for several off-policy gradient updates per refill.
//!
//! One [`FabTrainer::step`] performs, in order:
//!
//! 1. draw `n_updates_per_refill` priority-weighted batches from the buffer,
//! 2. run one gradient update per batch, sequentially, carrying optimizer
//!    state forward; the loss on a batch is
//!    \(-\tfrac1B \sum_i \mathrm{clip}(e^{(1-\alpha)(\log q - \log q_{old})},
//!    w_{clip}) \cdot \log q\), with the clipped weight held constant under
//!    differentiation,
//! 3. adjust the sampled buffer entries with the recorded per-sample
//!    corrections (each evaluated against the parameters its batch's loss
//!    used, i.e. before that batch's own update),
//! 4. run one SMC forward pass with the parameters as they stood *before*
//!    step 2 — neither computation reads the other's writes, so a pipelined
//!    executor may overlap them,
//! 5. insert the SMC output into the buffer.
//!
//! The entire mutable snapshot (flow parameters, optimizer state, SMC
//! adaptation state, buffer state, RNG) moves by value through
//! [`TrainState`]; there is no hidden shared state anywhere in the loop.

use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::buffer::{BufferState, PrioritisedBuffer};
use crate::flow::FlowModel;
use crate::optimizer::{OptState, Optimizer};
use crate::smc::{SmcDiagnostics, SmcSampler, SmcState};
use crate::target::TargetDensity;
use crate::{Error, Result};

/// FAB loss and replay knobs.
#[derive(Debug, Clone, Copy)]
pub struct FabConfig {
    /// Bootstrap power α; must equal the annealing schedule's α.
    pub alpha: f32,
    /// Upper clip on the importance-weight correction of one stale sample.
    pub w_clip: f32,
    /// Samples per gradient update.
    pub batch_size: usize,
    /// Gradient updates per SMC refill.
    pub n_updates_per_refill: usize,
}

impl Default for FabConfig {
    fn default() -> Self {
        Self {
            alpha: 2.0,
            w_clip: 10.0,
            batch_size: 128,
            n_updates_per_refill: 4,
        }
    }
}

/// The whole mutable training snapshot, moved by value between steps.
///
/// Checkpointing is the caller's concern; serializing the four state
/// components (plus the RNG) as one unit keeps a restored run consistent.
#[derive(Debug, Clone)]
pub struct TrainState {
    pub params: Array1<f32>,
    pub opt_state: OptState,
    pub smc_state: SmcState,
    pub buffer_state: BufferState,
    pub rng: ChaCha8Rng,
}

/// Per-step diagnostics record.
#[derive(Debug, Clone)]
pub struct StepInfo {
    /// Loss of each gradient update, in execution order.
    pub losses: Vec<f32>,
    /// Raw gradient norm of each update.
    pub grad_norms: Vec<f32>,
    /// Cumulative count of updates skipped by the optimizer's NaN guard.
    pub ignored_grad_count: u64,
    /// Buffer adjustments dropped because their correction was not finite.
    pub n_adjust_skipped: usize,
    /// Rows the SMC refill actually inserted into the buffer.
    pub n_added: usize,
    pub smc: SmcDiagnostics,
}

/// The FAB algorithm: a flow, a target, and the machinery between them.
#[derive(Debug, Clone)]
pub struct FabTrainer<F, T> {
    flow: F,
    target: T,
    smc: SmcSampler,
    buffer: PrioritisedBuffer,
    optimizer: Optimizer,
    cfg: FabConfig,
}

impl<F: FlowModel, T: TargetDensity> FabTrainer<F, T> {
    pub fn new(
        flow: F,
        target: T,
        smc: SmcSampler,
        buffer: PrioritisedBuffer,
        optimizer: Optimizer,
        cfg: FabConfig,
    ) -> Result<Self> {
        if flow.dim() != target.dim() {
            return Err(Error::Shape("flow and target dimensions must match"));
        }
        if buffer.config().dim != flow.dim() {
            return Err(Error::Shape("buffer dim must match the flow event dim"));
        }
        if cfg.alpha != smc.config().schedule.alpha() {
            return Err(Error::Config("alpha must match the annealing schedule"));
        }
        if !(cfg.w_clip > 0.0) || !cfg.w_clip.is_finite() {
            return Err(Error::Config("w_clip must be positive and finite"));
        }
        if cfg.batch_size == 0 || cfg.n_updates_per_refill == 0 {
            return Err(Error::Config("batch_size and n_updates_per_refill must be >= 1"));
        }
        if cfg.batch_size > buffer.config().min_fill {
            return Err(Error::Config("batch_size must not exceed the buffer min_fill"));
        }
        Ok(Self {
            flow,
            target,
            smc,
            buffer,
            optimizer,
            cfg,
        })
    }

    pub fn flow(&self) -> &F {
        &self.flow
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn config(&self) -> &FabConfig {
        &self.cfg
    }

    /// Initialize the training snapshot: flow parameters, optimizer and SMC
    /// state, then enough SMC forward passes to seed the buffer past its
    /// minimum fill. The seeding passes also warm up the SMC step-size
    /// adaptation before the first gradient update.
    pub fn init(&self, seed: u64) -> Result<TrainState> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let params = self.flow.init_params(seed);
        let opt_state = self.optimizer.init(self.flow.n_params());
        let mut smc_state = self.smc.init_state();

        let n_particles = self.smc.config().n_particles;
        let n_forward = self.buffer.config().min_fill / n_particles + 1;
        let dim = self.flow.dim();

        let mut xs = Array2::<f32>::zeros((n_forward * n_particles, dim));
        let mut log_ws = Array1::<f32>::zeros(n_forward * n_particles);
        let mut log_qs = Array1::<f32>::zeros(n_forward * n_particles);
        for f in 0..n_forward {
            let out = self
                .smc
                .run(&self.flow, &params.view(), &self.target, &mut smc_state, &mut rng)?;
            let base = f * n_particles;
            for i in 0..n_particles {
                for k in 0..dim {
                    xs[[base + i, k]] = out.samples[[i, k]];
                }
                log_ws[base + i] = out.log_w[i];
                log_qs[base + i] = out.log_q[i];
            }
        }

        let buffer_state = self
            .buffer
            .init(&xs.view(), &log_ws.view(), &log_qs.view())?;

        Ok(TrainState {
            params,
            opt_state,
            smc_state,
            buffer_state,
            rng,
        })
    }

    /// One FAB step. Consumes the snapshot and returns its successor plus
    /// the step's diagnostics.
    pub fn step(&self, state: TrainState) -> Result<(TrainState, StepInfo)> {
        let TrainState {
            params,
            mut opt_state,
            mut smc_state,
            mut buffer_state,
            mut rng,
        } = state;
        let n_updates = self.cfg.n_updates_per_refill;
        let batch_size = self.cfg.batch_size;
        let n_params = self.flow.n_params();

        // 1) Priority-weighted replay draw. All buffer reads for this step
        //    happen here, before any write.
        let draw =
            self.buffer
                .sample_n_batches(&buffer_state, &mut rng, n_updates, batch_size)?;

        // The SMC refill (step 4) reads the parameters as they stand now,
        // before the gradient updates: both computations share one snapshot
        // and could run concurrently.
        let params_for_smc = params.clone();

        // 2) Sequential gradient updates.
        let mut params = params;
        let one_minus_alpha = 1.0 - self.cfg.alpha;
        let mut losses = Vec::with_capacity(n_updates);
        let mut grad_norms = Vec::with_capacity(n_updates);
        let mut adj_log_q = Array1::<f32>::zeros(n_updates * batch_size);
        let mut adj_log_w = Array1::<f32>::zeros(n_updates * batch_size);

        for (b, (xb, log_q_old_b)) in draw.samples.iter().zip(&draw.log_q_old).enumerate() {
            let inv = 1.0 / batch_size as f32;
            let mut loss = 0.0f32;
            let mut grad = Array1::<f32>::zeros(n_params);
            for i in 0..batch_size {
                let (log_q, g) = self.flow.grad_log_prob(&params.view(), &xb.row(i));
                let log_w_adjust = one_minus_alpha * (log_q - log_q_old_b[i]);
                // The clipped weight is a constant under differentiation:
                // only log q carries gradient.
                let w = log_w_adjust.exp().min(self.cfg.w_clip);
                loss -= inv * w * log_q;
                for k in 0..n_params {
                    grad[k] -= inv * w * g[k];
                }
                adj_log_w[b * batch_size + i] = log_w_adjust;
                adj_log_q[b * batch_size + i] = log_q;
            }
            let info = self.optimizer.update(&grad.view(), &mut opt_state, &mut params);
            losses.push(loss);
            grad_norms.push(info.grad_norm);
        }

        // 3) Re-point the replayed entries at the parameters their losses
        //    used, so priorities track the current flow instead of staying
        //    frozen at insertion time.
        let n_adjust_skipped = self.buffer.adjust(
            &mut buffer_state,
            &adj_log_q.view(),
            &adj_log_w.view(),
            &draw.indices,
        )?;

        // 4) Refill pass on the pre-update snapshot.
        let out = self.smc.run(
            &self.flow,
            &params_for_smc.view(),
            &self.target,
            &mut smc_state,
            &mut rng,
        )?;

        // 5) Insert after all reads and adjustments of this step.
        let n_added = self.buffer.add(
            &mut buffer_state,
            &out.samples.view(),
            &out.log_w.view(),
            &out.log_q.view(),
        )?;

        let info = StepInfo {
            losses,
            grad_norms,
            ignored_grad_count: opt_state.ignored_grad_count,
            n_adjust_skipped,
            n_added,
            smc: out.diagnostics,
        };
        Ok((
            TrainState {
                params,
                opt_state,
                smc_state,
                buffer_state,
                rng,
            },
            info,
        ))
    }
}
