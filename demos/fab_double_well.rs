//! FAB training on the pairwise double-well target, minimal runnable demo.
//!
//! Prints per step:
//! - per-update losses and the SMC effective sample size
//! - acceptance rates of the annealing stages
//! - buffer fill and the NaN-skip counter

use flowanneal::buffer::{BufferConfig, PrioritisedBuffer};
use flowanneal::flow::DiagGaussianFlow;
use flowanneal::metropolis::MetropolisConfig;
use flowanneal::optimizer::{Optimizer, OptimizerConfig};
use flowanneal::schedule::{AnnealingSchedule, BetaSpacing};
use flowanneal::smc::{SmcConfig, SmcSampler};
use flowanneal::target::DoubleWellTarget;
use flowanneal::train::{FabConfig, FabTrainer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let n_vertices = 2usize;
    let vertex_dim = 2usize;
    let dim = n_vertices * vertex_dim;

    let target = DoubleWellTarget::new(n_vertices, vertex_dim);
    let flow = DiagGaussianFlow::new(dim);

    let smc = SmcSampler::new(SmcConfig {
        n_particles: 128,
        schedule: AnnealingSchedule::new(8, BetaSpacing::Quadratic, 2.0)?,
        mcmc: MetropolisConfig {
            n_sweeps: 4,
            ..MetropolisConfig::default()
        },
        ess_threshold_frac: 0.3,
    })?;
    let buffer = PrioritisedBuffer::new(BufferConfig {
        capacity: 2_048,
        min_fill: 512,
        dim,
    })?;
    let optimizer = Optimizer::new(OptimizerConfig {
        learning_rate: 2e-3,
        ..OptimizerConfig::default()
    })?;
    let trainer = FabTrainer::new(
        flow,
        target,
        smc,
        buffer,
        optimizer,
        FabConfig {
            alpha: 2.0,
            w_clip: 10.0,
            batch_size: 64,
            n_updates_per_refill: 4,
        },
    )?;

    let mut state = trainer.init(7)?;
    println!("seeded buffer with {} annealed samples", state.buffer_state.len());

    for step in 0..20 {
        let (next, info) = trainer.step(state)?;
        state = next;

        let mean_loss = info.losses.iter().sum::<f32>() / info.losses.len() as f32;
        let final_ess = info.smc.ess_history.last().copied().unwrap_or(0.0);
        let mean_accept =
            info.smc.accept_rates.iter().sum::<f32>() / info.smc.accept_rates.len() as f32;
        println!(
            "step {step:>2}: loss={mean_loss:>9.3} ess={final_ess:>6.1} \
             accept={mean_accept:.2} resamples={} buffer={} ignored_grads={}",
            info.smc.n_resamples,
            state.buffer_state.len(),
            info.ignored_grad_count,
        );
    }

    let d = dim;
    let params = &state.params;
    println!("\nlearned flow (mean / std per coordinate):");
    for k in 0..d {
        println!("  x[{k}]: mean={:+.3} std={:.3}", params[k], params[d + k].exp());
    }
    Ok(())
}
