//! Prioritised replay buffer for annealed importance samples.
//!
//! Storage is three parallel fixed-length arrays — flattened samples, log
//! importance weights, and the proposal log-density at insertion time —
//! behind a ring cursor: once full, new insertions overwrite the oldest
//! entries. Entries are *ordered* by insertion but *sampled* by priority,
//! proportional to `exp(log_w − max log_w)`.
//!
//! Sampling without replacement uses the Gumbel top-k identity: perturbing
//! each log-weight with independent Gumbel noise and taking the k largest
//! keys draws k distinct indices with the same distribution as sequential
//! priority-weighted draws. It is numerically stable (shift-invariant in
//! `log_w`) and needs no normalization.
//!
//! The indices backing a draw are returned as an opaque [`BufferIndices`]
//! token: `adjust` requires the token from the matching `sample_n_batches`
//! call, so priorities can only be corrected at positions that were actually
//! sampled.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::{Error, Result};

/// Buffer geometry. Validated once in [`PrioritisedBuffer::new`].
#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    /// Maximum number of stored entries.
    pub capacity: usize,
    /// Minimum number of valid entries before sampling is allowed.
    pub min_fill: usize,
    /// Flattened sample dimension.
    pub dim: usize,
}

/// The buffer's mutable state: parallel arrays, ring cursor, valid count.
#[derive(Debug, Clone)]
pub struct BufferState {
    data: Array2<f32>,
    log_w: Array1<f32>,
    log_q_old: Array1<f32>,
    cursor: usize,
    len: usize,
}

impl BufferState {
    /// Number of valid entries (never exceeds capacity).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stored samples, valid rows only.
    pub fn samples(&self) -> ArrayView2<f32> {
        self.data.slice(s![..self.len, ..])
    }

    /// Stored log-weights, valid entries only.
    pub fn log_w(&self) -> ArrayView1<f32> {
        self.log_w.slice(s![..self.len])
    }

    /// Stored proposal log-densities, valid entries only.
    pub fn log_q_old(&self) -> ArrayView1<f32> {
        self.log_q_old.slice(s![..self.len])
    }
}

/// Opaque capability token tying a `sample_n_batches` draw to its `adjust`.
///
/// Holds the drawn indices in batch order; cannot be constructed outside the
/// buffer, so an `adjust` call can only touch positions that were sampled.
#[derive(Debug, Clone)]
pub struct BufferIndices {
    flat: Vec<usize>,
    n_batches: usize,
    batch_size: usize,
}

impl BufferIndices {
    pub fn len(&self) -> usize {
        self.flat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flat.is_empty()
    }

    pub fn n_batches(&self) -> usize {
        self.n_batches
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Read-only view of the drawn positions, batch-major.
    pub fn as_flat(&self) -> &[usize] {
        &self.flat
    }
}

/// One priority-weighted draw: per-batch samples and proposal log-densities,
/// plus the index token needed to adjust those entries afterwards.
#[derive(Debug, Clone)]
pub struct SampledBatches {
    pub samples: Vec<Array2<f32>>,
    pub log_q_old: Vec<Array1<f32>>,
    pub indices: BufferIndices,
}

/// The prioritised replay buffer (configuration + operations; state is
/// owned by the caller and threaded explicitly).
#[derive(Debug, Clone)]
pub struct PrioritisedBuffer {
    cfg: BufferConfig,
}

impl PrioritisedBuffer {
    pub fn new(cfg: BufferConfig) -> Result<Self> {
        if cfg.dim == 0 {
            return Err(Error::Config("buffer dim must be >= 1"));
        }
        if cfg.min_fill == 0 {
            return Err(Error::Config("buffer min_fill must be >= 1"));
        }
        if cfg.capacity < cfg.min_fill {
            return Err(Error::Config("buffer capacity must be >= min_fill"));
        }
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &BufferConfig {
        &self.cfg
    }

    /// Bulk-seed a fresh state. Fails when fewer than `min_fill` valid
    /// entries are provided (rows with non-finite `log_w`/`log_q_old` do not
    /// count: they are dropped, the same as in `add`).
    pub fn init(
        &self,
        samples: &ArrayView2<f32>,
        log_w: &ArrayView1<f32>,
        log_q_old: &ArrayView1<f32>,
    ) -> Result<BufferState> {
        let mut state = BufferState {
            data: Array2::zeros((self.cfg.capacity, self.cfg.dim)),
            log_w: Array1::zeros(self.cfg.capacity),
            log_q_old: Array1::zeros(self.cfg.capacity),
            cursor: 0,
            len: 0,
        };
        self.add(&mut state, samples, log_w, log_q_old)?;
        if state.len < self.cfg.min_fill {
            return Err(Error::BufferUnderfull {
                have: state.len,
                need: self.cfg.min_fill,
            });
        }
        Ok(state)
    }

    /// Insert a batch, overwriting the oldest entries once at capacity.
    ///
    /// The write advances the ring cursor row by row, so a batch that wraps
    /// past the end of storage is split across the boundary rather than
    /// corrupting entries. Rows whose log-weight or proposal log-density is
    /// not finite are dropped; the number of rows actually inserted is
    /// returned.
    pub fn add(
        &self,
        state: &mut BufferState,
        samples: &ArrayView2<f32>,
        log_w: &ArrayView1<f32>,
        log_q_old: &ArrayView1<f32>,
    ) -> Result<usize> {
        if samples.ncols() != self.cfg.dim {
            return Err(Error::Shape("sample dim must match buffer dim"));
        }
        if samples.nrows() != log_w.len() || samples.nrows() != log_q_old.len() {
            return Err(Error::Shape("samples, log_w and log_q_old must have equal length"));
        }
        let mut inserted = 0usize;
        for i in 0..samples.nrows() {
            if !log_w[i].is_finite() || !log_q_old[i].is_finite() {
                continue;
            }
            for k in 0..self.cfg.dim {
                state.data[[state.cursor, k]] = samples[[i, k]];
            }
            state.log_w[state.cursor] = log_w[i];
            state.log_q_old[state.cursor] = log_q_old[i];
            state.cursor = (state.cursor + 1) % self.cfg.capacity;
            state.len = (state.len + 1).min(self.cfg.capacity);
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Draw `n_batches` independent batches of `batch_size` entries each,
    /// without replacement within a batch, with selection probability
    /// proportional to `exp(log_w − max log_w)`.
    ///
    /// Priorities are recomputed from the live log-weight array on every
    /// call; nothing is cached across `adjust`s.
    pub fn sample_n_batches(
        &self,
        state: &BufferState,
        rng: &mut ChaCha8Rng,
        n_batches: usize,
        batch_size: usize,
    ) -> Result<SampledBatches> {
        if n_batches == 0 || batch_size == 0 {
            return Err(Error::Domain("n_batches and batch_size must be >= 1"));
        }
        let need = self.cfg.min_fill.max(batch_size);
        if state.len < need {
            return Err(Error::BufferUnderfull {
                have: state.len,
                need,
            });
        }

        let mut samples = Vec::with_capacity(n_batches);
        let mut log_q_old = Vec::with_capacity(n_batches);
        let mut flat = Vec::with_capacity(n_batches * batch_size);

        let mut keyed: Vec<(f32, usize)> = Vec::with_capacity(state.len);
        for _ in 0..n_batches {
            // Gumbel-perturbed log-weights; the k largest keys are a
            // without-replacement priority draw.
            keyed.clear();
            for i in 0..state.len {
                let u: f32 = rng.random::<f32>().max(f32::MIN_POSITIVE);
                let gumbel = -(-u.ln()).ln();
                let key = if state.log_w[i].is_finite() {
                    state.log_w[i] + gumbel
                } else {
                    f32::NEG_INFINITY
                };
                keyed.push((key, i));
            }
            keyed.sort_by(|a, b| b.0.total_cmp(&a.0));

            let mut batch = Array2::<f32>::zeros((batch_size, self.cfg.dim));
            let mut batch_log_q = Array1::<f32>::zeros(batch_size);
            for (row, &(_, idx)) in keyed.iter().take(batch_size).enumerate() {
                for k in 0..self.cfg.dim {
                    batch[[row, k]] = state.data[[idx, k]];
                }
                batch_log_q[row] = state.log_q_old[idx];
                flat.push(idx);
            }
            samples.push(batch);
            log_q_old.push(batch_log_q);
        }

        Ok(SampledBatches {
            samples,
            log_q_old,
            indices: BufferIndices {
                flat,
                n_batches,
                batch_size,
            },
        })
    }

    /// Re-point sampled entries at the current flow: overwrite `log_q_old`
    /// and add `log_w_adjustment` to the stored log-weight at the drawn
    /// positions. Non-finite corrections are skipped per entry (a NaN loss
    /// must not poison stored priorities); the skip count is returned.
    pub fn adjust(
        &self,
        state: &mut BufferState,
        log_q_new: &ArrayView1<f32>,
        log_w_adjustment: &ArrayView1<f32>,
        indices: &BufferIndices,
    ) -> Result<usize> {
        if log_q_new.len() != indices.flat.len() || log_w_adjustment.len() != indices.flat.len() {
            return Err(Error::Shape("adjustments must match the sampled index count"));
        }
        let mut skipped = 0usize;
        for (j, &idx) in indices.flat.iter().enumerate() {
            if idx >= state.len {
                return Err(Error::Domain("index token does not match this buffer state"));
            }
            if !log_w_adjustment[j].is_finite() || !log_q_new[j].is_finite() {
                skipped += 1;
                continue;
            }
            state.log_w[idx] += log_w_adjustment[j];
            state.log_q_old[idx] = log_q_new[j];
        }
        Ok(skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;

    fn buffer(capacity: usize, min_fill: usize, dim: usize) -> PrioritisedBuffer {
        PrioritisedBuffer::new(BufferConfig {
            capacity,
            min_fill,
            dim,
        })
        .unwrap()
    }

    /// Batch where sample i is the constant vector `tag + i`, log_w 0.
    fn tagged(n: usize, dim: usize, tag: f32) -> (Array2<f32>, Array1<f32>, Array1<f32>) {
        let mut x = Array2::<f32>::zeros((n, dim));
        for i in 0..n {
            for k in 0..dim {
                x[[i, k]] = tag + i as f32;
            }
        }
        (x, Array1::zeros(n), Array1::zeros(n))
    }

    #[test]
    fn config_validation() {
        assert!(PrioritisedBuffer::new(BufferConfig { capacity: 4, min_fill: 8, dim: 2 }).is_err());
        assert!(PrioritisedBuffer::new(BufferConfig { capacity: 8, min_fill: 0, dim: 2 }).is_err());
        assert!(PrioritisedBuffer::new(BufferConfig { capacity: 8, min_fill: 8, dim: 0 }).is_err());
        assert!(PrioritisedBuffer::new(BufferConfig { capacity: 8, min_fill: 8, dim: 2 }).is_ok());
    }

    #[test]
    fn init_rejects_underfull_seed() {
        let buf = buffer(16, 8, 2);
        let (x, w, q) = tagged(4, 2, 0.0);
        let err = buf.init(&x.view(), &w.view(), &q.view()).unwrap_err();
        assert_eq!(err.to_string(), "buffer underfull: have 4, need 8");
    }

    #[test]
    fn ring_wraparound_keeps_last_capacity_entries() {
        // Capacity 10, three batches of 4: the survivors must be exactly the
        // last 10 insertions, with the two oldest overwritten first.
        let buf = buffer(10, 1, 1);
        let mut x = Array2::<f32>::zeros((4, 1));
        let w = Array1::<f32>::zeros(4);
        let q = Array1::<f32>::zeros(4);

        let mut state = None;
        for batch in 0..3 {
            for i in 0..4 {
                x[[i, 0]] = (batch * 4 + i) as f32;
            }
            match &mut state {
                None => state = Some(buf.init(&x.view(), &w.view(), &q.view()).unwrap()),
                Some(st) => {
                    buf.add(st, &x.view(), &w.view(), &q.view()).unwrap();
                }
            }
        }
        let state = state.unwrap();
        assert_eq!(state.len(), 10);

        let mut survivors: Vec<i64> = state
            .samples()
            .rows()
            .into_iter()
            .map(|r| r[0] as i64)
            .collect();
        survivors.sort_unstable();
        assert_eq!(survivors, (2..12).collect::<Vec<i64>>());

        // Slot layout: the cursor wrapped past slots 0 and 1.
        assert_eq!(state.samples()[[0, 0]], 10.0);
        assert_eq!(state.samples()[[1, 0]], 11.0);
        assert_eq!(state.samples()[[2, 0]], 2.0);
    }

    #[test]
    fn non_finite_rows_are_dropped_on_add() {
        let buf = buffer(8, 1, 1);
        let (x, mut w, mut q) = tagged(4, 1, 0.0);
        w[1] = f32::NAN;
        q[2] = f32::NEG_INFINITY;
        let mut state = buf.init(&x.view(), &w.view(), &q.view()).unwrap();
        assert_eq!(state.len(), 2);
        let inserted = buf.add(&mut state, &x.view(), &w.view(), &q.view()).unwrap();
        assert_eq!(inserted, 2);
    }

    #[test]
    fn sampling_requires_enough_valid_entries() {
        let buf = buffer(64, 4, 1);
        let (x, w, q) = tagged(5, 1, 0.0);
        let state = buf.init(&x.view(), &w.view(), &q.view()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = buf
            .sample_n_batches(&state, &mut rng, 1, 16)
            .unwrap_err();
        assert_eq!(err.to_string(), "buffer underfull: have 5, need 16");
        assert!(buf.sample_n_batches(&state, &mut rng, 2, 4).is_ok());
    }

    #[test]
    fn adjust_with_zero_correction_is_identity() {
        let buf = buffer(16, 4, 2);
        let (x, w, q) = tagged(8, 2, 0.0);
        let mut state = buf.init(&x.view(), &w.view(), &q.view()).unwrap();
        let before = state.clone();

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let draw = buf.sample_n_batches(&state, &mut rng, 2, 4).unwrap();
        let n = draw.indices.len();
        let log_q_new: Array1<f32> = Array1::from_iter(
            draw.indices.as_flat().iter().map(|&i| before.log_q_old()[i]),
        );
        let zeros = Array1::<f32>::zeros(n);
        let skipped = buf
            .adjust(&mut state, &log_q_new.view(), &zeros.view(), &draw.indices)
            .unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(state.log_w(), before.log_w());
        assert_eq!(state.log_q_old(), before.log_q_old());
        assert_eq!(state.samples(), before.samples());
    }

    #[test]
    fn adjust_touches_only_sampled_positions_and_skips_nan() {
        let buf = buffer(16, 2, 1);
        let (x, w, q) = tagged(8, 1, 0.0);
        let mut state = buf.init(&x.view(), &w.view(), &q.view()).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let draw = buf.sample_n_batches(&state, &mut rng, 1, 3).unwrap();
        let picked: Vec<usize> = draw.indices.as_flat().to_vec();

        let mut adj = Array1::<f32>::from_elem(3, 1.5);
        adj[1] = f32::NAN;
        let log_q_new = Array1::<f32>::from_elem(3, -2.0);
        let skipped = buf
            .adjust(&mut state, &log_q_new.view(), &adj.view(), &draw.indices)
            .unwrap();
        assert_eq!(skipped, 1);

        for i in 0..state.len() {
            let times = picked
                .iter()
                .enumerate()
                .filter(|&(j, &p)| p == i && j != 1)
                .count();
            assert!(
                (state.log_w()[i] - 1.5 * times as f32).abs() <= 1e-6,
                "unexpected log_w at {i}"
            );
        }
    }

    #[test]
    fn high_priority_entries_are_sampled_more_often() {
        // One entry carries 9× the priority mass of each of the other nine;
        // over many singleton draws it must dominate.
        let buf = buffer(16, 2, 1);
        let (x, mut w, q) = tagged(10, 1, 0.0);
        w[3] = (9.0f32).ln();
        let state = buf.init(&x.view(), &w.view(), &q.view()).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut hits = 0usize;
        let n_draws = 600;
        for _ in 0..n_draws {
            let draw = buf.sample_n_batches(&state, &mut rng, 1, 1).unwrap();
            if draw.indices.as_flat()[0] == 3 {
                hits += 1;
            }
        }
        // Expected frequency 0.5 (9 / 18); a uniform sampler would sit at 0.1.
        let freq = hits as f32 / n_draws as f32;
        assert!(freq > 0.35, "expected priority dominance, got freq={freq}");
    }

    proptest! {
        #[test]
        fn prop_len_never_exceeds_capacity(
            capacity in 1usize..32,
            batch_sizes in prop::collection::vec(1usize..12, 1..12),
        ) {
            let buf = buffer(capacity, 1, 1);
            let mut state: Option<BufferState> = None;
            let mut total = 0usize;
            for (b, n) in batch_sizes.iter().enumerate() {
                let (x, w, q) = tagged(*n, 1, (b * 100) as f32);
                match &mut state {
                    None => {
                        // First batch may legitimately underfill (min_fill=1
                        // needs one valid row, which tagged() always provides).
                        state = Some(buf.init(&x.view(), &w.view(), &q.view()).unwrap());
                    }
                    Some(st) => {
                        buf.add(st, &x.view(), &w.view(), &q.view()).unwrap();
                    }
                }
                total += n;
                let st = state.as_ref().unwrap();
                prop_assert!(st.len() <= capacity);
                prop_assert_eq!(st.len(), total.min(capacity));
            }
        }
    }

    proptest! {
        #[test]
        fn prop_batches_are_without_replacement(
            n_entries in 4usize..24,
            n_batches in 1usize..5,
            seed in any::<u64>(),
        ) {
            let buf = buffer(32, 2, 1);
            let (x, w, q) = tagged(n_entries, 1, 0.0);
            let state = buf.init(&x.view(), &w.view(), &q.view()).unwrap();
            let batch_size = (n_entries / 2).max(1);

            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let draw = buf.sample_n_batches(&state, &mut rng, n_batches, batch_size).unwrap();
            prop_assert_eq!(draw.indices.len(), n_batches * batch_size);

            for b in 0..n_batches {
                let batch = &draw.indices.as_flat()[b * batch_size..(b + 1) * batch_size];
                let mut seen = std::collections::HashSet::new();
                for &i in batch {
                    prop_assert!(i < state.len());
                    prop_assert!(seen.insert(i), "batch {} repeated index {}", b, i);
                }
            }
        }
    }
}
