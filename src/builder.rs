//! Level-by-level construction of the cascade.
//!
//! Each level is filled concurrently from fixed-size key blocks, finalized
//! on one thread (collision clearing plus rank directory), then re-scanned
//! for the keys it failed to place; those become the next level's input.
//! Keys still unplaced after the level cap land in an explicit fallback
//! table.

use crate::bitarray::BitArray;
use crate::build_hasher::FastBuildHasher;
use crate::cascade::{Level, Mphf};
use crate::hash::{fast_reduce64, level_seed, MphKey};
use crate::progress::{NoProgress, ProgressReporter};
use crate::spill::{SpillConfig, SpillFile, SpillKey, SpillWriter};
use hashbrown::HashSet;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::hash::BuildHasherDefault;
use thiserror::Error;

/// Keys per parallel block when streaming a spill file back in.
const SPILL_SUB_BLOCK: usize = 8 * 1024;

/// Build parameters.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Load-factor multiplier sizing each level's bit-array relative to
    /// its input count. Must be at least 1.0.
    pub gamma: f64,
    /// Master seed; every per-level hash seed derives from it, so equal
    /// seeds mean byte-identical cascades.
    pub seed: u64,
    /// Worker threads for the fill and residual phases. 0 uses the global
    /// rayon pool as-is; without the `parallel` feature this is ignored.
    pub num_threads: usize,
    /// Level cap; keys unplaced after this many levels go to the fallback
    /// table.
    pub max_levels: usize,
    /// Whether leftovers past the level cap may resolve through the
    /// fallback table. Disabled, they abort the build instead.
    pub enable_fallback: bool,
    /// Keys per dispatched block.
    pub block_keys: usize,
    /// Reject inputs containing duplicate keys instead of producing an
    /// undefined mapping.
    pub check_duplicates: bool,
    /// Stream large residuals through disk instead of memory.
    pub spill: Option<SpillConfig>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            gamma: 2.0,
            seed: 0xC0FF_EE00_D15E_A5E,
            num_threads: 0,
            max_levels: 25,
            enable_fallback: true,
            block_keys: 64 * 1024,
            check_duplicates: false,
            spill: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MphError {
    #[error("duplicate key detected during build")]
    DuplicateKey,
    #[error("gamma must be at least 1.0 (got {0})")]
    InvalidGamma(f64),
    #[error("level cap {levels} reached with {residual} keys unplaced and no fallback enabled")]
    BuildExhausted { levels: usize, residual: u64 },
    #[error("could not start worker pool: {0}")]
    WorkerPool(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade image: {0}")]
    FormatMismatch(&'static str),
}

pub struct Builder {
    cfg: BuildConfig,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            cfg: BuildConfig::default(),
        }
    }

    pub fn with_config(mut self, cfg: BuildConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Build over any finite key sequence. Keys must be distinct;
    /// `check_duplicates` turns violations into an error instead of an
    /// undefined mapping.
    pub fn build<K, I>(self, keys: I) -> Result<Mphf, MphError>
    where
        K: MphKey + SpillKey + Clone + Send + Sync + 'static,
        I: IntoIterator<Item = K>,
    {
        self.build_with_progress(keys, &NoProgress)
    }

    /// Same as [`build`](Self::build), reporting fill progress at block
    /// granularity.
    pub fn build_with_progress<K, I, P>(self, keys: I, progress: &P) -> Result<Mphf, MphError>
    where
        K: MphKey + SpillKey + Clone + Send + Sync + 'static,
        I: IntoIterator<Item = K>,
        P: ProgressReporter + ?Sized,
    {
        let keys: Vec<K> = keys.into_iter().collect();
        let check = self.cfg.check_duplicates;
        run(self.cfg, &keys, progress, check)
    }

    /// Build over a slice of keys already known to be unique; the
    /// duplicate check is skipped regardless of configuration.
    pub fn build_unique_ref<K>(self, keys: &[K]) -> Result<Mphf, MphError>
    where
        K: MphKey + SpillKey + Clone + Send + Sync + 'static,
    {
        run(self.cfg, keys, &NoProgress, false)
    }
}

fn run<K, P>(
    cfg: BuildConfig,
    keys: &[K],
    progress: &P,
    check_duplicates: bool,
) -> Result<Mphf, MphError>
where
    K: MphKey + SpillKey + Clone + Send + Sync + 'static,
    P: ProgressReporter + ?Sized,
{
    if cfg.gamma < 1.0 {
        return Err(MphError::InvalidGamma(cfg.gamma));
    }
    if check_duplicates {
        detect_duplicates(keys, cfg.seed)?;
    }
    if keys.is_empty() {
        let last_level_seed = level_seed(cfg.seed, cfg.max_levels as u32);
        return Ok(Mphf::from_parts(
            0,
            cfg.gamma,
            last_level_seed,
            Vec::new(),
            Vec::new(),
        ));
    }

    #[cfg(feature = "parallel")]
    {
        if cfg.num_threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(cfg.num_threads)
                .build()
                .map_err(|e| MphError::WorkerPool(e.to_string()))?;
            return pool.install(|| run_levels(&cfg, keys, progress));
        }
    }

    run_levels(&cfg, keys, progress)
}

fn run_levels<K, P>(cfg: &BuildConfig, keys: &[K], progress: &P) -> Result<Mphf, MphError>
where
    K: MphKey + SpillKey + Clone + Send + Sync + 'static,
    P: ProgressReporter + ?Sized,
{
    let nthreads = current_threads();
    let last_level_seed = level_seed(cfg.seed, cfg.max_levels as u32);

    let mut levels: Vec<Level> = Vec::new();
    let mut input: LevelInput<'_, K> = LevelInput::Slice(keys);
    let mut rank_offset = 0u64;

    for level_idx in 0..cfg.max_levels {
        let n_k = input.len();
        if n_k == 0 {
            break;
        }
        let size_k = level_size(cfg.gamma, n_k);
        let seed_k = level_seed(cfg.seed, level_idx as u32);
        let mut bits = BitArray::new(size_k);
        let coll = BitArray::new(size_k);

        progress.init(n_k as u64, &format!("level {level_idx}"), nthreads);
        fill_phase(&input, &bits, &coll, seed_k, size_k, cfg.block_keys, progress)?;
        progress.finish();

        // finalize: the single-threaded barrier between levels
        bits.clear_collisions(0, size_k, &coll);
        let next_offset = bits.build_ranks(rank_offset);
        let placed = next_offset - rank_offset;

        let next_input = if placed as usize == n_k {
            LevelInput::Mem(Vec::new())
        } else {
            residual_phase(cfg, &input, &bits, seed_k, size_k, level_idx)?
        };

        levels.push(Level {
            index: level_idx as u32,
            size_in_bits: size_k,
            seed: seed_k,
            rank_offset,
            bits,
        });
        rank_offset = next_offset;
        input = next_input;
    }

    let mut fallback = Vec::new();
    if input.len() > 0 {
        if !cfg.enable_fallback {
            return Err(MphError::BuildExhausted {
                levels: levels.len(),
                residual: input.len() as u64,
            });
        }
        // assigned in input order so the image is worker-count independent
        for key in input.into_keys()? {
            fallback.push((key.hash64(last_level_seed), rank_offset));
            rank_offset += 1;
        }
    }

    Ok(Mphf::from_parts(
        keys.len() as u64,
        cfg.gamma,
        last_level_seed,
        levels,
        fallback,
    ))
}

/// `max(64, ceil(gamma * n))`, rounded up to a whole word.
fn level_size(gamma: f64, n: usize) -> u64 {
    let bits = (gamma * n as f64).ceil() as u64;
    (bits.div_ceil(64) * 64).max(64)
}

fn detect_duplicates<K: MphKey>(keys: &[K], seed: u64) -> Result<(), MphError> {
    let mut seen: HashSet<(u64, u64), BuildHasherDefault<FastBuildHasher>> =
        HashSet::with_capacity_and_hasher(keys.len(), BuildHasherDefault::default());
    for key in keys {
        let fp = (key.hash64(seed ^ 0xA5A5_A5A5_5A5A_5A5A), key.hash64(!seed));
        if !seen.insert(fp) {
            return Err(MphError::DuplicateKey);
        }
    }
    Ok(())
}

enum LevelInput<'a, K> {
    Slice(&'a [K]),
    Mem(Vec<K>),
    Disk(SpillFile),
}

impl<K> LevelInput<'_, K> {
    fn len(&self) -> usize {
        match self {
            LevelInput::Slice(s) => s.len(),
            LevelInput::Mem(v) => v.len(),
            LevelInput::Disk(f) => f.count() as usize,
        }
    }

    fn into_keys(self) -> Result<Vec<K>, MphError>
    where
        K: SpillKey + Clone,
    {
        match self {
            LevelInput::Slice(s) => Ok(s.to_vec()),
            LevelInput::Mem(v) => Ok(v),
            LevelInput::Disk(f) => {
                let mut reader = f.reader::<K>()?;
                let mut out = Vec::with_capacity(f.count() as usize);
                let mut block = Vec::new();
                while reader.next_block(&mut block, SPILL_SUB_BLOCK)? {
                    out.append(&mut block);
                }
                Ok(out)
            }
        }
    }
}

fn fill_phase<K, P>(
    input: &LevelInput<'_, K>,
    bits: &BitArray,
    coll: &BitArray,
    seed: u64,
    size: u64,
    block_keys: usize,
    progress: &P,
) -> Result<(), MphError>
where
    K: MphKey + SpillKey + Send + Sync,
    P: ProgressReporter + ?Sized,
{
    match input {
        LevelInput::Slice(s) => {
            fill_blocks(s, block_keys, bits, coll, seed, size, progress);
            Ok(())
        }
        LevelInput::Mem(v) => {
            fill_blocks(v, block_keys, bits, coll, seed, size, progress);
            Ok(())
        }
        LevelInput::Disk(f) => {
            let mut reader = f.reader::<K>()?;
            let mut block = Vec::new();
            while reader.next_block(&mut block, block_keys)? {
                fill_blocks(&block, SPILL_SUB_BLOCK, bits, coll, seed, size, progress);
            }
            Ok(())
        }
    }
}

#[cfg(feature = "parallel")]
fn fill_blocks<K, P>(
    keys: &[K],
    block_keys: usize,
    bits: &BitArray,
    coll: &BitArray,
    seed: u64,
    size: u64,
    progress: &P,
) where
    K: MphKey + Send + Sync,
    P: ProgressReporter + ?Sized,
{
    keys.par_chunks(block_keys.max(1)).for_each(|block| {
        fill_block(block, bits, coll, seed, size);
        progress.inc(block.len() as u64, worker_id());
    });
}

#[cfg(not(feature = "parallel"))]
fn fill_blocks<K, P>(
    keys: &[K],
    block_keys: usize,
    bits: &BitArray,
    coll: &BitArray,
    seed: u64,
    size: u64,
    progress: &P,
) where
    K: MphKey + Send + Sync,
    P: ProgressReporter + ?Sized,
{
    for block in keys.chunks(block_keys.max(1)) {
        fill_block(block, bits, coll, seed, size);
        progress.inc(block.len() as u64, 0);
    }
}

fn fill_block<K: MphKey>(block: &[K], bits: &BitArray, coll: &BitArray, seed: u64, size: u64) {
    for key in block {
        let p = fast_reduce64(key.hash64(seed), size as usize) as u64;
        if coll.get(p) == 1 {
            // position already known to collide; the key cascades anyway
            continue;
        }
        if bits.atomic_test_and_set(p) == 1 {
            coll.set(p);
        }
    }
}

fn residual_phase<K>(
    cfg: &BuildConfig,
    input: &LevelInput<'_, K>,
    bits: &BitArray,
    seed: u64,
    size: u64,
    level_idx: usize,
) -> Result<LevelInput<'static, K>, MphError>
where
    K: MphKey + SpillKey + Clone + Send + Sync + 'static,
{
    let mut sink = match cfg.spill.as_ref() {
        Some(s) if input.len() >= s.min_keys => {
            ResidualSink::Disk(SpillWriter::create(&s.dir, level_idx + 1)?)
        }
        _ => ResidualSink::Mem(Vec::new()),
    };

    match input {
        LevelInput::Slice(s) => collect_residuals(s, cfg.block_keys, bits, seed, size, &mut sink)?,
        LevelInput::Mem(v) => collect_residuals(v, cfg.block_keys, bits, seed, size, &mut sink)?,
        LevelInput::Disk(f) => {
            let mut reader = f.reader::<K>()?;
            let mut block = Vec::new();
            while reader.next_block(&mut block, cfg.block_keys)? {
                collect_residuals(&block, SPILL_SUB_BLOCK, bits, seed, size, &mut sink)?;
            }
        }
    }

    sink.finish()
}

#[cfg(feature = "parallel")]
fn collect_residuals<K>(
    keys: &[K],
    block_keys: usize,
    bits: &BitArray,
    seed: u64,
    size: u64,
    sink: &mut ResidualSink<K>,
) -> Result<(), MphError>
where
    K: MphKey + SpillKey + Clone + Send + Sync,
{
    // chunk-ordered collect keeps the residual in input order
    let locals: Vec<Vec<K>> = keys
        .par_chunks(block_keys.max(1))
        .map(|block| residual_block(block, bits, seed, size))
        .collect();
    for local in locals {
        sink.extend(local)?;
    }
    Ok(())
}

#[cfg(not(feature = "parallel"))]
fn collect_residuals<K>(
    keys: &[K],
    block_keys: usize,
    bits: &BitArray,
    seed: u64,
    size: u64,
    sink: &mut ResidualSink<K>,
) -> Result<(), MphError>
where
    K: MphKey + SpillKey + Clone + Send + Sync,
{
    for block in keys.chunks(block_keys.max(1)) {
        sink.extend(residual_block(block, bits, seed, size))?;
    }
    Ok(())
}

fn residual_block<K: MphKey + Clone>(block: &[K], bits: &BitArray, seed: u64, size: u64) -> Vec<K> {
    let mut out = Vec::new();
    for key in block {
        let p = fast_reduce64(key.hash64(seed), size as usize) as u64;
        if bits.get(p) == 0 {
            out.push(key.clone());
        }
    }
    out
}

enum ResidualSink<K> {
    Mem(Vec<K>),
    Disk(SpillWriter),
}

impl<K: SpillKey> ResidualSink<K> {
    fn extend(&mut self, keys: Vec<K>) -> Result<(), MphError> {
        match self {
            ResidualSink::Mem(v) => {
                v.extend(keys);
                Ok(())
            }
            ResidualSink::Disk(w) => {
                for k in &keys {
                    w.push(k)?;
                }
                Ok(())
            }
        }
    }

    fn finish(self) -> Result<LevelInput<'static, K>, MphError> {
        match self {
            ResidualSink::Mem(v) => Ok(LevelInput::Mem(v)),
            ResidualSink::Disk(w) => Ok(LevelInput::Disk(w.finish()?)),
        }
    }
}

#[cfg(feature = "parallel")]
#[inline]
fn worker_id() -> usize {
    rayon::current_thread_index().unwrap_or(0)
}

#[cfg(feature = "parallel")]
fn current_threads() -> usize {
    rayon::current_num_threads()
}

#[cfg(not(feature = "parallel"))]
fn current_threads() -> usize {
    1
}
