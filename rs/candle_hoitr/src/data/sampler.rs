//! Index samplers.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// Order in which dataset indices are visited during one epoch
#[derive(Debug, Clone)]
pub enum Sampler {
    Sequential {
        len: usize,
    },
    /// Fresh permutation on every pass
    Random {
        len: usize,
        rng: StdRng,
    },
    /// Disjoint shard per rank, padded so every rank sees the same count.
    /// The permutation depends on `seed + epoch`.
    Distributed {
        len: usize,
        rank: usize,
        world_size: usize,
        shuffle: bool,
        seed: u64,
        epoch: u64,
    },
}

impl Sampler {
    pub fn sequential(len: usize) -> Self {
        Sampler::Sequential { len }
    }

    pub fn random(len: usize, seed: u64) -> Self {
        Sampler::Random {
            len,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn distributed(len: usize, rank: usize, world_size: usize, seed: u64) -> Self {
        Sampler::Distributed {
            len,
            rank,
            world_size,
            shuffle: true,
            seed,
            epoch: 0,
        }
    }

    pub fn set_epoch(&mut self, new_epoch: usize) {
        if let Sampler::Distributed { epoch, .. } = self {
            *epoch = new_epoch as u64;
        }
    }

    /// Number of indices yielded per pass
    pub fn len(&self) -> usize {
        match self {
            Sampler::Sequential { len } | Sampler::Random { len, .. } => *len,
            Sampler::Distributed {
                len, world_size, ..
            } => len.div_ceil(*world_size),
        }
    }

    pub fn indices(&mut self) -> Vec<usize> {
        match self {
            Sampler::Sequential { len } => (0..*len).collect(),
            Sampler::Random { len, rng } => {
                let mut indices: Vec<usize> = (0..*len).collect();
                indices.shuffle(rng);
                indices
            }
            Sampler::Distributed {
                len,
                rank,
                world_size,
                shuffle,
                seed,
                epoch,
            } => {
                let mut indices: Vec<usize> = (0..*len).collect();
                if *shuffle {
                    let mut rng = StdRng::seed_from_u64(*seed + *epoch);
                    indices.shuffle(&mut rng);
                }
                let total = len.div_ceil(*world_size) * *world_size;
                let mut k = 0;
                while indices.len() < total && *len > 0 {
                    indices.push(indices[k]);
                    k += 1;
                }
                indices
                    .into_iter()
                    .skip(*rank)
                    .step_by(*world_size)
                    .collect()
            }
        }
    }
}

/// Groups sampler indices into batches
#[derive(Debug, Clone)]
pub struct BatchSampler {
    pub sampler: Sampler,
    pub batch_size: usize,
    pub drop_last: bool,
}

impl BatchSampler {
    pub fn new(sampler: Sampler, batch_size: usize, drop_last: bool) -> Self {
        Self {
            sampler,
            batch_size: batch_size.max(1),
            drop_last,
        }
    }

    /// Number of batches per pass
    pub fn len(&self) -> usize {
        if self.drop_last {
            self.sampler.len() / self.batch_size
        } else {
            self.sampler.len().div_ceil(self.batch_size)
        }
    }

    pub fn batches(&mut self) -> Vec<Vec<usize>> {
        let mut batches: Vec<Vec<usize>> = self
            .sampler
            .indices()
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();
        if self.drop_last && batches.last().is_some_and(|b| b.len() < self.batch_size) {
            batches.pop();
        }
        batches
    }
}
