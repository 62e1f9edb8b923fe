//! Batched loading with a worker pool.

use std::sync::Arc;

use rayon::prelude::*;

use super::{collate, BatchSampler, ImageBatch, Target, VrdDataset};

pub type Batch = (ImageBatch, Vec<Target>);

pub struct DataLoader {
    dataset: Arc<VrdDataset>,
    pub batch_sampler: BatchSampler,
    /// None loads on the calling thread
    pool: Option<rayon::ThreadPool>,
    seed: u64,
    pass: u64,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<VrdDataset>,
        batch_sampler: BatchSampler,
        num_workers: usize,
        seed: u64,
    ) -> anyhow::Result<Self> {
        let pool = if num_workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_workers)
                    .thread_name(|i| format!("loader-{i}"))
                    .build()?,
            )
        } else {
            None
        };
        Ok(Self {
            dataset,
            batch_sampler,
            pool,
            seed,
            pass: 0,
        })
    }

    /// Number of batches per pass
    pub fn len(&self) -> usize {
        self.batch_sampler.len()
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.batch_sampler.sampler.set_epoch(epoch);
    }

    fn load(&self, indices: &[usize], pass: u64) -> anyhow::Result<Batch> {
        let seed = self.seed.wrapping_add(pass << 32);
        let load_one = |&i: &usize| self.dataset.get(i, seed.wrapping_add(i as u64));
        let samples: Vec<_> = match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(load_one)
                    .collect::<anyhow::Result<Vec<_>>>()
            })?,
            None => indices
                .iter()
                .map(load_one)
                .collect::<anyhow::Result<Vec<_>>>()?,
        };
        let (images, targets): (Vec<_>, Vec<_>) = samples.into_iter().unzip();
        Ok((collate(&images)?, targets))
    }

    /// One pass over the dataset
    pub fn iter(&mut self) -> impl Iterator<Item = anyhow::Result<Batch>> + '_ {
        let batches = self.batch_sampler.batches();
        let pass = self.pass;
        self.pass += 1;
        batches
            .into_iter()
            .map(move |indices| self.load(&indices, pass))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{transforms::Transforms, Sampler};
    use vrdtools::{EntityAnnotation, ImageAnnotation, RelationAnnotation};

    fn dataset(dir: &std::path::Path, n: usize) -> VrdDataset {
        let mut images = Vec::new();
        for i in 0..n {
            let name = format!("{i}.png");
            let w = 4 + i as u32;
            image::RgbImage::from_pixel(w, 4, image::Rgb([0, 0, 0]))
                .save(dir.join(&name))
                .unwrap();
            images.push(ImageAnnotation {
                file_name: name,
                image_id: i.to_string(),
                width: w,
                height: 4,
                annotations: vec![EntityAnnotation {
                    bbox: [0.0, 0.0, 2.0, 2.0],
                    category_id: 0,
                }],
                hoi_annotation: vec![RelationAnnotation {
                    subject_id: 0,
                    object_id: 0,
                    distance: 0,
                    occlusion: 0,
                }],
            });
        }
        VrdDataset::from_parts("valid", dir.to_path_buf(), images, Transforms::eval(4))
    }

    #[test]
    fn test_loader_batches() {
        let dir = tempfile::tempdir().unwrap();
        let ds = Arc::new(dataset(dir.path(), 3));
        let sampler = BatchSampler::new(Sampler::sequential(3), 2, false);
        let mut loader = DataLoader::new(ds, sampler, 2, 0).unwrap();
        assert_eq!(loader.len(), 2);

        let batches: Vec<Batch> = loader.iter().collect::<anyhow::Result<_>>().unwrap();
        assert_eq!(batches.len(), 2);
        let (images, targets) = &batches[0];
        // Widths 4 and 5 are padded to 5
        assert_eq!(images.tensor.dims(), &[2, 3, 4, 5]);
        assert_eq!(targets[1].image_id, "1");
        assert_eq!(batches[1].1.len(), 1);
    }
}
