use anyhow::anyhow;
use candle_core::{Device, Tensor};
use rand::prelude::SliceRandom;
use rayon::prelude::*;

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
pub struct Minibatches {
    pub samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(n: usize) -> Self {
        Self {
            samples: (0..n).collect(),
            chunks: vec![],
        }
    }

    /// Visit every sample exactly once in a random order
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        let mut rng = rand::rng();
        self.samples.shuffle(&mut rng);

        self.chunks = self
            .samples
            .par_chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect::<Vec<Vec<usize>>>();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

/// Take `rows` of `data` (if any) onto `target_device`
pub fn take_rows(
    rows: &[usize],
    target_device: &Device,
    data: Option<&Tensor>,
) -> anyhow::Result<Option<Tensor>> {
    let Some(data) = data else {
        return Ok(None);
    };

    let ntot = data.dim(0)?;
    if let Some(&bad) = rows.iter().find(|&&i| i >= ntot) {
        return Err(anyhow!("invalid row = {} vs. total # = {}", bad, ntot));
    }

    let idx = rows.iter().map(|&i| i as u32).collect::<Vec<_>>();
    let idx = Tensor::from_vec(idx, rows.len(), data.device())?;
    Ok(Some(data.index_select(&idx, 0)?.to_device(target_device)?))
}
