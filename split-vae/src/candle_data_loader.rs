use crate::candle_data_loader_util::*;

use anyhow::anyhow;
use candle_core::{DType, Device, Tensor};

/// Number of cells per minibatch unless specified
pub const DEFAULT_BATCH_SIZE: usize = 128;

/// A batch of cells
#[derive(Clone, Debug)]
pub struct ObservationBatch {
    /// features (n x d)
    pub x: Tensor,
    /// categorical covariate codes (n x k, `u32`)
    pub cat_covs: Option<Tensor>,
    /// continuous covariates (n x m)
    pub cont_covs: Option<Tensor>,
}

impl ObservationBatch {
    pub fn new(x: Tensor) -> Self {
        Self {
            x,
            cat_covs: None,
            cont_covs: None,
        }
    }

    pub fn with_cat_covs(mut self, cat_covs: Tensor) -> Self {
        self.cat_covs = Some(cat_covs);
        self
    }

    pub fn with_cont_covs(mut self, cont_covs: Tensor) -> Self {
        self.cont_covs = Some(cont_covs);
        self
    }

    pub fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            x: self.x.to_device(device)?,
            cat_covs: self
                .cat_covs
                .as_ref()
                .map(|c| c.to_device(device))
                .transpose()?,
            cont_covs: self
                .cont_covs
                .as_ref()
                .map(|c| c.to_device(device))
                .transpose()?,
        })
    }

    pub fn num_cells(&self) -> usize {
        self.x.dims().first().copied().unwrap_or(0)
    }

    /// Every tensor has the same number of rows; codes are `u32`
    pub fn validate(&self) -> candle_core::Result<()> {
        let (n, _) = self.x.dims2()?;
        if let Some(cat) = &self.cat_covs {
            let (n_cat, _) = cat.dims2()?;
            if n_cat != n {
                candle_core::bail!("{} cells but {} rows of categorical covariates", n, n_cat);
            }
            if cat.dtype() != DType::U32 {
                candle_core::bail!("categorical covariates should be u32, not {:?}", cat.dtype());
            }
        }
        if let Some(cont) = &self.cont_covs {
            let (n_cont, _) = cont.dims2()?;
            if n_cont != n {
                candle_core::bail!("{} cells but {} rows of continuous covariates", n, n_cont);
            }
        }
        Ok(())
    }
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    /// a minibatch of the current shuffle
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<ObservationBatch>;

    /// specific rows in the given order
    fn take_rows(&self, rows: &[usize], target_device: &Device)
        -> anyhow::Result<ObservationBatch>;

    fn num_minibatch(&self) -> usize;

    fn num_data(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for in-memory 2d matrices. Each row of `x`
/// is a cell with optional covariates in the same row of `cat_covs`
/// and `cont_covs`.
///
pub struct InMemoryData {
    data: ObservationBatch,
    minibatches: Minibatches,
}

impl InMemoryData {
    pub fn new(data: ObservationBatch) -> anyhow::Result<Self> {
        data.validate()?;
        let n = data.num_cells();
        Ok(Self {
            data,
            minibatches: Minibatches::new(n),
        })
    }

    pub fn from_features(x: Tensor) -> anyhow::Result<Self> {
        Self::new(ObservationBatch::new(x))
    }

    pub fn data(&self) -> &ObservationBatch {
        &self.data
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<ObservationBatch> {
        let rows = self.minibatches.chunks.get(batch_idx).ok_or(anyhow!(
            "invalid index = {} vs. total # = {}",
            batch_idx,
            self.num_minibatch()
        ))?;
        self.take_rows(rows, target_device)
    }

    fn take_rows(
        &self,
        rows: &[usize],
        target_device: &Device,
    ) -> anyhow::Result<ObservationBatch> {
        let x = take_rows(rows, target_device, Some(&self.data.x))?
            .ok_or(anyhow!("no feature matrix"))?;
        Ok(ObservationBatch {
            x,
            cat_covs: take_rows(rows, target_device, self.data.cat_covs.as_ref())?,
            cont_covs: take_rows(rows, target_device, self.data.cont_covs.as_ref())?,
        })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_data(&self) -> usize {
        self.minibatches.size()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if batch_size == 0 {
            return Err(anyhow!("batch size should be positive"));
        }
        self.minibatches.shuffle_minibatch(batch_size);
        Ok(())
    }
}

/// Pull ordered minibatches of selected rows, one at a time
pub struct OrderedMinibatches<'a, D: DataLoader + ?Sized> {
    data: &'a D,
    rows: Vec<usize>,
    batch_size: usize,
    pos: usize,
    target_device: Device,
}

impl<'a, D: DataLoader + ?Sized> OrderedMinibatches<'a, D> {
    /// * `indices` - rows to visit (all rows if `None`)
    /// * `batch_size` - cells per batch (default if `None`)
    pub fn new(
        data: &'a D,
        indices: Option<&[usize]>,
        batch_size: Option<usize>,
        target_device: &Device,
    ) -> Self {
        let rows = match indices {
            Some(indices) => indices.to_vec(),
            None => (0..data.num_data()).collect(),
        };
        Self {
            data,
            rows,
            batch_size: batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
            pos: 0,
            target_device: target_device.clone(),
        }
    }

    pub fn num_batches(&self) -> usize {
        self.rows.len().div_ceil(self.batch_size)
    }
}

impl<D: DataLoader + ?Sized> Iterator for OrderedMinibatches<'_, D> {
    type Item = anyhow::Result<ObservationBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.rows.len() {
            return None;
        }
        let ub = (self.pos + self.batch_size).min(self.rows.len());
        let batch = self
            .data
            .take_rows(&self.rows[self.pos..ub], &self.target_device);
        self.pos = ub;
        Some(batch)
    }
}
