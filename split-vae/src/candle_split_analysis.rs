use crate::candle_data_loader::*;
use crate::candle_loss_functions::softplus;
use crate::candle_model_config::SplitAggregation;
use crate::candle_model_traits::ExecMode;
use crate::candle_split_vae::*;

use anyhow::anyhow;
use candle_core::{Device, Result, Tensor};
use candle_nn::ops;
use log::{error, info};

/// Raw library size used when decoding latent codes without one
pub const DEFAULT_LIBRARY_SIZE: f64 = 1e4;

/// Result of a batch loop that may have stopped early
#[derive(Debug)]
pub struct PartialResult<T> {
    pub value: T,
    pub completed_batches: usize,
    pub total_batches: usize,
    /// why the loop stopped early
    pub error: Option<String>,
}

impl<T> PartialResult<T> {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.completed_batches == self.total_batches
    }

    /// The value if every batch went through, otherwise the error
    pub fn into_result(self) -> anyhow::Result<T> {
        match self.error {
            None => Ok(self.value),
            Some(msg) => Err(anyhow!(
                "stopped after {} of {} batches: {}",
                self.completed_batches,
                self.total_batches,
                msg
            )),
        }
    }
}

/// How much of each feature's aggregated output comes from each split
///
/// * logsumexp: softmax over the splits
/// * sum: L1-normalized absolute values (uniform if all zero)
/// * max: indicator of the maximum (ties share evenly)
///
/// * `original_nsd` - per-split outputs (n x s x d)
///
/// # Returns shares (n x s x d) that sum to one over the splits
pub fn split_shares(original_nsd: &Tensor, aggregation: SplitAggregation) -> Result<Tensor> {
    match aggregation {
        SplitAggregation::LogSumExp => ops::softmax(original_nsd, 1),
        SplitAggregation::Sum => {
            let abs_nsd = (original_nsd.abs()? + 1e-12)?;
            abs_nsd.broadcast_div(&abs_nsd.sum_keepdim(1)?)
        }
        SplitAggregation::Max => {
            let max_n1d = original_nsd.max_keepdim(1)?;
            let ind_nsd = original_nsd
                .broadcast_eq(&max_n1d)?
                .to_dtype(original_nsd.dtype())?;
            ind_nsd.broadcast_div(&ind_nsd.sum_keepdim(1)?)
        }
    }
}

/// Split shares weighted by softplus of the aggregated mean (n x s x d)
pub fn split_effects(generative: &GenerativeOutput, aggregation: SplitAggregation) -> Result<Tensor> {
    let share_nsd = split_shares(&generative.original_params.mean, aggregation)?;
    let weight_n1d = softplus(&generative.params.mean)?.unsqueeze(1)?;
    share_nsd.broadcast_mul(&weight_n1d)?.detach().to_device(&Device::Cpu)
}

/// Stack per-batch `cells x splits` effects, averaged over cells if
/// `aggregate_over_cells`. A failure to combine them is recorded as
/// the error of the result.
pub fn combine_split_effects(
    partial: PartialResult<Vec<Tensor>>,
    aggregate_over_cells: bool,
) -> PartialResult<Option<Tensor>> {
    let mut failure = partial.error;

    let value = if partial.value.is_empty() {
        None
    } else {
        let effect = Tensor::cat(&partial.value, 0).and_then(|effect_ns| {
            if aggregate_over_cells {
                effect_ns.mean(0)
            } else {
                Ok(effect_ns)
            }
        });
        match effect {
            Ok(effect) => Some(effect),
            Err(err) => {
                error!("failed to combine split effects: {}", err);
                failure.get_or_insert(err.to_string());
                None
            }
        }
    };

    PartialResult {
        value,
        completed_batches: partial.completed_batches,
        total_batches: partial.total_batches,
        error: failure,
    }
}

impl SplitVaeModule {
    /// Decode latent codes without data, in deterministic mode
    ///
    /// * `z` - latent codes (n x k)
    /// * `lib` - raw library size per cell (n), 1e4 if `None`
    /// * `cat_covs` - categorical codes (n x c)
    /// * `cont_covs` - continuous covariates (n x m)
    /// * `batch_size` - cells per batch
    ///
    /// # Returns aggregated mean parameters (n x d) in input order
    pub fn decode_latent_samples(
        &self,
        z: &Tensor,
        lib: Option<&Tensor>,
        cat_covs: Option<&Tensor>,
        cont_covs: Option<&Tensor>,
        batch_size: Option<usize>,
    ) -> anyhow::Result<Tensor> {
        let (n, _) = z.dims2()?;
        let batch_size = batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1);
        let dev = self.device();
        let side_info = self.noise_model().side_info();

        let log_lib = match lib {
            Some(lib) => lib.flatten_all()?.clamp(1f32, f32::MAX)?.log()?,
            None => (Tensor::ones(n, z.dtype(), z.device())? * DEFAULT_LIBRARY_SIZE.ln())?,
        };
        if log_lib.dim(0)? != n {
            return Err(anyhow!("{} library sizes for {} latent codes", log_lib.dim(0)?, n));
        }

        let take = |t: Option<&Tensor>, lb: usize, len: usize| -> Result<Option<Tensor>> {
            t.map(|t| t.narrow(0, lb, len)?.to_device(dev)).transpose()
        };

        let mut chunks = vec![];
        for lb in (0..n).step_by(batch_size) {
            let len = batch_size.min(n - lb);
            let z_b = z.narrow(0, lb, len)?.to_device(dev)?;
            let lib_b = log_lib.narrow(0, lb, len)?.to_device(dev)?;
            let cat_b = take(cat_covs, lb, len)?;
            let cont_b = take(cont_covs, lb, len)?;

            let out = self.generative(
                GenerativeInput {
                    z: &z_b,
                    library: &lib_b,
                    side_info: &side_info,
                    cont_covs: cont_b.as_ref(),
                    cat_covs: cat_b.as_ref(),
                },
                ExecMode::Deterministic,
            )?;
            chunks.push(out.params.mean.detach().to_device(&Device::Cpu)?);
        }

        if chunks.is_empty() {
            return Err(anyhow!("no latent codes to decode"));
        }
        Ok(Tensor::cat(&chunks, 0)?)
    }

    /// Run the module with its loss (KL weight 1) over ordered
    /// minibatches and let `step` update `store` with each output
    ///
    /// An error stops the loop; it is logged and reported in the
    /// returned record together with whatever `store` holds by then.
    ///
    /// * `data` - data loader
    /// * `indices` - rows to visit (all if `None`)
    /// * `batch_size` - cells per batch
    /// * `mode` - execution mode of the forward passes
    /// * `store` - initial state
    /// * `step` - `(batch, output, store)` callback
    pub fn iterate_on_ae_output<D, T, S>(
        &self,
        data: &D,
        indices: Option<&[usize]>,
        batch_size: Option<usize>,
        mode: ExecMode,
        mut store: T,
        mut step: S,
    ) -> PartialResult<T>
    where
        D: DataLoader + ?Sized,
        S: FnMut(&ObservationBatch, &ForwardOutput, &mut T) -> anyhow::Result<()>,
    {
        let batches = OrderedMinibatches::new(data, indices, batch_size, self.device());
        let total_batches = batches.num_batches();
        let mut completed_batches = 0;
        let mut failure = None;

        for batch in batches {
            let res = batch.and_then(|batch| {
                let out = self.forward(&batch, 1., mode)?;
                step(&batch, &out, &mut store)
            });

            if let Err(err) = res {
                error!(
                    "stopped at batch {} of {}: {}",
                    completed_batches + 1,
                    total_batches,
                    err
                );
                failure = Some(err.to_string());
                break;
            }
            completed_batches += 1;
        }

        PartialResult {
            value: store,
            completed_batches,
            total_batches,
            error: failure,
        }
    }

    /// Latent codes of the cells (n x k), posterior means if
    /// `give_mean`, otherwise one sample each
    pub fn get_latent_representation<D>(
        &self,
        data: &D,
        indices: Option<&[usize]>,
        batch_size: Option<usize>,
        give_mean: bool,
    ) -> anyhow::Result<Tensor>
    where
        D: DataLoader + ?Sized,
    {
        let mode = if give_mean {
            ExecMode::Deterministic
        } else {
            ExecMode::Infer
        };

        let chunks = self
            .iterate_on_ae_output(
                data,
                indices,
                batch_size,
                mode,
                vec![],
                |_, out, chunks: &mut Vec<Tensor>| {
                    let z = if give_mean {
                        &out.inference.qz_m
                    } else {
                        &out.inference.z
                    };
                    chunks.push(z.detach().to_device(&Device::Cpu)?);
                    Ok(())
                },
            )
            .into_result()?;

        if chunks.is_empty() {
            return Err(anyhow!("no cells to encode"));
        }
        Ok(Tensor::cat(&chunks, 0)?)
    }

    /// Contribution of each split to the reconstruction of each cell
    ///
    /// # Returns `cells x splits`, or `splits` averaged over cells if
    /// `aggregate_over_cells` (`None` if no batch went through)
    pub fn get_reconstruction_effect_of_each_split<D>(
        &self,
        data: &D,
        aggregate_over_cells: bool,
        indices: Option<&[usize]>,
        batch_size: Option<usize>,
    ) -> PartialResult<Option<Tensor>>
    where
        D: DataLoader + ?Sized,
    {
        let aggregation = self.split_aggregation();

        let partial = self.iterate_on_ae_output(
            data,
            indices,
            batch_size,
            ExecMode::Deterministic,
            vec![],
            |_, out, chunks: &mut Vec<Tensor>| {
                let effect_ns = split_effects(&out.generative, aggregation)?.sum(2)?;
                chunks.push(effect_ns);
                Ok(())
            },
        );

        combine_split_effects(partial, aggregate_over_cells)
    }

    /// Largest effect of each split on each feature over the cells
    ///
    /// # Returns `splits x features` running maximum (`None` if no
    /// batch went through)
    pub fn get_max_effect_of_splits_within_distribution<D>(
        &self,
        data: &D,
        indices: Option<&[usize]>,
        batch_size: Option<usize>,
    ) -> PartialResult<Option<Tensor>>
    where
        D: DataLoader + ?Sized,
    {
        let aggregation = self.split_aggregation();

        let partial = self.iterate_on_ae_output(
            data,
            indices,
            batch_size,
            ExecMode::Deterministic,
            None,
            |_, out, running: &mut Option<Tensor>| {
                let effect_sd = split_effects(&out.generative, aggregation)?.max(0)?;
                *running = Some(match running.take() {
                    Some(prev) => prev.maximum(&effect_sd)?,
                    None => effect_sd,
                });
                Ok(())
            },
        );

        if partial.is_complete() {
            info!(
                "max effects of {} splits over {} batches",
                self.n_split(),
                partial.completed_batches
            );
        }
        partial
    }
}
