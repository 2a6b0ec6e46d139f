use crate::candle_aux_layers::*;
use crate::candle_aux_linear::*;
use crate::candle_covariate::CovariateArgs;
use crate::candle_loss_functions::log_sum_exp;
use crate::candle_model_config::*;
use crate::candle_model_traits::*;

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

/// Everything the decoder needs to know at construction
#[derive(Clone, Copy, Debug)]
pub struct SplitDecoderArgs<'a> {
    pub n_latent: usize,
    pub n_continuous_cov: usize,
    pub n_output: usize,
    /// `-1` gives one split per latent dimension
    pub n_split: i64,
    pub split_method: SplitMethod,
    pub split_aggregation: SplitAggregation,
    pub reuse_weights: WeightReuse,
    pub layers: &'a [usize],
    pub dropout_rate: f32,
    pub use_batch_norm: bool,
    pub affine_batch_norm: bool,
    pub use_layer_norm: bool,
    pub covariates: Option<CovariateArgs<'a>>,
    pub inject_covariates: bool,
    /// also predict a variance per feature
    pub with_var_head: bool,
}

enum SplitTransform {
    Slice,
    Power(Linear),
    SliceMap(SplitLinear),
}

/// Decoder of a latent code split into groups, each decoded on its own
/// and aggregated over the splits at the end
pub struct SplitDecoder {
    n_latent: usize,
    n_continuous_cov: usize,
    n_output: usize,
    n_split: usize,
    aggregation: SplitAggregation,
    transform: SplitTransform,
    fc: FcLayers,
    mean_head: SplitLinear,
    var_head: Option<SplitLinear>,
}

/// Output of the decoder, before and after aggregation over splits
pub struct SplitDecoderOutput {
    /// aggregated over splits (n x d)
    pub params: DecoderParams,
    /// one per split (n x s x d)
    pub original_params: DecoderParams,
}

impl SplitDecoder {
    /// Will create a new decoder module with these variables:
    ///
    /// * `split.power.*` or `split.map.*` for non-trivial split methods
    /// * `fc.{}.linear.*` hidden layers (with a leading split axis if
    ///   they are not shared)
    /// * `px.mean.*`, `px.var.*` parameter heads
    pub fn new(args: SplitDecoderArgs, vb: VarBuilder) -> Result<Self> {
        let n_latent = args.n_latent;
        let n_split = resolve_n_split(args.n_split, n_latent)?;

        let method = if n_split == 1 {
            SplitMethod::Split
        } else {
            args.split_method
        };

        let (transform, view_dim) = match method {
            SplitMethod::Split | SplitMethod::SplitMap
                if n_split > n_latent || n_latent % n_split != 0 =>
            {
                candle_core::bail!(
                    "cannot split {} latent dims into {} groups",
                    n_latent,
                    n_split
                )
            }
            SplitMethod::Split => (SplitTransform::Slice, n_latent / n_split),
            SplitMethod::Power => (
                SplitTransform::Power(candle_nn::linear(
                    n_latent,
                    n_split * n_latent,
                    vb.pp("split.power"),
                )?),
                n_latent,
            ),
            SplitMethod::SplitMap => (
                SplitTransform::SliceMap(split_linear(
                    n_latent / n_split,
                    n_latent,
                    n_split,
                    false,
                    vb.pp("split.map"),
                )?),
                n_latent,
            ),
        };

        let fc = FcLayers::new(
            FcLayersArgs {
                n_input: view_dim + args.n_continuous_cov,
                layers_dim: args.layers,
                n_split,
                shared: args.reuse_weights.share_intermediate(),
                dropout_rate: args.dropout_rate,
                use_batch_norm: args.use_batch_norm,
                affine_batch_norm: args.affine_batch_norm,
                use_layer_norm: args.use_layer_norm,
                covariates: args.covariates,
                inject_covariates: args.inject_covariates,
            },
            vb.clone(),
        )?;

        let d_hidden = fc.dim_output();
        let share_last = args.reuse_weights.share_last();
        let mean_head = split_linear(
            d_hidden,
            args.n_output,
            n_split,
            share_last,
            vb.pp("px.mean"),
        )?;
        let var_head = if args.with_var_head {
            Some(split_linear(
                d_hidden,
                args.n_output,
                n_split,
                share_last,
                vb.pp("px.var"),
            )?)
        } else {
            None
        };

        Ok(Self {
            n_latent,
            n_continuous_cov: args.n_continuous_cov,
            n_output: args.n_output,
            n_split,
            aggregation: args.split_aggregation,
            transform,
            fc,
            mean_head,
            var_head,
        })
    }

    pub fn n_split(&self) -> usize {
        self.n_split
    }

    pub fn n_output(&self) -> usize {
        self.n_output
    }

    pub fn aggregation(&self) -> SplitAggregation {
        self.aggregation
    }

    /// Split views of the latent code with continuous covariates
    /// appended to every view
    ///
    /// * `z_nl` - latent code (n x l), or the latent code concatenated
    ///   with continuous covariates (n x (l + c))
    ///
    /// # Returns `n x s x (view + c)`
    pub fn split_latent(&self, z_nl: &Tensor) -> Result<Tensor> {
        let (n, width) = z_nl.dims2()?;
        if width != self.n_latent + self.n_continuous_cov {
            candle_core::bail!(
                "decoder expects {} latent + {} covariate columns, but got {}",
                self.n_latent,
                self.n_continuous_cov,
                width
            );
        }

        let z = z_nl.narrow(1, 0, self.n_latent)?.contiguous()?;
        let s = self.n_split;

        let z_nsv = match &self.transform {
            SplitTransform::Slice => z.reshape((n, s, self.n_latent / s))?,
            SplitTransform::Power(linear) => {
                linear.forward(&z)?.reshape((n, s, self.n_latent))?
            }
            SplitTransform::SliceMap(map) => {
                map.forward(&z.reshape((n, s, self.n_latent / s))?)?
            }
        };

        if self.n_continuous_cov == 0 {
            return Ok(z_nsv);
        }

        let cont_n1c = z_nl
            .narrow(1, self.n_latent, self.n_continuous_cov)?
            .unsqueeze(1)?;
        let cont_nsc = cont_n1c
            .broadcast_as((n, s, self.n_continuous_cov))?
            .contiguous()?;
        Tensor::cat(&[&z_nsv, &cont_nsc], 2)
    }

    /// Decode the latent code
    ///
    /// * `z_nl` - latent code with continuous covariates appended
    /// * `cat` - categorical codes (or a shared covariate embedding)
    /// * `mode` - execution mode
    pub fn forward_t(
        &self,
        z_nl: &Tensor,
        cat: Option<&Tensor>,
        mode: ExecMode,
    ) -> Result<SplitDecoderOutput> {
        let z_nsv = self.split_latent(z_nl)?;
        let h_nsh = self.fc.forward_t(&z_nsv, cat, mode)?;

        let mean_nsd = self.mean_head.forward(&h_nsh)?;
        let var_nsd = match &self.var_head {
            Some(head) => Some(head.forward(&h_nsh)?),
            None => None,
        };

        let params = DecoderParams {
            mean: aggregate_splits(&mean_nsd, self.aggregation)?,
            var: match &var_nsd {
                Some(v) => Some(aggregate_splits(v, self.aggregation)?),
                None => None,
            },
        };

        Ok(SplitDecoderOutput {
            params,
            original_params: DecoderParams {
                mean: mean_nsd,
                var: var_nsd,
            },
        })
    }
}

/// Pool `n x s x d` per-split outputs into `n x d`
pub fn aggregate_splits(x_nsd: &Tensor, aggregation: SplitAggregation) -> Result<Tensor> {
    match aggregation {
        SplitAggregation::Sum => x_nsd.sum(1),
        SplitAggregation::LogSumExp => log_sum_exp(x_nsd, 1),
        SplitAggregation::Max => x_nsd.max(1),
    }
}
