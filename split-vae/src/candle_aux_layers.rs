use crate::candle_aux_linear::{split_linear, SplitLinear};
use crate::candle_covariate::{CovariateArgs, CovariateCodec, CovariateFusionLayer};
use crate::candle_model_traits::ExecMode;

use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, Dropout, LayerNorm, Module, ModuleT};

/// Shape and regularization of a stack of fully connected layers
#[derive(Clone, Copy, Debug)]
pub struct FcLayersArgs<'a> {
    pub n_input: usize,
    pub layers_dim: &'a [usize],
    /// number of split views (1 for an ordinary `n x d` input)
    pub n_split: usize,
    /// share the layer weights across split views
    pub shared: bool,
    pub dropout_rate: f32,
    pub use_batch_norm: bool,
    pub affine_batch_norm: bool,
    pub use_layer_norm: bool,
    pub covariates: Option<CovariateArgs<'a>>,
    /// inject covariates into every layer, not only the first one
    pub inject_covariates: bool,
}

struct FcLayer {
    linear: SplitLinear,
    fusion: Option<CovariateFusionLayer>,
    batch_norm: Option<BatchNorm>,
    layer_norm: Option<LayerNorm>,
    dropout: Option<Dropout>,
}

/// build a stack of `linear -> norm -> covariates -> relu -> dropout`
/// layers, where covariates enter the first layer (or every layer)
pub struct FcLayers {
    layers: Vec<FcLayer>,
    codec: Option<CovariateCodec>,
    n_output: usize,
}

impl FcLayers {
    pub fn new(args: FcLayersArgs, vb: candle_nn::VarBuilder) -> Result<Self> {
        let codec = match args.covariates.as_ref() {
            Some(cov) if !cov.is_empty() => Some(CovariateCodec::new(cov, vb.pp("cov"))?),
            _ => None,
        };
        let cond_dim = codec.as_ref().map(|c| c.dim()).unwrap_or(0);

        let mut layers = Vec::with_capacity(args.layers_dim.len());
        let mut d_prev = args.n_input;

        for (j, &d_out) in args.layers_dim.iter().enumerate() {
            let vb_j = vb.pp(format!("fc.{}", j));
            let inject = j == 0 || args.inject_covariates;

            let fusion = match (&codec, args.covariates.as_ref()) {
                (Some(_), Some(cov)) if inject => Some(CovariateFusionLayer::new(
                    cov.modeling.fusion,
                    cond_dim,
                    d_out,
                    vb_j.clone(),
                )?),
                _ => None,
            };
            let d_in = d_prev + fusion.as_ref().map(|f| f.extra_input_dim()).unwrap_or(0);

            let linear = split_linear(d_in, d_out, args.n_split, args.shared, vb_j.pp("linear"))?;

            let batch_norm = if args.use_batch_norm {
                let config = candle_nn::BatchNormConfig {
                    eps: 1e-3,
                    remove_mean: true,
                    affine: args.affine_batch_norm,
                    momentum: 0.01,
                };
                Some(candle_nn::batch_norm(d_out, config, vb_j.pp("bn"))?)
            } else {
                None
            };

            let layer_norm = if args.use_layer_norm {
                let config = candle_nn::LayerNormConfig {
                    eps: 1e-5,
                    remove_mean: true,
                    affine: false,
                };
                Some(candle_nn::layer_norm(d_out, config, vb_j.pp("ln"))?)
            } else {
                None
            };

            let dropout = (args.dropout_rate > 0.).then(|| Dropout::new(args.dropout_rate));

            layers.push(FcLayer {
                linear,
                fusion,
                batch_norm,
                layer_norm,
                dropout,
            });
            d_prev = d_out;
        }

        Ok(Self {
            layers,
            codec,
            n_output: d_prev,
        })
    }

    /// output dimension (the input dimension if there is no layer)
    pub fn dim_output(&self) -> usize {
        self.n_output
    }

    pub fn has_covariates(&self) -> bool {
        self.codec.is_some()
    }

    /// * `x` - `n x d` or `n x s x d` input
    /// * `cov` - categorical codes (or a shared embedding)
    /// * `mode` - batch statistics and dropout only in training
    pub fn forward_t(&self, x: &Tensor, cov: Option<&Tensor>, mode: ExecMode) -> Result<Tensor> {
        let train = mode.is_train();

        let cond = match (&self.codec, cov) {
            (Some(codec), Some(cov)) => Some(codec.encode(cov, x.dtype())?),
            (Some(_), None) => {
                candle_core::bail!("this layer stack was built with categorical covariates")
            }
            (None, _) => None,
        };

        let mut h = x.clone();
        for layer in self.layers.iter() {
            let fusion = match (&layer.fusion, &cond) {
                (Some(f), Some(c)) => Some((f, c)),
                _ => None,
            };

            if let Some((f, c)) = fusion {
                h = f.before_linear(&h, c)?;
            }

            h = layer.linear.forward(&h)?;

            if let Some(bn) = &layer.batch_norm {
                h = rank2_forward_t(bn, &h, train)?;
            }

            if let Some(ln) = &layer.layer_norm {
                h = ln.forward(&h)?;
            }

            if let Some((f, c)) = fusion {
                h = f.after_norm(&h, c)?;
            }

            h = h.relu()?;

            if let Some(dropout) = &layer.dropout {
                h = dropout.forward_t(&h, train)?;
            }
        }
        Ok(h)
    }
}

/// batch norm works on `n x d`, so fold split views into the rows
fn rank2_forward_t(bn: &BatchNorm, h: &Tensor, train: bool) -> Result<Tensor> {
    if h.rank() == 2 {
        return bn.forward_t(h, train);
    }
    let dims = h.dims().to_vec();
    bn.forward_t(&h.flatten_to(h.rank() - 2)?, train)?
        .reshape(dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn split_stack_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

        let args = FcLayersArgs {
            n_input: 6,
            layers_dim: &[16, 8],
            n_split: 3,
            shared: false,
            dropout_rate: 0.1,
            use_batch_norm: true,
            affine_batch_norm: false,
            use_layer_norm: true,
            covariates: Some(CovariateArgs {
                n_cats_per_cov: &[3],
                embedding_dims: &[4],
                modeling: "emb_adapter".parse()?,
            }),
            inject_covariates: true,
        };
        let fc = FcLayers::new(args, vb)?;
        assert_eq!(fc.dim_output(), 8);

        let x = Tensor::randn(0f32, 1., (5, 3, 6), &dev)?;
        let cat = Tensor::new(&[[0u32], [1], [2], [0], [1]], &dev)?;
        for mode in [ExecMode::Train, ExecMode::Infer, ExecMode::Deterministic] {
            let h = fc.forward_t(&x, Some(&cat), mode)?;
            assert_eq!(h.dims(), &[5, 3, 8]);
        }
        assert!(fc.forward_t(&x, None, ExecMode::Infer).is_err());
        Ok(())
    }

    #[test]
    fn empty_stack_passes_through() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let args = FcLayersArgs {
            n_input: 6,
            layers_dim: &[],
            n_split: 1,
            shared: true,
            dropout_rate: 0.,
            use_batch_norm: false,
            affine_batch_norm: false,
            use_layer_norm: false,
            covariates: None,
            inject_covariates: false,
        };
        let fc = FcLayers::new(args, vb)?;
        assert_eq!(fc.dim_output(), 6);
        let x = Tensor::randn(0f32, 1., (5, 6), &dev)?;
        let h = fc.forward_t(&x, None, ExecMode::Train)?;
        assert_eq!(h.to_vec2::<f32>()?, x.to_vec2::<f32>()?);
        Ok(())
    }
}
