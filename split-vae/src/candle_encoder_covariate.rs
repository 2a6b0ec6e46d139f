use crate::candle_aux_layers::*;
use crate::candle_covariate::CovariateArgs;
use crate::candle_model_config::VarActivation;
use crate::candle_model_traits::*;

use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarBuilder};

/// Everything the encoder needs to know at construction
#[derive(Clone, Copy, Debug)]
pub struct EncoderArgs<'a> {
    pub n_input: usize,
    pub n_latent: usize,
    pub layers: &'a [usize],
    pub input_dropout_rate: f32,
    pub dropout_rate: f32,
    pub use_batch_norm: bool,
    pub affine_batch_norm: bool,
    pub use_layer_norm: bool,
    pub var_activation: VarActivation,
    pub covariates: Option<CovariateArgs<'a>>,
    pub inject_covariates: bool,
}

/// Gaussian encoder q(z | x, covariates)
pub struct CovariateEncoder {
    n_input: usize,
    n_latent: usize,
    input_dropout: Option<Dropout>,
    fc: FcLayers,
    z_mean: Linear,
    z_var: Linear,
    var_activation: VarActivation,
}

const VAR_EPS: f64 = 1e-4;

impl LatentEncoderT for CovariateEncoder {
    fn encode_gaussian(
        &self,
        x_nd: &Tensor,
        cat_nk: Option<&Tensor>,
        mode: ExecMode,
    ) -> Result<(Tensor, Tensor)> {
        self.latent_gaussian_params(x_nd, cat_nk, mode)
    }

    fn dim_obs(&self) -> usize {
        self.n_input
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

impl CovariateEncoder {
    /// Will create a new encoder module with these variables:
    ///
    /// * `fc.{}.linear.weight` where {} is the layer index
    /// * `fc.{}.bn.*`, `fc.{}.ln.*`, `fc.{}.cov.*` if needed
    /// * `cov.emb.{}` for per-field covariate embeddings
    /// * `z.mean.*`, `z.var.*` for the posterior heads
    pub fn new(args: EncoderArgs, vb: VarBuilder) -> Result<Self> {
        if args.n_input == 0 || args.n_latent == 0 {
            candle_core::bail!(
                "encoder needs positive input and latent dims: {} -> {}",
                args.n_input,
                args.n_latent
            );
        }

        let fc = FcLayers::new(
            FcLayersArgs {
                n_input: args.n_input,
                layers_dim: args.layers,
                n_split: 1,
                shared: true,
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
        let z_mean = candle_nn::linear(d_hidden, args.n_latent, vb.pp("z.mean"))?;
        let z_var = candle_nn::linear(d_hidden, args.n_latent, vb.pp("z.var"))?;

        let input_dropout =
            (args.input_dropout_rate > 0.).then(|| Dropout::new(args.input_dropout_rate));

        Ok(Self {
            n_input: args.n_input,
            n_latent: args.n_latent,
            input_dropout,
            fc,
            z_mean,
            z_var,
            var_activation: args.var_activation,
        })
    }

    ///
    /// Evaluate latent Gaussian parameters: mean and variance
    /// z ~ N(mu(x), var(x)), var(x) = act(h) + 1e-4
    ///
    pub fn latent_gaussian_params(
        &self,
        x_nd: &Tensor,
        cat_nk: Option<&Tensor>,
        mode: ExecMode,
    ) -> Result<(Tensor, Tensor)> {
        let (_, d) = x_nd.dims2()?;
        if d != self.n_input {
            candle_core::bail!("encoder expects {} input columns, got {}", self.n_input, d);
        }

        let x_nd = match &self.input_dropout {
            Some(dropout) => dropout.forward_t(x_nd, mode.is_train())?,
            None => x_nd.clone(),
        };

        let h_nh = self.fc.forward_t(&x_nd, cat_nk, mode)?;
        let qz_m = self.z_mean.forward(&h_nh)?;
        let raw_v = self.z_var.forward(&h_nh)?;

        let qz_v = match self.var_activation {
            VarActivation::Exp => raw_v.clamp(-15., 15.)?.exp()?,
            VarActivation::Pow2 => raw_v.sqr()?,
        };
        Ok((qz_m, (qz_v + VAR_EPS)?))
    }

    /// Posterior parameters together with a latent sample
    pub fn forward_t(
        &self,
        x_nd: &Tensor,
        cat_nk: Option<&Tensor>,
        mode: ExecMode,
    ) -> Result<LatentGaussian> {
        let (qz_m, qz_v) = self.latent_gaussian_params(x_nd, cat_nk, mode)?;
        let z = reparameterize(&qz_m, &qz_v, mode)?;
        Ok(LatentGaussian { qz_m, qz_v, z })
    }
}
