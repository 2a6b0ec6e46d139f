use candle_core::{Result, Tensor};

/// How a forward pass should behave
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// dropout, batch statistics, stochastic latent, masking
    Train,
    /// evaluation layers with a stochastic latent
    #[default]
    Infer,
    /// evaluation layers with the latent fixed to its mean
    Deterministic,
}

impl ExecMode {
    pub fn is_train(&self) -> bool {
        matches!(self, Self::Train)
    }

    /// whether the latent code is sampled (`Train` and `Infer`)
    pub fn is_stochastic(&self) -> bool {
        !matches!(self, Self::Deterministic)
    }
}

/// Approximate posterior q(z|x) and a latent code drawn from it
#[derive(Clone, Debug)]
pub struct LatentGaussian {
    /// posterior mean (n x k)
    pub qz_m: Tensor,
    /// posterior variance (n x k), strictly positive
    pub qz_v: Tensor,
    /// reparameterized sample, or `qz_m` in deterministic mode
    pub z: Tensor,
}

/// Distribution parameters produced by the decoder
///
/// `mean` is always there; `var` only when the decoder also predicts a
/// variance. Both are `n x d` after aggregation and `n x s x d` for
/// each split.
#[derive(Clone, Debug)]
pub struct DecoderParams {
    pub mean: Tensor,
    pub var: Option<Tensor>,
}

impl DecoderParams {
    pub fn detach(&self) -> Self {
        Self {
            mean: self.mean.detach(),
            var: self.var.as_ref().map(|v| v.detach()),
        }
    }
}

pub trait LatentEncoderT {
    /// Posterior parameters of the latent code
    ///
    /// # Arguments
    /// * `x_nd` - encoder input (n x d)
    /// * `cat_nk` - categorical covariates, if the encoder takes them
    /// * `mode` - execution mode
    ///
    /// # Returns `(qz_m, qz_v)`
    fn encode_gaussian(
        &self,
        x_nd: &Tensor,
        cat_nk: Option<&Tensor>,
        mode: ExecMode,
    ) -> Result<(Tensor, Tensor)>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

/// z = mean + sqrt(var) * eps, eps ~ N(0, 1); `mean` itself when the
/// mode is deterministic
pub fn reparameterize(z_mean: &Tensor, z_var: &Tensor, mode: ExecMode) -> Result<Tensor> {
    if mode.is_stochastic() {
        let eps = Tensor::randn_like(z_mean, 0., 1.)?;
        z_mean + (z_var.sqrt()? * eps)?
    } else {
        Ok(z_mean.clone())
    }
}
