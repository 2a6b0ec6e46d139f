use crate::candle_loss_functions::*;
use crate::candle_model_config::PriorSpec;
use crate::candle_model_traits::*;

use candle_core::{Result, Tensor};
use candle_nn::{ops, VarBuilder};

/// A batch of data used to initialize a prior
pub struct PriorSeed<'a> {
    /// posterior mean of the seed cells (n x k)
    pub qz_m: &'a Tensor,
    /// posterior variance of the seed cells (n x k)
    pub qz_v: &'a Tensor,
    /// encoder input of the seed cells (n x d)
    pub encoder_input: &'a Tensor,
    /// categorical covariates the encoder takes (n x c)
    pub encoder_cat: Option<&'a Tensor>,
}

/// Prior p(z) over the latent code
pub enum LatentPrior {
    Standard,
    GaussianMixture(GaussianMixturePrior),
    Vamp(VampPrior),
}

impl LatentPrior {
    /// Build a prior of the given family
    ///
    /// * `family` - prior family and the number of components
    /// * `n_latent` - latent dimension
    /// * `seed` - optional seed data (required for VampPrior)
    /// * `vb` - variable builder for the prior parameters
    ///
    pub fn new(
        family: PriorSpec,
        n_latent: usize,
        seed: Option<&PriorSeed>,
        vb: VarBuilder,
    ) -> Result<Self> {
        match family {
            PriorSpec::Normal => Ok(Self::Standard),
            PriorSpec::GaussianMixture(k) => Ok(Self::GaussianMixture(
                GaussianMixturePrior::new(k, n_latent, seed, vb.pp("gmm"))?,
            )),
            PriorSpec::Vamp(k) => match seed {
                Some(seed) => Ok(Self::Vamp(VampPrior::new(k, seed, vb.pp("vamp"))?)),
                None => candle_core::bail!(
                    "VampPrior with {} pseudo-inputs needs seed data to start from",
                    k
                ),
            },
        }
    }

    /// KL divergence between q(z|x) and the prior, one column per
    /// latent dimension (n x k)
    ///
    /// For the mixtures this is a single-sample Monte Carlo estimate
    /// whose row sums are `log q(z|x) - log p(z)`.
    ///
    /// * `qz_m` - posterior mean
    /// * `qz_v` - posterior variance
    /// * `mode` - execution mode (VampPrior re-encodes its pseudo-inputs)
    /// * `encoder` - encoder of the module, used by the VampPrior
    ///
    pub fn kl(
        &self,
        qz_m: &Tensor,
        qz_v: &Tensor,
        mode: ExecMode,
        encoder: &dyn LatentEncoderT,
    ) -> Result<Tensor> {
        match self {
            Self::Standard => gaussian_kl_loss(qz_m, qz_v),
            Self::GaussianMixture(gmm) => {
                let components = gmm.components()?;
                mixture_kl(qz_m, qz_v, &components, mode)
            }
            Self::Vamp(vamp) => {
                let components = vamp.components(encoder, mode)?;
                mixture_kl(qz_m, qz_v, &components, mode)
            }
        }
    }

    /// log p(z) for each cell (n)
    pub fn log_density(
        &self,
        z_nk: &Tensor,
        mode: ExecMode,
        encoder: &dyn LatentEncoderT,
    ) -> Result<Tensor> {
        match self {
            Self::Standard => {
                let zero = Tensor::zeros((1, 1), z_nk.dtype(), z_nk.device())?;
                let one = Tensor::ones((1, 1), z_nk.dtype(), z_nk.device())?;
                normal_log_prob(z_nk, &zero, &one)?.sum(1)
            }
            Self::GaussianMixture(gmm) => gmm.components()?.log_density(z_nk),
            Self::Vamp(vamp) => vamp.components(encoder, mode)?.log_density(z_nk),
        }
    }

    pub fn n_components(&self) -> Option<usize> {
        match self {
            Self::Standard => None,
            Self::GaussianMixture(gmm) => Some(gmm.n_components),
            Self::Vamp(vamp) => Some(vamp.n_components),
        }
    }
}

/// A mixture of K diagonal Gaussians
pub struct MixtureComponents {
    /// log mixture weights (k)
    pub log_weights: Tensor,
    /// component means (k x d)
    pub means: Tensor,
    /// component variances (k x d)
    pub vars: Tensor,
}

impl MixtureComponents {
    /// log sum_k w_k N(z | mu_k, var_k) for each row of `z_nd` (n)
    pub fn log_density(&self, z_nd: &Tensor) -> Result<Tensor> {
        let z_n1d = z_nd.unsqueeze(1)?;
        let mu_1kd = self.means.unsqueeze(0)?;
        let var_1kd = self.vars.unsqueeze(0)?;
        let log_p_nk = normal_log_prob(&z_n1d, &mu_1kd, &var_1kd)?.sum(2)?;
        let log_p_nk = log_p_nk.broadcast_add(&self.log_weights.unsqueeze(0)?)?;
        log_sum_exp(&log_p_nk, 1)
    }
}

/// log q(z|x) - log p(z), with the joint log p(z) spread evenly over
/// the latent dimensions
fn mixture_kl(
    qz_m: &Tensor,
    qz_v: &Tensor,
    components: &MixtureComponents,
    mode: ExecMode,
) -> Result<Tensor> {
    let (_, n_latent) = qz_m.dims2()?;
    let z = reparameterize(qz_m, qz_v, mode)?;
    let log_q_nd = normal_log_prob(&z, qz_m, qz_v)?;
    let log_p_n1 = (components.log_density(&z)?.unsqueeze(1)? / n_latent as f64)?;
    log_q_nd.broadcast_sub(&log_p_n1)
}

/////////////////////////////
// Gaussian mixture prior  //
/////////////////////////////

/// Learned mixture of K diagonal Gaussians
pub struct GaussianMixturePrior {
    n_components: usize,
    logits_k: Tensor,
    /// fixed starting point from seed data
    mean_seed_kd: Option<Tensor>,
    mean_kd: Tensor,
    lnvar_kd: Tensor,
}

impl GaussianMixturePrior {
    /// Will create these variables:
    ///
    /// * `gmm.logits` - mixture logits (k)
    /// * `gmm.mean` - component means, or their offsets from the seed (k x d)
    /// * `gmm.lnvar` - component log variances (k x d)
    pub fn new(
        n_components: usize,
        n_latent: usize,
        seed: Option<&PriorSeed>,
        vb: VarBuilder,
    ) -> Result<Self> {
        if n_components == 0 {
            candle_core::bail!("Gaussian mixture prior needs at least one component");
        }

        let logits_k = vb.get_with_hints(n_components, "logits", candle_nn::init::ZERO)?;

        let (mean_seed_kd, mean_kd, lnvar_kd) = match seed {
            Some(seed) => {
                let n_seed = seed.qz_m.dim(0)?;
                if n_seed < n_components {
                    candle_core::bail!(
                        "{} seed cells for a mixture of {} components",
                        n_seed,
                        n_components
                    );
                }
                let mean_seed = seed.qz_m.narrow(0, 0, n_components)?.detach();
                let lnvar_init = seed
                    .qz_v
                    .narrow(0, 0, n_components)?
                    .log()?
                    .mean_all()?
                    .to_dtype(candle_core::DType::F64)?
                    .to_scalar::<f64>()?;
                let offset =
                    vb.get_with_hints((n_components, n_latent), "mean", candle_nn::init::ZERO)?;
                let lnvar = vb.get_with_hints(
                    (n_components, n_latent),
                    "lnvar",
                    candle_nn::Init::Const(lnvar_init),
                )?;
                (Some(mean_seed), offset, lnvar)
            }
            None => {
                let mean = vb.get_with_hints(
                    (n_components, n_latent),
                    "mean",
                    candle_nn::Init::Randn {
                        mean: 0.,
                        stdev: 1.,
                    },
                )?;
                let lnvar = vb.get_with_hints(
                    (n_components, n_latent),
                    "lnvar",
                    candle_nn::init::ZERO,
                )?;
                (None, mean, lnvar)
            }
        };

        Ok(Self {
            n_components,
            logits_k,
            mean_seed_kd,
            mean_kd,
            lnvar_kd,
        })
    }

    pub fn components(&self) -> Result<MixtureComponents> {
        let means = match &self.mean_seed_kd {
            Some(seed) => (seed + &self.mean_kd)?,
            None => self.mean_kd.clone(),
        };
        Ok(MixtureComponents {
            log_weights: ops::log_softmax(&self.logits_k, 0)?,
            means,
            vars: (self.lnvar_kd.clamp(-15., 15.)?.exp()? + 1e-4)?,
        })
    }
}

//////////////////////////
// VampPrior            //
//////////////////////////

/// Uniform mixture of the posteriors of K trainable pseudo-inputs
pub struct VampPrior {
    n_components: usize,
    input_seed_kd: Tensor,
    input_offset_kd: Tensor,
    /// categorical covariates of the pseudo-inputs, not trained
    cat_kc: Option<Tensor>,
}

impl VampPrior {
    /// Will create `vamp.pseudo_inputs` (k x d), the offsets of the
    /// pseudo-inputs from the first K seed cells
    pub fn new(n_components: usize, seed: &PriorSeed, vb: VarBuilder) -> Result<Self> {
        if n_components == 0 {
            candle_core::bail!("VampPrior needs at least one pseudo-input");
        }

        let (n_seed, d) = seed.encoder_input.dims2()?;
        if n_seed < n_components {
            candle_core::bail!(
                "{} seed cells for {} pseudo-inputs",
                n_seed,
                n_components
            );
        }

        let input_seed_kd = seed.encoder_input.narrow(0, 0, n_components)?.detach();
        let input_offset_kd =
            vb.get_with_hints((n_components, d), "pseudo_inputs", candle_nn::init::ZERO)?;
        let cat_kc = match seed.encoder_cat {
            Some(cat) => Some(cat.narrow(0, 0, n_components)?.detach()),
            None => None,
        };

        Ok(Self {
            n_components,
            input_seed_kd,
            input_offset_kd,
            cat_kc,
        })
    }

    pub fn pseudo_inputs(&self) -> Result<Tensor> {
        &self.input_seed_kd + &self.input_offset_kd
    }

    /// Encode the pseudo-inputs with the current encoder
    pub fn components(
        &self,
        encoder: &dyn LatentEncoderT,
        mode: ExecMode,
    ) -> Result<MixtureComponents> {
        let u_kd = self.pseudo_inputs()?;
        let (means, vars) = encoder.encode_gaussian(&u_kd, self.cat_kc.as_ref(), mode)?;
        let log_weights = (Tensor::ones(self.n_components, means.dtype(), means.device())?
            * (-(self.n_components as f64).ln()))?;
        Ok(MixtureComponents {
            log_weights,
            means,
            vars,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_encoder_covariate::*;
    use crate::candle_model_config::VarActivation;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_encoder(vb: VarBuilder) -> Result<CovariateEncoder> {
        CovariateEncoder::new(
            EncoderArgs {
                n_input: 12,
                n_latent: 3,
                layers: &[8],
                input_dropout_rate: 0.,
                dropout_rate: 0.,
                use_batch_norm: false,
                affine_batch_norm: false,
                use_layer_norm: false,
                var_activation: VarActivation::Exp,
                covariates: None,
                inject_covariates: false,
            },
            vb,
        )
    }

    #[test]
    fn vamp_needs_seed() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        assert!(LatentPrior::new(PriorSpec::Vamp(5), 3, None, vb).is_err());
        Ok(())
    }

    #[test]
    fn mixture_kl_rows_match_monte_carlo_estimate() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let enc = small_encoder(vb.pp("enc"))?;
        let gmm = GaussianMixturePrior::new(4, 3, None, vb.pp("gmm"))?;
        let components = gmm.components()?;

        let qz_m = Tensor::randn(0f32, 1., (6, 3), &dev)?;
        let qz_v = (Tensor::rand(0f32, 1., (6, 3), &dev)? + 0.1)?;
        let prior = LatentPrior::GaussianMixture(gmm);

        // deterministic: z = qz_m, so the estimate is reproducible
        let kl = prior.kl(&qz_m, &qz_v, ExecMode::Deterministic, &enc)?;
        assert_eq!(kl.dims(), &[6, 3]);
        let kl_n = kl.sum(1)?.to_vec1::<f32>()?;

        let log_q = normal_log_prob(&qz_m, &qz_m, &qz_v)?.sum(1)?;
        let log_p = components.log_density(&qz_m)?;
        let expected = (log_q - log_p)?.to_vec1::<f32>()?;
        for (a, b) in kl_n.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn seeded_priors() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let enc = small_encoder(vb.pp("enc"))?;

        let x = Tensor::rand(0f32, 3., (10, 12), &dev)?;
        let (qz_m, qz_v) = enc.encode_gaussian(&x, None, ExecMode::Deterministic)?;
        let seed = PriorSeed {
            qz_m: &qz_m,
            qz_v: &qz_v,
            encoder_input: &x,
            encoder_cat: None,
        };

        let gmm = LatentPrior::new(PriorSpec::GaussianMixture(4), 3, Some(&seed), vb.pp("a"))?;
        let vamp = LatentPrior::new(PriorSpec::Vamp(5), 3, Some(&seed), vb.pp("b"))?;
        assert_eq!(vamp.n_components(), Some(5));

        if let LatentPrior::GaussianMixture(g) = &gmm {
            let means = g.components()?.means.to_vec2::<f32>()?;
            assert_eq!(means, qz_m.narrow(0, 0, 4)?.to_vec2::<f32>()?);
        }

        for prior in [&gmm, &vamp] {
            for mode in [ExecMode::Train, ExecMode::Infer, ExecMode::Deterministic] {
                let kl = prior.kl(&qz_m, &qz_v, mode, &enc)?;
                assert!(kl.sum_all()?.to_scalar::<f32>()?.is_finite());
            }
            let lp = prior.log_density(&qz_m, ExecMode::Deterministic, &enc)?;
            assert_eq!(lp.dims(), &[10]);
        }

        let too_many = LatentPrior::new(PriorSpec::Vamp(20), 3, Some(&seed), vb.pp("c"));
        assert!(too_many.is_err());
        let too_many = LatentPrior::new(PriorSpec::GaussianMixture(11), 3, Some(&seed), vb.pp("d"));
        assert!(too_many.is_err());
        Ok(())
    }
}
