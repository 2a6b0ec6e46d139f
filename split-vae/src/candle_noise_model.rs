use crate::candle_loss_functions::*;
use crate::candle_model_config::GeneLikelihood;
use crate::candle_model_traits::DecoderParams;

use candle_core::{DType, Result, Tensor};
use candle_nn::ops;
use rand_distr::{Distribution, Gamma, Poisson};

const VAR_EPS: f64 = 1e-4;
const MIN_LOG_PARAM: f64 = -20.;
const MAX_LOG_PARAM: f64 = 20.;

/// Scale of the encoder input relative to the raw data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InputScale {
    #[default]
    Identity,
    Log1p,
}

/// What the noise model remembers from the input transformation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct NoiseSideInfo {
    pub input_scale: InputScale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormalVariance {
    Fixed,
    Dynamic,
    PerFeature,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeanTransform {
    Exp,
    Softmax,
}

/// Observation noise of the features given decoder outputs
pub enum NoiseModel {
    Normal {
        variance: NormalVariance,
        log_var_1d: Option<Tensor>,
    },
    LogNormal {
        log_var_1d: Tensor,
    },
    Poisson,
    NegativeBinomial {
        mean_transform: MeanTransform,
        log_theta_1d: Tensor,
    },
    LogNegativeBinomial {
        log_theta_1d: Tensor,
    },
}

impl NoiseModel {
    /// Build the noise model of a named likelihood
    ///
    /// * `likelihood` - one of the supported likelihoods
    /// * `n_features` - number of features, for per-feature dispersion
    /// * `vb` - variable builder for the learned per-feature parameters
    ///
    pub fn new(
        likelihood: GeneLikelihood,
        n_features: usize,
        vb: candle_nn::VarBuilder,
    ) -> Result<Self> {
        let per_feature = |name: &str, init: candle_nn::Init| {
            vb.get_with_hints((1, n_features), name, init)
        };
        let randn = candle_nn::Init::Randn {
            mean: 0.,
            stdev: 1.,
        };

        Ok(match likelihood {
            GeneLikelihood::Normal => Self::Normal {
                variance: NormalVariance::Fixed,
                log_var_1d: None,
            },
            GeneLikelihood::NormalV => Self::Normal {
                variance: NormalVariance::Dynamic,
                log_var_1d: None,
            },
            GeneLikelihood::NormalSv => Self::Normal {
                variance: NormalVariance::PerFeature,
                log_var_1d: Some(per_feature("log_var", candle_nn::init::ZERO)?),
            },
            GeneLikelihood::LogNormal => Self::LogNormal {
                log_var_1d: per_feature("log_var", candle_nn::init::ZERO)?,
            },
            GeneLikelihood::Poisson => Self::Poisson,
            GeneLikelihood::Nb | GeneLikelihood::NbSv => Self::NegativeBinomial {
                mean_transform: MeanTransform::Exp,
                log_theta_1d: per_feature("log_theta", randn)?,
            },
            GeneLikelihood::NbOrig => Self::NegativeBinomial {
                mean_transform: MeanTransform::Softmax,
                log_theta_1d: per_feature("log_theta", randn)?,
            },
            GeneLikelihood::Pnb | GeneLikelihood::PnbSv => Self::LogNegativeBinomial {
                log_theta_1d: per_feature("log_theta", randn)?,
            },
        })
    }

    /// The decoder has to predict a variance as well as a mean
    pub fn needs_decoder_variance(&self) -> bool {
        matches!(
            self,
            Self::Normal {
                variance: NormalVariance::Dynamic,
                ..
            }
        )
    }

    /// Fixed transformation of the raw data before the encoder sees it:
    /// `log1p` for log-normal noise, identity otherwise
    pub fn initial_transformation(&self, x_nd: &Tensor) -> Result<(Tensor, NoiseSideInfo)> {
        let info = self.side_info();
        match info.input_scale {
            InputScale::Log1p => Ok(((x_nd + 1.)?.log()?, info)),
            InputScale::Identity => Ok((x_nd.clone(), info)),
        }
    }

    /// What `initial_transformation` reports, for decoding latent codes
    /// without any data
    pub fn side_info(&self) -> NoiseSideInfo {
        let input_scale = match self {
            Self::LogNormal { .. } => InputScale::Log1p,
            _ => InputScale::Identity,
        };
        NoiseSideInfo { input_scale }
    }

    /// Turn decoder outputs into an observation distribution
    ///
    /// * `params` - aggregated decoder parameters (n x d)
    /// * `library` - log library size per cell (n)
    /// * `info` - what `initial_transformation` returned
    ///
    pub fn build_distribution(
        &self,
        params: &DecoderParams,
        library: &Tensor,
        info: &NoiseSideInfo,
    ) -> Result<ObservationDistribution> {
        let mean = &params.mean;
        let (n, _) = mean.dims2()?;

        let expected_scale = self.side_info().input_scale;
        if info.input_scale != expected_scale {
            candle_core::bail!(
                "noise model expects {:?} input, but the data was {:?}",
                expected_scale,
                info.input_scale
            );
        }

        let log_lib_n1 = || -> Result<Tensor> {
            if library.elem_count() != n {
                candle_core::bail!(
                    "library size for {} cells, but {} rows of parameters",
                    library.elem_count(),
                    n
                );
            }
            library.reshape((n, 1))
        };

        Ok(match self {
            Self::Normal {
                variance,
                log_var_1d,
            } => {
                let var = match (variance, log_var_1d, &params.var) {
                    (NormalVariance::Fixed, _, _) => Tensor::ones_like(mean)?,
                    (NormalVariance::Dynamic, _, Some(raw)) => positive_variance(raw)?,
                    (NormalVariance::PerFeature, Some(raw), _) => {
                        positive_variance(raw)?.broadcast_as(mean.shape())?
                    }
                    _ => candle_core::bail!("decoder did not produce a variance"),
                };
                ObservationDistribution::Normal {
                    mean: mean.clone(),
                    var,
                }
            }
            Self::LogNormal { log_var_1d } => ObservationDistribution::LogNormal {
                mu: mean.clone(),
                var: positive_variance(log_var_1d)?.broadcast_as(mean.shape())?,
            },
            Self::Poisson => ObservationDistribution::Poisson {
                log_rate: mean
                    .clamp(MIN_LOG_PARAM, MAX_LOG_PARAM)?
                    .broadcast_add(&log_lib_n1()?)?,
            },
            Self::NegativeBinomial {
                mean_transform,
                log_theta_1d,
            } => {
                let log_mu = match mean_transform {
                    MeanTransform::Exp => mean.clamp(MIN_LOG_PARAM, MAX_LOG_PARAM)?,
                    MeanTransform::Softmax => ops::log_softmax(mean, 1)?,
                }
                .broadcast_add(&log_lib_n1()?)?;

                ObservationDistribution::NegativeBinomial {
                    mu: log_mu.exp()?,
                    theta: log_theta_1d.clamp(MIN_LOG_PARAM, MAX_LOG_PARAM)?.exp()?,
                }
            }
            Self::LogNegativeBinomial { log_theta_1d } => {
                ObservationDistribution::LogNegativeBinomial {
                    log_mu: mean
                        .clamp(MIN_LOG_PARAM, MAX_LOG_PARAM)?
                        .broadcast_add(&log_lib_n1()?)?,
                    log_theta: log_theta_1d.clamp(MIN_LOG_PARAM, MAX_LOG_PARAM)?,
                }
            }
        })
    }
}

/// exp(clamp(raw)) + eps
fn positive_variance(raw: &Tensor) -> Result<Tensor> {
    raw.clamp(-15., 15.)?.exp()? + VAR_EPS
}

////////////////////////////////////
// parametric observation models  //
////////////////////////////////////

/// Observation distribution over the raw features (n x d)
#[derive(Clone, Debug)]
pub enum ObservationDistribution {
    Normal { mean: Tensor, var: Tensor },
    /// log1p(x) ~ N(mu, var)
    LogNormal { mu: Tensor, var: Tensor },
    Poisson { log_rate: Tensor },
    NegativeBinomial { mu: Tensor, theta: Tensor },
    LogNegativeBinomial { log_mu: Tensor, log_theta: Tensor },
}

impl ObservationDistribution {
    /// Element-wise log-likelihood of the raw data (n x d)
    pub fn log_prob(&self, x_nd: &Tensor) -> Result<Tensor> {
        match self {
            Self::Normal { mean, var } => normal_log_prob(x_nd, mean, var),
            Self::LogNormal { mu, var } => {
                let log1p_x = (x_nd + 1.)?.log()?;
                normal_log_prob(&log1p_x, mu, var)? - log1p_x
            }
            Self::Poisson { log_rate } => poisson_log_prob(x_nd, log_rate),
            Self::NegativeBinomial { mu, theta } => nb_log_prob(x_nd, mu, theta),
            Self::LogNegativeBinomial { log_mu, log_theta } => {
                log_nb_log_prob(x_nd, log_mu, log_theta)
            }
        }
    }

    /// Expected value on the scale of the raw data (n x d)
    pub fn mean(&self) -> Result<Tensor> {
        match self {
            Self::Normal { mean, .. } => Ok(mean.clone()),
            Self::LogNormal { mu, var } => (mu + (var * 0.5)?)?.exp()? - 1.,
            Self::Poisson { log_rate } => log_rate.exp(),
            Self::NegativeBinomial { mu, .. } => Ok(mu.clone()),
            Self::LogNegativeBinomial { log_mu, .. } => log_mu.exp(),
        }
    }

    /// Draw one observation per entry (n x d)
    pub fn sample(&self) -> Result<Tensor> {
        match self {
            Self::Normal { mean, var } => {
                let eps = Tensor::randn_like(mean, 0., 1.)?;
                mean + (var.sqrt()? * eps)?
            }
            Self::LogNormal { mu, var } => {
                let eps = Tensor::randn_like(mu, 0., 1.)?;
                ((mu + (var.sqrt()? * eps)?)?.exp()? - 1.)?.relu()
            }
            Self::Poisson { log_rate } => sample_counts(log_rate, None),
            Self::NegativeBinomial { mu, theta } => {
                sample_counts(&(mu + 1e-8)?.log()?, Some(&theta.log()?))
            }
            Self::LogNegativeBinomial { log_mu, log_theta } => {
                sample_counts(log_mu, Some(log_theta))
            }
        }
    }
}

/// Poisson, or Gamma-Poisson if a dispersion is given, counts drawn
/// entry by entry on the host
fn sample_counts(log_mu: &Tensor, log_theta: Option<&Tensor>) -> Result<Tensor> {
    let shape = log_mu.shape().clone();
    let device = log_mu.device().clone();
    let dtype = log_mu.dtype();

    let mu = log_mu
        .exp()?
        .to_dtype(DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()?;

    let theta = match log_theta {
        Some(lt) => Some(
            lt.broadcast_as(shape.clone())?
                .exp()?
                .to_dtype(DType::F64)?
                .flatten_all()?
                .to_vec1::<f64>()?,
        ),
        None => None,
    };

    let mut rng = rand::rng();
    let mut out = Vec::with_capacity(mu.len());

    for (i, &m) in mu.iter().enumerate() {
        let rate = match &theta {
            Some(theta) => {
                let shape_i = theta[i];
                match Gamma::new(shape_i, m / shape_i) {
                    Ok(gamma) if m > 0. && shape_i > 0. => gamma.sample(&mut rng),
                    _ => 0.,
                }
            }
            None => m,
        };

        let count = match Poisson::new(rate) {
            Ok(pois) if rate > 0. => pois.sample(&mut rng),
            _ => 0.,
        };
        out.push(count as f32);
    }

    Tensor::from_vec(out, shape, &device)?.to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn count_data(dev: &Device) -> Result<Tensor> {
        Tensor::new(&[[0f32, 0., 0., 0.], [1., 5., 0., 20.], [3., 0., 2., 1.]], dev)
    }

    #[test]
    fn every_likelihood_builds_a_distribution() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let x = count_data(&dev)?;
        let library = x.sum(1)?.clamp(1f32, f32::MAX)?.log()?;

        for (j, name) in GeneLikelihood::NAMES.iter().enumerate() {
            let lik: GeneLikelihood = name.parse()?;
            let noise = NoiseModel::new(lik, 4, vb.pp(format!("noise.{}", j)))?;
            let (x_t, info) = noise.initial_transformation(&x)?;
            assert_eq!(x_t.dims(), x.dims());

            let params = DecoderParams {
                mean: Tensor::randn(0f32, 1., (3, 4), &dev)?,
                var: noise
                    .needs_decoder_variance()
                    .then(|| Tensor::randn(0f32, 1., (3, 4), &dev))
                    .transpose()?,
            };
            let px = noise.build_distribution(&params, &library, &info)?;
            let lp = px.log_prob(&x)?;
            assert_eq!(lp.dims(), &[3, 4]);
            let total = lp.sum_all()?.to_scalar::<f32>()?;
            assert!(total.is_finite(), "{}: {}", name, total);
            assert_eq!(px.mean()?.dims(), &[3, 4]);
            assert_eq!(px.sample()?.dims(), &[3, 4]);

            if let ObservationDistribution::Normal { var, .. }
            | ObservationDistribution::LogNormal { var, .. } = &px
            {
                assert!(var.min_all()?.to_scalar::<f32>()? > 0.);
            }
        }
        Ok(())
    }

    #[test]
    fn lognormal_transforms_input() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let noise = NoiseModel::new(GeneLikelihood::LogNormal, 4, vb)?;
        let x = count_data(&dev)?;
        let (x_t, info) = noise.initial_transformation(&x)?;
        assert_eq!(info.input_scale, InputScale::Log1p);
        let expected = (&x + 1.)?.log()?;
        assert_eq!(x_t.to_vec2::<f32>()?, expected.to_vec2::<f32>()?);

        // the side info has to match the noise model
        let params = DecoderParams {
            mean: Tensor::zeros((3, 4), DType::F32, &dev)?,
            var: None,
        };
        let library = Tensor::zeros(3, DType::F32, &dev)?;
        assert!(noise
            .build_distribution(&params, &library, &NoiseSideInfo::default())
            .is_err());
        Ok(())
    }

    #[test]
    fn dynamic_variance_requires_decoder_output() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let noise = NoiseModel::new(GeneLikelihood::NormalV, 4, vb)?;
        assert!(noise.needs_decoder_variance());
        let params = DecoderParams {
            mean: Tensor::zeros((3, 4), DType::F32, &dev)?,
            var: None,
        };
        let library = Tensor::zeros(3, DType::F32, &dev)?;
        assert!(noise
            .build_distribution(&params, &library, &NoiseSideInfo::default())
            .is_err());
        Ok(())
    }

    #[test]
    fn count_samples_are_non_negative_integers() -> Result<()> {
        let dev = Device::Cpu;
        let log_mu = Tensor::new(&[[0f32, 1., 2.], [-30., 3., 0.5]], &dev)?;
        let log_theta = Tensor::new(&[[0f32, 1., -1.]], &dev)?;
        for theta in [None, Some(&log_theta)] {
            let y = sample_counts(&log_mu, theta)?.to_vec2::<f32>()?;
            for v in y.iter().flatten() {
                assert!(*v >= 0. && v.fract() == 0.);
            }
        }
        Ok(())
    }
}
