use crate::candle_covariate::*;
use crate::candle_data_loader::ObservationBatch;
use crate::candle_decoder_split::*;
use crate::candle_encoder_covariate::*;
use crate::candle_loss_functions::*;
use crate::candle_model_config::*;
use crate::candle_model_traits::*;
use crate::candle_noise_model::*;
use crate::candle_prior::*;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use log::info;

/// Input of the encoder after the fixed transformations
pub struct PreprocessedInput {
    /// noise-model transformed features (n x d)
    pub x: Tensor,
    /// continuous covariates for the encoder (n x m)
    pub encoder_cont: Option<Tensor>,
    /// categorical codes for the encoder (n x k)
    pub encoder_cat: Option<Tensor>,
    /// log library size (n)
    pub library: Tensor,
    pub side_info: NoiseSideInfo,
}

pub struct InferenceOutput {
    pub qz_m: Tensor,
    pub qz_v: Tensor,
    pub z: Tensor,
    /// 1 for the entries the encoder saw, 0 for the masked ones
    pub x_mask: Option<Tensor>,
    pub library: Tensor,
    pub side_info: NoiseSideInfo,
}

pub struct GenerativeInput<'a> {
    pub z: &'a Tensor,
    /// log library size (n)
    pub library: &'a Tensor,
    pub side_info: &'a NoiseSideInfo,
    pub cont_covs: Option<&'a Tensor>,
    pub cat_covs: Option<&'a Tensor>,
}

pub struct GenerativeOutput {
    pub px: ObservationDistribution,
    /// aggregated over splits (n x d)
    pub params: DecoderParams,
    /// one per split (n x s x d)
    pub original_params: DecoderParams,
}

pub struct LossOutput {
    /// mean(reconstruction + kl_weight * KL)
    pub loss: Tensor,
    /// -sum_features log p(x|z) per cell (n)
    pub reconstruction_loss: Tensor,
    /// KL per cell (n)
    pub kl_local: Tensor,
    /// squared error against the mean per cell, not optimized (n)
    pub mse: Tensor,
}

pub struct ForwardOutput {
    pub inference: InferenceOutput,
    pub generative: GenerativeOutput,
    pub loss: Option<LossOutput>,
}

/// Variational autoencoder with a splittable latent space
///
/// A forward pass goes through these steps:
///
/// ```text
/// preprocess -> inference -> generative -> loss
/// ```
///
/// and each step receives the execution mode explicitly.
pub struct SplitVaeModule {
    config: SplitVaeConfig,
    n_split: usize,
    device: Device,
    noise: NoiseModel,
    shared_cov_emb: Option<MultiEmbedding>,
    encoder: CovariateEncoder,
    decoder: SplitDecoder,
    prior: LatentPrior,
}

/// The encoder as the priors see it: codes go through the shared
/// covariate embedding first
struct ModuleEncoder<'a> {
    encoder: &'a CovariateEncoder,
    shared_cov_emb: Option<&'a MultiEmbedding>,
}

impl LatentEncoderT for ModuleEncoder<'_> {
    fn encode_gaussian(
        &self,
        x_nd: &Tensor,
        cat_nk: Option<&Tensor>,
        mode: ExecMode,
    ) -> Result<(Tensor, Tensor)> {
        let cat = match (cat_nk, self.shared_cov_emb) {
            (Some(cat), Some(emb)) => Some(emb.forward(cat)?),
            (cat, _) => cat.cloned(),
        };
        self.encoder.latent_gaussian_params(x_nd, cat.as_ref(), mode)
    }

    fn dim_obs(&self) -> usize {
        self.encoder.dim_obs()
    }

    fn dim_latent(&self) -> usize {
        self.encoder.dim_latent()
    }
}

impl SplitVaeModule {
    /// Build the module with all its variables under `vb`:
    ///
    /// * `encoder.*` - encoder network
    /// * `decoder.*` - splittable decoder network
    /// * `noise.*` - per-feature dispersion/variance
    /// * `prior.*` - prior parameters (mixtures only)
    /// * `cov.shared.*` - shared covariate embedding
    ///
    /// # Arguments
    /// * `config` - model configuration (validated here)
    /// * `prior_seed` - cells to initialize a mixture prior from;
    ///   required for the VampPrior
    /// * `vb` - variable builder
    pub fn new(
        config: &SplitVaeConfig,
        prior_seed: Option<&ObservationBatch>,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;

        let n_split = config.n_split()?;
        let emb_dims = config.covariate_embedding_dims();
        let has_cat = !config.n_cats_per_cov.is_empty();
        let modeling = config.covariate_modeling_strategy;

        let shared_cov_emb = if has_cat && modeling.is_shared_embedding() {
            Some(MultiEmbedding::new(
                &config.n_cats_per_cov,
                &emb_dims,
                Some(1.),
                vb.pp("cov.shared"),
            )?)
        } else {
            None
        };

        let cov_args = has_cat.then_some(CovariateArgs {
            n_cats_per_cov: &config.n_cats_per_cov,
            embedding_dims: &emb_dims,
            modeling,
        });

        let n_encoder_input = if config.encode_covariates {
            config.n_input + config.n_continuous_cov
        } else {
            config.n_input
        };

        let encoder = CovariateEncoder::new(
            EncoderArgs {
                n_input: n_encoder_input,
                n_latent: config.n_latent,
                layers: &config.encoder_dims,
                input_dropout_rate: config.input_dropout_rate,
                dropout_rate: config.encoder_dropout_rate,
                use_batch_norm: config.use_batch_norm.encoder(),
                affine_batch_norm: config.affine_batch_norm.encoder(),
                use_layer_norm: config.use_layer_norm.encoder(),
                var_activation: config.var_activation,
                covariates: if config.encode_covariates {
                    cov_args
                } else {
                    None
                },
                inject_covariates: config.deeply_inject_covariates,
            },
            vb.pp("encoder"),
        )?;

        let noise = NoiseModel::new(config.gene_likelihood, config.n_input, vb.pp("noise"))?;

        let decoder = SplitDecoder::new(
            SplitDecoderArgs {
                n_latent: config.n_latent,
                n_continuous_cov: config.n_continuous_cov,
                n_output: config.n_input,
                n_split: config.n_split_latent,
                split_method: config.split_method,
                split_aggregation: config.split_aggregation,
                reuse_weights: config.decoder_reuse_weights,
                layers: &config.decoder_dims,
                dropout_rate: config.decoder_dropout_rate,
                use_batch_norm: config.use_batch_norm.decoder(),
                affine_batch_norm: config.affine_batch_norm.decoder(),
                use_layer_norm: config.use_layer_norm.decoder(),
                covariates: cov_args,
                inject_covariates: config.deeply_inject_covariates,
                with_var_head: noise.needs_decoder_variance(),
            },
            vb.pp("decoder"),
        )?;

        let mut module = Self {
            config: config.clone(),
            n_split,
            device: vb.device().clone(),
            noise,
            shared_cov_emb,
            encoder,
            decoder,
            prior: LatentPrior::Standard,
        };

        module.prior = match (config.prior, prior_seed) {
            (PriorSpec::Normal, _) => LatentPrior::Standard,
            (family, Some(seed)) => {
                let seed = seed.to_device(&module.device)?;
                let pre = module.preprocess(&seed)?;
                let encoder_input = pre.encoder_input(&pre.x)?;
                let (qz_m, qz_v) = module.encoder_capability().encode_gaussian(
                    &encoder_input,
                    pre.encoder_cat.as_ref(),
                    ExecMode::Deterministic,
                )?;
                let (qz_m, qz_v) = (qz_m.detach(), qz_v.detach());
                let seed = PriorSeed {
                    qz_m: &qz_m,
                    qz_v: &qz_v,
                    encoder_input: &encoder_input,
                    encoder_cat: pre.encoder_cat.as_ref(),
                };
                LatentPrior::new(family, config.n_latent, Some(&seed), vb.pp("prior"))?
            }
            (family, None) => LatentPrior::new(family, config.n_latent, None, vb.pp("prior"))?,
        };

        info!(
            "split-vae: {} features -> {} latent dims in {} split(s) [{}, {}, {} prior]",
            config.n_input,
            config.n_latent,
            n_split,
            config.split_method,
            config.gene_likelihood,
            config.prior
        );

        Ok(module)
    }

    pub fn config(&self) -> &SplitVaeConfig {
        &self.config
    }

    pub fn n_latent(&self) -> usize {
        self.config.n_latent
    }

    pub fn n_split(&self) -> usize {
        self.n_split
    }

    pub fn split_aggregation(&self) -> SplitAggregation {
        self.config.split_aggregation
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn prior(&self) -> &LatentPrior {
        &self.prior
    }

    pub fn noise_model(&self) -> &NoiseModel {
        &self.noise
    }

    fn encoder_capability(&self) -> ModuleEncoder<'_> {
        ModuleEncoder {
            encoder: &self.encoder,
            shared_cov_emb: self.shared_cov_emb.as_ref(),
        }
    }

    fn has_categorical_covariates(&self) -> bool {
        !self.config.n_cats_per_cov.is_empty()
    }

    /// Look up the shared covariate embedding if there is one
    fn embed_covariates(&self, cat: Option<&Tensor>) -> Result<Option<Tensor>> {
        match (cat, &self.shared_cov_emb) {
            (Some(cat), Some(emb)) => Ok(Some(emb.forward(cat)?)),
            (cat, _) => Ok(cat.cloned()),
        }
    }

    fn check_continuous_covariates(&self, cont: Option<&Tensor>, n: usize) -> Result<()> {
        let m = self.config.n_continuous_cov;
        match cont {
            None if m > 0 => candle_core::bail!("{} continuous covariates expected", m),
            Some(cont) if cont.dims() != [n, m] => candle_core::bail!(
                "continuous covariates should be {} x {}, got {:?}",
                n,
                m,
                cont.dims()
            ),
            _ => Ok(()),
        }
    }

    /// Fixed transformations before the encoder
    ///
    /// * noise-model transformation of the features
    /// * log library size, with the total floored at 1
    /// * covariates the encoder takes (`encode_covariates`)
    pub fn preprocess(&self, batch: &ObservationBatch) -> Result<PreprocessedInput> {
        batch.validate()?;
        let (n, d) = batch.x.dims2()?;
        if d != self.config.n_input {
            candle_core::bail!("expected {} features, got {}", self.config.n_input, d);
        }

        let (x, side_info) = self.noise.initial_transformation(&batch.x)?;
        let library = batch.x.sum(1)?.clamp(1f32, f32::MAX)?.log()?;

        let (encoder_cont, encoder_cat) = if self.config.encode_covariates {
            let cont = if self.config.n_continuous_cov > 0 {
                self.check_continuous_covariates(batch.cont_covs.as_ref(), n)?;
                batch.cont_covs.clone()
            } else {
                None
            };
            let cat = if self.has_categorical_covariates() {
                match &batch.cat_covs {
                    Some(cat) => Some(cat.clone()),
                    None => candle_core::bail!("categorical covariates expected"),
                }
            } else {
                None
            };
            (cont, cat)
        } else {
            (None, None)
        };

        Ok(PreprocessedInput {
            x,
            encoder_cont,
            encoder_cat,
            library,
            side_info,
        })
    }

    /// Encode a batch into the approximate posterior
    ///
    /// In training mode with a positive `fill_in_the_blanks_ratio`, a
    /// random fraction of the transformed features is zeroed before
    /// the encoder sees it.
    pub fn inference(&self, batch: &ObservationBatch, mode: ExecMode) -> Result<InferenceOutput> {
        let pre = self.preprocess(batch)?;

        let ratio = self.config.fill_in_the_blanks_ratio;
        let (x, x_mask) = if mode.is_train() && ratio > 0. {
            let mask = pre.x.rand_like(0., 1.)?.ge(ratio)?.to_dtype(pre.x.dtype())?;
            ((&pre.x * &mask)?, Some(mask))
        } else {
            (pre.x.clone(), None)
        };

        let encoder_input = pre.encoder_input(&x)?;
        let encoder_cat = self.embed_covariates(pre.encoder_cat.as_ref())?;
        let latent = self
            .encoder
            .forward_t(&encoder_input, encoder_cat.as_ref(), mode)?;

        Ok(InferenceOutput {
            qz_m: latent.qz_m,
            qz_v: latent.qz_v,
            z: latent.z,
            x_mask,
            library: pre.library,
            side_info: pre.side_info,
        })
    }

    /// Decode a latent code into the observation distribution
    pub fn generative(&self, input: GenerativeInput, mode: ExecMode) -> Result<GenerativeOutput> {
        let (n, _) = input.z.dims2()?;

        let z = if self.config.n_continuous_cov > 0 {
            self.check_continuous_covariates(input.cont_covs, n)?;
            match input.cont_covs {
                Some(cont) if cont.rank() == input.z.rank() => Tensor::cat(&[input.z, cont], 1)?,
                Some(cont) => candle_core::bail!(
                    "latent rank {} vs. continuous covariate rank {}",
                    input.z.rank(),
                    cont.rank()
                ),
                None => candle_core::bail!("continuous covariates expected"),
            }
        } else {
            input.z.clone()
        };

        let cat = if self.has_categorical_covariates() {
            self.embed_covariates(input.cat_covs)?
        } else {
            None
        };

        let out = self.decoder.forward_t(&z, cat.as_ref(), mode)?;
        let px = self
            .noise
            .build_distribution(&out.params, input.library, input.side_info)?;

        Ok(GenerativeOutput {
            px,
            params: out.params,
            original_params: out.original_params,
        })
    }

    /// Reconstruction plus weighted KL, averaged over cells
    pub fn loss(
        &self,
        batch: &ObservationBatch,
        inference: &InferenceOutput,
        generative: &GenerativeOutput,
        kl_weight: f64,
        mode: ExecMode,
    ) -> Result<LossOutput> {
        let kl_local = self
            .prior
            .kl(
                &inference.qz_m,
                &inference.qz_v,
                mode,
                &self.encoder_capability(),
            )?
            .sum(1)?;

        let log_px = generative.px.log_prob(&batch.x)?;
        let log_px = match &inference.x_mask {
            Some(mask) => log_px.mul(&mask.affine(-1., 1.)?)?,
            None => log_px,
        };
        let reconstruction_loss = log_px.sum(1)?.neg()?;

        if kl_local.dims() != reconstruction_loss.dims() {
            candle_core::bail!(
                "KL {:?} and reconstruction {:?} do not match",
                kl_local.dims(),
                reconstruction_loss.dims()
            );
        }

        let loss = (&reconstruction_loss + (&kl_local * kl_weight)?)?.mean_all()?;
        let mse = batch
            .x
            .sub(&generative.px.mean()?)?
            .sqr()?
            .sum(1)?
            .detach();

        Ok(LossOutput {
            loss,
            reconstruction_loss,
            kl_local,
            mse,
        })
    }

    fn run(
        &self,
        batch: &ObservationBatch,
        kl_weight: Option<f64>,
        mode: ExecMode,
    ) -> Result<ForwardOutput> {
        let inference = self.inference(batch, mode)?;
        let generative = self.generative(
            GenerativeInput {
                z: &inference.z,
                library: &inference.library,
                side_info: &inference.side_info,
                cont_covs: batch.cont_covs.as_ref(),
                cat_covs: batch.cat_covs.as_ref(),
            },
            mode,
        )?;
        let loss = match kl_weight {
            Some(w) => Some(self.loss(batch, &inference, &generative, w, mode)?),
            None => None,
        };
        Ok(ForwardOutput {
            inference,
            generative,
            loss,
        })
    }

    /// All the steps including the loss
    pub fn forward(
        &self,
        batch: &ObservationBatch,
        kl_weight: f64,
        mode: ExecMode,
    ) -> Result<ForwardOutput> {
        self.run(batch, Some(kl_weight), mode)
    }

    /// Inference and generative steps only
    pub fn forward_without_loss(
        &self,
        batch: &ObservationBatch,
        mode: ExecMode,
    ) -> Result<ForwardOutput> {
        self.run(batch, None, mode)
    }

    /// Posterior predictive samples: `n x d` for one sample, otherwise
    /// `n x d x n_samples`
    pub fn sample(&self, batch: &ObservationBatch, n_samples: usize) -> Result<Tensor> {
        if n_samples == 0 {
            candle_core::bail!("need at least one sample");
        }

        let mut draws = Vec::with_capacity(n_samples);
        for _ in 0..n_samples {
            let out = self.forward_without_loss(batch, ExecMode::Infer)?;
            draws.push(out.generative.px.sample()?.detach());
        }

        if n_samples == 1 {
            Ok(draws.swap_remove(0))
        } else {
            Tensor::stack(&draws, 2)
        }
    }

    /// Monte-Carlo estimate of the marginal log-likelihood of a batch
    ///
    /// log p(x) ~ log (1/S) sum_s p(z_s) p(x|z_s) / q(z_s|x)
    pub fn marginal_ll(&self, batch: &ObservationBatch, n_mc_samples: usize) -> Result<f32> {
        if n_mc_samples == 0 {
            candle_core::bail!("need at least one Monte Carlo sample");
        }

        let encoder = self.encoder_capability();
        let mut log_w = Vec::with_capacity(n_mc_samples);

        for _ in 0..n_mc_samples {
            let out = self.forward_without_loss(batch, ExecMode::Infer)?;
            let inf = &out.inference;
            let log_pz = self.prior.log_density(&inf.z, ExecMode::Infer, &encoder)?;
            let log_px = out.generative.px.log_prob(&batch.x)?.sum(1)?;
            let log_qz = normal_log_prob(&inf.z, &inf.qz_m, &inf.qz_v)?.sum(1)?;
            log_w.push(((log_pz + log_px)? - log_qz)?.detach());
        }

        let log_w_ns = Tensor::stack(&log_w, 1)?;
        let log_px_n = (log_sum_exp(&log_w_ns, 1)? - (n_mc_samples as f64).ln())?;
        log_px_n
            .sum_all()?
            .to_dtype(DType::F32)?
            .to_scalar::<f32>()
    }
}

impl PreprocessedInput {
    /// Features (masked or not) with the encoder's continuous
    /// covariates appended
    pub fn encoder_input(&self, x_nd: &Tensor) -> Result<Tensor> {
        match &self.encoder_cont {
            Some(cont) => Tensor::cat(&[x_nd, cont], 1),
            None => Ok(x_nd.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn toy_batch(dev: &Device) -> Result<ObservationBatch> {
        let x = Tensor::rand(0f32, 4., (12, 20), dev)?.floor()?;
        let cat = Tensor::from_vec((0..12u32).map(|i| i % 3).collect::<Vec<_>>(), (12, 1), dev)?;
        let cont = Tensor::randn(0f32, 1., (12, 2), dev)?;
        Ok(ObservationBatch::new(x)
            .with_cat_covs(cat)
            .with_cont_covs(cont))
    }

    fn toy_config() -> SplitVaeConfig {
        let mut config = SplitVaeConfig::new(20, 8);
        config.encoder_dims = vec![16];
        config.decoder_dims = vec![16];
        config.n_cats_per_cov = vec![3];
        config.n_continuous_cov = 2;
        config.encode_covariates = true;
        config.n_split_latent = 4;
        config
    }

    #[test]
    fn forward_pass_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let module = SplitVaeModule::new(&toy_config(), None, vb)?;
        let batch = toy_batch(&dev)?;

        let out = module.forward(&batch, 1., ExecMode::Train)?;
        assert_eq!(out.inference.z.dims(), &[12, 8]);
        assert_eq!(out.generative.params.mean.dims(), &[12, 20]);
        assert_eq!(out.generative.original_params.mean.dims(), &[12, 4, 20]);

        let loss = out.loss.ok_or(candle_core::Error::Msg("no loss".into()))?;
        assert_eq!(loss.reconstruction_loss.dims(), &[12]);
        assert_eq!(loss.kl_local.dims(), &[12]);
        assert_eq!(loss.mse.dims(), &[12]);
        assert!(loss.loss.to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn masked_training_loss() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut config = toy_config();
        config.fill_in_the_blanks_ratio = 0.5;
        let module = SplitVaeModule::new(&config, None, vb)?;
        let batch = toy_batch(&dev)?;

        let train = module.inference(&batch, ExecMode::Train)?;
        assert!(train.x_mask.is_some());
        let infer = module.inference(&batch, ExecMode::Infer)?;
        assert!(infer.x_mask.is_none());

        let out = module.forward(&batch, 1., ExecMode::Train)?;
        assert!(out.loss.is_some());
        Ok(())
    }

    #[test]
    fn missing_covariates_are_errors() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let module = SplitVaeModule::new(&toy_config(), None, vb)?;
        let batch = toy_batch(&dev)?;

        let no_cont = ObservationBatch {
            cont_covs: None,
            ..batch.clone()
        };
        assert!(module.forward(&no_cont, 1., ExecMode::Infer).is_err());

        let no_cat = ObservationBatch {
            cat_covs: None,
            ..batch
        };
        assert!(module.forward(&no_cat, 1., ExecMode::Infer).is_err());
        Ok(())
    }

    #[test]
    fn all_zero_rows_stay_finite() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut config = SplitVaeConfig::new(20, 8);
        config.encoder_dims = vec![16];
        config.decoder_dims = vec![16];
        config.gene_likelihood = GeneLikelihood::Poisson;
        let module = SplitVaeModule::new(&config, None, vb)?;

        let batch = ObservationBatch::new(Tensor::zeros((5, 20), DType::F32, &dev)?);
        let out = module.forward(&batch, 1., ExecMode::Infer)?;
        assert!(out.inference.qz_v.min_all()?.to_scalar::<f32>()? > 0.);
        assert_eq!(out.inference.library.to_vec1::<f32>()?, vec![0f32; 5]);
        let loss = out.loss.ok_or(candle_core::Error::Msg("no loss".into()))?;
        assert!(loss.loss.to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn sampling_and_marginal_likelihood() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let module = SplitVaeModule::new(&toy_config(), None, vb)?;
        let batch = toy_batch(&dev)?;

        assert_eq!(module.sample(&batch, 1)?.dims(), &[12, 20]);
        assert_eq!(module.sample(&batch, 3)?.dims(), &[12, 20, 3]);
        assert!(module.sample(&batch, 0).is_err());
        assert!(module.marginal_ll(&batch, 4)?.is_finite());
        Ok(())
    }
}
