use anyhow::anyhow;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use split_vae::candle_data_loader::*;
use split_vae::candle_inference::TrainConfig;
use split_vae::candle_model_config::*;
use split_vae::candle_model_traits::ExecMode;
use split_vae::candle_split_analysis::split_effects;
use split_vae::candle_split_vae::SplitVaeModule;
use split_vae::candle_vae_inference::*;
use split_vae::cli::simulate::{simulate_counts, SimulateArgs};

fn simulated_data(cells: usize, features: usize) -> anyhow::Result<InMemoryData> {
    let sim = simulate_counts(&SimulateArgs {
        out: String::new(),
        cells,
        features,
        cell_types: 4,
        batches: 3,
        depth: 500.,
        batch_effect: 0.5,
        seed: 1,
    })?;
    let batch: Vec<u32> = sim.batch.iter().map(|&b| b as u32).collect();
    let cat = Tensor::from_vec(batch, (cells, 1), &Device::Cpu)?;
    InMemoryData::new(ObservationBatch::new(sim.counts).with_cat_covs(cat))
}

fn small_config(n_input: usize, n_latent: usize) -> SplitVaeConfig {
    let mut config = SplitVaeConfig::new(n_input, n_latent);
    config.encoder_dims = vec![32];
    config.decoder_dims = vec![32];
    config.n_cats_per_cov = vec![3];
    config
}

fn quiet_training(num_epochs: usize) -> TrainConfig {
    TrainConfig {
        num_epochs,
        show_progress: false,
        ..TrainConfig::default()
    }
}

#[test]
fn normal_likelihood_latent_is_finite() -> anyhow::Result<()> {
    let mut data = simulated_data(1000, 200)?;

    let mut config = SplitVaeConfig::new(200, 32);
    config.n_cats_per_cov = vec![3];
    config.gene_likelihood = GeneLikelihood::Normal;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let module = SplitVaeModule::new(&config, None, vb)?;

    let mut vae = Vae::build(&module, &varmap);
    let trace = vae.train_encoder_decoder(&mut data, &quiet_training(10))?;
    assert_eq!(trace.len(), 10);
    assert!(trace.iter().all(|l| l.is_finite()));

    let latent = module.get_latent_representation(&data, None, None, true)?;
    assert_eq!(latent.dims(), &[1000, 32]);
    let total = latent.sum_all()?.to_scalar::<f32>()?;
    assert!(total.is_finite());
    Ok(())
}

#[test]
fn max_effects_are_non_negative_and_monotone() -> anyhow::Result<()> {
    let mut data = simulated_data(200, 40)?;

    let mut config = small_config(40, 16);
    config.n_split_latent = 8;
    config.split_aggregation = SplitAggregation::Max;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let module = SplitVaeModule::new(&config, None, vb)?;
    Vae::build(&module, &varmap).train_encoder_decoder(&mut data, &quiet_training(2))?;

    let full = module.get_max_effect_of_splits_within_distribution(&data, None, Some(32));
    assert!(full.is_complete());
    assert_eq!(full.total_batches, 7);
    let full = full.value.ok_or(anyhow!("no max effect"))?;
    assert_eq!(full.dims(), &[8, 40]);
    assert!(full.min_all()?.to_scalar::<f32>()? >= 0.);

    let subset: Vec<usize> = (0..64).collect();
    let part = module
        .get_max_effect_of_splits_within_distribution(&data, Some(&subset), Some(32))
        .into_result()?
        .ok_or(anyhow!("no max effect"))?;
    let gap = (&full - part)?.min_all()?.to_scalar::<f32>()?;
    assert!(gap >= 0.);

    // the running maximum never shrinks from one batch to the next
    let snapshots = module
        .iterate_on_ae_output(
            &data,
            None,
            Some(32),
            ExecMode::Deterministic,
            vec![],
            |_, out, snapshots: &mut Vec<Tensor>| {
                let effect_sd = split_effects(&out.generative, config.split_aggregation)?.max(0)?;
                let running = match snapshots.last() {
                    Some(prev) => prev.maximum(&effect_sd)?,
                    None => effect_sd,
                };
                snapshots.push(running);
                Ok(())
            },
        )
        .into_result()?;
    assert_eq!(snapshots.len(), 7);
    for pair in snapshots.windows(2) {
        let step = (&pair[1] - &pair[0])?.min_all()?.to_scalar::<f32>()?;
        assert!(step >= 0.);
    }

    let last = snapshots.last().ok_or(anyhow!("no snapshot"))?;
    let diff = (last - &full)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(diff < 1e-6);
    Ok(())
}

#[test]
fn split_effects_cover_every_cell() -> anyhow::Result<()> {
    let data = simulated_data(50, 30)?;
    let mut config = small_config(30, 12);
    config.n_split_latent = 3;
    config.split_aggregation = SplitAggregation::LogSumExp;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let module = SplitVaeModule::new(&config, None, vb)?;

    let per_cell = module
        .get_reconstruction_effect_of_each_split(&data, false, None, Some(16))
        .into_result()?
        .ok_or(anyhow!("no split effect"))?;
    assert_eq!(per_cell.dims(), &[50, 3]);

    let averaged = module
        .get_reconstruction_effect_of_each_split(&data, true, None, Some(16))
        .into_result()?
        .ok_or(anyhow!("no split effect"))?;
    assert_eq!(averaged.dims(), &[3]);
    Ok(())
}

#[test]
fn vamp_prior_needs_seed_cells() -> anyhow::Result<()> {
    let data = simulated_data(60, 30)?;
    let mut config = small_config(30, 8);
    config.prior = PriorSpec::Vamp(5);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    assert!(SplitVaeModule::new(&config, None, vb).is_err());

    let seed = data.take_rows(&(0..20).collect::<Vec<_>>(), &Device::Cpu)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let module = SplitVaeModule::new(&config, Some(&seed), vb)?;
    assert_eq!(module.prior().n_components(), Some(5));

    let batch = data.take_rows(&(20..60).collect::<Vec<_>>(), &Device::Cpu)?;
    let out = module.forward(&batch, 1., ExecMode::Train)?;
    let loss = out.loss.ok_or(anyhow!("no loss"))?;
    let kl = loss.kl_local.sum_all()?.to_scalar::<f32>()?;
    assert!(kl.is_finite());
    Ok(())
}

#[test]
fn single_split_matches_undivided_decoder() -> anyhow::Result<()> {
    let data = simulated_data(20, 30)?;
    for method in [SplitMethod::Split, SplitMethod::Power, SplitMethod::SplitMap] {
        let mut config = small_config(30, 8);
        config.split_method = method;
        config.n_split_latent = 1;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let module = SplitVaeModule::new(&config, None, vb)?;
        assert_eq!(module.n_split(), 1);

        let out = module.forward_without_loss(data.data(), ExecMode::Deterministic)?;
        let aggregated = out.generative.params.mean;
        let single = out.generative.original_params.mean.squeeze(1)?;
        let diff = (aggregated - single)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6, "{} differs by {}", method, diff);
    }
    Ok(())
}

#[test]
fn one_split_per_latent_dimension() -> anyhow::Result<()> {
    let data = simulated_data(20, 30)?;
    let mut config = small_config(30, 6);
    config.n_split_latent = -1;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let module = SplitVaeModule::new(&config, None, vb)?;
    assert_eq!(module.n_split(), 6);

    let out = module.forward_without_loss(data.data(), ExecMode::Infer)?;
    assert_eq!(out.generative.params.mean.dims(), &[20, 30]);
    assert_eq!(out.generative.original_params.mean.dims(), &[20, 6, 30]);
    Ok(())
}

#[test]
fn deterministic_decoding_is_repeatable() -> anyhow::Result<()> {
    let mut config = small_config(30, 8);
    config.n_split_latent = 4;
    config.decoder_dropout_rate = 0.2;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let module = SplitVaeModule::new(&config, None, vb)?;

    let z = Tensor::randn(0f32, 1., (25, 8), &Device::Cpu)?;
    let cat = Tensor::from_vec((0..25u32).map(|i| i % 3).collect::<Vec<_>>(), (25, 1), &Device::Cpu)?;

    let first = module.decode_latent_samples(&z, None, Some(&cat), None, Some(10))?;
    let second = module.decode_latent_samples(&z, None, Some(&cat), None, Some(10))?;
    assert_eq!(first.dims(), &[25, 30]);
    assert_eq!(first.to_vec2::<f32>()?, second.to_vec2::<f32>()?);
    Ok(())
}

/// Two categorical fields: batch (3 levels) and a binary cell group
fn two_field_data(cells: usize, features: usize) -> anyhow::Result<InMemoryData> {
    let sim = simulate_counts(&SimulateArgs {
        out: String::new(),
        cells,
        features,
        cell_types: 4,
        batches: 3,
        depth: 500.,
        batch_effect: 0.5,
        seed: 5,
    })?;
    let codes: Vec<u32> = sim
        .batch
        .iter()
        .zip(sim.cell_type.iter())
        .flat_map(|(&b, &t)| [b as u32, (t % 2) as u32])
        .collect();
    let cat = Tensor::from_vec(codes, (cells, 2), &Device::Cpu)?;
    InMemoryData::new(ObservationBatch::new(sim.counts).with_cat_covs(cat))
}

fn two_field_config(features: usize) -> SplitVaeConfig {
    let mut config = SplitVaeConfig::new(features, 8);
    config.encoder_dims = vec![16];
    config.decoder_dims = vec![16];
    config.n_cats_per_cov = vec![3, 2];
    config.n_split_latent = 4;
    config
}

/// Build a module (seeded from the first 20 cells when asked) and
/// check a training-mode loss
fn assert_finite_loss(
    data: &InMemoryData,
    config: &SplitVaeConfig,
    seeded: bool,
) -> anyhow::Result<f32> {
    let seed = data.take_rows(&(0..20).collect::<Vec<_>>(), &Device::Cpu)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let module = SplitVaeModule::new(config, seeded.then_some(&seed), vb)?;

    let out = module.forward(data.data(), 1., ExecMode::Train)?;
    let loss = out.loss.ok_or(anyhow!("no loss"))?;
    let value = loss.loss.to_scalar::<f32>()?;
    assert!(
        value.is_finite(),
        "{} / {} / {} / encode_covariates = {}",
        config.gene_likelihood,
        config.covariate_modeling_strategy,
        config.prior,
        config.encode_covariates
    );
    Ok(value)
}

#[test]
fn likelihoods_and_priors_train() -> anyhow::Result<()> {
    let mut data = two_field_data(60, 30)?;

    for likelihood in ["nb", "normal", "pnb", "normal_sv"] {
        for (prior, seeded) in [
            ("normal", false),
            ("gmm_5", false),
            ("gmm_5", true),
            ("vamp_5", true),
        ] {
            let mut config = two_field_config(30);
            config.gene_likelihood = likelihood.parse()?;
            config.prior = prior.parse()?;
            assert_finite_loss(&data, &config, seeded)?;

            let seed = data.take_rows(&(0..20).collect::<Vec<_>>(), &Device::Cpu)?;
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let module = SplitVaeModule::new(&config, seeded.then_some(&seed), vb)?;
            let trace = Vae::build(&module, &varmap).train_encoder_decoder(&mut data, &quiet_training(2))?;
            assert!(trace.iter().all(|l| l.is_finite()), "{} / {}", likelihood, prior);
        }
    }
    Ok(())
}

#[test]
fn every_covariate_strategy_with_vamp_prior() -> anyhow::Result<()> {
    let data = two_field_data(60, 30)?;

    for strategy in [
        "one_hot",
        "emb",
        "emb_shared",
        "one_hot_linear",
        "emb_linear",
        "emb_shared_linear",
        "one_hot_adapter",
        "emb_adapter",
        "emb_shared_adapter",
    ] {
        for encode_covariates in [false, true] {
            for deeply_inject_covariates in [false, true] {
                let mut config = two_field_config(30);
                config.covariate_modeling_strategy = strategy.parse()?;
                config.encode_covariates = encode_covariates;
                config.deeply_inject_covariates = deeply_inject_covariates;
                config.prior = PriorSpec::Vamp(5);
                assert_finite_loss(&data, &config, true)?;
            }
        }
    }
    Ok(())
}

#[test]
fn shared_embedding_strategies_with_mixture_priors() -> anyhow::Result<()> {
    let data = two_field_data(60, 30)?;

    for strategy in ["emb_shared", "emb_shared_linear", "emb_shared_adapter"] {
        for prior in ["normal", "gmm_3", "vamp_5"] {
            let mut config = two_field_config(30);
            config.covariate_modeling_strategy = strategy.parse()?;
            config.encode_covariates = true;
            config.prior = prior.parse()?;
            assert_finite_loss(&data, &config, config.prior != PriorSpec::Normal)?;
        }
    }
    Ok(())
}

#[test]
fn both_variance_activations() -> anyhow::Result<()> {
    let data = two_field_data(60, 30)?;

    for activation in ["exp", "pow2"] {
        let mut config = two_field_config(30);
        config.var_activation = activation.parse()?;
        config.encode_covariates = true;
        assert_finite_loss(&data, &config, false)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let module = SplitVaeModule::new(&config, None, vb)?;
        let qz_v = module.inference(data.data(), ExecMode::Infer)?.qz_v;
        assert!(qz_v.min_all()?.to_scalar::<f32>()? > 0.);
    }
    Ok(())
}
