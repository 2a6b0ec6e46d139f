use crate::candle_data_loader::*;
use crate::candle_inference::TrainConfig;
use crate::candle_model_config::*;
use crate::candle_split_vae::SplitVaeModule;
use crate::candle_vae_inference::*;
use crate::cli::io::*;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Args, ValueEnum};
use log::{info, warn};
use std::io::Write;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(
        required = true,
        help = "Data matrix file (cells x features)",
        long_help = "Delimited data matrix, one cell per line.\n\
		     Gzipped files (*.gz) are read transparently."
    )]
    pub data_file: String,

    #[arg(
        long,
        short,
        help = "Batch membership file",
        long_help = "Categorical covariates, one line per cell.\n\
		     Multiple columns give multiple covariates."
    )]
    pub batch_file: Option<String>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.latent.tsv.gz\n\
		     - {out}.split_effect.tsv.gz\n\
		     - {out}.max_effect.tsv.gz\n\
		     - {out}.loss.tsv.gz\n\
		     - {out}.config.json\n\
		     - {out}.model.safetensors\n"
    )]
    pub out: String,

    #[arg(long, short = 'k', default_value_t = 32, help = "Latent dimension")]
    pub n_latent: usize,

    #[arg(
        long,
        short = 's',
        default_value_t = 1,
        allow_negative_numbers = true,
        help = "Number of latent splits (-1: one per latent dimension)"
    )]
    pub n_split: i64,

    #[arg(long, default_value_t = SplitMethod::Split, help = "split, power or split_map")]
    pub split_method: SplitMethod,

    #[arg(long, default_value_t = SplitAggregation::Sum, help = "sum, logsumexp or max")]
    pub split_aggregation: SplitAggregation,

    #[arg(
        long,
        default_value_t = WeightReuse::Last,
        help = "Decoder weights shared across splits: everywhere, last, intermediate or nowhere"
    )]
    pub reuse_weights: WeightReuse,

    #[arg(long, value_delimiter(','), default_values_t = vec![128, 128])]
    pub encoder_dims: Vec<usize>,

    #[arg(long, value_delimiter(','), default_values_t = vec![128, 128])]
    pub decoder_dims: Vec<usize>,

    #[arg(
        long,
        default_value_t = GeneLikelihood::Nb,
        help = "Observation likelihood",
        long_help = "Observation likelihood: nb, nb_sv, nb_orig, pnb, pnb_sv,\n\
		     poisson, lognormal, normal, normal_v or normal_sv"
    )]
    pub likelihood: GeneLikelihood,

    #[arg(long, default_value_t = PriorSpec::Normal, help = "normal, gmm_{K} or vamp_{K}")]
    pub prior: PriorSpec,

    #[arg(
        long,
        default_value_t = CovariateModeling::default(),
        help = "Covariate modeling strategy, e.g., one_hot, emb_linear, emb_shared_adapter"
    )]
    pub covariate_modeling: CovariateModeling,

    #[arg(long, default_value_t = false, help = "Condition the encoder on covariates")]
    pub encode_covariates: bool,

    #[arg(long, default_value_t = false, help = "Inject covariates into every hidden layer")]
    pub deeply_inject_covariates: bool,

    #[arg(long, default_value_t = NormPlacement::Both)]
    pub batch_norm: NormPlacement,

    #[arg(long, default_value_t = NormPlacement::Nowhere)]
    pub layer_norm: NormPlacement,

    #[arg(long, default_value_t = 0., help = "Fraction of inputs masked during training")]
    pub mask_ratio: f64,

    #[arg(long, default_value_t = 0.)]
    pub dropout: f32,

    #[arg(long, short = 'i', default_value_t = 400)]
    pub epochs: usize,

    #[arg(long, default_value_t = 1e-3)]
    pub learning_rate: f32,

    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 0, help = "Epochs to ramp up the KL weight")]
    pub kl_warmup: usize,

    #[arg(
        long,
        default_value_t = 512,
        help = "Cells used to initialize a mixture prior"
    )]
    pub prior_seed_size: usize,

    #[arg(long, value_enum, default_value = "cpu")]
    pub device: ComputeDevice,

    #[arg(long, default_value_t = 0)]
    pub device_no: usize,

    #[arg(short, long)]
    pub verbose: bool,
}

impl FitArgs {
    /// Model configuration for `n_input` features
    pub fn model_config(&self, n_input: usize, n_cats_per_cov: Vec<usize>) -> SplitVaeConfig {
        SplitVaeConfig {
            n_input,
            n_latent: self.n_latent,
            n_split_latent: self.n_split,
            split_aggregation: self.split_aggregation,
            split_method: self.split_method,
            decoder_reuse_weights: self.reuse_weights,
            encoder_dims: self.encoder_dims.clone(),
            decoder_dims: self.decoder_dims.clone(),
            n_cats_per_cov,
            encode_covariates: self.encode_covariates,
            deeply_inject_covariates: self.deeply_inject_covariates,
            covariate_modeling_strategy: self.covariate_modeling,
            use_batch_norm: self.batch_norm,
            affine_batch_norm: self.batch_norm,
            use_layer_norm: self.layer_norm,
            fill_in_the_blanks_ratio: self.mask_ratio,
            encoder_dropout_rate: self.dropout,
            decoder_dropout_rate: self.dropout,
            gene_likelihood: self.likelihood,
            prior: self.prior,
            ..SplitVaeConfig::new(n_input, self.n_latent)
        }
    }
}

pub fn run(args: &FitArgs) -> anyhow::Result<()> {
    let dev = match args.device {
        ComputeDevice::Metal => Device::new_metal(args.device_no)?,
        ComputeDevice::Cuda => Device::new_cuda(args.device_no)?,
        _ => Device::Cpu,
    };

    // 1. read data
    let x = read_matrix(&args.data_file, &Device::Cpu)?;
    let (nn, dd) = x.dims2()?;
    info!("read {} cells x {} features from {}", nn, dd, args.data_file);

    let mut batch = ObservationBatch::new(x);
    let mut n_cats_per_cov = vec![];

    if let Some(batch_file) = &args.batch_file {
        let cat = read_categorical(batch_file, &Device::Cpu)?;
        info!("{:?} categories in {}", cat.n_cats_per_cov, batch_file);
        n_cats_per_cov = cat.n_cats_per_cov;
        batch = batch.with_cat_covs(cat.codes);
    }

    let mut data = InMemoryData::new(batch)?;

    // 2. build the module
    let config = args.model_config(dd, n_cats_per_cov);
    let seed_rows: Vec<usize> = (0..nn.min(args.prior_seed_size.max(1))).collect();
    let prior_seed = data.take_rows(&seed_rows, &dev)?;

    let parameters = VarMap::new();
    let vb = VarBuilder::from_varmap(&parameters, DType::F32, &dev);
    let module = SplitVaeModule::new(&config, Some(&prior_seed), vb)?;
    info!(
        "built a model with {} splits, {} likelihood, {} prior",
        module.n_split(),
        config.gene_likelihood,
        config.prior
    );

    // 3. train
    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        kl_warmup_epochs: args.kl_warmup,
        device: dev.clone(),
        verbose: args.verbose,
        show_progress: true,
    };

    let mut vae = Vae::build(&module, &parameters);
    let loss_trace = vae.train_encoder_decoder(&mut data, &train_config)?;
    if let Some(last) = loss_trace.last() {
        info!("final loss: {}", last);
    }

    // 4. write outputs
    write_tensor(
        &Tensor::new(loss_trace.as_slice(), &Device::Cpu)?,
        &format!("{}.loss.tsv.gz", args.out),
    )?;

    let latent = module.get_latent_representation(&data, None, Some(args.batch_size), true)?;
    write_tensor(&latent, &format!("{}.latent.tsv.gz", args.out))?;

    let split_effect = module.get_reconstruction_effect_of_each_split(
        &data,
        false,
        None,
        Some(args.batch_size),
    );
    if !split_effect.is_complete() {
        warn!(
            "split effects from {} of {} batches",
            split_effect.completed_batches, split_effect.total_batches
        );
    }
    if let Some(effect) = split_effect.value {
        write_tensor(&effect, &format!("{}.split_effect.tsv.gz", args.out))?;
    }

    let max_effect =
        module.get_max_effect_of_splits_within_distribution(&data, None, Some(args.batch_size));
    if !max_effect.is_complete() {
        warn!(
            "max effects from {} of {} batches",
            max_effect.completed_batches, max_effect.total_batches
        );
    }
    if let Some(effect) = max_effect.value {
        write_tensor(&effect, &format!("{}.max_effect.tsv.gz", args.out))?;
    }

    let config_file = format!("{}.config.json", args.out);
    mkdir(&config_file)?;
    let mut buf = open_buf_writer(&config_file)?;
    writeln!(buf, "{}", serde_json::to_string_pretty(&config)?)?;
    buf.flush()?;

    parameters.save(format!("{}.model.safetensors", args.out))?;

    info!("done");
    Ok(())
}
