use crate::cli::io::*;

use anyhow::anyhow;
use candle_core::{Device, Tensor};
use clap::Args;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Gamma, LogNormal, Poisson, Uniform};
use rayon::prelude::*;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(short, long, help = "Output prefix ({out}.counts.tsv.gz, {out}.batch.tsv.gz, ...)")]
    pub out: String,

    #[arg(long, default_value = "1000")]
    pub cells: usize,

    #[arg(long, default_value = "200")]
    pub features: usize,

    #[arg(long, default_value = "5", help = "Number of cell types")]
    pub cell_types: usize,

    #[arg(long, default_value = "3")]
    pub batches: usize,

    #[arg(long, default_value = "1000", help = "Expected total count per cell")]
    pub depth: f32,

    #[arg(long, default_value = "0.5", help = "Log-scale spread of batch effects")]
    pub batch_effect: f32,

    #[arg(long, default_value = "42")]
    pub seed: u64,
}

/// Simulated count data
pub struct SimOut {
    /// counts (cells x features)
    pub counts: Tensor,
    pub cell_type: Vec<usize>,
    pub batch: Vec<usize>,
}

/// Poisson counts from cell type profiles with multiplicative batch
/// effects: `y[i,g] ~ Poisson(depth * beta[t(i),g] * delta[b(i),g])`
pub fn simulate_counts(args: &SimulateArgs) -> anyhow::Result<SimOut> {
    if args.cells == 0 || args.features == 0 || args.cell_types == 0 || args.batches == 0 {
        return Err(anyhow!("cells, features, cell types and batches should be positive"));
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let (nn, dd) = (args.cells, args.features);

    let rgamma = Gamma::new(1f32, 1f32)?;
    let beta_td: Vec<Vec<f32>> = (0..args.cell_types)
        .map(|_| {
            let beta: Vec<f32> = (0..dd).map(|_| rgamma.sample(&mut rng)).collect();
            let tot: f32 = beta.iter().sum::<f32>().max(1e-8);
            beta.into_iter().map(|b| b / tot).collect()
        })
        .collect();

    let rlnorm = LogNormal::new(0f32, args.batch_effect.max(0.))?;
    let delta_bd: Vec<Vec<f32>> = (0..args.batches)
        .map(|_| (0..dd).map(|_| rlnorm.sample(&mut rng)).collect())
        .collect();

    let cell_type: Vec<usize> = {
        let runif = Uniform::new(0, args.cell_types)?;
        (0..nn).map(|_| runif.sample(&mut rng)).collect()
    };
    let batch: Vec<usize> = {
        let runif = Uniform::new(0, args.batches)?;
        (0..nn).map(|_| runif.sample(&mut rng)).collect()
    };

    let counts: Vec<f32> = (0..nn)
        .into_par_iter()
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(args.seed + 1 + i as u64);
            let (beta, delta) = (&beta_td[cell_type[i]], &delta_bd[batch[i]]);
            (0..dd)
                .map(|g| {
                    let lambda = (args.depth * beta[g] * delta[g]).max(1e-8);
                    Poisson::new(lambda)
                        .map(|rpois| rpois.sample(&mut rng))
                        .unwrap_or(0.)
                })
                .collect::<Vec<f32>>()
        })
        .flatten()
        .collect();

    info!("simulated {} cells x {} features", nn, dd);

    Ok(SimOut {
        counts: Tensor::from_vec(counts, (nn, dd), &Device::Cpu)?,
        cell_type,
        batch,
    })
}

pub fn run(args: &SimulateArgs) -> anyhow::Result<()> {
    let sim = simulate_counts(args)?;

    let counts_file = format!("{}.counts.tsv.gz", args.out);
    write_tensor(&sim.counts, &counts_file)?;

    let as_labels = |prefix: &str, xx: &[usize]| -> Vec<Box<str>> {
        xx.iter()
            .map(|x| format!("{}{}", prefix, x).into_boxed_str())
            .collect()
    };

    let batch_file = format!("{}.batch.tsv.gz", args.out);
    write_labels(&as_labels("batch_", &sim.batch), &batch_file)?;

    let celltype_file = format!("{}.celltype.tsv.gz", args.out);
    write_labels(&as_labels("type_", &sim.cell_type), &celltype_file)?;

    info!("wrote {}, {} and {}", counts_file, batch_file, celltype_file);
    Ok(())
}
