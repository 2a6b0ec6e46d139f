use crate::candle_model_config::{CovariateEncoding, CovariateFusion, CovariateModeling};

use candle_core::{Result, Tensor};
use candle_nn::{Embedding, Linear, Module};

/// Categorical covariates as seen by a stack of layers
#[derive(Clone, Copy, Debug)]
pub struct CovariateArgs<'a> {
    /// number of categories for each covariate field
    pub n_cats_per_cov: &'a [usize],
    /// embedding dimension for each covariate field
    pub embedding_dims: &'a [usize],
    pub modeling: CovariateModeling,
}

impl CovariateArgs<'_> {
    pub fn is_empty(&self) -> bool {
        self.n_cats_per_cov.is_empty()
    }
}

//////////////////////////////////////
// embedding of several code fields //
//////////////////////////////////////

/// One embedding table per covariate field, concatenated
#[derive(Clone, Debug)]
pub struct MultiEmbedding {
    tables: Vec<Embedding>,
    dims: Vec<usize>,
    max_norm: Option<f64>,
}

impl MultiEmbedding {
    /// * `n_cats_per_cov` - number of categories per field
    /// * `dims` - embedding dimension per field
    /// * `max_norm` - renormalize rows with a larger L2 norm
    pub fn new(
        n_cats_per_cov: &[usize],
        dims: &[usize],
        max_norm: Option<f64>,
        vb: candle_nn::VarBuilder,
    ) -> Result<Self> {
        if n_cats_per_cov.len() != dims.len() {
            candle_core::bail!(
                "{} covariate fields but {} embedding dims",
                n_cats_per_cov.len(),
                dims.len()
            );
        }

        let init = candle_nn::Init::Randn {
            mean: 0.,
            stdev: 1.,
        };

        let mut tables = Vec::with_capacity(dims.len());
        for (j, (&n_cat, &dim)) in n_cats_per_cov.iter().zip(dims.iter()).enumerate() {
            let weight = vb.get_with_hints((n_cat, dim), &format!("emb.{}", j), init)?;
            tables.push(Embedding::new(weight, dim));
        }

        Ok(Self {
            tables,
            dims: dims.to_vec(),
            max_norm,
        })
    }

    pub fn dim(&self) -> usize {
        self.dims.iter().sum()
    }

    /// Look up `n x k` integer codes to give `n x sum(dims)`
    pub fn forward(&self, cat_nk: &Tensor) -> Result<Tensor> {
        let (_, k) = cat_nk.dims2()?;
        if k != self.tables.len() {
            candle_core::bail!(
                "expected {} categorical covariate columns, but got {}",
                self.tables.len(),
                k
            );
        }

        let mut parts = Vec::with_capacity(k);
        for (j, table) in self.tables.iter().enumerate() {
            let codes = cat_nk.narrow(1, j, 1)?.squeeze(1)?.contiguous()?;
            let emb = table.forward(&codes)?;
            let emb = match self.max_norm {
                Some(max_norm) => {
                    let norms = emb.sqr()?.sum_keepdim(1)?.sqrt()?;
                    let scale = (norms.maximum(max_norm)?.recip()? * max_norm)?;
                    emb.broadcast_mul(&scale)?
                }
                None => emb,
            };
            parts.push(emb);
        }
        Tensor::cat(&parts, 1)
    }
}

///////////////////////////////////////
// codes -> conditioning vector      //
///////////////////////////////////////

/// Turns covariate input into one conditioning vector per cell
#[derive(Clone, Debug)]
pub enum CovariateCodec {
    OneHot { n_cats: Vec<usize> },
    Embedding(MultiEmbedding),
    /// the module has already looked up a shared embedding
    Preembedded { dim: usize },
}

impl CovariateCodec {
    pub fn new(args: &CovariateArgs, vb: candle_nn::VarBuilder) -> Result<Self> {
        match args.modeling.encoding {
            CovariateEncoding::OneHot => Ok(Self::OneHot {
                n_cats: args.n_cats_per_cov.to_vec(),
            }),
            CovariateEncoding::Embedding => Ok(Self::Embedding(MultiEmbedding::new(
                args.n_cats_per_cov,
                args.embedding_dims,
                None,
                vb,
            )?)),
            CovariateEncoding::SharedEmbedding => Ok(Self::Preembedded {
                dim: args.embedding_dims.iter().sum(),
            }),
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Self::OneHot { n_cats } => n_cats.iter().sum(),
            Self::Embedding(emb) => emb.dim(),
            Self::Preembedded { dim } => *dim,
        }
    }

    /// * `cov` - `n x k` integer codes, or `n x dim` embedded covariates
    pub fn encode(&self, cov: &Tensor, dtype: candle_core::DType) -> Result<Tensor> {
        match self {
            Self::OneHot { n_cats } => {
                let (_, k) = cov.dims2()?;
                if k != n_cats.len() {
                    candle_core::bail!(
                        "expected {} categorical covariate columns, but got {}",
                        n_cats.len(),
                        k
                    );
                }
                let mut parts = Vec::with_capacity(k);
                for (j, &n_cat) in n_cats.iter().enumerate() {
                    let codes = cov.narrow(1, j, 1)?.squeeze(1)?;
                    parts.push(candle_nn::encoding::one_hot(codes, n_cat, 1f32, 0f32)?);
                }
                Tensor::cat(&parts, 1)?.to_dtype(dtype)
            }
            Self::Embedding(emb) => emb.forward(cov),
            Self::Preembedded { dim } => {
                let (_, d) = cov.dims2()?;
                if d != *dim {
                    candle_core::bail!("expected {}-dim shared covariate embedding, got {}", dim, d);
                }
                Ok(cov.clone())
            }
        }
    }
}

/////////////////////////////////////////
// conditioning vector -> hidden layer //
/////////////////////////////////////////

/// How one hidden layer consumes the conditioning vector
#[derive(Clone, Debug)]
pub enum CovariateFusionLayer {
    /// concatenate to the layer's input
    Concat { cond_dim: usize },
    /// add a linear map of the condition after normalization
    Linear(Linear),
    /// feature-wise scale and shift predicted by a small MLP
    Adapter { hidden: Linear, film: Linear },
}

impl CovariateFusionLayer {
    pub fn new(
        fusion: CovariateFusion,
        cond_dim: usize,
        out_dim: usize,
        vb: candle_nn::VarBuilder,
    ) -> Result<Self> {
        match fusion {
            CovariateFusion::Concat => Ok(Self::Concat { cond_dim }),
            CovariateFusion::Linear => Ok(Self::Linear(candle_nn::linear_no_bias(
                cond_dim,
                out_dim,
                vb.pp("cov.linear"),
            )?)),
            CovariateFusion::Adapter => {
                let hidden_dim = cond_dim.max(8);
                let hidden = candle_nn::linear(cond_dim, hidden_dim, vb.pp("cov.adapter.hidden"))?;
                let film = candle_nn::linear(hidden_dim, 2 * out_dim, vb.pp("cov.adapter.film"))?;
                Ok(Self::Adapter { hidden, film })
            }
        }
    }

    /// Extra input width this fusion adds to the layer's linear map
    pub fn extra_input_dim(&self) -> usize {
        match self {
            Self::Concat { cond_dim } => *cond_dim,
            _ => 0,
        }
    }

    /// Applied to the input `x` (`n x d` or `n x s x d`)
    pub fn before_linear(&self, x: &Tensor, cond_nc: &Tensor) -> Result<Tensor> {
        match self {
            Self::Concat { .. } => {
                let cond = match *x.dims() {
                    [n, s, _] => cond_nc
                        .unsqueeze(1)?
                        .broadcast_as((n, s, cond_nc.dim(1)?))?
                        .contiguous()?,
                    _ => cond_nc.clone(),
                };
                Tensor::cat(&[x, &cond], x.rank() - 1)
            }
            _ => Ok(x.clone()),
        }
    }

    /// Applied to the normalized output `h` (`n x o` or `n x s x o`)
    pub fn after_norm(&self, h: &Tensor, cond_nc: &Tensor) -> Result<Tensor> {
        let align = |t: Tensor| -> Result<Tensor> {
            if h.rank() == 3 {
                t.unsqueeze(1)
            } else {
                Ok(t)
            }
        };

        match self {
            Self::Concat { .. } => Ok(h.clone()),
            Self::Linear(linear) => h.broadcast_add(&align(linear.forward(cond_nc)?)?),
            Self::Adapter { hidden, film } => {
                let out_dim = h.dim(h.rank() - 1)?;
                let gb = film.forward(&hidden.forward(cond_nc)?.relu()?)?;
                let gamma = align((gb.narrow(1, 0, out_dim)? + 1.)?)?;
                let beta = align(gb.narrow(1, out_dim, out_dim)?)?;
                h.broadcast_mul(&gamma)?.broadcast_add(&beta)
            }
        }
    }
}
