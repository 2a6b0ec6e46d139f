use candle_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declare an option enum that is parsed from (and printed as) a
/// fixed set of names, e.g., `"logsumexp"` or `"split_map"`.
macro_rules! named_options {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $s:literal $(| $alias:literal)* ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $s $(, alias = $alias)*)] $variant ),+
        }

        impl $name {
            pub const NAMES: &'static [&'static str] = &[$($s),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $s ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $( $s $(| $alias)* => Ok(Self::$variant), )+
                    _ => Err(Error::Msg(format!(
                        "unsupported {} `{}`, expected one of {:?}",
                        stringify!($name),
                        s,
                        Self::NAMES
                    ))),
                }
            }
        }
    };
}

named_options! {
    /// How to make splits of the latent space
    SplitMethod {
        /// contiguous slices of the latent vector
        Split => "split",
        /// linear projection into `n_split` views of size `n_latent`
        Power => "power",
        /// slices, each mapped back to `n_latent` by its own transform
        SplitMap => "split_map",
    }
}

named_options! {
    /// How to pool the per-split decoder outputs
    SplitAggregation {
        Sum => "sum",
        LogSumExp => "logsumexp",
        Max => "max",
    }
}

named_options! {
    /// Which decoder layers are shared across splits
    WeightReuse {
        Everywhere => "everywhere",
        Last => "last",
        Intermediate => "intermediate",
        Nowhere => "nowhere",
    }
}

named_options! {
    /// Where to place a normalization layer
    NormPlacement {
        Nowhere => "none",
        Encoder => "encoder",
        Decoder => "decoder",
        Both => "both",
    }
}

named_options! {
    /// Positivity activation of the posterior variance
    VarActivation {
        Exp => "exp",
        Pow2 => "pow2",
    }
}

named_options! {
    /// Observation likelihood of the features
    GeneLikelihood {
        Nb => "nb",
        NbSv => "nb_sv",
        NbOrig => "nb_orig",
        Pnb => "pnb",
        PnbSv => "pnb_sv" | "pnv_sv",
        Poisson => "poisson",
        LogNormal => "lognormal",
        Normal => "normal",
        NormalV => "normal_v",
        NormalSv => "normal_sv",
    }
}

impl WeightReuse {
    /// hidden layers are shared across splits
    pub fn share_intermediate(&self) -> bool {
        matches!(self, Self::Everywhere | Self::Intermediate)
    }

    /// parameter heads are shared across splits
    pub fn share_last(&self) -> bool {
        matches!(self, Self::Everywhere | Self::Last)
    }
}

impl NormPlacement {
    pub fn encoder(&self) -> bool {
        matches!(self, Self::Encoder | Self::Both)
    }

    pub fn decoder(&self) -> bool {
        matches!(self, Self::Decoder | Self::Both)
    }
}

////////////////////////////////
// covariate modeling options //
////////////////////////////////

/// How categorical covariate codes become a conditioning vector
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CovariateEncoding {
    OneHot,
    Embedding,
    SharedEmbedding,
}

/// How the conditioning vector enters a hidden layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CovariateFusion {
    Concat,
    Linear,
    Adapter,
}

/// One of the nine `{one_hot, emb, emb_shared} x {-, linear,
/// adapter}` strategies, e.g., `"emb_shared_adapter"`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CovariateModeling {
    pub encoding: CovariateEncoding,
    pub fusion: CovariateFusion,
}

impl CovariateModeling {
    pub fn new(encoding: CovariateEncoding, fusion: CovariateFusion) -> Self {
        Self { encoding, fusion }
    }

    pub fn is_shared_embedding(&self) -> bool {
        self.encoding == CovariateEncoding::SharedEmbedding
    }
}

impl Default for CovariateModeling {
    fn default() -> Self {
        Self::new(CovariateEncoding::OneHot, CovariateFusion::Concat)
    }
}

impl fmt::Display for CovariateModeling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoding = match self.encoding {
            CovariateEncoding::OneHot => "one_hot",
            CovariateEncoding::Embedding => "emb",
            CovariateEncoding::SharedEmbedding => "emb_shared",
        };
        match self.fusion {
            CovariateFusion::Concat => write!(f, "{}", encoding),
            CovariateFusion::Linear => write!(f, "{}_linear", encoding),
            CovariateFusion::Adapter => write!(f, "{}_adapter", encoding),
        }
    }
}

impl FromStr for CovariateModeling {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (head, fusion) = if let Some(head) = s.strip_suffix("_linear") {
            (head, CovariateFusion::Linear)
        } else if let Some(head) = s.strip_suffix("_adapter") {
            (head, CovariateFusion::Adapter)
        } else {
            (s, CovariateFusion::Concat)
        };
        let encoding = match head {
            "one_hot" => CovariateEncoding::OneHot,
            "emb" => CovariateEncoding::Embedding,
            "emb_shared" => CovariateEncoding::SharedEmbedding,
            _ => {
                return Err(Error::Msg(format!(
                    "unsupported covariate modeling strategy `{}`",
                    s
                )))
            }
        };
        Ok(Self::new(encoding, fusion))
    }
}

impl TryFrom<String> for CovariateModeling {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CovariateModeling> for String {
    fn from(x: CovariateModeling) -> Self {
        x.to_string()
    }
}

///////////////////
// prior options //
///////////////////

/// Latent prior family: `normal`, `gmm_{K}` or `vamp_{K}`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PriorSpec {
    Normal,
    GaussianMixture(usize),
    Vamp(usize),
}

impl PriorSpec {
    pub fn n_components(&self) -> Option<usize> {
        match self {
            Self::Normal => None,
            Self::GaussianMixture(k) | Self::Vamp(k) => Some(*k),
        }
    }
}

impl Default for PriorSpec {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for PriorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::GaussianMixture(k) => write!(f, "gmm_{}", k),
            Self::Vamp(k) => write!(f, "vamp_{}", k),
        }
    }
}

impl FromStr for PriorSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "normal" {
            return Ok(Self::Normal);
        }

        let parse_k = |k: &str| -> Result<usize> {
            match k.parse::<usize>() {
                Ok(k) if k > 0 => Ok(k),
                _ => Err(Error::Msg(format!(
                    "malformed prior `{}`: need a positive number of components",
                    s
                ))),
            }
        };

        if let Some(k) = s.strip_prefix("gmm_") {
            Ok(Self::GaussianMixture(parse_k(k)?))
        } else if let Some(k) = s.strip_prefix("vamp_") {
            Ok(Self::Vamp(parse_k(k)?))
        } else {
            Err(Error::Msg(format!(
                "unsupported prior `{}`, expected `normal`, `gmm_K` or `vamp_K`",
                s
            )))
        }
    }
}

impl TryFrom<String> for PriorSpec {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PriorSpec> for String {
    fn from(x: PriorSpec) -> Self {
        x.to_string()
    }
}

///////////////////////////
// module configuration  //
///////////////////////////

/// Embedding dimension of a categorical covariate unless specified
pub const DEFAULT_COVARIATE_EMBEDDING_DIM: usize = 10;

/// Everything needed to build a `SplitVaeModule`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitVaeConfig {
    pub n_input: usize,
    pub n_latent: usize,
    /// `-1` gives one split per latent dimension
    pub n_split_latent: i64,
    pub split_aggregation: SplitAggregation,
    pub split_method: SplitMethod,
    pub decoder_reuse_weights: WeightReuse,
    pub encoder_dims: Vec<usize>,
    pub decoder_dims: Vec<usize>,
    pub n_cats_per_cov: Vec<usize>,
    pub n_continuous_cov: usize,
    pub encode_covariates: bool,
    pub deeply_inject_covariates: bool,
    pub categorical_covariate_dims: Vec<usize>,
    pub covariate_modeling_strategy: CovariateModeling,
    pub use_batch_norm: NormPlacement,
    pub affine_batch_norm: NormPlacement,
    pub use_layer_norm: NormPlacement,
    pub fill_in_the_blanks_ratio: f64,
    pub input_dropout_rate: f32,
    pub encoder_dropout_rate: f32,
    pub decoder_dropout_rate: f32,
    pub gene_likelihood: GeneLikelihood,
    pub prior: PriorSpec,
    pub var_activation: VarActivation,
}

impl Default for SplitVaeConfig {
    fn default() -> Self {
        Self {
            n_input: 0,
            n_latent: 32,
            n_split_latent: 1,
            split_aggregation: SplitAggregation::Sum,
            split_method: SplitMethod::Split,
            decoder_reuse_weights: WeightReuse::Last,
            encoder_dims: vec![128, 128],
            decoder_dims: vec![128, 128],
            n_cats_per_cov: vec![],
            n_continuous_cov: 0,
            encode_covariates: false,
            deeply_inject_covariates: false,
            categorical_covariate_dims: vec![],
            covariate_modeling_strategy: CovariateModeling::default(),
            use_batch_norm: NormPlacement::Both,
            affine_batch_norm: NormPlacement::Both,
            use_layer_norm: NormPlacement::Nowhere,
            fill_in_the_blanks_ratio: 0.,
            input_dropout_rate: 0.,
            encoder_dropout_rate: 0.,
            decoder_dropout_rate: 0.,
            gene_likelihood: GeneLikelihood::Nb,
            prior: PriorSpec::Normal,
            var_activation: VarActivation::Exp,
        }
    }
}

impl SplitVaeConfig {
    pub fn new(n_input: usize, n_latent: usize) -> Self {
        Self {
            n_input,
            n_latent,
            ..Default::default()
        }
    }

    /// Resolve the number of splits, where `-1` means one split per
    /// latent dimension
    pub fn n_split(&self) -> Result<usize> {
        resolve_n_split(self.n_split_latent, self.n_latent)
    }

    /// Embedding dimension for each categorical covariate, padded with
    /// the default dimension
    pub fn covariate_embedding_dims(&self) -> Vec<usize> {
        (0..self.n_cats_per_cov.len())
            .map(|j| {
                self.categorical_covariate_dims
                    .get(j)
                    .copied()
                    .unwrap_or(DEFAULT_COVARIATE_EMBEDDING_DIM)
            })
            .collect()
    }

    /// Fail fast on inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.n_input == 0 {
            candle_core::bail!("n_input must be positive");
        }
        if self.n_latent == 0 {
            candle_core::bail!("n_latent must be positive");
        }

        let n_split = self.n_split()?;
        if n_split > 1 && matches!(self.split_method, SplitMethod::Split | SplitMethod::SplitMap) {
            if n_split > self.n_latent {
                candle_core::bail!(
                    "n_split = {} exceeds n_latent = {}",
                    n_split,
                    self.n_latent
                );
            }
            if self.n_latent % n_split != 0 {
                candle_core::bail!(
                    "n_latent = {} is not divisible by n_split = {}",
                    self.n_latent,
                    n_split
                );
            }
        }

        if !(0.0..1.0).contains(&self.fill_in_the_blanks_ratio) {
            candle_core::bail!(
                "fill_in_the_blanks_ratio should be in [0, 1): {}",
                self.fill_in_the_blanks_ratio
            );
        }

        for (name, rate) in [
            ("input", self.input_dropout_rate),
            ("encoder", self.encoder_dropout_rate),
            ("decoder", self.decoder_dropout_rate),
        ] {
            if !(0.0..1.0).contains(&rate) {
                candle_core::bail!("{} dropout rate should be in [0, 1): {}", name, rate);
            }
        }

        if self.n_cats_per_cov.iter().any(|&n| n == 0) {
            candle_core::bail!("every categorical covariate needs at least one category");
        }

        if self.categorical_covariate_dims.len() > self.n_cats_per_cov.len() {
            candle_core::bail!(
                "{} embedding dims for {} categorical covariates",
                self.categorical_covariate_dims.len(),
                self.n_cats_per_cov.len()
            );
        }

        if self.categorical_covariate_dims.iter().any(|&d| d == 0) {
            candle_core::bail!("covariate embedding dims should be positive");
        }

        Ok(())
    }
}

/// `n_split = 1` is an undivided decoder; `-1` is one split per
/// latent dimension; anything else non-positive is invalid.
///
/// Slicing methods further need `n_split` to divide `n_latent`, which
/// is checked where the method is known.
pub fn resolve_n_split(n_split: i64, n_latent: usize) -> Result<usize> {
    match n_split {
        -1 => Ok(n_latent),
        k if k >= 1 => Ok(k as usize),
        k => candle_core::bail!("invalid n_split = {}", k),
    }
}
