use candle_core::{Result, Tensor};
use candle_nn::Module;

////////////////////////////////////////////////
// Linear module over split views of the data //
////////////////////////////////////////////////

/// A linear layer applied to every split view of the input.
///
/// With a shared weight the same `(out x in)` matrix is used for every
/// split and the input can be `n x in` or `n x s x in`. Otherwise each
/// split `s` owns its `(out x in)` matrix and the input must be
/// `n x s x in`.
#[derive(Clone, Debug)]
pub struct SplitLinear {
    in_dim: usize,
    out_dim: usize,
    n_split: usize,
    weight: Tensor,
    bias: Tensor,
    shared: bool,
}

impl SplitLinear {
    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// shared: `out x in`, per-split: `s x out x in`
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

/// Create a `SplitLinear` with the uniform(-1/sqrt(in), 1/sqrt(in))
/// initialization of an ordinary linear layer
///
/// * `in_dim` - input dimension of each split view
/// * `out_dim` - output dimension of each split view
/// * `n_split` - number of split views
/// * `shared` - share one weight matrix across all the splits
///
pub fn split_linear(
    in_dim: usize,
    out_dim: usize,
    n_split: usize,
    shared: bool,
    vb: candle_nn::VarBuilder,
) -> Result<SplitLinear> {
    let bound = 1. / (in_dim.max(1) as f64).sqrt();
    let init = candle_nn::Init::Uniform {
        lo: -bound,
        up: bound,
    };

    let (weight, bias) = if shared {
        (
            vb.get_with_hints((out_dim, in_dim), "weight", init)?,
            vb.get_with_hints(out_dim, "bias", init)?,
        )
    } else {
        (
            vb.get_with_hints((n_split, out_dim, in_dim), "weight", init)?,
            vb.get_with_hints((n_split, 1, out_dim), "bias", init)?,
        )
    };

    Ok(SplitLinear {
        in_dim,
        out_dim,
        n_split,
        weight,
        bias,
        shared,
    })
}

impl Module for SplitLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if self.shared {
            let w = match *x.dims() {
                [b1, b2, _, _] => self.weight.broadcast_left((b1, b2))?.t()?,
                [bsize, _, _] => self.weight.broadcast_left(bsize)?.t()?,
                _ => self.weight.t()?,
            };
            return x.matmul(&w)?.broadcast_add(&self.bias);
        }

        match *x.dims() {
            [_, s, _] if s == self.n_split => {
                // n x s x in -> s x n x in
                let x_sni = x.transpose(0, 1)?.contiguous()?;
                let h_sno = x_sni
                    .matmul(&self.weight.t()?)?
                    .broadcast_add(&self.bias)?;
                h_sno.transpose(0, 1)?.contiguous()
            }
            _ => candle_core::bail!(
                "per-split linear layer expects n x {} x {}, but got {:?}",
                self.n_split,
                self.in_dim,
                x.dims()
            ),
        }
    }
}
