use candle_core::{Result, Tensor};

/// log(2π)
pub const LN_2PI: f64 = 1.8378770664093453;

/// KL divergence against the standard Gaussian N(0, I), one entry per
/// latent dimension (not summed)
///
/// 0.5 * (sigma^2 + mu^2 - 1 - log(sigma^2))
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_var` - variance of Gaussian distribution (positive)
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_var: &Tensor) -> Result<Tensor> {
    let z_lnvar = z_var.log()?;
    (((z_var + z_mean.sqr()?)? - 1.)? - z_lnvar)? * 0.5
}

/// Element-wise Gaussian log-density
///
/// log N(x | mu, var) = -0.5 * [ log(2π) + log(var) + (x - mu)^2 / var ]
///
/// * `x` - observed values
/// * `mean` - mean, broadcastable to `x`
/// * `var` - variance (positive), broadcastable to `x`
///
pub fn normal_log_prob(x: &Tensor, mean: &Tensor, var: &Tensor) -> Result<Tensor> {
    let sq = x.broadcast_sub(mean)?.sqr()?.broadcast_div(var)?;
    (sq.broadcast_add(&var.log()?)? + LN_2PI)? * (-0.5)
}

/// Element-wise Poisson log-density with the rate in log space
///
/// x * log(rate) - rate - lgamma(x + 1)
///
pub fn poisson_log_prob(x: &Tensor, log_rate: &Tensor) -> Result<Tensor> {
    let rate = log_rate.exp()?;
    x.mul(log_rate)?.sub(&rate)?.sub(&lgamma_approx(&(x + 1.0)?)?)
}

/// Element-wise Negative Binomial log-density, mean/dispersion
/// parameterization with a small epsilon inside the logs
///
/// ```text
/// lgamma(x + θ) - lgamma(θ) - lgamma(x + 1)
///   + θ * [log(θ + ε) - log(θ + μ + ε)]
///   + x * [log(μ + ε) - log(θ + μ + ε)]
/// ```
///
/// * `x` - observed counts (n x d)
/// * `mu` - mean (n x d)
/// * `theta` - inverse dispersion, broadcastable to `x`
///
pub fn nb_log_prob(x: &Tensor, mu: &Tensor, theta: &Tensor) -> Result<Tensor> {
    let eps = 1e-8;
    let theta = theta.broadcast_as(x.shape())?;
    let log_theta_mu_eps = ((&theta + mu)? + eps)?.log()?;
    let log_theta_eps = (&theta + eps)?.log()?;
    let log_mu_eps = (mu + eps)?.log()?;

    let term_theta = theta.mul(&log_theta_eps.sub(&log_theta_mu_eps)?)?;
    let term_x = x.mul(&log_mu_eps.sub(&log_theta_mu_eps)?)?;

    let lgamma_terms = lgamma_approx(&(x + &theta)?)?
        .sub(&lgamma_approx(&theta)?)?
        .sub(&lgamma_approx(&(x + 1.0)?)?)?;

    (term_theta + term_x)? + lgamma_terms
}

/// Element-wise Negative Binomial log-density computed in log space
///
/// ```text
/// lgamma(x + θ) - lgamma(θ) - lgamma(x + 1)
///   + θ * [log θ - log(θ + μ)] + x * [log μ - log(θ + μ)]
/// ```
/// where `log(θ + μ)` is a log-sum-exp of `log θ` and `log μ`.
///
pub fn log_nb_log_prob(x: &Tensor, log_mu: &Tensor, log_theta: &Tensor) -> Result<Tensor> {
    let log_theta = log_theta.broadcast_as(x.shape())?;
    let theta = log_theta.exp()?;
    let log_theta_mu = log_add_exp(&log_theta, log_mu)?;

    let term_theta = theta.mul(&log_theta.sub(&log_theta_mu)?)?;
    let term_x = x.mul(&log_mu.sub(&log_theta_mu)?)?;

    let lgamma_terms = lgamma_approx(&(x + &theta)?)?
        .sub(&lgamma_approx(&theta)?)?
        .sub(&lgamma_approx(&(x + 1.0)?)?)?;

    (term_theta + term_x)? + lgamma_terms
}

/// Fast lgamma approximation for tensors (Paul Mineiro's fastlgamma).
///
/// ```text
/// lgamma(x) ≈ -2.081061466 - x + 0.0833333/(x+3) - log(x*(1+x)*(2+x)) + (2.5+x)*log(x+3)
/// ```
pub fn lgamma_approx(x: &Tensor) -> Result<Tensor> {
    let x_safe = x.clamp(1e-6f32, f32::MAX)?;

    let x_plus_1 = (&x_safe + 1.0)?;
    let x_plus_2 = (&x_safe + 2.0)?;
    let logterm = ((&x_safe * &x_plus_1)? * &x_plus_2)?.log()?;

    let xp3 = (&x_safe + 3.0)?;
    let log_xp3 = xp3.log()?;

    let recip_term = (xp3.recip()? * 0.0833333)?;
    let mult_term = ((&x_safe + 2.5)? * &log_xp3)?;

    (((recip_term - 2.081061466)? - &x_safe)? - &logterm)? + &mult_term
}

/// log(exp(a) + exp(b)) = max(a,b) + log(1 + exp(-|a - b|))
pub fn log_add_exp(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let max = a.maximum(b)?;
    let gap = a.sub(b)?.abs()?.neg()?;
    max + (gap.exp()? + 1.)?.log()?
}

/// Numerically stable log-sum-exp along `dim` (the dimension is removed)
pub fn log_sum_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?.detach();
    x.broadcast_sub(&max)?
        .exp()?
        .sum_keepdim(dim)?
        .log()?
        .broadcast_add(&max)?
        .squeeze(dim)
}

/// softplus(x) = log(1 + exp(x)) = relu(x) + log(1 + exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    x.relu()? + tail
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn lgamma_known_values() -> Result<()> {
        let dev = Device::Cpu;
        // lgamma(1) = lgamma(2) = 0, lgamma(10) = ln(9!)
        let x = Tensor::new(&[1f32, 2., 10.], &dev)?;
        let y = lgamma_approx(&x)?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(y[0], 0.0, epsilon = 1e-2);
        assert_abs_diff_eq!(y[1], 0.0, epsilon = 1e-2);
        assert_abs_diff_eq!(y[2], 362880f32.ln(), epsilon = 1e-2);
        Ok(())
    }

    #[test]
    fn standard_kl_vanishes_at_prior() -> Result<()> {
        let dev = Device::Cpu;
        let mean = Tensor::zeros((4, 3), candle_core::DType::F32, &dev)?;
        let var = Tensor::ones((4, 3), candle_core::DType::F32, &dev)?;
        let kl = gaussian_kl_loss(&mean, &var)?;
        assert_eq!(kl.dims(), &[4, 3]);
        let total = kl.sum_all()?.to_scalar::<f32>()?;
        assert_abs_diff_eq!(total, 0.0, epsilon = 1e-6);

        let mean = (Tensor::ones((1, 2), candle_core::DType::F32, &dev)? * 2.)?;
        let kl = gaussian_kl_loss(&mean, &Tensor::ones((1, 2), candle_core::DType::F32, &dev)?)?;
        // 0.5 * mu^2
        for v in kl.flatten_all()?.to_vec1::<f32>()? {
            assert_abs_diff_eq!(v, 2.0, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn normal_density_at_mean() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[0f32, 1.]], &dev)?;
        let mean = Tensor::new(&[[0f32, 0.]], &dev)?;
        let var = Tensor::new(&[[1f32]], &dev)?;
        let lp = normal_log_prob(&x, &mean, &var)?.to_vec2::<f32>()?;
        assert_abs_diff_eq!(lp[0][0], (-0.5 * LN_2PI) as f32, epsilon = 1e-5);
        assert_abs_diff_eq!(lp[0][1], (-0.5 * LN_2PI - 0.5) as f32, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn nb_parameterizations_agree() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[0f32, 3., 10.], [1., 0., 25.]], &dev)?;
        let mu = Tensor::new(&[[0.5f32, 2., 8.], [1.5, 0.1, 30.]], &dev)?;
        let theta = Tensor::new(&[[2f32, 0.5, 10.]], &dev)?;

        let a = nb_log_prob(&x, &mu, &theta)?.to_vec2::<f32>()?;
        let b = log_nb_log_prob(&x, &mu.log()?, &theta.log()?)?.to_vec2::<f32>()?;
        for (ra, rb) in a.iter().zip(b.iter()) {
            for (va, vb) in ra.iter().zip(rb.iter()) {
                assert!(va.is_finite() && *va <= 1e-3);
                assert_abs_diff_eq!(va, vb, epsilon = 1e-3);
            }
        }
        Ok(())
    }

    #[test]
    fn stable_reductions() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[100f32, 100.], [0., -50.]], &dev)?;
        let lse = log_sum_exp(&x, 1)?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(lse[0], 100. + 2f32.ln(), epsilon = 1e-4);
        assert_abs_diff_eq!(lse[1], 0.0, epsilon = 1e-4);

        let sp = softplus(&Tensor::new(&[-100f32, 0., 100.], &dev)?)?.to_vec1::<f32>()?;
        assert_abs_diff_eq!(sp[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sp[1], 2f32.ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(sp[2], 100.0, epsilon = 1e-4);
        Ok(())
    }
}
