use candle_core::{Result, Tensor};
use candle_nn::ops::log_softmax;

/// Gaussian negative log-likelihood with unit variance, constants dropped
///
/// nll(i) = 0.5 * [ x(i) - xhat(i) ]^2
///
/// * `x_n` - observed data
/// * `hat_n` - reconstruction, same shape as `x_n`
///
pub fn gaussian_nll(x_n: &Tensor, hat_n: &Tensor) -> Result<Tensor> {
    x_n.sub(hat_n)?.sqr()? * 0.5
}

/// Single-sample KL estimate against a uniform prior over `k` categories
///
/// kl(i) = log q(n_i) - log(1/k)
///
/// * `log_q_n` - log-probability of each sampled category
/// * `k` - number of categories
///
pub fn categorical_kl_uniform_sampled(log_q_n: &Tensor, k: usize) -> Result<Tensor> {
    log_q_n + (k as f64).ln()
}

/// Closed-form KL divergence to a uniform prior
///
/// kl(i) = sum_k q(i,k) * [ log q(i,k) + log(k) ]
///
/// * `logits_nk` - unnormalised log-probabilities, categories on the last axis
///
pub fn categorical_kl_uniform(logits_nk: &Tensor) -> Result<Tensor> {
    let last = logits_nk.rank() - 1;
    let k = logits_nk.dim(last)?;
    let log_q_nk = log_softmax(logits_nk, last)?;
    let q_nk = log_q_nk.exp()?;
    q_nk.mul(&(log_q_nk + (k as f64).ln())?)?.sum(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn uniform_posterior_has_zero_kl() -> Result<()> {
        let logits = Tensor::zeros((2, 4), candle_core::DType::F32, &Device::Cpu)?;
        for v in categorical_kl_uniform(&logits)?.to_vec1::<f32>()? {
            assert_abs_diff_eq!(v, 0., epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn sampled_kl_averages_to_closed_form() -> Result<()> {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[0.1f32, 0.2, 0.3]], &dev)?;
        let analytic = categorical_kl_uniform(&logits)?.to_vec1::<f32>()?[0];

        let log_q = log_softmax(&logits, 1)?.flatten_all()?;
        let q = log_q.exp()?;
        let sampled = categorical_kl_uniform_sampled(&log_q, 3)?;
        let expectation = q.mul(&sampled)?.sum_all()?.to_scalar::<f32>()?;
        assert_abs_diff_eq!(expectation, analytic, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn gaussian_nll_is_half_squared_error() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[1f32, -2.], &dev)?;
        let hat = Tensor::new(&[0f32, 0.], &dev)?;
        assert_eq!(gaussian_nll(&x, &hat)?.to_vec1::<f32>()?, vec![0.5, 2.]);
        Ok(())
    }
}
