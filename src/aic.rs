// Information-criterion scoring of candidate signal models. The physics of
// signal prediction stays behind the SignalModel trait; the kernel only owns
// the residual likelihood and the criterion itself.

use crate::engine::VoxelKernel;
use crate::KernelError;
use std::f64::consts::PI;

/// Akaike information criterion from a log-likelihood and a parameter count;
/// lower is better.
pub fn aic(log_likelihood: f64, dof: usize) -> f64 {
    2.0 * dof as f64 - 2.0 * log_likelihood
}

/// log-density of a zero-mean Gaussian at `diff` with standard deviation `sigma`
pub fn gaussian_log_likelihood(diff: f64, sigma: f64) -> f64 {
    -0.5 * (diff / sigma).powi(2) - (sigma * (2.0 * PI).sqrt()).ln()
}

/// iid Gaussian log-likelihood of a residual vector
pub fn multigaussian_log_likelihood(diffs: &[f64], sigma: f64) -> f64 {
    diffs.iter().map(|&d| gaussian_log_likelihood(d, sigma)).sum()
}

/// Predicts a noiseless signal from one voxel's packed model features and
/// reports the model's degree-of-freedom count. Implementations carry the
/// acquisition physics (tensor shapes, gradient tables) the engine never sees.
pub trait SignalModel: Sync {
    /// number of packed feature values the model consumes, excluding the
    /// measured signal and the trailing sigma
    fn feature_len(&self) -> usize;
    /// number of signal samples predicted per voxel
    fn signal_len(&self) -> usize;
    /// writes the predicted signal and returns the degrees of freedom
    fn predict(&self, features: &[f64], signal: &mut [f64]) -> Result<usize, KernelError>;
}

/// Vector-to-scalar engine kernel scoring one candidate model per voxel.
/// The per-voxel input layout is `[measured signal | model features | sigma]`,
/// the concatenation the caller assembles once for the whole volume.
pub struct AicScoreKernel<M: SignalModel> {
    model: M,
}

impl<M: SignalModel> AicScoreKernel<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

impl<M: SignalModel> VoxelKernel for AicScoreKernel<M> {
    fn input_len(&self) -> usize {
        self.model.signal_len() + self.model.feature_len() + 1
    }

    fn output_len(&self) -> usize {
        1
    }

    fn apply(&self, input: &[f64], output: &mut [f64]) -> Result<(), KernelError> {
        let n = self.model.signal_len();
        let (measured, rest) = input.split_at(n);
        let (features, sigma) = rest.split_at(self.model.feature_len());
        let sigma = sigma[0];
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(KernelError::NonFinite("sigma"));
        }

        let mut predicted = vec![0.0; n];
        let dof = self.model.predict(features, &mut predicted)?;

        let log_likelihood: f64 = measured
            .iter()
            .zip(&predicted)
            .map(|(&m, &p)| gaussian_log_likelihood(m - p, sigma))
            .sum();
        if !log_likelihood.is_finite() {
            return Err(KernelError::NonFinite("log-likelihood"));
        }

        output[0] = aic(log_likelihood, dof);
        Ok(())
    }
}
