// Sharpening deconvolution transform. One voxel's smooth ODF coefficient
// vector goes in, a sharpened coefficient vector in the same basis comes out,
// via a regularized solve that iteratively suppresses negative lobes on the
// regularization directions.

use crate::engine::VoxelKernel;
use crate::{EngineError, KernelError};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// number of coefficients in an order-4 symmetric SH series; the initial
/// deconvolution estimate is truncated past this block
const ORDER4_COEFF_COUNT: usize = 15;

/// What to do with a voxel whose constrained solve does not stabilize within
/// the iteration budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NonConvergence {
    /// abort the whole batch, reporting the voxel
    Fail,
    /// write the zero vector for that voxel and continue
    ZeroFill,
    /// keep the last iterate as-is
    Accept,
}

enum Solve {
    Converged(DVector<f64>),
    Stalled {
        estimate: DVector<f64>,
        iterations: usize,
    },
}

/// Per-voxel sharpening deconvolution. The regularization operator `reg` is
/// square over the SH coefficients (diagonal in the SDT construction) and
/// `basis` maps coefficients to amplitudes on the regularization directions.
/// Both matrices, the rescaled damping factor and the threshold scale are
/// bound once at construction and shared read-only across all workers.
pub struct SharpenKernel {
    reg: DMatrix<f64>,
    basis: DMatrix<f64>,
    lambda: f64,
    tau: f64,
    r2_term: bool,
    policy: NonConvergence,
    max_iterations: usize,
}

impl SharpenKernel {
    /// Validates the operator dimensions and rescales `lambda` by
    /// `reg.nrows * reg[0,0] / basis.nrows` to normalize for the coefficient
    /// and direction counts. The rescaling happens here, never per voxel.
    pub fn new(
        reg: DMatrix<f64>,
        basis: DMatrix<f64>,
        lambda: f64,
        tau: f64,
        r2_term: bool,
    ) -> Result<Self, EngineError> {
        if reg.nrows() == 0 || reg.nrows() != reg.ncols() {
            return Err(EngineError::LengthMismatch {
                expected: reg.ncols(),
                found: reg.nrows(),
            });
        }
        if basis.nrows() == 0 || basis.ncols() != reg.ncols() {
            return Err(EngineError::LengthMismatch {
                expected: reg.ncols(),
                found: basis.ncols(),
            });
        }
        let lambda = lambda * reg.nrows() as f64 * reg[(0, 0)] / basis.nrows() as f64;
        Ok(Self {
            reg,
            basis,
            lambda,
            tau,
            r2_term,
            policy: NonConvergence::Fail,
            max_iterations: 50,
        })
    }

    pub fn with_policy(mut self, policy: NonConvergence) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    fn deconvolve(&self, odf_sh: &[f64]) -> Result<Solve, KernelError> {
        let n = self.reg.ncols();
        let odf = DVector::from_column_slice(odf_sh);

        // initial estimate: plain least squares against the regularization
        // operator, truncated above the order-4 coefficient block
        let mut fodf_sh = lstsq(&self.reg, &odf)?;
        for i in ORDER4_COEFF_COUNT.min(n)..n {
            fodf_sh[i] = 0.0;
        }

        // q-ball style ODFs are not unit normalized; force it before thresholding
        if !self.r2_term {
            let z = (&self.basis * &fodf_sh).norm();
            if z > 0.0 {
                fodf_sh /= z;
            }
        }

        let threshold = self.tau * (&self.basis * &fodf_sh).max();

        let mut prev: Vec<usize> = Vec::new();
        for iteration in 1..=self.max_iterations {
            let amplitudes = &self.basis * &fodf_sh;
            let active: Vec<usize> = (0..amplitudes.len())
                .filter(|&i| amplitudes[i] < threshold)
                .collect();

            // too few constrained directions to stabilize the solve
            if active.len() + self.reg.nrows() < self.basis.ncols() {
                return Ok(Solve::Stalled {
                    estimate: fodf_sh,
                    iterations: iteration,
                });
            }
            if iteration > 1 && active == prev {
                return Ok(Solve::Converged(fodf_sh));
            }
            prev = active;

            // stacked system [reg; lambda * basis[active, :]] x = [odf; 0]
            let rows = self.reg.nrows() + prev.len();
            let mut stacked = DMatrix::zeros(rows, n);
            stacked
                .view_mut((0, 0), (self.reg.nrows(), n))
                .copy_from(&self.reg);
            for (row, &dir) in prev.iter().enumerate() {
                for col in 0..n {
                    stacked[(self.reg.nrows() + row, col)] = self.lambda * self.basis[(dir, col)];
                }
            }
            let mut rhs = DVector::zeros(rows);
            rhs.rows_mut(0, odf.len()).copy_from(&odf);

            fodf_sh = lstsq(&stacked, &rhs)?;
        }

        Ok(Solve::Stalled {
            estimate: fodf_sh,
            iterations: self.max_iterations,
        })
    }
}

fn lstsq(m: &DMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>, KernelError> {
    m.clone()
        .svd(true, true)
        .solve(rhs, 1.0e-12)
        .map_err(|e| KernelError::Solver(e.to_string()))
}

impl VoxelKernel for SharpenKernel {
    fn input_len(&self) -> usize {
        self.reg.ncols()
    }

    fn output_len(&self) -> usize {
        self.reg.ncols()
    }

    fn apply(&self, input: &[f64], output: &mut [f64]) -> Result<(), KernelError> {
        // a null ODF sharpens to a null ODF; skip the solve entirely
        if input.iter().all(|&v| v == 0.0) {
            output.fill(0.0);
            return Ok(());
        }
        match self.deconvolve(input)? {
            Solve::Converged(sharpened) => {
                output.copy_from_slice(sharpened.as_slice());
                Ok(())
            }
            Solve::Stalled { estimate, iterations } => match self.policy {
                NonConvergence::Fail => Err(KernelError::NonConvergence { iterations }),
                NonConvergence::ZeroFill => {
                    output.fill(0.0);
                    Ok(())
                }
                NonConvergence::Accept => {
                    output.copy_from_slice(estimate.as_slice());
                    Ok(())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::run;
    use crate::volume::MaskedVolume;
    use ndarray::{Array3, Array4};

    // identity regularization with a strictly positive, near-uniform sampling
    // operator: every amplitude clears the threshold, the active set is empty
    // on consecutive iterations and the solve returns the input unchanged
    fn benign_kernel() -> SharpenKernel {
        let reg = DMatrix::<f64>::identity(4, 4);
        let basis = DMatrix::from_row_slice(
            6,
            4,
            &[
                1.0, 1.0, 1.0, 1.0, //
                1.1, 1.0, 0.9, 1.0, //
                1.0, 1.1, 1.0, 0.9, //
                0.9, 1.0, 1.1, 1.0, //
                1.0, 0.9, 1.0, 1.1, //
                1.05, 0.95, 1.05, 0.95,
            ],
        );
        SharpenKernel::new(reg, basis, 1.0, 0.1, true).unwrap()
    }

    #[test]
    fn lambda_is_rescaled_once_at_construction() {
        let kernel = benign_kernel();
        // 1.0 * nrows(4) * reg[0,0](1.0) / basis rows(6)
        assert!((kernel.lambda - 4.0 / 6.0).abs() < 1e-15);
    }

    #[test]
    fn rejects_mismatched_operators() {
        let reg = DMatrix::<f64>::identity(4, 4);
        let basis = DMatrix::<f64>::zeros(6, 5);
        assert!(matches!(
            SharpenKernel::new(reg, basis, 1.0, 0.1, true),
            Err(EngineError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn zero_input_short_circuits() {
        for (lambda, tau) in [(1.0, 0.1), (100.0, 0.0), (0.0, 5.0)] {
            let kernel = benign_kernel();
            let kernel = SharpenKernel::new(kernel.reg.clone(), kernel.basis.clone(), lambda, tau, true).unwrap();
            let mut out = [1.0; 4];
            kernel.apply(&[0.0; 4], &mut out).unwrap();
            assert_eq!(out, [0.0; 4]);
        }
    }

    #[test]
    fn benign_voxel_converges_to_itself() {
        let kernel = benign_kernel();
        let input = [0.8, 0.3, 0.5, 0.4];
        let mut out = [0.0; 4];
        kernel.apply(&input, &mut out).unwrap();
        for (a, b) in out.iter().zip(&input) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn exhausted_iterations_follow_the_policy() {
        let input = [0.8, 0.3, 0.5, 0.4];

        // one iteration can never observe a repeated active set
        let kernel = benign_kernel().with_max_iterations(1);
        let mut out = [0.0; 4];
        assert!(matches!(
            kernel.apply(&input, &mut out),
            Err(KernelError::NonConvergence { iterations: 1 })
        ));

        let kernel = benign_kernel()
            .with_max_iterations(1)
            .with_policy(NonConvergence::ZeroFill);
        let mut out = [1.0; 4];
        kernel.apply(&input, &mut out).unwrap();
        assert_eq!(out, [0.0; 4]);

        let kernel = benign_kernel()
            .with_max_iterations(1)
            .with_policy(NonConvergence::Accept);
        let mut out = [0.0; 4];
        kernel.apply(&input, &mut out).unwrap();
        for (a, b) in out.iter().zip(&input) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn sharpening_runs_through_the_engine() {
        let mut data = Array4::<f64>::zeros((2, 2, 1, 4));
        data.slice_mut(ndarray::s![0, 0, 0, ..])
            .assign(&ndarray::arr1(&[0.8, 0.3, 0.5, 0.4]));
        data.slice_mut(ndarray::s![1, 1, 0, ..])
            .assign(&ndarray::arr1(&[0.2, 0.6, 0.4, 0.7]));
        let mask = Array3::from_elem((2, 2, 1), true);
        let volume = MaskedVolume::new(&data, &mask).unwrap();

        let out = run(&volume, &benign_kernel(), 2).unwrap();

        // zero voxels short-circuit to zero, populated voxels round-trip
        assert!(out
            .slice(ndarray::s![0, 1, 0, ..])
            .iter()
            .all(|&v| v == 0.0));
        for c in 0..4 {
            assert!((out[[0, 0, 0, c]] - data[[0, 0, 0, c]]).abs() < 1e-9);
            assert!((out[[1, 1, 0, c]] - data[[1, 1, 0, c]]).abs() < 1e-9);
        }
    }
}
