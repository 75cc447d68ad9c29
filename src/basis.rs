// Spherical-harmonic basis conversion: project coefficients to amplitudes on
// a direction set with the input basis, then fit the output basis to those
// amplitudes. Exact given correctly constructed matrices; no iteration.

use crate::engine::VoxelKernel;
use crate::{EngineError, KernelError};
use nalgebra::{DMatrix, DVector};

/// Converts per-voxel SH coefficient vectors between two fixed bases via
/// `coeff_out = (coeff_in . b_in) . inv_b_out`. `b_in` maps input coefficients
/// to sample-direction amplitudes (coefficients x directions) and `inv_b_out`
/// maps amplitudes back to coefficients of the output basis (directions x
/// coefficients). Dimension compatibility is checked once here, never per
/// voxel.
pub struct BasisConversionKernel {
    b_in: DMatrix<f64>,
    inv_b_out: DMatrix<f64>,
}

impl BasisConversionKernel {
    pub fn new(b_in: DMatrix<f64>, inv_b_out: DMatrix<f64>) -> Result<Self, EngineError> {
        if b_in.ncols() != inv_b_out.nrows() {
            return Err(EngineError::LengthMismatch {
                expected: b_in.ncols(),
                found: inv_b_out.nrows(),
            });
        }
        if b_in.nrows() == 0 || inv_b_out.ncols() == 0 {
            return Err(EngineError::LengthMismatch {
                expected: 1,
                found: 0,
            });
        }
        Ok(Self { b_in, inv_b_out })
    }
}

impl VoxelKernel for BasisConversionKernel {
    fn input_len(&self) -> usize {
        self.b_in.nrows()
    }

    fn output_len(&self) -> usize {
        self.inv_b_out.ncols()
    }

    fn apply(&self, input: &[f64], output: &mut [f64]) -> Result<(), KernelError> {
        // an all-zero signal is all-zero in every basis; skip both products
        if input.iter().all(|&v| v == 0.0) {
            output.fill(0.0);
            return Ok(());
        }
        let coeff = DVector::from_column_slice(input);
        let amplitudes = self.b_in.tr_mul(&coeff);
        let converted = self.inv_b_out.tr_mul(&amplitudes);
        output.copy_from_slice(converted.as_slice());
        Ok(())
    }
}
