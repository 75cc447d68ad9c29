// Neighborhood smoothing of per-voxel candidate scores: each masked voxel's
// score vector is replaced by a damped-Gaussian weighted sum over its spatial
// patch, counting only mask-true neighbors. Used to regularize an information
// criterion before model selection.

use crate::array_utils::index_to_subscript_row_maj3;
use crate::patch::{pad_spatial, PadMode, PatchGrid};
use crate::EngineError;
use ndarray::{Array3, Array4};
use rayon::prelude::*;

/// Damped isotropic Gaussian falloff over a cubic patch in patch-local
/// coordinates, normalized to sum to one. Shared read-only across all voxels.
pub fn damped_gaussian_weights(patch_size: usize, sigma: f64) -> Vec<f64> {
    assert!(patch_size % 2 == 1, "patch size must be odd");
    assert!(sigma > 0.0, "sigma must be positive");
    let center = ((patch_size - 1) / 2) as f64;
    let norm = sigma * (2.0 * std::f64::consts::PI).sqrt();
    let mut weights = Vec::with_capacity(patch_size.pow(3));
    for x in 0..patch_size {
        for y in 0..patch_size {
            for z in 0..patch_size {
                let d2 = (x as f64 - center).powi(2)
                    + (y as f64 - center).powi(2)
                    + (z as f64 - center).powi(2);
                weights.push((-0.5 * (d2 / sigma).sqrt()).exp() / norm);
            }
        }
    }
    let total: f64 = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= total);
    weights
}

#[derive(Debug, Clone, Copy)]
pub struct SmoothingConfig {
    /// cubic patch edge length, odd so the window centers on each voxel
    pub patch_size: usize,
    pub sigma: f64,
    pub pad_mode: PadMode,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            patch_size: 3,
            sigma: 0.5,
            pad_mode: PadMode::Zero,
        }
    }
}

/// Replaces each masked voxel's candidate-score vector with the kernel-weighted
/// sum over its patch neighborhood, restricted to mask-true neighbors.
/// Masked-out voxels contribute nothing and receive a zero row. Under
/// [`PadMode::Zero`] the padded mask margin is false, so voxels outside the
/// volume never contribute either; [`PadMode::Reflect`] mirrors scores and
/// mask alike, trading the boundary attenuation for mirrored neighbors.
pub fn smooth_scores(
    scores: &Array4<f64>,
    mask: &Array3<bool>,
    cfg: &SmoothingConfig,
) -> Result<Array4<f64>, EngineError> {
    let (nx, ny, nz, nc) = scores.dim();
    let (mx, my, mz) = mask.dim();
    if [nx, ny, nz] != [mx, my, mz] {
        return Err(EngineError::ShapeMismatch {
            volume: [nx, ny, nz],
            mask: [mx, my, mz],
        });
    }
    if nc == 0 {
        return Err(EngineError::LengthMismatch {
            expected: 1,
            found: 0,
        });
    }
    let kn = cfg.patch_size;
    let dims = [nx, ny, nz];
    // even or empty patches have no center voxel
    if kn == 0 || kn % 2 == 0 {
        return Err(EngineError::InvalidPatch {
            patch: [kn; 3],
            step: [1; 3],
            dims,
        });
    }
    let margin = (kn - 1) / 2;
    let weights = damped_gaussian_weights(kn, cfg.sigma);

    let padded_dims = [nx + 2 * margin, ny + 2 * margin, nz + 2 * margin];
    let padded_scores = pad_spatial(
        scores.as_slice().expect("scores must be contiguous"),
        &dims,
        nc,
        margin,
        cfg.pad_mode,
    );
    let padded_mask = pad_spatial(
        mask.as_slice().expect("mask must be contiguous"),
        &dims,
        1,
        margin,
        cfg.pad_mode,
    );

    // one window per voxel of the original volume
    let score_grid = PatchGrid::new(padded_dims, nc, [kn; 3], [1; 3])?;
    let mask_grid = PatchGrid::new(padded_dims, 1, [kn; 3], [1; 3])?;

    let mask_flat = mask.as_slice().expect("mask must be contiguous");
    let mut out = Array4::<f64>::zeros((nx, ny, nz, nc));
    let out_flat = out.as_slice_mut().expect("output must be contiguous");

    out_flat
        .par_chunks_exact_mut(nc)
        .enumerate()
        .for_each(|(idx, row)| {
            if !mask_flat[idx] {
                return;
            }
            let coord = index_to_subscript_row_maj3(idx, &dims);
            let score_view = score_grid.view(&padded_scores, coord);
            let mask_view = mask_grid.view(&padded_mask, coord);

            let mut w_idx = 0;
            for x in 0..kn {
                for y in 0..kn {
                    for z in 0..kn {
                        let w = weights[w_idx];
                        w_idx += 1;
                        if *mask_view.get([x, y, z], 0) {
                            for c in 0..nc {
                                row[c] += w * *score_view.get([x, y, z], c);
                            }
                        }
                    }
                }
            }
        });

    Ok(out)
}
