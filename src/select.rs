// Model selection over a stack of per-voxel candidate scores: pick the
// arg-extremum along the candidate axis, then gather the winning candidate out
// of companion arrays with the exact same index volume so all outputs stay
// mutually consistent.

use crate::smooth::{smooth_scores, SmoothingConfig};
use crate::EngineError;
use ndarray::{Array3, Array4, Array5};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// which end of the criterion axis wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Extremum {
    /// lower is better (AIC-style criteria)
    Min,
    /// higher is better (likelihood-style criteria)
    Max,
}

/// Per-voxel arg-extremum along the candidate axis. Ties resolve to the lowest
/// index, so the result is deterministic for any input.
pub fn select(scores: &Array4<f64>, extremum: Extremum) -> Array3<usize> {
    let (nx, ny, nz, nc) = scores.dim();
    assert!(nc > 0, "candidate axis must be non-empty");
    let flat = scores.as_slice().expect("scores must be contiguous");
    let mut best = Array3::<usize>::zeros((nx, ny, nz));
    let best_flat = best.as_slice_mut().expect("index volume must be contiguous");
    best_flat
        .par_iter_mut()
        .zip(flat.par_chunks_exact(nc))
        .for_each(|(slot, row)| {
            let mut best_idx = 0;
            for (i, &v) in row.iter().enumerate().skip(1) {
                let better = match extremum {
                    Extremum::Min => v < row[best_idx],
                    Extremum::Max => v > row[best_idx],
                };
                if better {
                    best_idx = i;
                }
            }
            *slot = best_idx;
        });
    best
}

/// reduces a per-candidate score stack to the winning score per voxel
pub fn gather_scores(scores: &Array4<f64>, best: &Array3<usize>) -> Array3<f64> {
    let (nx, ny, nz, nc) = scores.dim();
    assert_eq!((nx, ny, nz), best.dim(), "score and index spatial axes differ");
    let flat = scores.as_slice().expect("scores must be contiguous");
    let idx = best.as_slice().expect("index volume must be contiguous");
    let mut out = Array3::<f64>::zeros((nx, ny, nz));
    out.as_slice_mut()
        .expect("output must be contiguous")
        .par_iter_mut()
        .enumerate()
        .for_each(|(v, slot)| {
            *slot = flat[v * nc + idx[v]];
        });
    out
}

/// maps the winning candidate index through a label table (e.g. the sharpening
/// ratio each candidate was produced with)
pub fn gather_labels(labels: &[f64], best: &Array3<usize>) -> Array3<f64> {
    let (nx, ny, nz) = best.dim();
    let idx = best.as_slice().expect("index volume must be contiguous");
    let mut out = Array3::<f64>::zeros((nx, ny, nz));
    out.as_slice_mut()
        .expect("output must be contiguous")
        .par_iter_mut()
        .enumerate()
        .for_each(|(v, slot)| {
            *slot = labels[idx[v]];
        });
    out
}

/// reduces a per-candidate payload stack (spatial x payload x candidates) to
/// the winning payload vector per voxel
pub fn gather_payload(payload: &Array5<f64>, best: &Array3<usize>) -> Array4<f64> {
    let (nx, ny, nz, nk, nc) = payload.dim();
    assert_eq!(
        (nx, ny, nz),
        best.dim(),
        "payload and index spatial axes differ"
    );
    let src = payload.as_slice().expect("payload must be contiguous");
    let idx = best.as_slice().expect("index volume must be contiguous");
    let mut out = Array4::<f64>::zeros((nx, ny, nz, nk));
    out.as_slice_mut()
        .expect("output must be contiguous")
        .par_chunks_exact_mut(nk)
        .enumerate()
        .for_each(|(v, row)| {
            let base = v * nk * nc;
            let best_c = idx[v];
            for k in 0..nk {
                row[k] = src[base + k * nc + best_c];
            }
        });
    out
}

/// Everything one model-selection pass produces, all gathered with the same
/// index volume.
pub struct ModelSelection {
    pub best_index: Array3<usize>,
    pub best_score: Array3<f64>,
    pub best_label: Array3<f64>,
    pub best_payload: Array4<f64>,
}

/// Full selection pipeline: optionally smooth the criterion over each voxel's
/// neighborhood, select the winning candidate, then gather score, label and
/// payload from the ORIGINAL (unsmoothed) stacks. Every output is zeroed
/// outside the mask.
pub fn combine(
    scores: &Array4<f64>,
    payload: &Array5<f64>,
    labels: &[f64],
    mask: &Array3<bool>,
    extremum: Extremum,
    smoothing: Option<&SmoothingConfig>,
) -> Result<ModelSelection, EngineError> {
    let (nx, ny, nz, nc) = scores.dim();
    let (px, py, pz, nk, pc) = payload.dim();
    let (mx, my, mz) = mask.dim();
    if [nx, ny, nz] != [mx, my, mz] {
        return Err(EngineError::ShapeMismatch {
            volume: [nx, ny, nz],
            mask: [mx, my, mz],
        });
    }
    if [px, py, pz] != [mx, my, mz] {
        return Err(EngineError::ShapeMismatch {
            volume: [px, py, pz],
            mask: [mx, my, mz],
        });
    }
    if nc == 0 || nk == 0 {
        return Err(EngineError::LengthMismatch {
            expected: 1,
            found: 0,
        });
    }
    if pc != nc {
        return Err(EngineError::LengthMismatch {
            expected: nc,
            found: pc,
        });
    }
    if labels.len() != nc {
        return Err(EngineError::LengthMismatch {
            expected: nc,
            found: labels.len(),
        });
    }

    let smoothed;
    let criterion = match smoothing {
        Some(cfg) => {
            smoothed = smooth_scores(scores, mask, cfg)?;
            &smoothed
        }
        None => scores,
    };

    let mut best_index = select(criterion, extremum);
    let mut best_score = gather_scores(scores, &best_index);
    let mut best_label = gather_labels(labels, &best_index);
    let mut best_payload = gather_payload(payload, &best_index);

    // masked-out voxels are never assigned a result
    let mask_flat = mask.as_slice().expect("mask must be contiguous");
    best_index
        .as_slice_mut()
        .expect("index volume must be contiguous")
        .iter_mut()
        .zip(mask_flat)
        .for_each(|(b, &m)| {
            if !m {
                *b = 0;
            }
        });
    best_score
        .as_slice_mut()
        .expect("score volume must be contiguous")
        .iter_mut()
        .zip(mask_flat)
        .for_each(|(s, &m)| {
            if !m {
                *s = 0.0;
            }
        });
    best_label
        .as_slice_mut()
        .expect("label volume must be contiguous")
        .iter_mut()
        .zip(mask_flat)
        .for_each(|(l, &m)| {
            if !m {
                *l = 0.0;
            }
        });
    best_payload
        .as_slice_mut()
        .expect("payload volume must be contiguous")
        .chunks_exact_mut(nk)
        .zip(mask_flat)
        .for_each(|(row, &m)| {
            if !m {
                row.fill(0.0);
            }
        });

    Ok(ModelSelection {
        best_index,
        best_score,
        best_label,
        best_payload,
    })
}
