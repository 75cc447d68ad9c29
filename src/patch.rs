// Windowed access over a volume without copying: a PatchGrid describes the
// window lattice, and each PatchView resolves reads straight into the source
// slice. The neighborhood-smoothing pass pads first so a window can be
// centered on every voxel, then queries one view per voxel.

use crate::EngineError;
use serde::{Deserialize, Serialize};

/// How the spatial margin added by [`pad_spatial`] is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PadMode {
    /// fill the margin with the type's zero value (`false` for masks);
    /// phantom neighbors then carry no mask weight
    Zero,
    /// mirror the volume about its edges, removing the attenuation a zero
    /// margin causes near boundaries
    Reflect,
}

/// symmetric reflection about the array edges, repeating the edge sample
fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let mut i = i;
    loop {
        if i < 0 {
            i = -i - 1;
        } else if i >= n {
            i = 2 * n - i - 1;
        } else {
            return i as usize;
        }
    }
}

/// Embeds `data` (spatial dims x `channels`, row-major) in a volume grown by
/// `margin` voxels on every spatial edge. The trailing channel axis is not
/// padded.
pub fn pad_spatial<T: Copy + Default>(
    data: &[T],
    dims: &[usize; 3],
    channels: usize,
    margin: usize,
    mode: PadMode,
) -> Vec<T> {
    let [nx, ny, nz] = *dims;
    assert_eq!(
        data.len(),
        nx * ny * nz * channels,
        "data length disagrees with dimensions"
    );
    let (px, py, pz) = (nx + 2 * margin, ny + 2 * margin, nz + 2 * margin);
    let mut padded = vec![T::default(); px * py * pz * channels];

    for x in 0..px {
        for y in 0..py {
            for z in 0..pz {
                let dst = ((x * py + y) * pz + z) * channels;
                let (sx, sy, sz) = match mode {
                    PadMode::Zero => {
                        let inside = x >= margin
                            && x < nx + margin
                            && y >= margin
                            && y < ny + margin
                            && z >= margin
                            && z < nz + margin;
                        if !inside {
                            continue;
                        }
                        (x - margin, y - margin, z - margin)
                    }
                    PadMode::Reflect => (
                        reflect(x as isize - margin as isize, nx),
                        reflect(y as isize - margin as isize, ny),
                        reflect(z as isize - margin as isize, nz),
                    ),
                };
                let src = ((sx * ny + sy) * nz + sz) * channels;
                padded[dst..dst + channels].copy_from_slice(&data[src..src + channels]);
            }
        }
    }
    padded
}

/// The lattice of fixed-shape windows over a volume with a trailing channel
/// axis. Windows always span the full channel axis; along each spatial axis
/// `d` there are `(dims[d] - patch[d]) / step[d] + 1` of them. The grid holds
/// no data: views are built lazily per query and borrow the source directly.
#[derive(Debug, Clone)]
pub struct PatchGrid {
    dims: [usize; 3],
    channels: usize,
    patch: [usize; 3],
    step: [usize; 3],
}

impl PatchGrid {
    pub fn new(
        dims: [usize; 3],
        channels: usize,
        patch: [usize; 3],
        step: [usize; 3],
    ) -> Result<Self, EngineError> {
        let patch_fits = patch
            .iter()
            .zip(&dims)
            .all(|(&p, &d)| p >= 1 && p <= d);
        if !patch_fits || step.iter().any(|&s| s == 0) || channels == 0 {
            return Err(EngineError::InvalidPatch { patch, step, dims });
        }
        Ok(Self {
            dims,
            channels,
            patch,
            step,
        })
    }

    /// number of windows along each spatial axis
    pub fn window_counts(&self) -> [usize; 3] {
        let mut counts = [0usize; 3];
        for d in 0..3 {
            counts[d] = (self.dims[d] - self.patch[d]) / self.step[d] + 1;
        }
        counts
    }

    /// Builds the read-only window whose lower corner sits at `window * step`.
    /// The view aliases `source`; nothing is copied.
    pub fn view<'a, T>(&self, source: &'a [T], window: [usize; 3]) -> PatchView<'a, T> {
        assert_eq!(
            source.len(),
            self.dims.iter().product::<usize>() * self.channels,
            "source length disagrees with grid dimensions"
        );
        let counts = self.window_counts();
        assert!(
            window.iter().zip(&counts).all(|(&w, &c)| w < c),
            "window coordinate {window:?} out of range {counts:?}"
        );
        PatchView {
            source,
            dims: self.dims,
            channels: self.channels,
            patch: self.patch,
            origin: [
                window[0] * self.step[0],
                window[1] * self.step[1],
                window[2] * self.step[2],
            ],
        }
    }
}

/// A read-only window into a larger volume. Every read resolves to an element
/// of the borrowed source slice, so overlapping views share storage and a view
/// constructed after a source update observes the new contents.
pub struct PatchView<'a, T> {
    source: &'a [T],
    dims: [usize; 3],
    channels: usize,
    patch: [usize; 3],
    origin: [usize; 3],
}

impl<'a, T> PatchView<'a, T> {
    pub fn patch_shape(&self) -> [usize; 3] {
        self.patch
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// element at a patch-local offset; the reference points into the source
    pub fn get(&self, offset: [usize; 3], channel: usize) -> &'a T {
        debug_assert!(offset.iter().zip(&self.patch).all(|(&o, &p)| o < p));
        debug_assert!(channel < self.channels);
        let x = self.origin[0] + offset[0];
        let y = self.origin[1] + offset[1];
        let z = self.origin[2] + offset[2];
        &self.source[((x * self.dims[1] + y) * self.dims[2] + z) * self.channels + channel]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_counts_match_the_lattice_formula() {
        let grid = PatchGrid::new([5, 6, 7], 1, [3, 3, 3], [1, 1, 1]).unwrap();
        assert_eq!(grid.window_counts(), [3, 4, 5]);

        let grid = PatchGrid::new([6, 6, 6], 2, [2, 2, 2], [2, 2, 2]).unwrap();
        assert_eq!(grid.window_counts(), [3, 3, 3]);

        let grid = PatchGrid::new([5, 5, 5], 1, [3, 3, 3], [2, 2, 2]).unwrap();
        assert_eq!(grid.window_counts(), [2, 2, 2]);
    }

    #[test]
    fn oversized_patch_is_rejected() {
        assert!(matches!(
            PatchGrid::new([2, 2, 2], 1, [3, 1, 1], [1, 1, 1]),
            Err(EngineError::InvalidPatch { .. })
        ));
        assert!(matches!(
            PatchGrid::new([4, 4, 4], 1, [2, 2, 2], [0, 1, 1]),
            Err(EngineError::InvalidPatch { .. })
        ));
    }

    #[test]
    fn views_address_the_expected_elements() {
        let dims = [4, 4, 4];
        let source: Vec<f64> = (0..64).map(|i| i as f64).collect();
        let grid = PatchGrid::new(dims, 1, [2, 2, 2], [2, 2, 2]).unwrap();

        let view = grid.view(&source, [1, 0, 1]);
        // lower corner at (2, 0, 2)
        assert_eq!(*view.get([0, 0, 0], 0), ((2 * 4 + 0) * 4 + 2) as f64);
        assert_eq!(*view.get([1, 1, 1], 0), ((3 * 4 + 1) * 4 + 3) as f64);
    }

    #[test]
    fn overlapping_views_alias_the_same_storage() {
        let dims = [3, 3, 3];
        let source: Vec<f64> = (0..27).map(|i| i as f64).collect();
        let grid = PatchGrid::new(dims, 1, [2, 2, 2], [1, 1, 1]).unwrap();

        let a = grid.view(&source, [0, 0, 0]);
        let b = grid.view(&source, [1, 0, 0]);
        // a's far-x face is b's near-x face
        assert!(std::ptr::eq(a.get([1, 0, 0], 0), b.get([0, 0, 0], 0)));
    }

    #[test]
    fn views_observe_source_updates_not_snapshots() {
        let dims = [3, 3, 3];
        let mut source: Vec<f64> = vec![0.0; 27];
        let grid = PatchGrid::new(dims, 1, [3, 3, 3], [1, 1, 1]).unwrap();

        assert_eq!(*grid.view(&source, [0, 0, 0]).get([1, 1, 1], 0), 0.0);
        source[(1 * 3 + 1) * 3 + 1] = 42.0;
        // a freshly constructed view reads through to the updated storage
        assert_eq!(*grid.view(&source, [0, 0, 0]).get([1, 1, 1], 0), 42.0);
    }

    #[test]
    fn channel_axis_is_spanned_in_full() {
        let dims = [2, 2, 2];
        let channels = 3;
        let source: Vec<f64> = (0..24).map(|i| i as f64).collect();
        let grid = PatchGrid::new(dims, channels, [2, 2, 2], [1, 1, 1]).unwrap();
        let view = grid.view(&source, [0, 0, 0]);
        for c in 0..channels {
            assert_eq!(
                *view.get([1, 1, 1], c),
                (((1 * 2 + 1) * 2 + 1) * channels + c) as f64
            );
        }
    }

    #[test]
    fn zero_padding_fills_the_margin() {
        let dims = [2, 2, 2];
        let data = vec![1.0; 8];
        let padded = pad_spatial(&data, &dims, 1, 1, PadMode::Zero);
        assert_eq!(padded.len(), 64);
        assert_eq!(padded.iter().filter(|&&v| v == 1.0).count(), 8);
        // corner of the margin is zero, interior is preserved
        assert_eq!(padded[0], 0.0);
        assert_eq!(padded[(1 * 4 + 1) * 4 + 1], 1.0);
    }

    #[test]
    fn mask_margin_is_false_under_zero_padding() {
        let dims = [2, 2, 2];
        let mask = vec![true; 8];
        let padded = pad_spatial(&mask, &dims, 1, 1, PadMode::Zero);
        assert_eq!(padded.iter().filter(|&&m| m).count(), 8);
        assert!(!padded[0]);
    }

    #[test]
    fn reflect_padding_mirrors_the_edges() {
        let dims = [3, 1, 1];
        let data = vec![10.0, 20.0, 30.0];
        let padded = pad_spatial(&data, &dims, 1, 2, PadMode::Reflect);
        // padded dims are (7, 5, 5); walk the x axis through the volume center
        assert_eq!(padded.len(), 7 * 5 * 5);
        let expected = [20.0, 10.0, 10.0, 20.0, 30.0, 30.0, 20.0];
        for (x, &want) in expected.iter().enumerate() {
            assert_eq!(padded[((x * 5) + 2) * 5 + 2], want);
        }
    }
}
