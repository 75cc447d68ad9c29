use crate::array_utils::{index_to_subscript_row_maj3, subscript_to_index_row_maj3};
use crate::EngineError;
use ndarray::{Array3, Array4};

/// Pairs a dense coefficient volume with its boolean spatial mask. The volume
/// carries one fixed-length feature vector per voxel on its trailing axis; the
/// mask decides which voxels the engine visits. Both are read-only for the
/// lifetime of an engine call.
pub struct MaskedVolume<'a> {
    data: &'a [f64],
    mask: &'a [bool],
    spatial: [usize; 3],
    coeff_len: usize,
}

impl<'a> MaskedVolume<'a> {
    /// Pairs a volume with its mask, failing fast if their spatial axes disagree.
    pub fn new(data: &'a Array4<f64>, mask: &'a Array3<bool>) -> Result<Self, EngineError> {
        let (nx, ny, nz, nc) = data.dim();
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
        // owned arrays are always standard layout, so the flat views exist
        let data = data.as_slice().expect("volume must be contiguous");
        let mask = mask.as_slice().expect("mask must be contiguous");
        Ok(Self {
            data,
            mask,
            spatial: [nx, ny, nz],
            coeff_len: nc,
        })
    }

    pub fn spatial_dims(&self) -> [usize; 3] {
        self.spatial
    }

    pub fn coeff_len(&self) -> usize {
        self.coeff_len
    }

    pub fn masked_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    /// The ordered coordinate arena: every mask-true voxel in row-major
    /// traversal order. Gather, compute and scatter all thread this list, so
    /// chunk boundaries never depend on array-shape side effects.
    pub fn masked_coords(&self) -> Vec<[usize; 3]> {
        self.mask
            .iter()
            .enumerate()
            .filter(|(_, &m)| m)
            .map(|(i, _)| index_to_subscript_row_maj3(i, &self.spatial))
            .collect()
    }

    /// The feature vector stored at one spatial coordinate.
    pub fn voxel(&self, coord: [usize; 3]) -> &'a [f64] {
        let idx = subscript_to_index_row_maj3(&coord, &self.spatial);
        &self.data[idx * self.coeff_len..(idx + 1) * self.coeff_len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};

    #[test]
    fn rejects_mismatched_shapes() {
        let data = Array4::<f64>::zeros((2, 2, 2, 4));
        let mask = Array3::<bool>::from_elem((2, 2, 3), true);
        assert!(matches!(
            MaskedVolume::new(&data, &mask),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_empty_feature_axis() {
        let data = Array4::<f64>::zeros((2, 2, 2, 0));
        let mask = Array3::<bool>::from_elem((2, 2, 2), true);
        assert!(matches!(
            MaskedVolume::new(&data, &mask),
            Err(EngineError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn coords_follow_row_major_traversal() {
        let data = Array4::<f64>::zeros((2, 2, 2, 1));
        let mut mask = Array3::<bool>::from_elem((2, 2, 2), false);
        mask[[0, 0, 1]] = true;
        mask[[0, 1, 0]] = true;
        mask[[1, 0, 0]] = true;
        let volume = MaskedVolume::new(&data, &mask).unwrap();
        assert_eq!(
            volume.masked_coords(),
            vec![[0, 0, 1], [0, 1, 0], [1, 0, 0]]
        );
        assert_eq!(volume.masked_count(), 3);
    }

    #[test]
    fn voxel_returns_feature_vector() {
        let data = Array4::from_shape_fn((2, 2, 2, 3), |(x, y, z, c)| {
            (x * 100 + y * 10 + z) as f64 + c as f64 * 0.1
        });
        let mask = Array3::from_elem((2, 2, 2), true);
        let volume = MaskedVolume::new(&data, &mask).unwrap();
        assert_eq!(volume.voxel([1, 0, 1]), &[101.0, 101.1, 101.2]);
    }
}
