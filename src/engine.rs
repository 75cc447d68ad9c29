// Generic voxel-parallel map: gather masked feature vectors in traversal
// order, fan contiguous chunks out to a worker pool, scatter results back to
// the original coordinates once every worker has returned.

use crate::array_utils::subscript_to_index_row_maj3;
use crate::volume::MaskedVolume;
use crate::{EngineError, KernelError};
use ndarray::Array4;
use rayon::prelude::*;
use std::ops::Range;

/// A pure per-voxel function with fixed, declared input and output lengths.
/// Implementations are invoked concurrently and possibly redundantly, so they
/// must be free of shared mutable state; any call-invariant parameters
/// (matrices, damping factors) belong inside the kernel value itself.
pub trait VoxelKernel: Sync {
    fn input_len(&self) -> usize;
    fn output_len(&self) -> usize;
    fn apply(&self, input: &[f64], output: &mut [f64]) -> Result<(), KernelError>;
}

/// splits `len` items into `n` contiguous ranges whose sizes differ by at most one
fn split_even(len: usize, n: usize) -> Vec<Range<usize>> {
    let base = len / n;
    let rem = len % n;
    let mut ranges = Vec::with_capacity(n);
    let mut start = 0;
    for i in 0..n {
        let size = base + (i < rem) as usize;
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

/// Applies `kernel` to the feature vector of every mask-true voxel of `volume`
/// and returns a volume of the kernel's outputs at the same coordinates.
/// Masked-out voxels hold the zero vector of the kernel's output length.
///
/// `worker_count` is clamped to the available hardware parallelism; the call
/// blocks until every chunk has completed and no partial result is observable.
/// The first kernel failure aborts the whole batch, reporting the failing
/// voxel's coordinate.
pub fn run<K: VoxelKernel>(
    volume: &MaskedVolume,
    kernel: &K,
    worker_count: usize,
) -> Result<Array4<f64>, EngineError> {
    if worker_count < 1 {
        return Err(EngineError::InvalidWorkerCount(worker_count));
    }
    if kernel.input_len() != volume.coeff_len() {
        return Err(EngineError::LengthMismatch {
            expected: kernel.input_len(),
            found: volume.coeff_len(),
        });
    }
    let out_len = kernel.output_len();
    assert!(out_len > 0, "kernel output length must be at least 1");

    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let workers = worker_count.min(available);

    let spatial = volume.spatial_dims();
    let [nx, ny, nz] = spatial;
    let mut output = Array4::<f64>::zeros((nx, ny, nz, out_len));

    let coords = volume.masked_coords();
    if coords.is_empty() {
        return Ok(output);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(EngineError::ThreadPool)?;

    // one contiguous chunk per worker; empty chunks are harmless when there
    // are fewer voxels than workers
    let chunks = split_even(coords.len(), workers);

    let chunk_outputs: Vec<Vec<f64>> = pool.install(|| {
        chunks
            .par_iter()
            .map(|range| {
                let mut chunk_out = vec![0.0; range.len() * out_len];
                for (slot, &coord) in chunk_out
                    .chunks_exact_mut(out_len)
                    .zip(&coords[range.clone()])
                {
                    kernel
                        .apply(volume.voxel(coord), slot)
                        .map_err(|source| EngineError::KernelFailure { coord, source })?;
                }
                Ok(chunk_out)
            })
            .collect::<Result<_, EngineError>>()
    })?;

    // every worker has returned; scatter chunk outputs back in arena order
    let out_flat = output.as_slice_mut().expect("output must be contiguous");
    let mut arena = coords.iter();
    for chunk in &chunk_outputs {
        for slot in chunk.chunks_exact(out_len) {
            let coord = arena.next().expect("chunk outputs exceed arena length");
            let idx = subscript_to_index_row_maj3(coord, &spatial);
            out_flat[idx * out_len..(idx + 1) * out_len].copy_from_slice(slot);
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Identity {
        len: usize,
    }

    impl VoxelKernel for Identity {
        fn input_len(&self) -> usize {
            self.len
        }
        fn output_len(&self) -> usize {
            self.len
        }
        fn apply(&self, input: &[f64], output: &mut [f64]) -> Result<(), KernelError> {
            output.copy_from_slice(input);
            Ok(())
        }
    }

    struct Poly;

    impl VoxelKernel for Poly {
        fn input_len(&self) -> usize {
            3
        }
        fn output_len(&self) -> usize {
            2
        }
        fn apply(&self, input: &[f64], output: &mut [f64]) -> Result<(), KernelError> {
            output[0] = input[0] * input[1] - input[2];
            output[1] = (input[0] + input[1] + input[2]).sin();
            Ok(())
        }
    }

    struct FailAt {
        coord_value: f64,
    }

    impl VoxelKernel for FailAt {
        fn input_len(&self) -> usize {
            1
        }
        fn output_len(&self) -> usize {
            1
        }
        fn apply(&self, input: &[f64], output: &mut [f64]) -> Result<(), KernelError> {
            if input[0] == self.coord_value {
                return Err(KernelError::NonFinite("poisoned voxel"));
            }
            output[0] = input[0];
            Ok(())
        }
    }

    fn random_volume(dims: (usize, usize, usize, usize), seed: u64) -> Array4<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array4::from_shape_fn(dims, |_| rng.random_range(-1.0..1.0))
    }

    #[test]
    fn chunks_partition_evenly() {
        for (len, n) in [(10, 3), (9, 3), (1, 4), (100, 7)] {
            let ranges = split_even(len, n);
            assert_eq!(ranges.len(), n);
            assert_eq!(ranges.iter().map(|r| r.len()).sum::<usize>(), len);
            let min = ranges.iter().map(|r| r.len()).min().unwrap();
            let max = ranges.iter().map(|r| r.len()).max().unwrap();
            assert!(max - min <= 1);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
        }
    }

    #[test]
    fn identity_round_trip_with_masked_corner() {
        // 2x2x2 volume, 4 coefficients per voxel, all-true mask except one corner
        let data = random_volume((2, 2, 2, 4), 7);
        let mut mask = Array3::from_elem((2, 2, 2), true);
        mask[[1, 1, 1]] = false;

        let volume = MaskedVolume::new(&data, &mask).unwrap();
        let out = run(&volume, &Identity { len: 4 }, 2).unwrap();

        for x in 0..2 {
            for y in 0..2 {
                for z in 0..2 {
                    for c in 0..4 {
                        let expected = if (x, y, z) == (1, 1, 1) {
                            0.0
                        } else {
                            data[[x, y, z, c]]
                        };
                        assert_eq!(out[[x, y, z, c]], expected);
                    }
                }
            }
        }
    }

    #[test]
    fn masked_out_voxels_stay_zero() {
        let data = random_volume((4, 3, 5, 3), 11);
        let mut rng = StdRng::seed_from_u64(3);
        let mask = Array3::from_shape_fn((4, 3, 5), |_| rng.random_range(0..2) == 1);

        let volume = MaskedVolume::new(&data, &mask).unwrap();
        let out = run(&volume, &Poly, 3).unwrap();

        for ((x, y, z), &m) in mask.indexed_iter() {
            if !m {
                assert_eq!(out[[x, y, z, 0]], 0.0);
                assert_eq!(out[[x, y, z, 1]], 0.0);
            }
        }
    }

    #[test]
    fn output_is_invariant_to_worker_count() {
        let data = random_volume((5, 4, 3, 3), 23);
        let mut rng = StdRng::seed_from_u64(5);
        let mask = Array3::from_shape_fn((5, 4, 3), |_| rng.random_range(0..4) > 0);
        let volume = MaskedVolume::new(&data, &mask).unwrap();

        let reference = run(&volume, &Poly, 1).unwrap();
        for workers in [2, 3, 5, 64] {
            let out = run(&volume, &Poly, workers).unwrap();
            // bit-identical regardless of chunk boundaries
            assert_eq!(out, reference);
        }
    }

    #[test]
    fn zero_workers_is_a_configuration_error() {
        let data = Array4::<f64>::zeros((2, 2, 2, 1));
        let mask = Array3::from_elem((2, 2, 2), true);
        let volume = MaskedVolume::new(&data, &mask).unwrap();
        assert!(matches!(
            run(&volume, &Identity { len: 1 }, 0),
            Err(EngineError::InvalidWorkerCount(0))
        ));
    }

    #[test]
    fn kernel_length_is_validated_up_front() {
        let data = Array4::<f64>::zeros((2, 2, 2, 3));
        let mask = Array3::from_elem((2, 2, 2), true);
        let volume = MaskedVolume::new(&data, &mask).unwrap();
        assert!(matches!(
            run(&volume, &Identity { len: 4 }, 1),
            Err(EngineError::LengthMismatch {
                expected: 4,
                found: 3
            })
        ));
    }

    #[test]
    fn kernel_failure_reports_voxel_coordinate() {
        let mut data = Array4::<f64>::zeros((3, 3, 3, 1));
        data[[2, 0, 1, 0]] = f64::MAX;
        let mask = Array3::from_elem((3, 3, 3), true);
        let volume = MaskedVolume::new(&data, &mask).unwrap();

        let err = run(&volume, &FailAt { coord_value: f64::MAX }, 4).unwrap_err();
        match err {
            EngineError::KernelFailure { coord, .. } => assert_eq!(coord, [2, 0, 1]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_mask_yields_all_zero_output() {
        let data = random_volume((2, 2, 2, 2), 1);
        let mask = Array3::from_elem((2, 2, 2), false);
        let volume = MaskedVolume::new(&data, &mask).unwrap();
        let out = run(&volume, &Identity { len: 2 }, 8).unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }
}
