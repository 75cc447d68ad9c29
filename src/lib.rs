//! Voxel-parallel spherical-harmonic processing for diffusion MRI volumes.
//!
//! The core of the crate is a generic map engine ([`engine::run`]) that applies a
//! pure per-voxel kernel to every masked voxel of a volume across a pool of
//! workers, plus the kernels it was built for: sharpening deconvolution
//! ([`deconv::SharpenKernel`]), SH basis conversion
//! ([`basis::BasisConversionKernel`]) and information-criterion scoring
//! ([`aic::AicScoreKernel`]). Model selection over a stack of candidate score
//! volumes, with optional neighborhood smoothing, lives in [`select`] and
//! [`smooth`].
//!
//! File formats, gradient tables and the construction of SH basis matrices are
//! deliberately outside the engine: matrices and signal models enter as opaque
//! inputs, and the nifti/text I/O in [`nifti_io`] is used only by the binaries.

use std::fmt;

pub mod aic;
pub mod array_utils;
pub mod basis;
pub mod deconv;
pub mod engine;
pub mod nifti_io;
pub mod params;
pub mod patch;
pub mod select;
pub mod smooth;
pub mod volume;

pub use engine::{run, VoxelKernel};
pub use volume::MaskedVolume;

/// Errors surfaced by the engine and its kernels. Configuration problems are
/// detected once, before any parallel work starts; a kernel failure aborts the
/// whole batch and carries the coordinate of the offending voxel.
#[derive(Debug)]
pub enum EngineError {
    /// requested worker count was zero
    InvalidWorkerCount(usize),
    /// spatial axes of a volume and its mask disagree
    ShapeMismatch {
        volume: [usize; 3],
        mask: [usize; 3],
    },
    /// a per-voxel vector length does not match what a kernel or matrix expects
    LengthMismatch { expected: usize, found: usize },
    /// a patch shape or step is incompatible with the source dimensions
    InvalidPatch {
        patch: [usize; 3],
        step: [usize; 3],
        dims: [usize; 3],
    },
    /// the worker pool could not be constructed
    ThreadPool(rayon::ThreadPoolBuildError),
    /// a kernel failed on one voxel; no partial output is produced
    KernelFailure {
        coord: [usize; 3],
        source: KernelError,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidWorkerCount(n) => {
                write!(f, "invalid worker count {n}, must be at least 1")
            }
            EngineError::ShapeMismatch { volume, mask } => {
                write!(
                    f,
                    "volume spatial shape {volume:?} does not match mask shape {mask:?}"
                )
            }
            EngineError::LengthMismatch { expected, found } => {
                write!(
                    f,
                    "per-voxel vector length mismatch: expected {expected}, found {found}"
                )
            }
            EngineError::InvalidPatch { patch, step, dims } => {
                write!(
                    f,
                    "patch shape {patch:?} with step {step:?} is incompatible with dimensions {dims:?}"
                )
            }
            EngineError::ThreadPool(e) => write!(f, "failed to build worker pool: {e}"),
            EngineError::KernelFailure { coord, source } => {
                write!(
                    f,
                    "kernel failed at voxel ({}, {}, {}): {}",
                    coord[0], coord[1], coord[2], source
                )
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::KernelFailure { source, .. } => Some(source),
            EngineError::ThreadPool(e) => Some(e),
            _ => None,
        }
    }
}

/// Per-voxel numerical failures reported by kernels.
#[derive(Debug)]
pub enum KernelError {
    /// the constrained solve did not stabilize within the iteration budget
    NonConvergence { iterations: usize },
    /// an SVD least-squares solve produced no solution
    Solver(String),
    /// a non-finite value where a finite one is required
    NonFinite(&'static str),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::NonConvergence { iterations } => {
                write!(f, "constrained solve did not stabilize after {iterations} iterations")
            }
            KernelError::Solver(msg) => write!(f, "least-squares solve failed: {msg}"),
            KernelError::NonFinite(what) => write!(f, "non-finite {what} encountered"),
        }
    }
}

impl std::error::Error for KernelError {}
