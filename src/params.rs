// Parameter files for the command-line tools, (de)serialized as TOML.
// Defaults mirror the processing scripts this crate grew out of.

use crate::deconv::NonConvergence;
use crate::patch::PadMode;
use crate::select::Extremum;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharpenParams {
    /// damping factor before the once-per-call rescaling
    pub lambda: f64,
    /// threshold scale for the negative-lobe constraint
    pub tau: f64,
    /// set when the input ODF model carries the solid-angle r^2 term
    pub r2_term: bool,
    /// iteration budget for the constrained solve
    pub iterations: usize,
    pub on_non_convergence: NonConvergence,
    /// requested worker count, clamped to the hardware
    pub cores: usize,
}

impl Default for SharpenParams {
    fn default() -> Self {
        Self {
            lambda: 1.0,
            tau: 0.1,
            r2_term: true,
            iterations: 50,
            on_non_convergence: NonConvergence::Fail,
            cores: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectParams {
    /// smooth the criterion over each voxel's neighborhood before selection
    pub smooth: bool,
    pub patch_size: usize,
    pub sigma: f64,
    pub pad_mode: PadMode,
    pub extremum: Extremum,
    /// requested worker count, clamped to the hardware
    pub cores: usize,
}

impl Default for SelectParams {
    fn default() -> Self {
        Self {
            smooth: false,
            patch_size: 3,
            sigma: 0.5,
            pad_mode: PadMode::Zero,
            extremum: Extremum::Min,
            cores: 1,
        }
    }
}

/// Loads parameters from a TOML file, falling back to the defaults when no
/// path is given. Used by the binaries only, so failures panic with the
/// offending path.
pub fn load_params<T: Default + DeserializeOwned>(path: Option<&Path>) -> T {
    match path {
        None => T::default(),
        Some(path) => {
            let mut toml_str = String::new();
            File::open(path)
                .unwrap_or_else(|e| panic!("failed to open params file {}: {e}", path.display()))
                .read_to_string(&mut toml_str)
                .unwrap_or_else(|e| panic!("failed to read params file {}: {e}", path.display()));
            toml::from_str(&toml_str)
                .unwrap_or_else(|e| panic!("failed to parse params file {}: {e}", path.display()))
        }
    }
}
