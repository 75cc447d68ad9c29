// Boundary I/O for the command-line tools: nifti volumes in and out, plus
// whitespace-delimited text matrices for the precomputed SH operators. The
// engine itself never touches a file format.

use nalgebra::DMatrix;
use ndarray::{Array3, Array4, ArrayD, Ix3, Ix4};
use nifti::writer::WriterOptions;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// loads a nifti volume as f64 along with its header for later writing
pub fn load_volume(path: impl AsRef<Path>) -> (ArrayD<f64>, NiftiHeader) {
    let path = path.as_ref();
    let obj = InMemNiftiObject::from_file(path)
        .unwrap_or_else(|e| panic!("failed to read nifti file {}: {e}", path.display()));
    let header = obj.header().clone();
    let data = obj
        .into_volume()
        .into_ndarray::<f64>()
        .unwrap_or_else(|e| panic!("failed to decode nifti volume {}: {e}", path.display()));
    // nifti volumes arrive in fortran memory order; rewrite to standard layout
    // so the flat row-major views the engine relies on exist
    let data = data.as_standard_layout().into_owned();
    (data, header)
}

/// loads a 4-D coefficient volume (spatial axes then coefficients)
pub fn load_volume4(path: impl AsRef<Path>) -> (Array4<f64>, NiftiHeader) {
    let path = path.as_ref();
    let (data, header) = load_volume(path);
    let data = data
        .into_dimensionality::<Ix4>()
        .unwrap_or_else(|_| panic!("expected a 4-D volume in {}", path.display()));
    (data, header)
}

/// loads a 3-D volume and thresholds it into a boolean mask (nonzero = true)
pub fn load_mask(path: impl AsRef<Path>) -> Array3<bool> {
    let path = path.as_ref();
    let (data, _) = load_volume(path);
    let data = data
        .into_dimensionality::<Ix3>()
        .unwrap_or_else(|_| panic!("expected a 3-D mask in {}", path.display()));
    data.mapv(|v| v != 0.0)
}

/// writes a volume against a reference header taken from one of the inputs
pub fn save_volume(path: impl AsRef<Path>, data: &ArrayD<f64>, reference: &NiftiHeader) {
    let path = path.as_ref();
    WriterOptions::new(path)
        .reference_header(reference)
        .write_nifti(data)
        .unwrap_or_else(|e| panic!("failed to write nifti file {}: {e}", path.display()));
}

/// reads a whitespace-delimited real matrix from a text file, one row per line
pub fn read_matrix(path: impl AsRef<Path>) -> DMatrix<f64> {
    let path = path.as_ref();
    let mut s = String::new();
    File::open(path)
        .unwrap_or_else(|e| panic!("failed to open matrix file {}: {e}", path.display()))
        .read_to_string(&mut s)
        .unwrap_or_else(|e| panic!("failed to read matrix file {}: {e}", path.display()));

    let rows: Vec<Vec<f64>> = s
        .lines()
        .map(|line| {
            line.split_ascii_whitespace()
                .map(|token| {
                    token.parse::<f64>().unwrap_or_else(|_| {
                        panic!("invalid matrix entry '{token}' in {}", path.display())
                    })
                })
                .collect()
        })
        .filter(|row: &Vec<f64>| !row.is_empty())
        .collect();

    assert!(!rows.is_empty(), "matrix file {} contains no rows", path.display());
    let ncols = rows[0].len();
    assert!(
        rows.iter().all(|row| row.len() == ncols),
        "matrix file {} has rows of differing lengths",
        path.display()
    );
    DMatrix::from_row_iterator(rows.len(), ncols, rows.into_iter().flatten())
}
