use clap::Parser;
use ndarray::Array3;
use sh_vox::basis::BasisConversionKernel;
use sh_vox::{engine, nifti_io, MaskedVolume};
use std::path::PathBuf;
use std::time::Instant;

/// Convert a spherical-harmonic coefficient volume between two basis
/// conventions using precomputed forward and inverse transform matrices.
#[derive(Debug, Parser)]
struct Args {
    /// input SH coefficient volume (4-D nifti)
    #[arg(long = "in")]
    input: PathBuf,
    /// converted output volume
    #[arg(long)]
    out: PathBuf,
    /// binary mask volume; defaults to every voxel with any nonzero coefficient
    #[arg(long)]
    mask: Option<PathBuf>,
    /// input-basis sampling matrix B_in (coefficients x directions)
    #[arg(long)]
    b_in: PathBuf,
    /// output-basis inverse matrix invB_out (directions x coefficients)
    #[arg(long)]
    inv_b_out: PathBuf,
    /// requested worker count, clamped to the hardware
    #[arg(long, default_value_t = 1)]
    cores: usize,
}

fn main() {
    let args = Args::parse();

    let (sh, header) = nifti_io::load_volume4(&args.input);
    let (nx, ny, nz, nc) = sh.dim();
    println!("loaded SH volume {:?} with {} coefficients", [nx, ny, nz], nc);

    // without an explicit mask, skip voxels that are all-zero anyway
    let mask = match &args.mask {
        Some(path) => nifti_io::load_mask(path),
        None => {
            let flat = sh.as_slice().expect("volume must be contiguous");
            let mut mask = Array3::from_elem((nx, ny, nz), false);
            mask.as_slice_mut()
                .expect("mask must be contiguous")
                .iter_mut()
                .zip(flat.chunks_exact(nc))
                .for_each(|(m, row)| *m = row.iter().any(|&v| v != 0.0));
            mask
        }
    };

    let b_in = nifti_io::read_matrix(&args.b_in);
    let inv_b_out = nifti_io::read_matrix(&args.inv_b_out);
    let kernel = BasisConversionKernel::new(b_in, inv_b_out)
        .unwrap_or_else(|e| panic!("incompatible conversion matrices: {e}"));

    let volume = MaskedVolume::new(&sh, &mask)
        .unwrap_or_else(|e| panic!("invalid input configuration: {e}"));
    println!("mask keeps {} voxels", volume.masked_count());

    let start = Instant::now();
    let converted = engine::run(&volume, &kernel, args.cores)
        .unwrap_or_else(|e| panic!("basis conversion failed: {e}"));
    println!("Elapsed time = {:.2} s", start.elapsed().as_secs_f32());

    nifti_io::save_volume(&args.out, &converted.into_dyn(), &header);
}
