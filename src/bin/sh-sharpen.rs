use clap::Parser;
use ndarray::Array3;
use sh_vox::deconv::SharpenKernel;
use sh_vox::params::{load_params, SharpenParams};
use sh_vox::{engine, nifti_io, MaskedVolume};
use std::path::PathBuf;
use std::time::Instant;

/// Sharpen a spherical-harmonic ODF volume with the sharpening deconvolution
/// transform. The regularization and sampling operators are precomputed by
/// the caller and read from text files.
#[derive(Debug, Parser)]
struct Args {
    /// input SH coefficient volume (4-D nifti)
    #[arg(long = "in")]
    input: PathBuf,
    /// sharpened output volume
    #[arg(long)]
    out: PathBuf,
    /// binary mask volume; all voxels are processed when omitted
    #[arg(long)]
    mask: Option<PathBuf>,
    /// regularization operator R (text matrix, one row per line)
    #[arg(long)]
    reg: PathBuf,
    /// sampling operator B mapping SH coefficients to regularization directions
    #[arg(long)]
    basis: PathBuf,
    /// sharpening parameters (toml); defaults are used when omitted
    #[arg(long)]
    params: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    let params: SharpenParams = load_params(args.params.as_deref());

    let (sh, header) = nifti_io::load_volume4(&args.input);
    let (nx, ny, nz, nc) = sh.dim();
    println!("loaded SH volume {:?} with {} coefficients", [nx, ny, nz], nc);

    let mask = match &args.mask {
        Some(path) => nifti_io::load_mask(path),
        None => Array3::from_elem((nx, ny, nz), true),
    };

    let reg = nifti_io::read_matrix(&args.reg);
    let basis = nifti_io::read_matrix(&args.basis);

    println!("Sharpening with tau = {}", params.tau);
    println!("Sharpening with lambda = {}", params.lambda);
    println!("Sharpening with r2_term = {}", params.r2_term);

    let kernel = SharpenKernel::new(reg, basis, params.lambda, params.tau, params.r2_term)
        .unwrap_or_else(|e| panic!("incompatible deconvolution operators: {e}"))
        .with_policy(params.on_non_convergence)
        .with_max_iterations(params.iterations);

    let volume = MaskedVolume::new(&sh, &mask)
        .unwrap_or_else(|e| panic!("invalid input configuration: {e}"));
    println!("mask keeps {} voxels", volume.masked_count());

    let start = Instant::now();
    let sharpened = engine::run(&volume, &kernel, params.cores)
        .unwrap_or_else(|e| panic!("sharpening failed: {e}"));
    println!("Elapsed time = {:.2} s", start.elapsed().as_secs_f32());

    nifti_io::save_volume(&args.out, &sharpened.into_dyn(), &header);
}
