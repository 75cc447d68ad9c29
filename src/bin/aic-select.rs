use clap::Parser;
use ndarray::{concatenate, Array3, Array4, Array5, ArrayD, Axis, Ix4, Ix5};
use sh_vox::nifti_io;
use sh_vox::params::{load_params, SelectParams};
use sh_vox::select::combine;
use sh_vox::smooth::SmoothingConfig;
use std::path::PathBuf;
use std::time::Instant;

/// Pick the best candidate model per voxel from a stack of criterion volumes,
/// optionally smoothing the criterion over each voxel's neighborhood first,
/// and gather the matching ODF and label volumes with the same winner index.
#[derive(Debug, Parser)]
struct Args {
    /// input criterion volumes, one per candidate (3-D or 4-D nifti)
    #[arg(long = "iaic", num_args = 1.., required = true)]
    aic: Vec<PathBuf>,
    /// input ODF volumes, one per candidate (4-D or 5-D nifti)
    #[arg(long = "iodf", num_args = 1.., required = true)]
    odf: Vec<PathBuf>,
    /// masks to intersect; all voxels are kept when omitted
    #[arg(long = "mask", num_args = 0..)]
    masks: Vec<PathBuf>,
    /// candidate labels (e.g. the sharpening ratio behind each candidate)
    #[arg(long = "ratios", num_args = 1.., required = true)]
    ratios: Vec<f64>,
    /// output best-ODF volume
    #[arg(long)]
    oodf: PathBuf,
    /// output best-criterion volume
    #[arg(long)]
    oaic: PathBuf,
    /// output best-label volume
    #[arg(long)]
    oratio: PathBuf,
    /// selection parameters (toml); defaults are used when omitted
    #[arg(long)]
    params: Option<PathBuf>,
}

/// stacks per-candidate criterion volumes along a new trailing axis
fn stack_criteria(paths: &[PathBuf]) -> (Array4<f64>, nifti::NiftiHeader) {
    let mut volumes: Vec<Array4<f64>> = Vec::with_capacity(paths.len());
    let mut header = None;
    for path in paths {
        let (data, hdr) = nifti_io::load_volume(path);
        header.get_or_insert(hdr);
        let data: ArrayD<f64> = if data.ndim() == 3 {
            data.insert_axis(Axis(3))
        } else {
            data
        };
        let data = data
            .into_dimensionality::<Ix4>()
            .unwrap_or_else(|_| panic!("expected a 3-D or 4-D criterion volume in {}", path.display()));
        volumes.push(data);
    }
    let views: Vec<_> = volumes.iter().map(|v| v.view()).collect();
    let stacked = concatenate(Axis(3), &views).expect("criterion volumes have differing shapes");
    (stacked, header.unwrap())
}

/// stacks per-candidate ODF volumes along a new trailing candidate axis
fn stack_odfs(paths: &[PathBuf]) -> Array5<f64> {
    let mut volumes: Vec<Array5<f64>> = Vec::with_capacity(paths.len());
    for path in paths {
        let (data, _) = nifti_io::load_volume(path);
        let data: ArrayD<f64> = if data.ndim() == 4 {
            data.insert_axis(Axis(4))
        } else {
            data
        };
        let data = data
            .into_dimensionality::<Ix5>()
            .unwrap_or_else(|_| panic!("expected a 4-D or 5-D ODF volume in {}", path.display()));
        volumes.push(data);
    }
    let views: Vec<_> = volumes.iter().map(|v| v.view()).collect();
    concatenate(Axis(4), &views).expect("ODF volumes have differing shapes")
}

fn main() {
    let args = Args::parse();
    let params: SelectParams = load_params(args.params.as_deref());

    println!("Loading criterion data");
    let (criteria, header) = stack_criteria(&args.aic);
    let (nx, ny, nz, nc) = criteria.dim();
    println!("Full criterion stack shape = {:?}", criteria.dim());
    assert_eq!(
        nc,
        args.ratios.len(),
        "expected one label per candidate, found {} labels for {} candidates",
        args.ratios.len(),
        nc
    );

    println!("Loading ODF data");
    let odfs = stack_odfs(&args.odf);
    println!("Full ODF stack shape = {:?}", odfs.dim());

    let mut mask = Array3::from_elem((nx, ny, nz), true);
    for path in &args.masks {
        let next = nifti_io::load_mask(path);
        mask.zip_mut_with(&next, |m, &n| *m = *m && n);
    }
    let kept = mask.iter().filter(|&&m| m).count();
    println!(
        "Final mask has {} voxels ({:.1} % of total)",
        kept,
        100.0 * kept as f64 / (nx * ny * nz) as f64
    );

    let smoothing = params.smooth.then(|| SmoothingConfig {
        patch_size: params.patch_size,
        sigma: params.sigma,
        pad_mode: params.pad_mode,
    });
    if smoothing.is_some() {
        println!(
            "Smoothing criterion over {0}x{0}x{0} neighborhoods (sigma = {1})",
            params.patch_size, params.sigma
        );
    }

    // smoothing and the gathers run on rayon; size the pool like the engine does
    assert!(params.cores >= 1, "cores must be at least 1");
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(params.cores.min(available))
        .build()
        .unwrap_or_else(|e| panic!("failed to build worker pool: {e}"));

    let start = Instant::now();
    let selection = pool
        .install(|| {
            combine(
                &criteria,
                &odfs,
                &args.ratios,
                &mask,
                params.extremum,
                smoothing.as_ref(),
            )
        })
        .unwrap_or_else(|e| panic!("model selection failed: {e}"));
    println!("Elapsed time = {:.2} s", start.elapsed().as_secs_f32());

    nifti_io::save_volume(&args.oaic, &selection.best_score.into_dyn(), &header);
    nifti_io::save_volume(&args.oratio, &selection.best_label.into_dyn(), &header);
    nifti_io::save_volume(&args.oodf, &selection.best_payload.into_dyn(), &header);
}
