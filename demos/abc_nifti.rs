//! Tissue classification of registered NIfTI volumes
//!
//! Usage:
//!   cargo run --release --example abc_nifti -- <output_dir> <params.json|-> \
//!       --images t1.nii.gz t2.nii.gz --priors p1.nii.gz p2.nii.gz p3.nii.gz [--mask mask.nii.gz]
//!
//! Images and priors must already be on the same grid. Writes `labels.nii.gz`,
//! `corrected_<n>.nii.gz` and `posterior_<n>.nii.gz` into the output directory.

use std::path::{Path, PathBuf};
use std::time::Instant;

use abc_core::nifti_io::{read_volume, write_volume};
use abc_core::output::posteriors_to_i16;
use abc_core::utils::intensity::{rescale_intensity, to_i16};
use abc_core::utils::{field_of_view_mask, intersect};
use abc_core::{ClassificationInputs, ClassificationParams, PosteriorSelection, Segmenter};
use tracing::info;

struct Args {
    output_dir: PathBuf,
    params: Option<PathBuf>,
    images: Vec<PathBuf>,
    priors: Vec<PathBuf>,
    mask: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let mut raw = std::env::args().skip(1);
    let output_dir = raw.next().ok_or("missing output directory")?;
    let params = raw.next().ok_or("missing parameter file (use - for defaults)")?;

    let mut images = Vec::new();
    let mut priors = Vec::new();
    let mut mask = None;
    let mut target = None;
    for arg in raw {
        match arg.as_str() {
            "--images" => target = Some(0),
            "--priors" => target = Some(1),
            "--mask" => target = Some(2),
            _ => match target {
                Some(0) => images.push(PathBuf::from(arg)),
                Some(1) => priors.push(PathBuf::from(arg)),
                Some(2) => mask = Some(PathBuf::from(arg)),
                _ => return Err(format!("unexpected argument '{}'", arg)),
            },
        }
    }
    if images.is_empty() || priors.is_empty() {
        return Err("need at least one --images and two --priors volumes".into());
    }

    Ok(Args {
        output_dir: PathBuf::from(output_dir),
        params: (params != "-").then(|| PathBuf::from(params)),
        images,
        priors,
        mask,
    })
}

fn load_all(paths: &[PathBuf]) -> Result<Vec<abc_core::Volume>, String> {
    paths.iter().map(|p| read_volume(p).map_err(|e| e.to_string())).collect()
}

fn main() -> Result<(), String> {
    tracing_subscriber::fmt::init();
    let args = parse_args()?;
    let total_start = Instant::now();

    let params = match &args.params {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
            ClassificationParams::from_json(&text).map_err(|e| e.to_string())?
        }
        None => ClassificationParams::default(),
    };

    let start = Instant::now();
    let images = load_all(&args.images)?;
    let priors = load_all(&args.priors)?;
    let fov = field_of_view_mask(&images).ok_or("no input images")?;
    let mask = match &args.mask {
        Some(path) => {
            let m = read_volume(path).map_err(|e| e.to_string())?;
            m.geometry.ensure_matches(&fov.geometry, "mask").map_err(|e| e.to_string())?;
            intersect(&m.map(|&v| u8::from(v > 0.0)), &fov)
        }
        None => fov,
    };
    let (nx, ny, nz) = mask.dims();
    info!(
        "loaded {} channels, {} priors on {}x{}x{} ({} foreground) in {:.2?}",
        images.len(),
        priors.len(),
        nx,
        ny,
        nz,
        mask.count(),
        start.elapsed()
    );

    let start = Instant::now();
    let inputs = ClassificationInputs { images, mask, priors, template: None };
    let result = Segmenter::new(params)
        .run_with_progress(inputs, |report| {
            info!("iteration {}: log-likelihood {:.6e}", report.iteration, report.log_likelihood);
            std::ops::ControlFlow::Continue(())
        })
        .map_err(|e| e.to_string())?;
    info!("{:?} after {} iterations in {:.2?}", result.status, result.iterations, start.elapsed());

    std::fs::create_dir_all(&args.output_dir).map_err(|e| format!("failed to create output dir: {}", e))?;
    let out = |name: String| -> PathBuf { Path::new(&args.output_dir).join(name) };

    write_volume(&out("labels.nii.gz".into()), &result.labels()).map_err(|e| e.to_string())?;

    for (c, corrected) in result.corrected_images().iter().enumerate() {
        let scaled = to_i16(&rescale_intensity(corrected, 1.0, 32000.0));
        write_volume(&out(format!("corrected_{}.nii.gz", c)), &scaled).map_err(|e| e.to_string())?;
    }

    // Trailing atlas classes are background and are not exported
    let k = result.num_classes();
    let selection = if k > 3 { PosteriorSelection::DropTrailing(3) } else { PosteriorSelection::All };
    for (c, posterior) in posteriors_to_i16(&result.posterior_volumes(selection)).iter().enumerate() {
        write_volume(&out(format!("posterior_{}.nii.gz", c)), posterior).map_err(|e| e.to_string())?;
    }

    info!("done in {:.2?}", total_start.elapsed());
    Ok(())
}
