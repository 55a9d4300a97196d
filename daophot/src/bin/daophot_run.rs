//! Reduce FITS images with DAOPHOT and ALLSTAR.
//!
//! For every image: prepare a working copy, find stars, measure aperture
//! photometry, fit a PSF, fit every star with ALLSTAR, reject over-subtracted
//! stars and refit. Artifacts of each image are saved to `<outdir>/<stem>/`.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use daophot::image::fits::FitsImageIo;
use daophot::pipeline::{AllstarStatus, ProcessLauncher};
use daophot::tools::TerminalReviewer;
use daophot::{PhotometryPipeline, PipelineConfig, PipelineReport};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// DAOPHOT/ALLSTAR photometry pipeline
#[derive(Parser, Debug)]
#[command(name = "daophot_run")]
#[command(about = "Run DAOPHOT and ALLSTAR over FITS images")]
#[command(version)]
struct Args {
    /// Images to reduce
    images: Vec<PathBuf>,

    /// Directory holding the daophot and allstar executables (default: PATH)
    #[arg(long)]
    dao_dir: Option<PathBuf>,

    /// FIND detection threshold in sigma
    #[arg(long)]
    threshold: Option<f64>,

    /// Directory receiving the artifacts of every image
    #[arg(long, default_value = ".")]
    outdir: PathBuf,

    /// Skip DAOPHOT and run ALLSTAR on this prepared image (its .psf and .ap must exist)
    #[arg(long, value_name = "IMAGE")]
    allstar_only: Option<PathBuf>,

    /// JSON pipeline configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Review every PSF candidate at the terminal
    #[arg(long)]
    interactive: bool,

    /// Do not refit after rejecting stars
    #[arg(long)]
    no_clean_pass: bool,

    /// Echo the tool transcripts
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dao_dir) = &args.dao_dir {
        config.dao_dir = dao_dir.clone();
    }
    if let Some(threshold) = args.threshold {
        config.daophot.threshold = Some(threshold);
    }
    if args.no_clean_pass {
        config.clean_pass = false;
    }
    if args.verbose {
        config.verbose = true;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn summarize(report: &PipelineReport) {
    match &report.allstar {
        AllstarStatus::Ran(outcome) => info!(
            "{}: ALLSTAR {:?}, {} stars rejected, clean pass {:?}, {} files saved",
            report.image.display(),
            outcome,
            report.rejected.len(),
            report.clean_pass,
            report.saved.len()
        ),
        AllstarStatus::Skipped(reason) => warn!(
            "{}: ALLSTAR skipped ({}), {} files saved",
            report.image.display(),
            reason,
            report.saved.len()
        ),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.images.is_empty() && args.allstar_only.is_none() {
        bail!("no images given");
    }

    let config = load_config(&args)?;
    let launcher = ProcessLauncher::from_config(&config);
    let mut pipeline = PhotometryPipeline::new(config, launcher, FitsImageIo)?;
    if args.interactive {
        pipeline = pipeline.with_reviewer(Box::new(TerminalReviewer::stdio()));
    }

    if let Some(prepared) = &args.allstar_only {
        let report = pipeline.run_allstar_only(prepared, &args.outdir)?;
        summarize(&report);
        return Ok(());
    }

    let mut failed = 0;
    for image in &args.images {
        match pipeline.run(image, &args.outdir) {
            Ok(report) => summarize(&report),
            Err(e) => {
                error!("{}: {e}", image.display());
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} images failed", args.images.len());
    }
    Ok(())
}
