//! One image through DAOPHOT, ALLSTAR and the clean second pass.
//!
//! ```text
//! prepare ─► DAOPHOT (attach … psf) ─► converged? ─no─► report, skip ALLSTAR
//!                                          │yes
//!                                          ▼
//!                      ALLSTAR ─► validity check ─► rejects? ─► .cleanap ─► ALLSTAR
//! ```
//!
//! The working image lives in the pipeline's work directory and names every
//! artifact of the run; the artifacts are copied into `<out_dir>/<image stem>/`
//! at the end. A run that fails after the working image exists still copies
//! whatever it produced before returning its error.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::image::{Image, ImageError, ImageIo};
use crate::process::{
    ChannelConfig, ChannelError, ChannelResult, ProcessChannel, PromptSession, Transport,
};
use crate::table::{FitResultTable, PhotometryTable, TableError};
use crate::tools::{
    Allstar, AllstarOutcome, AllstarPass, AutomaticReviewer, CandidateReviewer, ConfigError,
    Daophot, DriverError, FileRole, PsfOutcome, RunArtifacts, Timeouts,
};
use crate::validity::{rejected_ids, NoiseModel, StarValidator, ValidityError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("cannot launch {tool}: {source}")]
    Launch {
        tool: Tool,
        #[source]
        source: ChannelError,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("validity check aborted: {0}")]
    Table(#[from] TableError),

    #[error(transparent)]
    Validity(#[from] ValidityError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{} is required but does not exist", .0.display())]
    MissingArtifact(PathBuf),

    #[error("cannot save artifacts to {}: {source}", dir.display())]
    Save {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for pipeline runs.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// The external programs the pipeline drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Daophot,
    Allstar,
}

impl Tool {
    pub fn program(self) -> &'static str {
        match self {
            Tool::Daophot => "daophot",
            Tool::Allstar => "allstar",
        }
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

/// Starts a fresh tool process for each session.
pub trait ToolLauncher {
    fn launch(&mut self, tool: Tool) -> ChannelResult<Box<dyn Transport>>;
}

/// Launches the real executables from a directory (or `PATH`).
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    dao_dir: PathBuf,
    channel: ChannelConfig,
}

impl ProcessLauncher {
    pub fn new(dao_dir: impl Into<PathBuf>, channel: ChannelConfig) -> Self {
        Self {
            dao_dir: dao_dir.into(),
            channel,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        let channel = ChannelConfig {
            verbose: config.verbose,
            send_delay: config.send_delay(),
        };
        Self::new(&config.dao_dir, channel)
    }

    /// Path of `tool`'s executable.
    pub fn program_path(&self, tool: Tool) -> PathBuf {
        if self.dao_dir.as_os_str().is_empty() {
            PathBuf::from(tool.program())
        } else {
            self.dao_dir.join(tool.program())
        }
    }
}

impl ToolLauncher for ProcessLauncher {
    fn launch(&mut self, tool: Tool) -> ChannelResult<Box<dyn Transport>> {
        let program = self.program_path(tool);
        let channel = ProcessChannel::spawn(
            &program.to_string_lossy(),
            Vec::<&str>::new(),
            self.channel.clone(),
        )?;
        Ok(Box::new(channel))
    }
}

/// Whether ALLSTAR ran, and how it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllstarStatus {
    Ran(AllstarOutcome),
    Skipped(String),
}

/// What happened to one image.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub image: PathBuf,
    pub working_image: PathBuf,
    /// `None` when DAOPHOT was not run.
    pub psf: Option<PsfOutcome>,
    pub allstar: AllstarStatus,
    /// Stars dropped by the validity check.
    pub rejected: BTreeSet<u32>,
    /// Outcome of the refit without rejected stars, if it ran.
    pub clean_pass: Option<AllstarOutcome>,
    pub artifacts: RunArtifacts,
    /// Files copied into the output directory.
    pub saved: Vec<PathBuf>,
}

/// Gain and read noise of the image being reduced.
#[derive(Debug, Clone, Copy)]
struct Detector {
    gain: f64,
    read_noise: f64,
}

/// Drives the tools over one image at a time.
pub struct PhotometryPipeline<L, I> {
    config: PipelineConfig,
    timeouts: Timeouts,
    launcher: L,
    images: I,
    reviewer: Box<dyn CandidateReviewer>,
    work_dir: PathBuf,
}

impl<L: ToolLauncher, I: ImageIo> PhotometryPipeline<L, I> {
    pub fn new(config: PipelineConfig, launcher: L, images: I) -> PipelineResult<Self> {
        config.validate()?;
        let timeouts = config.timeouts.to_timeouts()?;
        Ok(Self {
            config,
            timeouts,
            launcher,
            images,
            reviewer: Box::new(AutomaticReviewer),
            work_dir: std::env::temp_dir(),
        })
    }

    pub fn with_reviewer(mut self, reviewer: Box<dyn CandidateReviewer>) -> Self {
        self.reviewer = reviewer;
        self
    }

    /// Directory for the working image and every artifact of a run.
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn images(&self) -> &I {
        &self.images
    }

    /// The image the tools work on for this process.
    pub fn working_image(&self) -> PathBuf {
        self.work_dir
            .join(format!("pid{}.fits", std::process::id()))
    }

    /// Full reduction of `image`; artifacts end up in `<out_dir>/<stem>/`.
    pub fn run(&mut self, image: &Path, out_dir: &Path) -> PipelineResult<PipelineReport> {
        info!("Reducing {}", image.display());
        let (prepared, detector) = self.prepare(image)?;
        let working = self.working_image();
        let mut artifacts = RunArtifacts::for_image(&working);

        let outcome = match self.run_daophot(&working, detector, &mut artifacts) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.salvage(image, out_dir, &artifacts, e)),
        };
        let mut report = PipelineReport {
            image: image.to_path_buf(),
            working_image: working.clone(),
            psf: Some(outcome),
            allstar: AllstarStatus::Skipped("PSF fit failed to converge".to_string()),
            rejected: BTreeSet::new(),
            clean_pass: None,
            artifacts,
            saved: Vec::new(),
        };

        if outcome.is_converged() {
            if let Err(e) = self.fit_and_clean(&working, &prepared, detector, &mut report) {
                return Err(self.salvage(image, out_dir, &report.artifacts, e));
            }
        } else {
            warn!("Skipping ALLSTAR for {}: PSF fit failed to converge", image.display());
        }

        self.save(image, out_dir, &mut report)?;
        Ok(report)
    }

    /// ALLSTAR (and the clean pass) on an image that DAOPHOT already reduced.
    ///
    /// The image's `.psf` and `.ap` files must exist beside it.
    pub fn run_allstar_only(
        &mut self,
        prepared_image: &Path,
        out_dir: &Path,
    ) -> PipelineResult<PipelineReport> {
        info!("Running ALLSTAR only on {}", prepared_image.display());
        let artifacts = RunArtifacts::for_image(prepared_image)
            .assign_default(FileRole::Psf)
            .assign_default(FileRole::Ap);
        for role in [FileRole::Psf, FileRole::Ap] {
            let path = artifacts.resolve(role);
            if !path.exists() {
                return Err(PipelineError::MissingArtifact(path));
            }
        }

        let prepared = self.images.open_image(prepared_image)?;
        let detector = self.detector(&prepared);
        let mut report = PipelineReport {
            image: prepared_image.to_path_buf(),
            working_image: prepared_image.to_path_buf(),
            psf: None,
            allstar: AllstarStatus::Skipped("not run".to_string()),
            rejected: BTreeSet::new(),
            clean_pass: None,
            artifacts,
            saved: Vec::new(),
        };

        if let Err(e) = self.fit_and_clean(prepared_image, &prepared, detector, &mut report) {
            return Err(self.salvage(prepared_image, out_dir, &report.artifacts, e));
        }
        self.save(prepared_image, out_dir, &mut report)?;
        Ok(report)
    }

    fn detector(&self, image: &Image) -> Detector {
        Detector {
            gain: self.config.gain_for(image.gain()),
            read_noise: self.config.read_noise_for(image.read_noise()),
        }
    }

    /// Load `image`, mask it with its weight map, rescale it and write the
    /// working copy.
    fn prepare(&mut self, image: &Path) -> PipelineResult<(Image, Detector)> {
        let mut prepared = self.images.open_image(image)?;
        let detector = self.detector(&prepared);

        match self.images.read_weight_mask(image)? {
            Some(weights) => {
                prepared.apply_weights(weights.view())?;
                info!("Applied weight map to {}", image.display());
            }
            None => info!("No weight map for {}", image.display()),
        }
        prepared.rescale(self.config.prescale, self.config.add_sky);

        let working = self.working_image();
        self.images.write_image(&working, &prepared)?;
        info!(
            "Working image {} (gain {:.2}, read noise {:.2})",
            working.display(),
            detector.gain,
            detector.read_noise
        );
        Ok((prepared, detector))
    }

    fn launch(&mut self, tool: Tool) -> PipelineResult<PromptSession<Box<dyn Transport>>> {
        let transport = self
            .launcher
            .launch(tool)
            .map_err(|source| PipelineError::Launch { tool, source })?;
        Ok(PromptSession::new(transport)
            .with_read_timeout(self.timeouts.read)
            .with_leading_match(self.config.leading_match()))
    }

    /// Every step's artifacts land in `artifacts` as soon as it completes, so
    /// a later failure still knows what was written.
    fn run_daophot(
        &mut self,
        working: &Path,
        detector: Detector,
        artifacts: &mut RunArtifacts,
    ) -> PipelineResult<PsfOutcome> {
        let session = self.launch(Tool::Daophot)?;
        let mut dao = Daophot::from_session(session, working, self.timeouts);

        dao.start(detector.read_noise, detector.gain)?;
        dao.attach()?;
        dao.set_options(&self.config.daophot)?;
        dao.sky()?;
        *artifacts = dao.find(&self.config.find, artifacts)?;
        *artifacts = dao.phot(&self.config.phot, artifacts)?;
        *artifacts = dao.pick(&self.config.pick, artifacts)?;
        let (outcome, fitted) = dao.psf(self.reviewer.as_mut(), artifacts)?;
        *artifacts = fitted;
        dao.exit()?;
        Ok(outcome)
    }

    fn run_allstar(
        &mut self,
        working: &Path,
        pass: AllstarPass,
        artifacts: &RunArtifacts,
    ) -> PipelineResult<(AllstarOutcome, RunArtifacts)> {
        let session = self.launch(Tool::Allstar)?;
        let mut allstar = Allstar::from_session(session, working, self.timeouts);
        Ok(allstar.run(&self.config.allstar, pass, artifacts)?)
    }

    fn fit_and_clean(
        &mut self,
        working: &Path,
        prepared: &Image,
        detector: Detector,
        report: &mut PipelineReport,
    ) -> PipelineResult<()> {
        let (outcome, artifacts) =
            self.run_allstar(working, AllstarPass::Initial, &report.artifacts)?;
        report.allstar = AllstarStatus::Ran(outcome);
        report.artifacts = artifacts;

        report.rejected = self.check_validity(prepared, detector, &report.artifacts)?;
        if report.rejected.is_empty() {
            info!("All fitted stars passed the validity check");
            return Ok(());
        }
        if !self.config.clean_pass {
            info!("{} stars rejected, clean pass disabled", report.rejected.len());
            return Ok(());
        }

        let photometry = PhotometryTable::read(report.artifacts.resolve(FileRole::Ap))?;
        let cleaned = photometry.remove_stars(&report.rejected);
        let artifacts = report.artifacts.assign_default(FileRole::CleanAp);
        cleaned.write(artifacts.resolve(FileRole::CleanAp))?;
        info!(
            "Refitting {} of {} stars without rejected ones",
            cleaned.len(),
            photometry.len()
        );

        let (outcome, artifacts) = self.run_allstar(working, AllstarPass::Cleaned, &artifacts)?;
        report.clean_pass = Some(outcome);
        report.artifacts = artifacts;
        Ok(())
    }

    fn check_validity(
        &self,
        prepared: &Image,
        detector: Detector,
        artifacts: &RunArtifacts,
    ) -> PipelineResult<BTreeSet<u32>> {
        let fits = FitResultTable::read(artifacts.resolve(FileRole::Als))?;
        let residual = self
            .images
            .open_image(&artifacts.resolve(FileRole::StarSub))?;

        let validator = StarValidator::new(
            NoiseModel::new(detector.gain, detector.read_noise),
            self.config.validity,
        );
        let verdicts = validator.check(prepared.data.view(), residual.data.view(), &fits.stars)?;
        let rejected = rejected_ids(&verdicts);
        info!(
            "Validity check: {} of {} stars rejected",
            rejected.len(),
            verdicts.len()
        );
        Ok(rejected)
    }

    /// Save what a failed run produced, then hand back its error.
    fn salvage(
        &self,
        image: &Path,
        out_dir: &Path,
        artifacts: &RunArtifacts,
        error: PipelineError,
    ) -> PipelineError {
        let dir = out_dir.join(image_stem(image));
        match artifacts.save_files(&dir) {
            Ok(saved) => warn!(
                "Run on {} failed, saved {} files to {}",
                image.display(),
                saved.len(),
                dir.display()
            ),
            Err(e) => warn!(
                "Run on {} failed and saving to {} failed too: {e}",
                image.display(),
                dir.display()
            ),
        }
        error
    }

    fn save(
        &self,
        image: &Path,
        out_dir: &Path,
        report: &mut PipelineReport,
    ) -> PipelineResult<()> {
        let dir = out_dir.join(image_stem(image));
        report.saved = report
            .artifacts
            .save_files(&dir)
            .map_err(|source| PipelineError::Save {
                dir: dir.clone(),
                source,
            })?;
        info!("Saved {} files to {}", report.saved.len(), dir.display());
        Ok(())
    }
}

/// File name of `image` without `.fits`.
fn image_stem(image: &Path) -> String {
    let name = image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    match name.strip_suffix(".fits") {
        Some(stem) => stem.to_string(),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_stem() {
        assert_eq!(image_stem(Path::new("/data/m31.fits")), "m31");
        assert_eq!(image_stem(Path::new("frame.fit")), "frame.fit");
    }

    #[test]
    fn test_program_path() {
        let launcher = ProcessLauncher::new("/opt/dao", ChannelConfig::default());
        assert_eq!(
            launcher.program_path(Tool::Allstar),
            PathBuf::from("/opt/dao/allstar")
        );
        let on_path = ProcessLauncher::new("", ChannelConfig::default());
        assert_eq!(on_path.program_path(Tool::Daophot), PathBuf::from("daophot"));
    }

    #[test]
    fn test_missing_program_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut launcher = ProcessLauncher::new(dir.path(), ChannelConfig::default());
        assert!(matches!(
            launcher.launch(Tool::Daophot),
            Err(ChannelError::Spawn { .. })
        ));
    }
}
