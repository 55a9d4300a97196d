//! ALLSTAR session driver.
//!
//! ALLSTAR has a single dialogue: options, then five file names, then a fit
//! that runs until the tool says goodbye. A driver runs it once.

use std::path::{Path, PathBuf};

use tracing::info;

use super::artifacts::{clobber, FileRole, RunArtifacts};
use super::options::{option_line, AllstarOptions};
use super::{exchange, expect, DriverError, DriverResult, Timeouts};
use crate::process::{PromptSession, Transport, Wait};

const OPTION_PROMPT: &str = "OPT>";
const IMAGE_PROMPT: &str = "Input image name:";
const PSF_PROMPT: &str = "File with the PSF";
const INPUT_PROMPT: &str = "Input file";
const RESULTS_PROMPT: &str = "File for results";
const SUBTRACTED_PROMPT: &str = "Name for subtracted image";
const DONE_PROMPTS: [&str; 2] = ["Finished", "Good bye"];

/// Which photometry ALLSTAR fits and where its outputs go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllstarPass {
    /// Fit the full aperture photometry list.
    Initial,
    /// Refit after rejected stars were removed from the list.
    Cleaned,
}

impl AllstarPass {
    pub fn photometry(self) -> FileRole {
        match self {
            AllstarPass::Initial => FileRole::Ap,
            AllstarPass::Cleaned => FileRole::CleanAp,
        }
    }

    pub fn results(self) -> FileRole {
        match self {
            AllstarPass::Initial => FileRole::Als,
            AllstarPass::Cleaned => FileRole::CleanAls,
        }
    }

    pub fn subtracted(self) -> FileRole {
        match self {
            AllstarPass::Initial => FileRole::StarSub,
            AllstarPass::Cleaned => FileRole::CleanStarSub,
        }
    }
}

/// The closing message ALLSTAR printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllstarOutcome {
    Finished,
    GoodBye,
}

/// One ALLSTAR process fitting one image.
pub struct Allstar<T: Transport> {
    session: PromptSession<T>,
    image: PathBuf,
    timeouts: Timeouts,
    done: bool,
}

impl<T: Transport> Allstar<T> {
    pub fn new(transport: T, image: impl Into<PathBuf>, timeouts: Timeouts) -> Self {
        let session = PromptSession::new(transport).with_read_timeout(timeouts.read);
        Self::from_session(session, image, timeouts)
    }

    pub fn from_session(
        session: PromptSession<T>,
        image: impl Into<PathBuf>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            session,
            image: image.into(),
            timeouts,
            done: false,
        }
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn session(&self) -> &PromptSession<T> {
        &self.session
    }

    /// Fit every star of the pass's photometry file with the PSF model.
    ///
    /// Returns the artifacts with the pass's results and subtracted image
    /// bound. The child is shut down afterwards.
    pub fn run(
        &mut self,
        options: &AllstarOptions,
        pass: AllstarPass,
        artifacts: &RunArtifacts,
    ) -> DriverResult<(AllstarOutcome, RunArtifacts)> {
        options.validate()?;
        if self.done {
            return Err(DriverError::InvalidTransition {
                operation: "run ALLSTAR",
                state: "finished".to_string(),
            });
        }

        expect(
            &mut self.session,
            &[OPTION_PROMPT],
            &self.timeouts,
            self.timeouts.step,
        )?;
        for (key, value) in options.entries() {
            exchange(
                &mut self.session,
                &option_line(key, value),
                OPTION_PROMPT,
                &self.timeouts,
            )?;
        }
        exchange(&mut self.session, "\n", IMAGE_PROMPT, &self.timeouts)?;

        let image = format!("{}\n", self.image.display());
        exchange(&mut self.session, &image, PSF_PROMPT, &self.timeouts)?;
        let psf = path_line(&artifacts.resolve(FileRole::Psf));
        exchange(&mut self.session, &psf, INPUT_PROMPT, &self.timeouts)?;
        let photometry = path_line(&artifacts.resolve(pass.photometry()));
        exchange(&mut self.session, &photometry, RESULTS_PROMPT, &self.timeouts)?;

        let artifacts = artifacts
            .assign_default(pass.results())
            .assign_default(pass.subtracted());
        let results = artifacts.resolve(pass.results());
        clobber(&results)?;
        exchange(
            &mut self.session,
            &path_line(&results),
            SUBTRACTED_PROMPT,
            &self.timeouts,
        )?;

        let subtracted = artifacts.resolve(pass.subtracted());
        clobber(&subtracted)?;
        self.session.send(&path_line(&subtracted))?;

        // The fit scales with star count and crowding; ALLSTAR is silent
        // until it is done or dies.
        let closing = self
            .session
            .read_until(&DONE_PROMPTS, Wait::Indefinitely)?;
        let outcome = match closing.matched {
            Some(0) => AllstarOutcome::Finished,
            _ => AllstarOutcome::GoodBye,
        };
        self.done = true;
        self.session
            .transport_mut()
            .shutdown(self.timeouts.shutdown_grace)?;

        info!(
            "ALLSTAR {:?} pass on {} wrote {}",
            pass,
            self.image.display(),
            results.display()
        );
        Ok((outcome, artifacts))
    }
}

fn path_line(path: &Path) -> String {
    format!("{}\n", path.display())
}
