//! DAOPHOT session driver.
//!
//! A session moves strictly forward through
//! `Idle → Attached → Configured → SkyEstimated → SourcesFound →
//! PhotometryDone → CandidatesPicked → PsfFitted → Exited`. Steps may be
//! skipped (a run without `OPTION` is fine) but never repeated or reordered,
//! because each step consumes files the previous one wrote.
//!
//! # Example
//!
//! ```no_run
//! use daophot::process::{ChannelConfig, ProcessChannel};
//! use daophot::tools::*;
//!
//! let channel = ProcessChannel::spawn("daophot", Vec::<&str>::new(), ChannelConfig::default())?;
//! let mut dao = Daophot::new(channel, "/tmp/frame.fits", Timeouts::default());
//! dao.start(5.0, 1.3)?;
//! dao.attach()?;
//! dao.set_options(&DaophotOptions::default())?;
//! dao.sky()?;
//!
//! let artifacts = RunArtifacts::for_image("/tmp/frame.fits");
//! let artifacts = dao.find(&FindOptions::default(), &artifacts)?;
//! let artifacts = dao.phot(&PhotOptions::default(), &artifacts)?;
//! let artifacts = dao.pick(&PickOptions::default(), &artifacts)?;
//! let (outcome, artifacts) = dao.psf(&mut AutomaticReviewer, &artifacts)?;
//! dao.exit()?;
//! # Ok::<(), DriverError>(())
//! ```

use std::fmt;
use std::io::{BufRead, StdinLock, Stdout, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};

use super::artifacts::{clobber, FileRole, RunArtifacts};
use super::options::{option_line, DaophotOptions, FindOptions, PhotOptions, PickOptions};
use super::{
    exchange, expect, timed_out, DriverError, DriverResult, Timeouts, COMMAND_PROMPT,
};
use crate::process::{find_prompt, ChannelError, PromptMatch, PromptSession, Transport, Wait};

/// Questions DAOPHOT asks at start-up when its option file lacks a usable value.
const STARTUP_QUESTIONS: [&str; 2] = ["READ NOISE (ADU; 1 frame) =", "GAIN (e-/ADU; 1 frame) ="];

/// Printed right before each start-up question.
const REENTER_NOTICE: &str = "please re-enter";

const PARAMETER_FILE_PROMPT: &str = "File with parameters";
const OPTION_PROMPT: &str = "OPT>";

const FRAMES_PROMPT: &str = "Number of frames averaged, summed:";
const POSITIONS_FILE_PROMPT: &str = "File for positions";
const HAPPY_PROMPT: &str = "Are you happy with this?";

const APERTURE_FILE_PROMPT: &str = "File with aperture radii";
const PHOT_PROMPT: &str = "PHO>";
const INPUT_POSITIONS_PROMPT: &str = "Input position file";
const OUTPUT_FILE_PROMPT: &str = "Output file";

const PICK_INPUT_PROMPT: &str = "Input file name";
const PICK_COUNT_PROMPT: &str = "Desired number of stars, faintest magnitude:";
const PICK_OUTPUT_PROMPT: &str = "Output file name";

const AP_RESULTS_PROMPT: &str = "File with aperture results";
const PSF_STARS_PROMPT: &str = "File with PSF stars";
const PSF_FILE_PROMPT: &str = "File for the PSF";

/// Prompts of the PSF candidate loop, in match priority order.
const PSF_PROMPTS: [&str; 4] = [
    "Use this one?",
    "Try this one anyway?",
    "Failed to converge",
    "File with PSF stars and neighbors",
];

/// How a PSF fit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsfOutcome {
    Converged,
    FailedToConverge,
}

impl PsfOutcome {
    pub fn is_converged(self) -> bool {
        self == PsfOutcome::Converged
    }
}

/// Where a DAOPHOT session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaophotState {
    Idle,
    Attached,
    Configured,
    SkyEstimated,
    SourcesFound,
    PhotometryDone,
    CandidatesPicked,
    PsfFitted(PsfOutcome),
    Exited,
}

impl DaophotState {
    fn rank(self) -> u8 {
        match self {
            DaophotState::Idle => 0,
            DaophotState::Attached => 1,
            DaophotState::Configured => 2,
            DaophotState::SkyEstimated => 3,
            DaophotState::SourcesFound => 4,
            DaophotState::PhotometryDone => 5,
            DaophotState::CandidatesPicked => 6,
            DaophotState::PsfFitted(_) => 7,
            DaophotState::Exited => 8,
        }
    }
}

impl fmt::Display for DaophotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaophotState::Idle => write!(f, "idle"),
            DaophotState::Attached => write!(f, "attached"),
            DaophotState::Configured => write!(f, "configured"),
            DaophotState::SkyEstimated => write!(f, "sky estimated"),
            DaophotState::SourcesFound => write!(f, "sources found"),
            DaophotState::PhotometryDone => write!(f, "photometry done"),
            DaophotState::CandidatesPicked => write!(f, "candidates picked"),
            DaophotState::PsfFitted(PsfOutcome::Converged) => write!(f, "PSF converged"),
            DaophotState::PsfFitted(PsfOutcome::FailedToConverge) => write!(f, "PSF failed"),
            DaophotState::Exited => write!(f, "exited"),
        }
    }
}

/// The two questions DAOPHOT asks about a PSF candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePrompt {
    /// "Use this one?" for a candidate that looks fine.
    UseThisOne,
    /// "Try this one anyway?" for a candidate with a defect.
    TryAnyway,
}

/// Decides whether each PSF candidate is used.
pub trait CandidateReviewer {
    /// Answer, without the newline, for the candidate shown in `transcript`.
    fn review(&mut self, prompt: CandidatePrompt, transcript: &str) -> String;
}

/// Accepts clean candidates and rejects flagged ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutomaticReviewer;

impl CandidateReviewer for AutomaticReviewer {
    fn review(&mut self, prompt: CandidatePrompt, _transcript: &str) -> String {
        match prompt {
            CandidatePrompt::UseThisOne => "yes".to_string(),
            CandidatePrompt::TryAnyway => "no".to_string(),
        }
    }
}

/// Shows each candidate to an operator and relays their answer.
///
/// An empty answer or a closed input falls back to the automatic choice.
pub struct TerminalReviewer<R, W> {
    input: R,
    output: W,
}

impl TerminalReviewer<StdinLock<'static>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(std::io::stdin().lock(), std::io::stdout())
    }
}

impl<R: BufRead, W: Write> TerminalReviewer<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> CandidateReviewer for TerminalReviewer<R, W> {
    fn review(&mut self, prompt: CandidatePrompt, transcript: &str) -> String {
        let fallback = AutomaticReviewer.review(prompt, transcript);
        if write!(self.output, "{transcript}")
            .and_then(|_| self.output.flush())
            .is_err()
        {
            return fallback;
        }

        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) => fallback,
            Ok(_) if line.trim().is_empty() => fallback,
            Ok(_) => line.trim().to_string(),
            Err(e) => {
                warn!("Could not read candidate answer: {e}");
                fallback
            }
        }
    }
}

fn path_line(path: &Path) -> String {
    format!("{}\n", path.display())
}

/// The start-up question DAOPHOT is waiting on: a read-noise or gain prompt
/// after the re-enter notice with nothing printed after it. The same labels
/// in the option table never follow the notice.
fn pending_question(output: &str) -> Option<usize> {
    let (_, asked) = output.rsplit_once(REENTER_NOTICE)?;
    let asked = asked.trim_end();
    STARTUP_QUESTIONS
        .iter()
        .position(|question| asked.ends_with(question))
}

/// Pull the count out of PICK's "N suitable candidates were found." line.
fn candidates_found(output: &str) -> Option<usize> {
    output
        .lines()
        .find(|line| line.contains("suitable candidates"))
        .and_then(|line| line.split_whitespace().next())
        .and_then(|count| count.replace(',', "").parse().ok())
}

/// One interactive DAOPHOT session bound to one image.
pub struct Daophot<T: Transport> {
    session: PromptSession<T>,
    image: PathBuf,
    state: DaophotState,
    timeouts: Timeouts,
}

impl<T: Transport> Daophot<T> {
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
            state: DaophotState::Idle,
            timeouts,
        }
    }

    pub fn state(&self) -> DaophotState {
        self.state
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn session(&self) -> &PromptSession<T> {
        &self.session
    }

    pub fn into_session(self) -> PromptSession<T> {
        self.session
    }

    fn enter(&self, operation: &'static str, next: DaophotState) -> DriverResult<()> {
        if self.state == DaophotState::Exited || next.rank() <= self.state.rank() {
            return Err(DriverError::InvalidTransition {
                operation,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn send_expect(&mut self, line: &str, prompt: &str) -> DriverResult<PromptMatch> {
        exchange(&mut self.session, line, prompt, &self.timeouts)
    }

    fn send_expect_long(&mut self, line: &str, prompt: &str) -> DriverResult<PromptMatch> {
        self.session.send(line)?;
        expect(
            &mut self.session,
            &[prompt],
            &self.timeouts,
            self.timeouts.long_running,
        )
    }

    /// Get through the start-up banner to the first `Command:` prompt.
    ///
    /// Answers read noise and gain if the tool asks for them. The labels also
    /// appear in the option table DAOPHOT prints first, so only a label right
    /// after the re-enter notice counts as a question.
    pub fn start(&mut self, read_noise: f64, gain: f64) -> DriverResult<()> {
        if self.state != DaophotState::Idle {
            return Err(DriverError::InvalidTransition {
                operation: "start",
                state: self.state.to_string(),
            });
        }

        let leading = self.session.leading_match();
        let started = Instant::now();
        let mut buffer = Vec::new();
        loop {
            let mut question = None;
            let ready = self.session.read_into(
                &mut buffer,
                Wait::For(self.timeouts.prompt),
                |output| {
                    question = pending_question(output);
                    question.is_some()
                        || find_prompt(output, &[COMMAND_PROMPT], leading).is_some()
                },
            )?;
            match question {
                Some(index) => {
                    let value = if index == 0 { read_noise } else { gain };
                    self.session.send(&format!("{value:.2}\n"))?;
                    buffer.clear();
                }
                None if ready => {
                    debug!("DAOPHOT ready");
                    return Ok(());
                }
                None => {}
            }
            if started.elapsed() >= self.timeouts.step {
                let mut expected = vec![COMMAND_PROMPT];
                expected.extend(STARTUP_QUESTIONS);
                return Err(timed_out(&expected, started));
            }
        }
    }

    /// `ATTACH` the session's image.
    pub fn attach(&mut self) -> DriverResult<()> {
        self.enter("attach", DaophotState::Attached)?;
        let line = format!("ATTACH {}\n", self.image.display());
        self.send_expect(&line, COMMAND_PROMPT)?;
        info!("Attached {}", self.image.display());
        self.state = DaophotState::Attached;
        Ok(())
    }

    /// Enter every set option at the `OPT>` prompt.
    pub fn set_options(&mut self, options: &DaophotOptions) -> DriverResult<()> {
        options.validate()?;
        self.enter("set options", DaophotState::Configured)?;

        self.send_expect("OPTION\n", PARAMETER_FILE_PROMPT)?;
        self.send_expect("\n", OPTION_PROMPT)?;
        for (key, value) in options.entries() {
            self.send_expect(&option_line(key, value), OPTION_PROMPT)?;
        }
        self.send_expect("\n", COMMAND_PROMPT)?;

        self.state = DaophotState::Configured;
        Ok(())
    }

    /// Estimate the sky background.
    pub fn sky(&mut self) -> DriverResult<()> {
        self.enter("estimate the sky", DaophotState::SkyEstimated)?;
        self.send_expect_long("SKY\n", COMMAND_PROMPT)?;
        self.state = DaophotState::SkyEstimated;
        Ok(())
    }

    /// Detect sources into the `coo` file.
    pub fn find(
        &mut self,
        options: &FindOptions,
        artifacts: &RunArtifacts,
    ) -> DriverResult<RunArtifacts> {
        options.validate()?;
        self.enter("find sources", DaophotState::SourcesFound)?;

        self.send_expect("FIND\n", FRAMES_PROMPT)?;
        let frames = format!("{},{}\n", options.frames_averaged, options.frames_summed);
        self.send_expect(&frames, POSITIONS_FILE_PROMPT)?;

        let artifacts = artifacts.assign_default(FileRole::Coo);
        let coo = artifacts.resolve(FileRole::Coo);
        clobber(&coo)?;
        self.session.send(&path_line(&coo))?;

        // FIND's run time grows with frame size and source density and it
        // prints nothing to time out against until it is done.
        let summary = self.session.read_until(&[HAPPY_PROMPT], Wait::Indefinitely)?;
        debug!("FIND summary: {}", summary.output.trim());

        self.send_expect("yes\n", COMMAND_PROMPT)?;
        info!("Sources written to {}", coo.display());
        self.state = DaophotState::SourcesFound;
        Ok(artifacts)
    }

    /// Aperture photometry of the `coo` positions into the `ap` file.
    pub fn phot(
        &mut self,
        options: &PhotOptions,
        artifacts: &RunArtifacts,
    ) -> DriverResult<RunArtifacts> {
        options.validate()?;
        self.enter("run aperture photometry", DaophotState::PhotometryDone)?;

        self.send_expect("PHOT\n", APERTURE_FILE_PROMPT)?;
        self.send_expect("\n", PHOT_PROMPT)?;
        for (key, value) in options.entries() {
            self.send_expect(&option_line(key, value), PHOT_PROMPT)?;
        }
        self.send_expect("\n", INPUT_POSITIONS_PROMPT)?;
        self.send_expect(&path_line(&artifacts.resolve(FileRole::Coo)), OUTPUT_FILE_PROMPT)?;

        let artifacts = artifacts.assign_default(FileRole::Ap);
        let ap = artifacts.resolve(FileRole::Ap);
        clobber(&ap)?;
        self.send_expect_long(&path_line(&ap), COMMAND_PROMPT)?;

        info!("Aperture photometry written to {}", ap.display());
        self.state = DaophotState::PhotometryDone;
        Ok(artifacts)
    }

    /// Pick PSF candidates from the `ap` file into the `lst` file.
    pub fn pick(
        &mut self,
        options: &PickOptions,
        artifacts: &RunArtifacts,
    ) -> DriverResult<RunArtifacts> {
        options.validate()?;
        self.enter("pick PSF candidates", DaophotState::CandidatesPicked)?;

        self.send_expect("PICK\n", PICK_INPUT_PROMPT)?;
        self.send_expect(&path_line(&artifacts.resolve(FileRole::Ap)), PICK_COUNT_PROMPT)?;
        let count = format!("{},{}\n", options.stars, options.faintest_magnitude);
        self.send_expect(&count, PICK_OUTPUT_PROMPT)?;

        let artifacts = artifacts.assign_default(FileRole::Lst);
        let lst = artifacts.resolve(FileRole::Lst);
        clobber(&lst)?;
        let done = self.send_expect_long(&path_line(&lst), COMMAND_PROMPT)?;

        match candidates_found(&done.output) {
            Some(count) => info!("{count} PSF candidates written to {}", lst.display()),
            None => info!("PSF candidates written to {}", lst.display()),
        }
        self.state = DaophotState::CandidatesPicked;
        Ok(artifacts)
    }

    /// Fit the PSF model, reviewing each candidate star as DAOPHOT presents it.
    ///
    /// A fit that fails to converge is a normal outcome, not an error. The
    /// candidate loop is bounded by [`Timeouts::psf_budget`].
    pub fn psf(
        &mut self,
        reviewer: &mut dyn CandidateReviewer,
        artifacts: &RunArtifacts,
    ) -> DriverResult<(PsfOutcome, RunArtifacts)> {
        self.enter("fit the PSF", DaophotState::PsfFitted(PsfOutcome::Converged))?;

        self.send_expect("PSF\n", AP_RESULTS_PROMPT)?;
        self.send_expect(&path_line(&artifacts.resolve(FileRole::Ap)), PSF_STARS_PROMPT)?;
        self.send_expect(&path_line(&artifacts.resolve(FileRole::Lst)), PSF_FILE_PROMPT)?;

        let mut artifacts = artifacts.assign_default(FileRole::Psf);
        let psf = artifacts.resolve(FileRole::Psf);
        clobber(&psf)?;
        self.session.send(&path_line(&psf))?;

        let outcome = self.review_candidates(reviewer)?;
        if outcome.is_converged() {
            artifacts = artifacts.assign_default(FileRole::Nei);
            let nei = artifacts.resolve(FileRole::Nei);
            clobber(&nei)?;
            self.send_expect_long(&path_line(&nei), COMMAND_PROMPT)?;
            info!("PSF model written to {}", psf.display());
        } else {
            warn!("PSF fit for {} failed to converge", self.image.display());
        }

        self.state = DaophotState::PsfFitted(outcome);
        Ok((outcome, artifacts))
    }

    fn review_candidates(
        &mut self,
        reviewer: &mut dyn CandidateReviewer,
    ) -> DriverResult<PsfOutcome> {
        let started = Instant::now();
        let mut reviewed = 0usize;
        let mut buffer = Vec::new();
        loop {
            let matched = self.session.resume_until(
                &mut buffer,
                &PSF_PROMPTS,
                Wait::For(self.timeouts.prompt),
            )?;
            let prompt = match matched {
                Some(0) => Some(CandidatePrompt::UseThisOne),
                Some(1) => Some(CandidatePrompt::TryAnyway),
                Some(2) => return Ok(PsfOutcome::FailedToConverge),
                Some(_) => {
                    debug!("PSF converged after reviewing {reviewed} candidates");
                    return Ok(PsfOutcome::Converged);
                }
                None => None,
            };

            if let Some(prompt) = prompt {
                let transcript = String::from_utf8_lossy(&buffer).into_owned();
                let answer = reviewer.review(prompt, &transcript);
                debug!("Candidate {:?}: {}", prompt, answer);
                self.session.send(&format!("{answer}\n"))?;
                buffer.clear();
                reviewed += 1;
            }

            if started.elapsed() >= self.timeouts.psf_budget {
                return Err(timed_out(&PSF_PROMPTS, started));
            }
        }
    }

    /// Leave DAOPHOT and wait for the process to end.
    ///
    /// Allowed from any state; a child that already died is not an error here.
    pub fn exit(&mut self) -> DriverResult<()> {
        if self.state == DaophotState::Exited {
            return Ok(());
        }
        match self.session.send("EXIT\n") {
            Ok(()) | Err(ChannelError::ProcessDied { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.session
            .transport_mut()
            .shutdown(self.timeouts.shutdown_grace)?;
        self.state = DaophotState::Exited;
        Ok(())
    }
}
