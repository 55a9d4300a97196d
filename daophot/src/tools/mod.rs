//! Scripted dialogues with the DAOPHOT and ALLSTAR programs.
//!
//! [`Daophot`] walks one interactive DAOPHOT session through its commands in
//! order; [`Allstar`] runs the single ALLSTAR dialogue. Both speak through a
//! [`PromptSession`] and thread a [`RunArtifacts`] value through every step
//! that creates or consumes a file.

mod allstar;
mod artifacts;
mod daophot;
mod options;

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::process::{ChannelError, PromptMatch, PromptSession, Transport, Wait};

pub use allstar::{Allstar, AllstarOutcome, AllstarPass};
pub use artifacts::{clobber, FileRole, RunArtifacts};
pub use daophot::{
    AutomaticReviewer, CandidatePrompt, CandidateReviewer, Daophot, DaophotState, PsfOutcome,
    TerminalReviewer,
};
pub use options::{
    AllstarOptions, ConfigError, DaophotOptions, FindOptions, PhotOptions, PickOptions,
    APERTURE_KEYS, MAX_APERTURES,
};

/// The tool's main prompt, shown whenever a command has completed.
pub const COMMAND_PROMPT: &str = "Command:";

/// Errors from driving a tool dialogue.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// None of the expected prompts appeared within the step's budget.
    #[error("timed out after {waited:?} waiting for {expected:?}")]
    PromptTimeout {
        expected: Vec<String>,
        waited: Duration,
    },

    /// A step was requested out of order.
    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: String,
    },

    #[error("invalid options: {0}")]
    Config(#[from] ConfigError),

    /// Clobbering an output file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tool dialogues.
pub type DriverResult<T> = Result<T, DriverError>;

/// Time limits for tool dialogues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Window of a single transport read.
    pub read: Duration,
    /// Window of a single prompt wait; waits are retried until their budget runs out.
    pub prompt: Duration,
    /// Budget for prompts that follow quick steps.
    pub step: Duration,
    /// Budget for prompts after PHOT and PICK, which scale with the star count.
    pub long_running: Duration,
    /// Budget for the whole PSF candidate loop.
    pub psf_budget: Duration,
    /// How long an exiting tool gets before it is killed.
    pub shutdown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_millis(100),
            prompt: Duration::from_secs(1),
            step: Duration::from_secs(30),
            long_running: Duration::from_secs(600),
            psf_budget: Duration::from_secs(1800),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Wait for one of `prompts`, retrying prompt-sized waits until `budget` is spent.
///
/// Output is kept across the retries, so a prompt that arrives in pieces
/// still matches.
pub(crate) fn expect<T: Transport>(
    session: &mut PromptSession<T>,
    prompts: &[&str],
    timeouts: &Timeouts,
    budget: Duration,
) -> DriverResult<PromptMatch> {
    let started = Instant::now();
    let mut buffer = Vec::new();
    loop {
        let matched = session.resume_until(&mut buffer, prompts, Wait::For(timeouts.prompt))?;
        if matched.is_some() {
            return Ok(PromptMatch {
                output: String::from_utf8_lossy(&buffer).into_owned(),
                matched,
            });
        }
        if started.elapsed() >= budget {
            return Err(timed_out(prompts, started));
        }
        debug!("still waiting for {:?} after {:?}", prompts, started.elapsed());
    }
}

pub(crate) fn timed_out(prompts: &[&str], started: Instant) -> DriverError {
    DriverError::PromptTimeout {
        expected: prompts.iter().map(|p| p.to_string()).collect(),
        waited: started.elapsed(),
    }
}

/// Send `line` and wait for `prompt` within the step budget.
pub(crate) fn exchange<T: Transport>(
    session: &mut PromptSession<T>,
    line: &str,
    prompt: &str,
    timeouts: &Timeouts,
) -> DriverResult<PromptMatch> {
    session.send(line)?;
    expect(session, &[prompt], timeouts, timeouts.step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ScriptedTransport;

    pub(crate) fn fast_timeouts() -> Timeouts {
        Timeouts {
            read: Duration::from_millis(1),
            prompt: Duration::from_millis(10),
            step: Duration::from_millis(40),
            long_running: Duration::from_millis(40),
            psf_budget: Duration::from_millis(60),
            shutdown_grace: Duration::ZERO,
        }
    }

    #[test]
    fn test_expect_gives_up_after_budget() {
        let timeouts = fast_timeouts();
        let mut session = PromptSession::new(ScriptedTransport::new(" busy"))
            .with_read_timeout(timeouts.read);

        let result = expect(&mut session, &["Command:"], &timeouts, timeouts.step);
        match result {
            Err(DriverError::PromptTimeout { expected, waited }) => {
                assert_eq!(expected, vec!["Command:".to_string()]);
                assert!(waited >= timeouts.step);
            }
            other => panic!("expected PromptTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_expect_keeps_output_between_waits() {
        let timeouts = Timeouts {
            step: Duration::from_millis(200),
            ..fast_timeouts()
        };
        let transport = ScriptedTransport::new("")
            .later(Duration::from_millis(5), "\n Comm")
            .later(Duration::from_millis(35), "and: ");
        let mut session = PromptSession::new(transport).with_read_timeout(timeouts.read);

        let found = expect(&mut session, &[COMMAND_PROMPT], &timeouts, timeouts.step).unwrap();
        assert_eq!(found.matched, Some(0));
        assert_eq!(found.output, "\n Command: ");
    }

    #[test]
    fn test_expect_matches_prompt_starting_a_later_wait() {
        let timeouts = Timeouts {
            step: Duration::from_millis(200),
            ..fast_timeouts()
        };
        let transport = ScriptedTransport::new("\n Sky value...")
            .later(Duration::from_millis(35), "Command: ");
        let mut session = PromptSession::new(transport).with_read_timeout(timeouts.read);

        let found = expect(&mut session, &[COMMAND_PROMPT], &timeouts, timeouts.step).unwrap();
        assert_eq!(found.output, "\n Sky value...Command: ");
    }

    #[test]
    fn test_exchange_sends_then_waits() {
        let timeouts = fast_timeouts();
        let transport = ScriptedTransport::new("").reply("\n Command: ");
        let mut session = PromptSession::new(transport).with_read_timeout(timeouts.read);

        let found = exchange(&mut session, "SKY\n", COMMAND_PROMPT, &timeouts).unwrap();
        assert_eq!(found.matched, Some(0));
        assert_eq!(session.transport().writes(), &["SKY\n".to_string()]);
    }
}
