//! Byte-level plumbing for driving an interactive child program.
//!
//! The layers mirror how a human would operate a prompt-oriented tool:
//!
//! - [`ProcessChannel`] owns the child and moves raw bytes in and out of it
//!   under a timeout.
//! - [`PromptSession`] accumulates output until one of several expected
//!   prompts shows up, and writes the scripted answer.
//! - [`ScriptedTransport`] replays a canned transcript so the layers above can
//!   be exercised without spawning anything.
//!
//! Everything above the channel talks to the [`Transport`] trait, never to
//! the child directly.

mod channel;
mod script;
mod session;

use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

pub use channel::{ChannelConfig, ProcessChannel};
pub use script::ScriptedTransport;
pub use session::{find_prompt, LeadingMatch, PromptMatch, PromptSession, Wait};

/// Errors raised while moving bytes to and from the child process.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The child program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The child exited; nothing more can be read from or written to it.
    #[error("process died ({status})")]
    ProcessDied { status: String },

    /// A write kept failing with transient errors until the retry budget ran out.
    #[error("write failed after {attempts} attempts: {source}")]
    WriteRetryExhausted {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Any other I/O failure on the pipes.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    pub(crate) fn died(status: Option<ExitStatus>) -> Self {
        let status = match status {
            Some(status) => status.to_string(),
            None => "exit status unknown".to_string(),
        };
        ChannelError::ProcessDied { status }
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// A bidirectional byte stream to an interactive program.
///
/// Implemented by [`ProcessChannel`] for real children and by
/// [`ScriptedTransport`] for deterministic tests.
pub trait Transport {
    /// Collect whatever output arrives within `timeout`. May be empty.
    fn read_available(&mut self, timeout: Duration) -> ChannelResult<Vec<u8>>;

    /// Write `bytes`, retrying transient failures up to `max_retries` times.
    fn write(&mut self, bytes: &[u8], max_retries: u32) -> ChannelResult<()>;

    /// Wait up to `grace` for the peer to finish on its own, then tear it down.
    fn shutdown(&mut self, _grace: Duration) -> ChannelResult<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_available(&mut self, timeout: Duration) -> ChannelResult<Vec<u8>> {
        (**self).read_available(timeout)
    }

    fn write(&mut self, bytes: &[u8], max_retries: u32) -> ChannelResult<()> {
        (**self).write(bytes, max_retries)
    }

    fn shutdown(&mut self, grace: Duration) -> ChannelResult<()> {
        (**self).shutdown(grace)
    }
}
