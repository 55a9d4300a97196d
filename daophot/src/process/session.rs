//! "Write a line, wait for a prompt" on top of a [`Transport`].

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::{ChannelResult, Transport};

/// Default number of attempts for a single write.
pub const DEFAULT_WRITE_RETRIES: u32 = 3;

/// How long [`PromptSession::read_until`] keeps collecting output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Give up after this long and report no match.
    For(Duration),
    /// Keep reading until a prompt shows up or the process dies.
    Indefinitely,
}

impl Wait {
    /// Seconds-based constructor; a negative (or unrepresentable) value means
    /// [`Wait::Indefinitely`].
    pub fn from_secs_f64(seconds: f64) -> Self {
        Duration::try_from_secs_f64(seconds)
            .map(Wait::For)
            .unwrap_or(Wait::Indefinitely)
    }

    fn expired(self, started: Instant) -> bool {
        match self {
            Wait::For(limit) => started.elapsed() >= limit,
            Wait::Indefinitely => false,
        }
    }
}

/// Whether a prompt found at the very first byte of the accumulated output counts.
///
/// The legacy driver only accepted matches at a position greater than zero, so
/// output that *starts* with the prompt text is not recognised until the next
/// call. `Ignore` keeps that behaviour; `Accept` matches anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeadingMatch {
    #[default]
    Ignore,
    Accept,
}

/// Outcome of waiting for a set of prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMatch {
    /// Everything read while waiting, including the prompt itself.
    pub output: String,
    /// Index into the candidate list, or `None` if the wait expired first.
    pub matched: Option<usize>,
}

impl PromptMatch {
    /// True if the wait ended without seeing any candidate.
    pub fn timed_out(&self) -> bool {
        self.matched.is_none()
    }
}

/// Locate the first candidate prompt in `text`.
///
/// Candidates are tried in list order and the first one present wins, even if
/// a later candidate occurs earlier in the text. Only the first occurrence of
/// each candidate is considered. Returns `(candidate index, byte position)`.
///
/// ```
/// use daophot::process::{find_prompt, LeadingMatch};
///
/// let hit = find_prompt("abcPROMPT_Xdef", &["PROMPT_X", "PROMPT_Y"], LeadingMatch::Ignore);
/// assert_eq!(hit, Some((0, 3)));
/// assert_eq!(find_prompt("PROMPT_X", &["PROMPT_X"], LeadingMatch::Ignore), None);
/// ```
pub fn find_prompt(text: &str, prompts: &[&str], leading: LeadingMatch) -> Option<(usize, usize)> {
    prompts.iter().enumerate().find_map(|(index, prompt)| {
        text.find(prompt)
            .filter(|&position| position > 0 || leading == LeadingMatch::Accept)
            .map(|position| (index, position))
    })
}

/// Prompt-matching wrapper around a transport.
///
/// Holds no protocol state of its own: text read past a matched prompt within
/// the same call is returned in [`PromptMatch::output`] and then forgotten.
/// Callers that wait in several windows keep their own buffer and use
/// [`resume_until`](Self::resume_until).
pub struct PromptSession<T: Transport> {
    transport: T,
    read_timeout: Duration,
    write_retries: u32,
    leading: LeadingMatch,
}

impl<T: Transport> PromptSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            read_timeout: Duration::from_millis(100),
            write_retries: DEFAULT_WRITE_RETRIES,
            leading: LeadingMatch::default(),
        }
    }

    /// Window used for each underlying read.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_leading_match(mut self, leading: LeadingMatch) -> Self {
        self.leading = leading;
        self
    }

    pub fn leading_match(&self) -> LeadingMatch {
        self.leading
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Write `text` verbatim; callers include the trailing newline.
    pub fn send(&mut self, text: &str) -> ChannelResult<()> {
        debug!("send: {:?}", text.trim_end());
        self.transport.write(text.as_bytes(), self.write_retries)
    }

    /// Read until one of `prompts` appears or `wait` expires.
    pub fn read_until(&mut self, prompts: &[&str], wait: Wait) -> ChannelResult<PromptMatch> {
        let mut bytes = Vec::new();
        let matched = self.resume_until(&mut bytes, prompts, wait)?;
        Ok(PromptMatch {
            output: String::from_utf8_lossy(&bytes).into_owned(),
            matched,
        })
    }

    /// [`read_until`](Self::read_until) over output already collected in
    /// `buffer`. New output is appended and matching covers the whole buffer,
    /// so a prompt split across several waits is still found.
    pub fn resume_until(
        &mut self,
        buffer: &mut Vec<u8>,
        prompts: &[&str],
        wait: Wait,
    ) -> ChannelResult<Option<usize>> {
        let leading = self.leading;
        let mut matched = None;
        self.read_into(buffer, wait, |output| {
            matched = find_prompt(output, prompts, leading).map(|(index, _)| index);
            matched.is_some()
        })?;
        match matched {
            Some(index) => trace!("matched prompt {:?}", prompts[index]),
            None => trace!("no prompt of {:?} yet", prompts),
        }
        Ok(matched)
    }

    /// Append output to `buffer` until `done` accepts the accumulated text or
    /// `wait` expires. `done` sees the whole buffer after every non-empty read.
    pub fn read_into(
        &mut self,
        buffer: &mut Vec<u8>,
        wait: Wait,
        mut done: impl FnMut(&str) -> bool,
    ) -> ChannelResult<bool> {
        let started = Instant::now();
        while !wait.expired(started) {
            let chunk = self.transport.read_available(self.read_timeout)?;
            if chunk.is_empty() {
                continue;
            }
            buffer.extend_from_slice(&chunk);
            if done(&String::from_utf8_lossy(buffer)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// [`send`](Self::send) followed by [`read_until`](Self::read_until).
    pub fn send_and_await(
        &mut self,
        text: &str,
        prompts: &[&str],
        wait: Wait,
    ) -> ChannelResult<PromptMatch> {
        self.send(text)?;
        self.read_until(prompts, wait)
    }
}
