//! Canned transcripts standing in for a live child process.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use super::{ChannelError, ChannelResult, Transport};

/// Longest a read on an empty script blocks, so timeouts still elapse.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Replays a scripted conversation: an opening banner, then one queued reply
/// released by each write.
///
/// Every write is recorded so tests can assert on exactly what the driver
/// sent and how much of the script it consumed.
///
/// ```
/// use std::time::Duration;
/// use daophot::process::{ScriptedTransport, Transport};
///
/// let mut transport = ScriptedTransport::new(" Command: ").reply(" OPT> ");
/// assert_eq!(transport.read_available(Duration::ZERO).unwrap(), b" Command: ");
/// transport.write(b"OPTION\n", 1).unwrap();
/// assert_eq!(transport.read_available(Duration::ZERO).unwrap(), b" OPT> ");
/// ```
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    pending: VecDeque<u8>,
    replies: VecDeque<String>,
    scheduled: VecDeque<(Instant, String)>,
    writes: Vec<String>,
    chunk_size: Option<usize>,
    exit_after_script: bool,
}

impl ScriptedTransport {
    /// Start with `banner` already waiting to be read.
    pub fn new(banner: &str) -> Self {
        Self {
            pending: banner.bytes().collect(),
            ..Default::default()
        }
    }

    /// Queue the output produced in response to the next unanswered write.
    pub fn reply(mut self, output: &str) -> Self {
        self.replies.push_back(output.to_string());
        self
    }

    /// Output that becomes readable `delay` from now, whatever the driver
    /// writes. Scheduled outputs are released in the order they were added.
    pub fn later(mut self, delay: Duration, output: &str) -> Self {
        self.scheduled
            .push_back((Instant::now() + delay, output.to_string()));
        self
    }

    /// Hand out at most `size` bytes per read.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    /// Behave like a process that exits once the script is used up.
    pub fn exit_after_script(mut self) -> Self {
        self.exit_after_script = true;
        self
    }

    /// Everything written so far, one entry per write.
    pub fn writes(&self) -> &[String] {
        &self.writes
    }

    /// Replies not yet released by a write.
    pub fn remaining_replies(&self) -> usize {
        self.replies.len()
    }

    fn exhausted(&self) -> bool {
        self.exit_after_script
            && self.pending.is_empty()
            && self.replies.is_empty()
            && self.scheduled.is_empty()
    }

    fn release_due(&mut self) {
        let now = Instant::now();
        while self.scheduled.front().is_some_and(|(due, _)| *due <= now) {
            if let Some((_, output)) = self.scheduled.pop_front() {
                self.pending.extend(output.bytes());
            }
        }
    }
}

impl Transport for ScriptedTransport {
    fn read_available(&mut self, timeout: Duration) -> ChannelResult<Vec<u8>> {
        self.release_due();
        if self.pending.is_empty() {
            if self.exhausted() {
                return Err(ChannelError::died(None));
            }
            thread::sleep(timeout.min(IDLE_SLEEP));
            return Ok(Vec::new());
        }
        let take = self
            .chunk_size
            .unwrap_or(self.pending.len())
            .min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }

    fn write(&mut self, bytes: &[u8], _max_retries: u32) -> ChannelResult<()> {
        if self.exhausted() {
            return Err(ChannelError::died(None));
        }
        self.writes.push(String::from_utf8_lossy(bytes).into_owned());
        if let Some(reply) = self.replies.pop_front() {
            self.pending.extend(reply.bytes());
        }
        Ok(())
    }
}
