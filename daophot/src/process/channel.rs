//! Child process ownership and timed byte I/O.
//!
//! The child's stdout is drained by a pump thread that forwards every chunk
//! the pipe yields, without waiting for line ends, so a prompt that is not
//! newline-terminated still reaches the reader. Stderr is drained into the
//! log so the child can never block on a full pipe.

use std::ffi::OsStr;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, trace, warn};

use super::{ChannelError, ChannelResult, Transport};

/// Pause between write attempts after a transient failure.
const WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// Largest chunk the stdout pump hands over at once.
const PUMP_CHUNK: usize = 256;

/// Polling interval while waiting for a child to exit during shutdown.
const EXIT_POLL: Duration = Duration::from_millis(10);

/// Tuning for a [`ProcessChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Echo the full transcript at `info` level instead of `trace`.
    pub verbose: bool,
    /// Pause after every successful write.
    pub send_delay: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            send_delay: Duration::ZERO,
        }
    }
}

/// A spawned child process with piped stdin/stdout.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use daophot::process::{ChannelConfig, ProcessChannel, Transport};
///
/// let mut channel = ProcessChannel::spawn("cat", ["-u"], ChannelConfig::default())?;
/// channel.write(b"hello\n", 3)?;
/// let echoed = channel.read_available(Duration::from_millis(200))?;
/// # Ok::<(), daophot::process::ChannelError>(())
/// ```
pub struct ProcessChannel {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    output: Receiver<Vec<u8>>,
    config: ChannelConfig,
}

impl ProcessChannel {
    /// Start `program` with `args`, capturing all three standard streams.
    pub fn spawn<I, S>(program: &str, args: I, config: ChannelConfig) -> ChannelResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ChannelError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            ChannelError::Io(std::io::Error::new(
                ErrorKind::BrokenPipe,
                "child stdout was not captured",
            ))
        })?;

        let (sender, output) = crossbeam_channel::unbounded();
        thread::Builder::new()
            .name("child-stdout".to_string())
            .spawn(move || pump(stdout, sender))?;

        if let Some(stderr) = child.stderr.take() {
            let name = program.to_string();
            thread::Builder::new()
                .name("child-stderr".to_string())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        debug!(target: "stderr", "{name}: {line}");
                    }
                })?;
        }

        debug!("Spawned {} (pid {})", program, child.id());

        Ok(Self {
            program: program.to_string(),
            child,
            stdin,
            output,
            config,
        })
    }

    fn echo(&self, direction: &str, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(bytes);
        if self.config.verbose {
            info!(target: "transcript", "{} {}: {}", self.program, direction, text);
        } else {
            trace!("{} {}: {:?}", self.program, direction, text);
        }
    }
}

fn pump<R: Read>(mut source: R, sink: Sender<Vec<u8>>) {
    let mut buf = [0u8; PUMP_CHUNK];
    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if sink.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                trace!("stdout pump stopped: {e}");
                break;
            }
        }
    }
}

fn is_transient(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

/// Write and flush `bytes`, retrying transient failures up to `max_retries`
/// attempts in total with `backoff` between them. A closed pipe means the
/// reader is gone and is reported as [`ChannelError::ProcessDied`].
fn write_with_retries<W: Write>(
    writer: &mut W,
    bytes: &[u8],
    max_retries: u32,
    backoff: Duration,
) -> ChannelResult<()> {
    let allowed = max_retries.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match writer.write_all(bytes).and_then(|_| writer.flush()) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => return Err(ChannelError::died(None)),
            Err(e) if is_transient(&e) && attempts < allowed => {
                warn!("Write failed (attempt {attempts} of {allowed}): {e}");
                thread::sleep(backoff);
            }
            Err(e) if is_transient(&e) => {
                return Err(ChannelError::WriteRetryExhausted {
                    attempts,
                    source: e,
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
}

impl Transport for ProcessChannel {
    /// Gather output for the whole `timeout` window.
    ///
    /// Output the child produced before exiting is still returned; once the
    /// child has exited and nothing is left, [`ChannelError::ProcessDied`].
    fn read_available(&mut self, timeout: Duration) -> ChannelResult<Vec<u8>> {
        let exited = self.child.try_wait()?;

        let mut output: Vec<u8> = self.output.try_iter().flatten().collect();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.output.recv_timeout(remaining) {
                Ok(chunk) => output.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if output.is_empty() {
            if let Some(status) = exited {
                return Err(ChannelError::died(Some(status)));
            }
        }

        self.echo("recv", &output);
        Ok(output)
    }

    fn write(&mut self, bytes: &[u8], max_retries: u32) -> ChannelResult<()> {
        if let Some(status) = self.child.try_wait()? {
            return Err(ChannelError::died(Some(status)));
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ChannelError::died(None));
        };

        match write_with_retries(stdin, bytes, max_retries, WRITE_BACKOFF) {
            Err(ChannelError::ProcessDied { .. }) => {
                return Err(ChannelError::died(self.child.try_wait().ok().flatten()));
            }
            result => result?,
        }

        self.echo("send", bytes);
        if !self.config.send_delay.is_zero() {
            thread::sleep(self.config.send_delay);
        }
        Ok(())
    }

    /// Close stdin, give the child `grace` to exit, then kill it.
    fn shutdown(&mut self, grace: Duration) -> ChannelResult<()> {
        self.stdin.take();
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait()? {
                debug!("{} exited: {}", self.program, status);
                return Ok(());
            }
            thread::sleep(EXIT_POLL);
        }
        warn!("{} still running after {:?}, killing", self.program, grace);
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            debug!("Killing {} on drop", self.program);
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod retry_tests {
    use super::*;

    /// Fails every write with `kind`, counting the attempts.
    struct FailingWriter {
        kind: ErrorKind,
        attempts: u32,
    }

    impl FailingWriter {
        fn new(kind: ErrorKind) -> Self {
            Self { kind, attempts: 0 }
        }
    }

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            self.attempts += 1;
            Err(self.kind.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Fails the first `failures` writes with `WouldBlock`.
    struct FlakyWriter {
        failures: u32,
        written: Vec<u8>,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(ErrorKind::WouldBlock.into());
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_transient_failures_exhaust_retries() {
        let mut writer = FailingWriter::new(ErrorKind::WouldBlock);
        let result = write_with_retries(&mut writer, b"SKY\n", 3, Duration::ZERO);

        match result {
            Err(ChannelError::WriteRetryExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.kind(), ErrorKind::WouldBlock);
            }
            other => panic!("expected WriteRetryExhausted, got {other:?}"),
        }
        assert_eq!(writer.attempts, 3);
    }

    #[test]
    fn test_zero_retries_still_tries_once() {
        let mut writer = FailingWriter::new(ErrorKind::TimedOut);
        let result = write_with_retries(&mut writer, b"x", 0, Duration::ZERO);
        assert!(matches!(
            result,
            Err(ChannelError::WriteRetryExhausted { attempts: 1, .. })
        ));
        assert_eq!(writer.attempts, 1);
    }

    #[test]
    fn test_recovers_before_retries_run_out() {
        let mut writer = FlakyWriter {
            failures: 2,
            written: Vec::new(),
        };
        write_with_retries(&mut writer, b"PHOT\n", 3, Duration::ZERO).unwrap();
        assert_eq!(writer.written, b"PHOT\n");
    }

    #[test]
    fn test_broken_pipe_is_process_death() {
        let mut writer = FailingWriter::new(ErrorKind::BrokenPipe);
        let result = write_with_retries(&mut writer, b"EXIT\n", 3, Duration::ZERO);
        assert!(matches!(result, Err(ChannelError::ProcessDied { .. })));
        assert_eq!(writer.attempts, 1);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let mut writer = FailingWriter::new(ErrorKind::PermissionDenied);
        let result = write_with_retries(&mut writer, b"x", 3, Duration::ZERO);
        assert!(matches!(result, Err(ChannelError::Io(_))));
        assert_eq!(writer.attempts, 1);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn config() -> ChannelConfig {
        ChannelConfig::default()
    }

    fn read_until_death(channel: &mut ProcessChannel) -> (Vec<u8>, bool) {
        let mut output = Vec::new();
        for _ in 0..100 {
            match channel.read_available(Duration::from_millis(50)) {
                Ok(bytes) => output.extend(bytes),
                Err(ChannelError::ProcessDied { .. }) => return (output, true),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        (output, false)
    }

    #[test]
    fn test_echo_through_cat() {
        let mut channel = ProcessChannel::spawn("cat", Vec::<&str>::new(), config()).unwrap();
        channel.write(b"hello\n", 3).unwrap();

        let mut output = Vec::new();
        for _ in 0..40 {
            output.extend(channel.read_available(Duration::from_millis(50)).unwrap());
            if output.ends_with(b"hello\n") {
                break;
            }
        }
        assert_eq!(output, b"hello\n");
    }

    #[test]
    fn test_partial_prompt_without_newline_is_delivered() {
        let mut channel =
            ProcessChannel::spawn("sh", ["-c", "printf 'Command: '; sleep 2"], config()).unwrap();

        let mut output = Vec::new();
        for _ in 0..40 {
            output.extend(channel.read_available(Duration::from_millis(50)).unwrap());
            if !output.is_empty() {
                break;
            }
        }
        assert_eq!(output, b"Command: ");
    }

    #[test]
    fn test_spawn_missing_program() {
        let result = ProcessChannel::spawn("/nonexistent/daophot", Vec::<&str>::new(), config());
        assert!(matches!(result, Err(ChannelError::Spawn { .. })));
    }

    #[test]
    fn test_output_before_exit_is_kept() {
        let mut channel = ProcessChannel::spawn("sh", ["-c", "printf bye"], config()).unwrap();
        let (output, died) = read_until_death(&mut channel);
        assert!(died);
        assert_eq!(output, b"bye");
    }

    #[test]
    fn test_write_after_exit_reports_death() {
        let mut channel = ProcessChannel::spawn("true", Vec::<&str>::new(), config()).unwrap();
        let (_, died) = read_until_death(&mut channel);
        assert!(died);

        let result = channel.write(b"EXIT\n", 3);
        assert!(matches!(result, Err(ChannelError::ProcessDied { .. })));
    }

    #[test]
    fn test_shutdown_lets_cat_finish() {
        let mut channel = ProcessChannel::spawn("cat", Vec::<&str>::new(), config()).unwrap();
        channel.shutdown(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            channel.read_available(Duration::from_millis(10)),
            Err(ChannelError::ProcessDied { .. })
        ));
    }
}
