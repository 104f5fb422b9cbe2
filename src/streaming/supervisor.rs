//! Subprocess supervisor
//!
//! Runs one transcoder/demuxer process per invocation and exposes its
//! stdout as a chunked byte source plus a typed event stream. The
//! supervisor makes no policy decisions: it never retries and never picks
//! URLs — classified failures are reported upward and acted on by the
//! resilience controller.
//!
//! Stop semantics: soft-terminate first (the transcoder's `q` quit command
//! on stdin), then hard-kill after the grace period. `stop()` returns only
//! after the OS has reaped the pid, and `Exited` is emitted only after
//! stdout has been fully drained.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::errors::SupervisorError;
use crate::streaming::stderr_classifier::{StderrErrorKind, classify_stderr_line};
use crate::utils::UrlUtils;

/// Placeholder substituted with the resolved upstream URL in arg templates.
pub const URL_PLACEHOLDER: &str = "[URL]";

/// The spawn-to-`Started` path is bounded by this watchdog; an OS that
/// cannot fork and exec the transcoder inside it fails the invocation.
pub const START_REPORT_DEADLINE: Duration = Duration::from_secs(2);

/// Typed events emitted by a supervised process.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Started {
        pid: u32,
    },
    StderrLine {
        text: String,
    },
    ClassifiedError {
        kind: StderrErrorKind,
        text: String,
    },
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
        /// Set when the process died without ever producing a stdout byte
        failed_to_start: bool,
    },
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Transcoder binary to invoke
    pub command: String,
    /// Stdout read size upper bound; chunk boundaries are the natural
    /// read sizes, so this is also the fan-out chunking
    pub chunk_bytes: usize,
    /// Extra args spliced before the input arg for HLS upstreams
    pub hls_protocol_args: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: crate::config::defaults::DEFAULT_TRANSCODER_COMMAND.to_string(),
            chunk_bytes: crate::config::defaults::DEFAULT_CHUNK_BYTES,
            hls_protocol_args: Vec::new(),
        }
    }
}

/// Factory for supervised processes; holds the pieces every invocation
/// shares (binary name, chunking, HLS arg splice).
#[derive(Clone)]
pub struct Supervisor {
    config: SupervisorConfig,
}

enum Control {
    Stop {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running transcoder invocation.
pub struct SupervisedProcess {
    pid: u32,
    /// Stdout, chunked at natural read sizes
    bytes: mpsc::Receiver<bytes::Bytes>,
    /// Typed lifecycle and stderr events
    events: mpsc::UnboundedReceiver<SupervisorEvent>,
    control: mpsc::Sender<Control>,
    produced_output: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// Substitute the URL placeholder and splice HLS protocol args before
    /// the input argument when the upstream is an HLS playlist.
    pub fn render_args(
        &self,
        template: &[String],
        upstream_url: &str,
    ) -> Result<Vec<String>, SupervisorError> {
        if !template.iter().any(|a| a == URL_PLACEHOLDER) {
            return Err(SupervisorError::BadTemplate(template.join(" ")));
        }

        let is_hls = {
            let path = UrlUtils::strip_query_and_fragment(upstream_url).to_ascii_lowercase();
            path.ends_with(".m3u8") || path.ends_with(".m3u")
        };

        let mut args = Vec::with_capacity(template.len() + self.config.hls_protocol_args.len());
        for arg in template {
            if arg == URL_PLACEHOLDER {
                if is_hls {
                    // The splice lands immediately before the input URL so
                    // it scopes to the input, not the output muxer.
                    let input_flag_at = args.len().checked_sub(1);
                    if let Some(idx) = input_flag_at {
                        if args[idx] == "-i" {
                            let flag = args.pop();
                            args.extend(self.config.hls_protocol_args.iter().cloned());
                            if let Some(flag) = flag {
                                args.push(flag);
                            }
                        } else {
                            args.extend(self.config.hls_protocol_args.iter().cloned());
                        }
                    } else {
                        args.extend(self.config.hls_protocol_args.iter().cloned());
                    }
                }
                args.push(upstream_url.to_string());
            } else {
                args.push(arg.clone());
            }
        }
        Ok(args)
    }

    /// Spawn one transcoder invocation.
    ///
    /// The spawn-to-`Started` path runs under the
    /// [`START_REPORT_DEADLINE`] watchdog: `Started{pid}` is emitted as
    /// soon as the OS has forked and exec'd the child, and a spawn that
    /// does not complete inside the window fails the invocation with
    /// [`SupervisorError::StartupTimeout`]. Spawn failures of any kind
    /// are fatal to this invocation and returned as errors, never as
    /// events.
    pub async fn spawn(
        &self,
        template: &[String],
        upstream_url: &str,
        env_overrides: &[(String, String)],
    ) -> Result<SupervisedProcess, SupervisorError> {
        let args = self.render_args(template, upstream_url)?;

        debug!(
            command = %self.config.command,
            url = %UrlUtils::obfuscate_credentials(upstream_url),
            "spawning transcoder"
        );

        let mut cmd = TokioCommand::new(&self.config.command);
        cmd.args(&args);
        cmd.envs(env_overrides.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // fork+exec is a blocking syscall; run it off the reactor so the
        // startup watchdog can actually fire on a wedged system. A child
        // that materializes after the deadline is dropped and reaped via
        // kill_on_drop.
        let command_name = self.config.command.clone();
        let spawned = tokio::time::timeout(
            START_REPORT_DEADLINE,
            tokio::task::spawn_blocking(move || {
                let mut cmd = cmd;
                cmd.spawn()
            }),
        )
        .await;

        let mut child = match spawned {
            Ok(Ok(Ok(child))) => child,
            Ok(Ok(Err(e))) => {
                return Err(SupervisorError::SpawnFailed(format!("{command_name}: {e}")));
            }
            Ok(Err(join_error)) => {
                return Err(SupervisorError::SpawnFailed(format!(
                    "{command_name}: spawn task failed: {join_error}"
                )));
            }
            Err(_) => {
                warn!(
                    command = %command_name,
                    deadline = ?START_REPORT_DEADLINE,
                    "transcoder failed to start within the report deadline"
                );
                return Err(SupervisorError::StartupTimeout(START_REPORT_DEADLINE));
            }
        };

        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::SpawnFailed("child has no pid".to_string()))?;

        let (bytes_tx, bytes_rx) = mpsc::channel::<bytes::Bytes>(32);
        let (events_tx, events_rx) = mpsc::unbounded_channel::<SupervisorEvent>();
        let (control_tx, mut control_rx) = mpsc::channel::<Control>(4);

        let produced_output = Arc::new(AtomicBool::new(false));

        let _ = events_tx.send(SupervisorEvent::Started { pid });
        info!(pid, command = %self.config.command, "transcoder started");

        // Stdout pump: natural-read-size chunks into the byte channel.
        let stdout = child.stdout.take().ok_or_else(|| {
            SupervisorError::SpawnFailed("child stdout not captured".to_string())
        })?;
        let stdout_task = {
            let produced = produced_output.clone();
            let chunk_bytes = self.config.chunk_bytes;
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                let mut buf = vec![0u8; chunk_bytes];
                loop {
                    match reader.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            produced.store(true, Ordering::Release);
                            let chunk = bytes::Bytes::copy_from_slice(&buf[..n]);
                            if bytes_tx.send(chunk).await.is_err() {
                                // Receiver gone; keep draining so the
                                // child never blocks on a full pipe.
                                let mut sink = reader;
                                let mut scratch = buf;
                                while matches!(sink.read(&mut scratch).await, Ok(n) if n > 0) {}
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(pid, error = %e, "stdout read ended");
                            break;
                        }
                    }
                }
            })
        };

        // Stderr watch: every line is forwarded, failures additionally
        // produce a classified event.
        let stderr = child.stderr.take().ok_or_else(|| {
            SupervisorError::SpawnFailed("child stderr not captured".to_string())
        })?;
        let stderr_task = {
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(kind) = classify_stderr_line(&line) {
                        warn!(pid, %kind, text = %line, "transcoder error");
                        let _ = events_tx.send(SupervisorEvent::ClassifiedError {
                            kind,
                            text: line.clone(),
                        });
                    }
                    let _ = events_tx.send(SupervisorEvent::StderrLine { text: line });
                }
            })
        };

        let stdin = child.stdin.take();

        // Monitor task: owns the child, answers stop requests, and emits
        // Exited only after the stdout pump has drained.
        {
            let events_tx = events_tx.clone();
            let produced = produced_output.clone();
            tokio::spawn(async move {
                let mut stdin = stdin;
                let mut stop_done: Option<oneshot::Sender<()>> = None;

                let status = tokio::select! {
                    status = child.wait() => status,
                    ctl = control_rx.recv() => match ctl {
                        Some(Control::Stop { grace, done }) => {
                            stop_done = Some(done);
                            // Soft-terminate: the transcoder's interactive
                            // quit, then escalate after the grace period.
                            if let Some(mut pipe) = stdin.take() {
                                let _ = pipe.write_all(b"q\n").await;
                                let _ = pipe.shutdown().await;
                            }
                            match tokio::time::timeout(grace, child.wait()).await {
                                Ok(status) => status,
                                Err(_) => {
                                    warn!(pid, "soft-terminate grace elapsed, killing transcoder");
                                    let _ = child.kill().await;
                                    child.wait().await
                                }
                            }
                        }
                        None => {
                            // Every handle dropped without an explicit
                            // stop; reap rather than leak the child.
                            let _ = child.kill().await;
                            child.wait().await
                        }
                    },
                };

                // Drain stdout completely before reporting the exit, so
                // no bytes are lost behind the Exited event. The stderr
                // task is not awaited: it ends on its own at pipe EOF and
                // must not gate the exit report when its channel is full.
                let _ = stdout_task.await;
                drop(stderr_task);

                let (code, signal) = match &status {
                    Ok(status) => (status.code(), exit_signal(status)),
                    Err(e) => {
                        error!(pid, error = %e, "failed to reap transcoder");
                        (None, None)
                    }
                };

                let failed_to_start = !produced.load(Ordering::Acquire);
                info!(pid, ?code, ?signal, failed_to_start, "transcoder exited");
                let _ = events_tx.send(SupervisorEvent::Exited {
                    code,
                    signal,
                    failed_to_start,
                });

                if let Some(done) = stop_done {
                    let _ = done.send(());
                }
            });
        }

        Ok(SupervisedProcess {
            pid,
            bytes: bytes_rx,
            events: events_rx,
            control: control_tx,
            produced_output,
        })
    }
}

impl SupervisedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_produced_output(&self) -> bool {
        self.produced_output.load(Ordering::Acquire)
    }

    /// Next stdout chunk; `None` once the process has exited and stdout
    /// is drained.
    pub async fn next_chunk(&mut self) -> Option<bytes::Bytes> {
        self.bytes.recv().await
    }

    /// Next lifecycle/stderr event.
    pub async fn next_event(&mut self) -> Option<SupervisorEvent> {
        self.events.recv().await
    }

    /// Split the byte and event channels for use in a select loop.
    pub fn split_channels(
        &mut self,
    ) -> (
        &mut mpsc::Receiver<bytes::Bytes>,
        &mut mpsc::UnboundedReceiver<SupervisorEvent>,
    ) {
        (&mut self.bytes, &mut self.events)
    }

    /// Soft-terminate then hard-kill. Returns once the pid is reaped.
    pub async fn stop(&mut self, grace: Duration) {
        // Nobody drains stdout once a stop is requested; closing the byte
        // channel fails any blocked send so the pump task can run to pipe
        // EOF instead of wedging the reap.
        self.bytes.close();
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .control
            .send(Control::Stop {
                grace,
                done: done_tx,
            })
            .await
            .is_ok()
        {
            // The monitor drops the sender if the child already exited on
            // its own, which is success for our purposes.
            let _ = done_rx.await;
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_supervisor() -> Supervisor {
        Supervisor::new(SupervisorConfig {
            command: "sh".to_string(),
            chunk_bytes: 4096,
            hls_protocol_args: Vec::new(),
        })
    }

    fn sh_template(script: &str) -> Vec<String> {
        // The URL placeholder lands in $0 so scripts can ignore it.
        vec!["-c".to_string(), script.to_string(), URL_PLACEHOLDER.to_string()]
    }

    #[test]
    fn render_args_substitutes_placeholder() {
        let supervisor = Supervisor::new(SupervisorConfig {
            command: "ffmpeg".into(),
            chunk_bytes: 65536,
            hls_protocol_args: vec!["-allowed_extensions".into(), "ALL".into()],
        });
        let template: Vec<String> = ["-i", "[URL]", "-c", "copy", "-f", "mpegts", "pipe:1"]
            .map(String::from)
            .to_vec();

        let plain = supervisor
            .render_args(&template, "http://host/feed.ts")
            .unwrap();
        assert_eq!(plain, vec!["-i", "http://host/feed.ts", "-c", "copy", "-f", "mpegts", "pipe:1"]);

        let hls = supervisor
            .render_args(&template, "http://host/live.m3u8?token=x")
            .unwrap();
        assert_eq!(
            hls,
            vec![
                "-allowed_extensions",
                "ALL",
                "-i",
                "http://host/live.m3u8?token=x",
                "-c",
                "copy",
                "-f",
                "mpegts",
                "pipe:1"
            ]
        );
    }

    #[test]
    fn render_args_rejects_template_without_placeholder() {
        let supervisor = sh_supervisor();
        let template: Vec<String> = ["-i", "fixed"].map(String::from).to_vec();
        assert!(matches!(
            supervisor.render_args(&template, "http://x"),
            Err(SupervisorError::BadTemplate(_))
        ));
    }

    #[tokio::test]
    async fn spawn_reports_started_streams_stdout_then_exits() {
        let supervisor = sh_supervisor();
        let mut process = supervisor
            .spawn(&sh_template("printf 'hello-bytes'"), "http://unused", &[])
            .await
            .unwrap();

        match process.next_event().await {
            Some(SupervisorEvent::Started { pid }) => assert!(pid > 0),
            other => panic!("expected Started, got {other:?}"),
        }

        let mut collected = Vec::new();
        while let Some(chunk) = process.next_chunk().await {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"hello-bytes");

        // Exited arrives after stdout is fully drained.
        loop {
            match process.next_event().await {
                Some(SupervisorEvent::Exited {
                    code,
                    failed_to_start,
                    ..
                }) => {
                    assert_eq!(code, Some(0));
                    assert!(!failed_to_start);
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed before Exited"),
            }
        }
    }

    #[tokio::test]
    async fn stderr_failures_are_classified() {
        let supervisor = sh_supervisor();
        let mut process = supervisor
            .spawn(
                &sh_template("echo 'Connection timed out' >&2; exit 1"),
                "http://unused",
                &[],
            )
            .await
            .unwrap();

        let mut saw_classified = false;
        let mut saw_exit_failure = false;
        while let Some(event) = process.next_event().await {
            match event {
                SupervisorEvent::ClassifiedError { kind, .. } => {
                    assert_eq!(kind, StderrErrorKind::NetworkTimeout);
                    saw_classified = true;
                }
                SupervisorEvent::Exited {
                    code,
                    failed_to_start,
                    ..
                } => {
                    assert_eq!(code, Some(1));
                    assert!(failed_to_start);
                    saw_exit_failure = true;
                }
                _ => {}
            }
        }
        assert!(saw_classified);
        assert!(saw_exit_failure);
    }

    #[tokio::test]
    async fn stop_reaps_a_long_running_child() {
        let supervisor = sh_supervisor();
        let mut process = supervisor
            .spawn(&sh_template("sleep 30"), "http://unused", &[])
            .await
            .unwrap();

        // sh ignores the soft quit byte; the grace timeout escalates to a
        // hard kill and stop() still returns promptly.
        process.stop(Duration::from_millis(100)).await;

        loop {
            match process.next_event().await {
                Some(SupervisorEvent::Exited { .. }) => break,
                Some(_) => continue,
                None => panic!("event channel closed before Exited"),
            }
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_not_an_event() {
        let supervisor = Supervisor::new(SupervisorConfig {
            command: "definitely-not-a-real-binary-xyz".to_string(),
            chunk_bytes: 4096,
            hls_protocol_args: Vec::new(),
        });
        let result = supervisor
            .spawn(&sh_template("true"), "http://unused", &[])
            .await;
        assert!(matches!(result, Err(SupervisorError::SpawnFailed(_))));
    }
}
