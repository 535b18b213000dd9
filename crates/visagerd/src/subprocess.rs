//! Out-of-process recognition backend.
//!
//! The recognizer runs as a persistent child process that keeps its model
//! warm between jobs and speaks newline-delimited JSON on stdin/stdout:
//!
//! ```text
//! <- {"ready": true, "model": "ArcFace"}            (once, at startup)
//! -> {"id": 1, "path": "/photos/Inbox/a.jpg"}
//! <- {"id": 1, "faces": [{"embedding": [...], "region": {...}, "confidence": 0.99}]}
//! <- {"id": 2, "error": "no_face"}
//! <- {"id": 3, "error": "cannot decode image"}
//! ```
//!
//! A child that exits, breaks protocol or overruns the job timeout is killed
//! and the job fails; the next job starts a fresh child. The child leads its
//! own process group and the whole group is killed, so a wrapper script
//! cannot leave the real recognizer running.

use serde::{Deserialize, Serialize};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use visager_core::{DetectError, FaceBackend, FaceObservation};

/// Error string a recognizer sends when the image holds no face.
const NO_FACE: &str = "no_face";

/// How long a child gets to exit after its stdin is closed.
const EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct Hello {
    ready: bool,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    path: &'a Path,
}

#[derive(Debug, Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    faces: Option<Vec<FaceObservation>>,
    #[serde(default)]
    error: Option<String>,
}

/// A running recognizer child.
struct Worker {
    child: Child,
    stdin: ChildStdin,
    /// Lines read from the child's stdout by a helper thread.
    lines: Receiver<std::io::Result<String>>,
}

impl Worker {
    fn kill(mut self) {
        kill_group(&mut self.child);
    }

    /// Close stdin and wait for the child to exit on its own, killing it if
    /// it lingers past the grace period.
    fn stop(self) {
        let Worker {
            mut child, stdin, ..
        } = self;
        drop(stdin);

        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(%status, "recognizer exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                _ => {
                    tracing::warn!("recognizer did not exit after stdin closed; killing");
                    kill_group(&mut child);
                    return;
                }
            }
        }
    }

    /// Reap the child after its stdout closed and describe how it ended.
    fn exit_description(mut self) -> String {
        // Stragglers the child left in its group.
        let _ = killpg(Pid::from_raw(self.child.id() as i32), Signal::SIGKILL);
        match self.child.wait() {
            Ok(status) => format!("recognizer exited ({status})"),
            Err(e) => format!("recognizer vanished: {e}"),
        }
    }
}

/// [`FaceBackend`] backed by a persistent recognizer child process.
pub struct SubprocessBackend {
    program: String,
    args: Vec<String>,
    expected_model: String,
    startup_timeout: Duration,
    job_timeout: Duration,
    worker: Option<Worker>,
    next_id: u64,
}

impl SubprocessBackend {
    /// `command` is the program followed by its arguments.
    pub fn new(
        command: &[String],
        expected_model: &str,
        startup_timeout: Duration,
        job_timeout: Duration,
    ) -> Result<Self, DetectError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| DetectError::Unavailable("empty recognizer command".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            expected_model: expected_model.to_string(),
            startup_timeout,
            job_timeout,
            worker: None,
            next_id: 0,
        })
    }

    fn spawn(&self) -> Result<Worker, DetectError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .map_err(|e| DetectError::Unavailable(format!("spawning {}: {e}", self.program)))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(DetectError::Unavailable("recognizer pipes unavailable".into()));
        };

        let (tx, lines) = mpsc::channel();
        std::thread::Builder::new()
            .name("visager-recognizer-out".into())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| DetectError::Unavailable(format!("spawning reader thread: {e}")))?;

        let worker = Worker {
            child,
            stdin,
            lines,
        };

        let hello = match read_line(&worker.lines, self.startup_timeout) {
            Ok(line) => serde_json::from_str::<Hello>(&line)
                .map_err(|e| DetectError::Unavailable(format!("bad handshake {line:?}: {e}"))),
            Err(LineError::Timeout) => Err(DetectError::Unavailable(format!(
                "no handshake within {:?}",
                self.startup_timeout
            ))),
            Err(LineError::Closed) => {
                let desc = worker.exit_description();
                return Err(DetectError::Unavailable(desc));
            }
        };

        let hello = match hello {
            Ok(h) if h.ready => h,
            Ok(h) => {
                worker.kill();
                return Err(DetectError::Unavailable(
                    h.error.unwrap_or_else(|| "recognizer reported not ready".into()),
                ));
            }
            Err(e) => {
                worker.kill();
                return Err(e);
            }
        };

        match hello.model.as_deref() {
            Some(model) if model != self.expected_model => tracing::warn!(
                reported = model,
                expected = %self.expected_model,
                "recognizer model differs from identity store model"
            ),
            _ => {}
        }
        tracing::info!(
            program = %self.program,
            pid = worker.child.id(),
            model = ?hello.model,
            "recognizer started"
        );
        Ok(worker)
    }

    fn ensure_worker(&mut self) -> Result<&mut Worker, DetectError> {
        if self.worker.is_none() {
            self.worker = Some(self.spawn()?);
        }
        self.worker
            .as_mut()
            .ok_or_else(|| DetectError::Unavailable("recognizer not running".into()))
    }

    fn exchange(&mut self, path: &Path) -> Result<Vec<FaceObservation>, DetectError> {
        self.next_id += 1;
        let id = self.next_id;
        let job_timeout = self.job_timeout;

        let mut line = serde_json::to_string(&Request { id, path })
            .map_err(|e| DetectError::Backend(format!("encoding request: {e}")))?;
        line.push('\n');

        let worker = self.ensure_worker()?;
        if let Err(e) = worker
            .stdin
            .write_all(line.as_bytes())
            .and_then(|()| worker.stdin.flush())
        {
            return Err(self.fail(DetectError::Crashed(format!("writing request: {e}"))));
        }

        let reply = match read_line(&worker.lines, job_timeout) {
            Ok(reply) => reply,
            Err(LineError::Timeout) => {
                return Err(self.fail(DetectError::TimedOut(job_timeout)));
            }
            Err(LineError::Closed) => {
                let desc = self
                    .worker
                    .take()
                    .map(Worker::exit_description)
                    .unwrap_or_default();
                return Err(DetectError::Crashed(desc));
            }
        };

        let response: Response = match serde_json::from_str(&reply) {
            Ok(r) => r,
            Err(e) => {
                return Err(self.fail(DetectError::Crashed(format!(
                    "unparseable reply {reply:?}: {e}"
                ))))
            }
        };
        if response.id != id {
            return Err(self.fail(DetectError::Crashed(format!(
                "reply for job {} while waiting for {id}",
                response.id
            ))));
        }

        match (response.faces, response.error) {
            (_, Some(err)) if err == NO_FACE => Err(DetectError::NoFace),
            (_, Some(err)) => Err(DetectError::Backend(err)),
            (Some(faces), None) => Ok(faces),
            (None, None) => Err(DetectError::Backend("reply carried neither faces nor error".into())),
        }
    }

    /// Kill the current child and pass the error through.
    fn fail(&mut self, err: DetectError) -> DetectError {
        tracing::error!(error = %err, "killing recognizer");
        if let Some(worker) = self.worker.take() {
            worker.kill();
        }
        err
    }
}

impl FaceBackend for SubprocessBackend {
    fn initialize(&mut self) -> Result<(), DetectError> {
        self.ensure_worker().map(|_| ())
    }

    fn is_ready(&self) -> bool {
        self.worker.is_some()
    }

    fn detect_faces(&mut self, path: &Path) -> Result<Vec<FaceObservation>, DetectError> {
        // Cheap header probe so unreadable files never reach the recognizer.
        let (width, height) = image::image_dimensions(path)
            .map_err(|e| DetectError::Backend(format!("unreadable image: {e}")))?;
        tracing::debug!(path = %path.display(), width, height, "sending to recognizer");

        self.exchange(path)
    }

    fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Drop for SubprocessBackend {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.kill();
        }
    }
}

/// SIGKILL the child's process group, falling back to the child alone, and
/// reap it.
fn kill_group(child: &mut Child) {
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        tracing::debug!(error = %e, "killpg failed; killing recognizer only");
        let _ = child.kill();
    }
    let _ = child.wait();
}

enum LineError {
    Timeout,
    Closed,
}

/// Next non-empty line from the child, within `timeout`.
fn read_line(lines: &Receiver<std::io::Result<String>>, timeout: Duration) -> Result<String, LineError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match lines.recv_timeout(remaining) {
            Ok(Ok(line)) if line.trim().is_empty() => continue,
            Ok(Ok(line)) => return Ok(line),
            Ok(Err(_)) | Err(RecvTimeoutError::Disconnected) => return Err(LineError::Closed),
            Err(RecvTimeoutError::Timeout) => return Err(LineError::Timeout),
        }
    }
}
