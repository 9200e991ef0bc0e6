//! Session and process control for post-image validation.
//!
//! A [`SessionHub`] wraps one materialized image and hands out named
//! [`Session`]s. Each session spawns child processes against the image root,
//! either through the image launcher or from an explicit [`LaunchSpec`].
//!
//! Every spawn immediately starts two dedicated reader threads, one per
//! standard stream, plus a monitor thread that reaps the exit status. Both
//! pipes drain concurrently from the start, so a child interleaving large
//! output on stdout and stderr can never deadlock against a full pipe
//! buffer. `stdout()`/`stderr()` block until the stream is fully captured;
//! `exit_code()` blocks until the child terminates. There is no implicit
//! timeout: callers needing a bounded wait attach a [`CancelToken`], which
//! stops the wait without touching the child.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::LinkError;
use crate::image::ExecutableImage;

/// How often a cancellable wait re-checks its token.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Cooperative cancellation handle for pending exit-code waits.
///
/// Cancelling stops the wait; it never terminates the child process, whose
/// lifecycle stays with the caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Launch descriptor for an arbitrary external command: program, arguments
/// and an optional working directory.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    program: PathBuf,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// One-line rendering for error messages.
    fn display_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Bare program names are resolved on PATH; anything with a path
    /// component is taken as-is.
    fn resolved_program(&self) -> Result<PathBuf, LinkError> {
        if self.program.components().count() > 1 || self.program.is_absolute() {
            return Ok(self.program.clone());
        }
        which::which(&self.program).map_err(|e| LinkError::Launch {
            command: self.display_line(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, e),
        })
    }
}

/// Scope for spawning processes against one image root.
///
/// Session names need not be unique; every [`SessionHub::new_session`] call
/// returns an independent handle. Closing (or dropping) a session releases
/// its hub bookkeeping and never terminates children spawned through it;
/// callers are expected to have drained them first.
#[derive(Debug)]
pub struct Session {
    id: u64,
    name: String,
    image: ExecutableImage,
    open: Arc<Mutex<BTreeMap<u64, String>>>,
}

impl Session {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the image launcher with `args` appended to the image's fixed
    /// launcher arguments, rooted at the image directory.
    pub fn new_image_process(
        &self,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<RunningProcess, LinkError> {
        let spec = LaunchSpec::new(self.image.launcher())
            .args(self.image.launcher_args().iter().cloned())
            .args(args)
            .current_dir(self.image.root());
        spawn_process(&spec)
    }

    /// Spawn an arbitrary external command. When the spec names no working
    /// directory, the image root is used.
    pub fn new_running_process(&self, spec: LaunchSpec) -> Result<RunningProcess, LinkError> {
        let spec = if spec.current_dir.is_none() {
            spec.current_dir(self.image.root())
        } else {
            spec
        };
        spawn_process(&spec)
    }

    /// Release the session's hub bookkeeping. Equivalent to dropping.
    pub fn close(self) {}
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.remove(&self.id);
    }
}

/// Controller handed to post-processors: owns the image handle and tracks
/// open sessions by name.
#[derive(Debug)]
pub struct SessionHub {
    image: ExecutableImage,
    next_id: AtomicU64,
    open: Arc<Mutex<BTreeMap<u64, String>>>,
}

impl SessionHub {
    pub fn new(image: ExecutableImage) -> Self {
        Self {
            image,
            next_id: AtomicU64::new(0),
            open: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn image(&self) -> &ExecutableImage {
        &self.image
    }

    pub fn new_session(&self, name: &str) -> Session {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.insert(id, name.to_string());
        Session {
            id,
            name: name.to_string(),
            image: self.image.clone(),
            open: Arc::clone(&self.open),
        }
    }

    /// Names of currently open sessions, in creation order.
    pub fn open_sessions(&self) -> Vec<String> {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.values().cloned().collect()
    }
}

/// Fully captured output of a drained child.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// One spawned child: both stream buffers and the exit gate.
#[derive(Debug)]
pub struct RunningProcess {
    command: String,
    stdout: StreamCapture,
    stderr: StreamCapture,
    exit: ExitGate,
}

impl RunningProcess {
    /// The command line this process was spawned from.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Block until stdout is fully drained, returning the whole stream.
    pub fn stdout(&self) -> Result<String, LinkError> {
        self.stdout.wait()
    }

    /// Block until stderr is fully drained, returning the whole stream.
    pub fn stderr(&self) -> Result<String, LinkError> {
        self.stderr.wait()
    }

    /// Block until the child terminates.
    pub fn exit_code(&self) -> Result<i32, LinkError> {
        self.exit.wait(None)
    }

    /// Non-blocking probe: `Ok(None)` while the child still runs.
    pub fn try_exit_code(&self) -> Result<Option<i32>, LinkError> {
        self.exit.try_wait()
    }

    /// Block until the child terminates or `cancel` fires. Cancellation
    /// reports a wait failure and leaves the child untouched; a later
    /// uncancelled wait still observes the real exit status.
    pub fn exit_code_cancellable(&self, cancel: &CancelToken) -> Result<i32, LinkError> {
        self.exit.wait(Some(cancel))
    }

    /// Drain both streams and join the exit status in one call.
    pub fn wait_drained(&self) -> Result<ProcessOutput, LinkError> {
        let stdout = self.stdout()?;
        let stderr = self.stderr()?;
        let exit_code = self.exit_code()?;
        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

fn spawn_process(spec: &LaunchSpec) -> Result<RunningProcess, LinkError> {
    let program = spec.resolved_program()?;
    let display = spec.display_line();

    let mut command = Command::new(&program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.current_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|source| LinkError::Launch {
        command: display.clone(),
        source,
    })?;

    let stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| LinkError::Io("child stdout pipe missing".to_string()))?;
    let stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| LinkError::Io("child stderr pipe missing".to_string()))?;

    // Both pipes drain from this point on; the monitor thread reaps the
    // child as soon as it exits.
    let stdout = StreamCapture::start("stdout", stdout_pipe);
    let stderr = StreamCapture::start("stderr", stderr_pipe);

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(child.wait());
    });

    Ok(RunningProcess {
        command: display,
        stdout,
        stderr,
        exit: ExitGate::new(rx),
    })
}

#[derive(Debug)]
struct StreamCapture {
    name: &'static str,
    inner: Mutex<CaptureInner>,
}

#[derive(Debug)]
struct CaptureInner {
    reader: Option<JoinHandle<std::io::Result<String>>>,
    result: Option<Result<String, String>>,
}

impl StreamCapture {
    fn start(name: &'static str, mut pipe: impl Read + Send + 'static) -> Self {
        let reader = thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).into_owned())
        });
        Self {
            name,
            inner: Mutex::new(CaptureInner {
                reader: Some(reader),
                result: None,
            }),
        }
    }

    fn wait(&self) -> Result<String, LinkError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(result) = &inner.result {
            return result.clone().map_err(LinkError::Io);
        }
        let result = match inner.reader.take() {
            Some(handle) => match handle.join() {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(e)) => Err(format!("reading child {}: {e}", self.name)),
                Err(_) => Err(format!("child {} reader thread panicked", self.name)),
            },
            None => Err(format!("child {} capture lost", self.name)),
        };
        inner.result = Some(result.clone());
        result.map_err(LinkError::Io)
    }
}

#[derive(Debug)]
struct ExitGate {
    inner: Mutex<ExitInner>,
}

#[derive(Debug)]
struct ExitInner {
    rx: Option<Receiver<std::io::Result<ExitStatus>>>,
    result: Option<Result<i32, String>>,
}

impl ExitGate {
    fn new(rx: Receiver<std::io::Result<ExitStatus>>) -> Self {
        Self {
            inner: Mutex::new(ExitInner {
                rx: Some(rx),
                result: None,
            }),
        }
    }

    fn wait(&self, cancel: Option<&CancelToken>) -> Result<i32, LinkError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(result) = &inner.result {
            return result.clone().map_err(LinkError::Wait);
        }
        let rx = match inner.rx.take() {
            Some(rx) => rx,
            None => return Err(LinkError::Wait("exit monitor lost".to_string())),
        };

        let status = match cancel {
            Some(token) => loop {
                if token.is_cancelled() {
                    // Put the receiver back: an uncancelled wait can still
                    // pick up the real status later.
                    inner.rx = Some(rx);
                    return Err(LinkError::Wait("wait cancelled".to_string()));
                }
                match rx.recv_timeout(CANCEL_POLL) {
                    Ok(status) => break status,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Self::finish(
                            &mut inner,
                            Err("exit monitor disconnected".to_string()),
                        );
                    }
                }
            },
            None => match rx.recv() {
                Ok(status) => status,
                Err(_) => {
                    return Self::finish(&mut inner, Err("exit monitor disconnected".to_string()));
                }
            },
        };

        let result = match status {
            Ok(status) => match status.code() {
                Some(code) => Ok(code),
                None => Err("child terminated by signal".to_string()),
            },
            Err(e) => Err(format!("waiting for child: {e}")),
        };
        Self::finish(&mut inner, result)
    }

    fn try_wait(&self) -> Result<Option<i32>, LinkError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(result) = &inner.result {
            return result.clone().map(Some).map_err(LinkError::Wait);
        }
        let rx = match inner.rx.take() {
            Some(rx) => rx,
            None => return Err(LinkError::Wait("exit monitor lost".to_string())),
        };
        match rx.try_recv() {
            Ok(Ok(status)) => {
                let result = match status.code() {
                    Some(code) => Ok(code),
                    None => Err("child terminated by signal".to_string()),
                };
                Self::finish(&mut inner, result).map(Some)
            }
            Ok(Err(e)) => {
                Self::finish(&mut inner, Err(format!("waiting for child: {e}"))).map(Some)
            }
            Err(TryRecvError::Empty) => {
                inner.rx = Some(rx);
                Ok(None)
            }
            Err(TryRecvError::Disconnected) => {
                Self::finish(&mut inner, Err("exit monitor disconnected".to_string())).map(Some)
            }
        }
    }

    fn finish(inner: &mut ExitInner, result: Result<i32, String>) -> Result<i32, LinkError> {
        inner.result = Some(result.clone());
        result.map_err(LinkError::Wait)
    }
}
