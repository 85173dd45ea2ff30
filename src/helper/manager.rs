//! Host helper session manager (spec §4.8).
//!
//! Owns the actor-like discipline spec §5 describes: one logical owner
//! (this struct, guarded by `parking_lot::Mutex`/`Condvar` per session)
//! mutates session state; the sidecar's event-reader thread (in
//! [`super::client::ControlClient`]) only posts work back onto it via
//! [`dispatch_event`]. Grounded on the old `HelperManager`'s state-enum,
//! start/stop, ping-based readiness-loop shape, adapted from a single forked
//! VM to many named process sessions multiplexed over one control socket.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ctrm_protocol::{ControlError, ControlEvent, ControlResponse, ErrorKind, ExecSpec, RequestMethod};
use parking_lot::{Condvar, Mutex};

use crate::config::SandboxPaths;
use crate::error::{Error, Result};

use super::client::{dial_vsock, ControlClient};
use super::launcher::{self, SidecarHandle};

/// Where a process session's output goes, and an optional mirror into a
/// persistent container log (spec §4.8: "also mirror into the container's
/// persistent log").
pub struct ProcessStdio {
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
    pub log: Option<Mutex<std::fs::File>>,
}

impl ProcessStdio {
    pub fn inherit() -> Self {
        Self { stdout: Box::new(std::io::stdout()), stderr: Box::new(std::io::stderr()), log: None }
    }
}

struct SessionState {
    stdio: ProcessStdio,
    exit_status: Option<i32>,
    last_agent_error: Option<String>,
    stdin_closed: bool,
}

struct Session {
    state: Mutex<SessionState>,
    condvar: Condvar,
}

/// One sandbox's host-side session table plus its sidecar control
/// connection (spec §4.8).
pub struct HostHelperManager {
    client: Arc<ControlClient>,
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    socket_path: PathBuf,
    sidecar: Mutex<Option<Child>>,
}

impl HostHelperManager {
    /// Launch a fresh sidecar for `sandbox_id` and connect to it.
    pub fn launch(sandbox_id: &str, agent_socket_dir: &Path, paths: &SandboxPaths) -> Result<Self> {
        let SidecarHandle { child, socket_path } =
            launcher::spawn_sidecar(sandbox_id, agent_socket_dir, paths)?;
        launcher::wait_for_socket(&socket_path, Duration::from_secs(5))?;

        let manager = Self::connect(&socket_path)?;
        *manager.sidecar.lock() = Some(child);
        manager.wait_until_responsive(Duration::from_secs(2))?;
        Ok(manager)
    }

    /// Connect to an already-running sidecar's control socket.
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let sessions: Arc<Mutex<HashMap<String, Arc<Session>>>> = Arc::new(Mutex::new(HashMap::new()));
        let dispatch_sessions = sessions.clone();
        let client = ControlClient::connect(
            socket_path,
            Box::new(move |event| dispatch_event(&dispatch_sessions, event)),
        )?;
        Ok(Self {
            client: Arc::new(client),
            sessions,
            socket_path: socket_path.to_path_buf(),
            sidecar: Mutex::new(None),
        })
    }

    fn wait_until_responsive(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if let Ok(response) = self.client.call(RequestMethod::SidecarPing, Duration::from_millis(300)) {
                if response.ok {
                    return Ok(());
                }
            }
            if start.elapsed() >= timeout {
                return Err(Error::timeout("sidecar did not answer sidecar.ping in time"));
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// `vm.bootstrapStart`, retried up to 120x with 500ms spacing (spec §4.7).
    pub fn bootstrap_start(&self) -> Result<()> {
        retry(120, Duration::from_millis(500), || {
            response_to_result(self.client.call(RequestMethod::VmBootstrapStart, Duration::from_millis(500))?)
        })
    }

    /// `vm.stop`, idempotent (spec §4.7).
    pub fn stop(&self) -> Result<()> {
        response_to_result(self.client.call(RequestMethod::VmStop, Duration::from_secs(10))?)
    }

    /// Registers a session so its stdio and exit status can be tracked
    /// before `start_process` is called (spec §4.8: `createProcess`).
    pub fn create_process(&self, id: impl Into<String>, stdio: ProcessStdio) {
        let session = Arc::new(Session {
            state: Mutex::new(SessionState {
                stdio,
                exit_status: None,
                last_agent_error: None,
                stdin_closed: false,
            }),
            condvar: Condvar::new(),
        });
        self.sessions.lock().insert(id.into(), session);
    }

    /// Connects through the sidecar to the guest agent and starts `exec`
    /// (spec §4.8: `startProcess`). Retried up to 240x with 500ms spacing
    /// across the VM-boot window (spec §4.7).
    pub fn start_process(&self, id: &str, port: u32, exec: ExecSpec) -> Result<()> {
        if !self.sessions.lock().contains_key(id) {
            return Err(Error::invalid_state(format!("process {id} was not created")));
        }
        retry(240, Duration::from_millis(500), || {
            let response = self.client.call(
                RequestMethod::ProcessStart { port, process_id: id.to_string(), exec: exec.clone() },
                Duration::from_secs(5),
            )?;
            response_to_result(response)
        })
    }

    pub fn send_stdin(&self, id: &str, data: Vec<u8>) -> Result<()> {
        response_to_result(self.client.call(
            RequestMethod::ProcessStdin { process_id: id.to_string(), data },
            Duration::from_secs(5),
        )?)
    }

    pub fn send_signal(&self, id: &str, signal: i32) -> Result<()> {
        response_to_result(self.client.call(
            RequestMethod::ProcessSignal { process_id: id.to_string(), signal },
            Duration::from_secs(5),
        )?)
    }

    pub fn resize(&self, id: &str, width: u16, height: u16) -> Result<()> {
        response_to_result(self.client.call(
            RequestMethod::ProcessResize { process_id: id.to_string(), width, height },
            Duration::from_secs(5),
        )?)
    }

    /// Forwards host stdin EOF as exactly one `process.close` (spec §4.8's
    /// `stdinClosed` guard).
    pub fn close_stdin(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no such process session: {id}")))?;
        {
            let mut state = session.state.lock();
            if state.stdin_closed {
                return Ok(());
            }
            state.stdin_closed = true;
        }
        response_to_result(
            self.client
                .call(RequestMethod::ProcessClose { process_id: id.to_string() }, Duration::from_secs(5))?,
        )
    }

    /// Spawns a thread that copies `reader` into `process.stdin` frames,
    /// closing stdin exactly once on EOF or a read/send error.
    pub fn forward_stdin<R: Read + Send + 'static>(self: &Arc<Self>, id: impl Into<String>, mut reader: R) {
        let id = id.into();
        let manager = self.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        let _ = manager.close_stdin(&id);
                        break;
                    }
                    Ok(n) => {
                        if manager.send_stdin(&id, buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = manager.close_stdin(&id);
                        break;
                    }
                }
            }
        });
    }

    /// Blocks until `id`'s exit status is known, or `timeout` elapses (spec
    /// §4.8: "the timeout path cancels its own continuation cleanly").
    pub fn wait(&self, id: &str, timeout: Option<Duration>) -> Result<i32> {
        let session = self
            .sessions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no such process session: {id}")))?;

        let mut state = session.state.lock();
        match timeout {
            None => {
                while state.exit_status.is_none() {
                    session.condvar.wait(&mut state);
                }
            }
            Some(budget) => {
                let deadline = Instant::now() + budget;
                loop {
                    if state.exit_status.is_some() {
                        break;
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::timeout(format!("wait({id}) exceeded {budget:?}")));
                    }
                    session.condvar.wait_for(&mut state, remaining);
                }
            }
        }
        Ok(state.exit_status.expect("loop only exits once exit_status is set"))
    }

    pub fn last_agent_error(&self, id: &str) -> Option<String> {
        self.sessions.lock().get(id)?.state.lock().last_agent_error.clone()
    }

    /// `dial(port)` (spec §4.8): opens a fresh ephemeral connection through
    /// the sidecar and returns the resulting vsock stream.
    pub fn dial(&self, port: u32) -> Result<std::os::unix::net::UnixStream> {
        let (fd, response) = dial_vsock(&self.socket_path, port)?;
        if !response.ok {
            let err = response.error.unwrap_or(ControlError {
                kind: ErrorKind::Protocol,
                message: "vsock dial failed with no error detail".into(),
            });
            return Err(map_control_error(err));
        }
        let fd = fd.ok_or_else(|| Error::sidecar("vsock dial reported ok without an attached fd"))?;
        Ok(std::os::unix::net::UnixStream::from(fd))
    }

    /// Resolves every pending waiter (with a synthesized exit if none was
    /// ever observed), tells the sidecar to quit, and reaps the subprocess
    /// if this manager launched it (spec §4.8, §5 Cancellation).
    pub fn shutdown(&self) -> Result<()> {
        for session in self.sessions.lock().values() {
            let mut state = session.state.lock();
            if state.exit_status.is_none() {
                state.exit_status = Some(1);
            }
            drop(state);
            session.condvar.notify_all();
        }

        let _ = self.client.call(RequestMethod::SidecarQuit, Duration::from_secs(5));

        if let Some(mut child) = self.sidecar.lock().take() {
            let _ = child.wait();
        }
        Ok(())
    }
}

impl Drop for HostHelperManager {
    fn drop(&mut self) {
        if let Some(mut child) = self.sidecar.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn dispatch_event(sessions: &Arc<Mutex<HashMap<String, Arc<Session>>>>, event: ControlEvent) {
    let process_id = event.process_id().to_string();
    let Some(session) = sessions.lock().get(&process_id).cloned() else {
        return;
    };

    match event {
        ControlEvent::ProcessStdout { data, .. } => {
            let mut state = session.state.lock();
            let _ = state.stdio.stdout.write_all(&data);
            let _ = state.stdio.stdout.flush();
            if let Some(log) = &state.stdio.log {
                let _ = log.lock().write_all(&data);
            }
        }
        ControlEvent::ProcessStderr { data, .. } => {
            let mut state = session.state.lock();
            let _ = state.stdio.stderr.write_all(&data);
            let _ = state.stdio.stderr.flush();
            if let Some(log) = &state.stdio.log {
                let _ = log.lock().write_all(&data);
            }
        }
        ControlEvent::ProcessError { message, .. } => {
            session.state.lock().last_agent_error = Some(message);
        }
        ControlEvent::ProcessExit { exit_code, .. } => {
            {
                let mut state = session.state.lock();
                state.exit_status.get_or_insert(exit_code);
            }
            session.condvar.notify_all();
        }
    }
}

fn response_to_result(response: ControlResponse) -> Result<()> {
    if response.ok {
        return Ok(());
    }
    Err(map_control_error(response.error.unwrap_or(ControlError {
        kind: ErrorKind::Protocol,
        message: "request failed with no error detail".into(),
    })))
}

fn map_control_error(err: ControlError) -> Error {
    match err.kind {
        ErrorKind::NotFound => Error::not_found(err.message),
        ErrorKind::Timeout => Error::timeout(err.message),
        ErrorKind::InvalidState => Error::invalid_state(err.message),
        _ => Error::sidecar(err.message),
    }
}

/// Retries `f` up to `attempts` times with `spacing` between tries,
/// returning the last error if none succeed (spec §4.7's client-side retry
/// policies for `vm.bootstrapStart` and `process.start`).
///
/// Logs each failed attempt at positions 1..5, every 20th, and the final
/// attempt only, so a long retry window (spec §8 scenario 5) doesn't flood
/// the log with one line per 500ms tick.
fn retry<T>(attempts: u32, spacing: Duration, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut last_err = None;
    for attempt in 0..attempts {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) => {
                let position = attempt + 1;
                if position <= 5 || position % 20 == 0 || position == attempts {
                    tracing::warn!(attempt = position, attempts, error = %e, "retry attempt failed");
                }
                last_err = Some(e);
                if position < attempts {
                    std::thread::sleep(spacing);
                }
            }
        }
    }
    Err(last_err.expect("attempts > 0"))
}
