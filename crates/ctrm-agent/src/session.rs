//! Per-connection frame loop (spec §4.6).
//!
//! One connection owns at most one child process. A second `exec` frame
//! kills and reaps the current child before starting the replacement, so
//! there is never more than one reader thread alive per connection.

use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use ctrm_protocol::{read_frame, write_frame, ExecSpec, Frame};
use tracing::{debug, warn};

use crate::pty;

type Writer = Arc<Mutex<UnixStream>>;

enum StdinSink {
    Piped(std::process::ChildStdin),
    Pty(std::fs::File),
}

struct ActiveChild {
    pid: i32,
    stdin: Option<StdinSink>,
    master_fd: Option<i32>,
    reader: JoinHandle<()>,
}

impl ActiveChild {
    fn write_stdin(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.stdin {
            Some(StdinSink::Piped(h)) => h.write_all(data),
            Some(StdinSink::Pty(h)) => h.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin already closed")),
        }
    }

    fn close_stdin(&mut self) {
        // A pty-backed child has one fd for both directions; closing it
        // would also kill the read side the reader thread depends on, so
        // `close` is a documented no-op there (see crate::frame::Frame::Close).
        if matches!(self.stdin, Some(StdinSink::Piped(_))) {
            self.stdin = None;
        }
    }

    fn kill_and_join(self) {
        let _ = kill(Pid::from_raw(self.pid), Signal::SIGKILL);
        let _ = self.reader.join();
    }
}

/// Run the frame loop for one accepted connection until the peer disconnects
/// or an unrecoverable protocol error occurs.
pub fn run_connection(stream: UnixStream) -> ctrm_protocol::Result<()> {
    let mut reader_stream = stream.try_clone()?;
    let writer: Writer = Arc::new(Mutex::new(stream));

    send_frame(&writer, &Frame::Ready)?;

    let mut active: Option<ActiveChild> = None;

    loop {
        let frame: Frame = match read_frame(&mut reader_stream) {
            Ok(frame) => frame,
            Err(ctrm_protocol::Error::UnexpectedEof) => {
                debug!("peer closed connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "frame decode error, closing connection");
                break;
            }
        };

        match frame {
            Frame::Exec { id, spec } => {
                debug!(id, executable = %spec.executable, terminal = spec.terminal, "exec");
                if let Some(prev) = active.take() {
                    prev.kill_and_join();
                }
                match spawn_child(&spec, writer.clone()) {
                    Ok(child) => active = Some(child),
                    Err(e) => {
                        send_frame(&writer, &Frame::Error { message: e.to_string() })?;
                        send_frame(&writer, &Frame::Exit { exit_code: 1 })?;
                    }
                }
            }
            Frame::Stdin { data } => {
                if let Some(child) = active.as_mut() {
                    if let Err(e) = child.write_stdin(&data) {
                        send_frame(&writer, &Frame::Error { message: format!("stdin write failed: {e}") })?;
                    }
                }
            }
            Frame::Signal { signal } => {
                if let Some(child) = active.as_ref() {
                    match Signal::try_from(signal) {
                        Ok(sig) => {
                            if let Err(e) = kill(Pid::from_raw(child.pid), sig) {
                                send_frame(&writer, &Frame::Error { message: format!("kill failed: {e}") })?;
                            }
                        }
                        Err(_) => {
                            send_frame(&writer, &Frame::Error { message: format!("unknown signal {signal}") })?;
                        }
                    }
                }
            }
            Frame::Resize { width, height } => {
                if let Some(child) = active.as_ref() {
                    match child.master_fd {
                        Some(fd) => {
                            if let Err(e) = pty::resize(fd, width, height) {
                                send_frame(&writer, &Frame::Error { message: format!("resize failed: {e}") })?;
                            }
                        }
                        None => {
                            send_frame(&writer, &Frame::Error { message: "resize requires a terminal exec".into() })?;
                        }
                    }
                }
            }
            Frame::Close => {
                if let Some(child) = active.as_mut() {
                    child.close_stdin();
                }
            }
            Frame::Ready | Frame::Stdout { .. } | Frame::Stderr { .. } | Frame::Exit { .. } | Frame::Error { .. } => {
                debug!("ignoring frame the agent only ever sends");
            }
        }
    }

    if let Some(child) = active.take() {
        child.kill_and_join();
    }
    Ok(())
}

fn spawn_child(spec: &ExecSpec, writer: Writer) -> io::Result<ActiveChild> {
    if spec.terminal {
        spawn_pty_child(spec, writer)
    } else {
        spawn_piped_child(spec, writer)
    }
}

fn configure_command(spec: &ExecSpec) -> Command {
    let mut cmd = Command::new(&spec.executable);
    cmd.args(&spec.arguments);
    cmd.env_clear();
    for (k, v) in &spec.environment {
        cmd.env(k, v);
    }
    if let Some(dir) = &spec.working_directory {
        cmd.current_dir(dir);
    }
    cmd
}

fn spawn_piped_child(spec: &ExecSpec, writer: Writer) -> io::Result<ActiveChild> {
    let mut cmd = configure_command(spec);
    cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let stdin = child.stdin.take().expect("piped stdin");
    let pid = child.id() as i32;

    let reader = std::thread::spawn(move || drain_piped(child, stdout, stderr, writer));

    Ok(ActiveChild {
        pid,
        stdin: Some(StdinSink::Piped(stdin)),
        master_fd: None,
        reader,
    })
}

fn spawn_pty_child(spec: &ExecSpec, writer: Writer) -> io::Result<ActiveChild> {
    let pair = pty::open(80, 24)?;
    let stdin_fd = pty::dup_fd(&pair.slave)?;
    let stdout_fd = pty::dup_fd(&pair.slave)?;
    let stderr_fd = pty::dup_fd(&pair.slave)?;

    let mut cmd = configure_command(spec);
    cmd.stdin(Stdio::from(stdin_fd));
    cmd.stdout(Stdio::from(stdout_fd));
    cmd.stderr(Stdio::from(stderr_fd));
    // New session so the pty slave becomes the child's controlling terminal.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    drop(pair.slave);

    let master_read_fd = pty::dup_fd(&pair.master)?;
    let master_read = std::fs::File::from(master_read_fd);
    let master_write = std::fs::File::from(pair.master);
    let master_fd = master_write.as_raw_fd();
    let pid = child.id() as i32;

    let reader = std::thread::spawn(move || drain_pty(child, master_read, writer));

    Ok(ActiveChild {
        pid,
        stdin: Some(StdinSink::Pty(master_write)),
        master_fd: Some(master_fd),
        reader,
    })
}

fn set_nonblocking(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn drain_piped(mut child: Child, mut stdout: std::process::ChildStdout, mut stderr: std::process::ChildStderr, writer: Writer) {
    set_nonblocking(stdout.as_raw_fd());
    set_nonblocking(stderr.as_raw_fd());

    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut buf = [0u8; 8192];

    while stdout_open || stderr_open {
        let mut made_progress = false;

        if stdout_open {
            match stdout.read(&mut buf) {
                Ok(0) => stdout_open = false,
                Ok(n) => {
                    made_progress = true;
                    let _ = send_frame(&writer, &Frame::Stdout { data: buf[..n].to_vec() });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => stdout_open = false,
            }
        }

        if stderr_open {
            match stderr.read(&mut buf) {
                Ok(0) => stderr_open = false,
                Ok(n) => {
                    made_progress = true;
                    let _ = send_frame(&writer, &Frame::Stderr { data: buf[..n].to_vec() });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => stderr_open = false,
            }
        }

        if !made_progress && (stdout_open || stderr_open) {
            if let Ok(Some(_)) = child.try_wait() {
                // Child is gone; drain whatever is left in the pipe buffers
                // once more before giving up so no trailing output is lost.
                continue;
            }
            std::thread::sleep(Duration::from_millis(15));
        }
    }

    let status = child.wait();
    let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
    let _ = send_frame(&writer, &Frame::Exit { exit_code: code });
}

fn drain_pty(mut child: Child, mut master: std::fs::File, writer: Writer) {
    set_nonblocking(master.as_raw_fd());
    let mut buf = [0u8; 8192];

    loop {
        match master.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let _ = send_frame(&writer, &Frame::Stdout { data: buf[..n].to_vec() });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Ok(Some(_)) = child.try_wait() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(15));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // A pty master read fails with EIO once every slave fd has
            // closed, which is the normal end-of-session signal.
            Err(_) => break,
        }
    }

    let status = child.wait();
    let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
    let _ = send_frame(&writer, &Frame::Exit { exit_code: code });
}

fn send_frame(writer: &Writer, frame: &Frame) -> ctrm_protocol::Result<()> {
    let mut guard = writer.lock().unwrap_or_else(|p| p.into_inner());
    write_frame(&mut *guard, frame)
}
