//! Per-connection dispatch (spec §4.7).
//!
//! Two connection shapes share one socket: the single persistent control
//! connection (requests/responses/events, looped until the peer hangs up)
//! and ephemeral `vm.connectVsock` connections (exactly one request, a
//! marker byte plus optional fd, then close). The first frame read
//! determines which: a `vm_connect_vsock` request is handled as the
//! ephemeral shape; anything else enters the persistent loop.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ctrm_protocol::{
    read_frame, write_frame, ControlEnvelope, ControlError, ControlRequest, ControlResponse,
    ErrorKind, Frame, RequestMethod,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fd;
use crate::gate;
use crate::session::ProcessSession;
use crate::vm::VirtualizationHost;

/// vsock-connect callback wait cap (spec §4.7).
const VSOCK_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Guest-agent `ready` frame wait cap (spec §4.7).
const AGENT_READY_TIMEOUT: Duration = Duration::from_secs(3);

pub fn handle_connection(mut stream: std::os::unix::net::UnixStream, vm: Arc<dyn VirtualizationHost>) {
    let first: ControlEnvelope = match read_frame(&mut stream) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "failed to read first control frame");
            return;
        }
    };

    let ControlEnvelope::Request(request) = first else {
        warn!("first frame on control connection was not a request");
        return;
    };

    if matches!(request.method, RequestMethod::VmConnectVsock { .. }) {
        handle_vsock_connect(stream, request, &vm);
        return;
    }

    run_persistent_connection(stream, request, vm);
}

/// Ephemeral shape: one `vm.connectVsock` request, one response, done.
fn handle_vsock_connect(
    mut stream: std::os::unix::net::UnixStream,
    request: ControlRequest,
    vm: &Arc<dyn VirtualizationHost>,
) {
    let RequestMethod::VmConnectVsock { port } = request.method else {
        unreachable!("caller already matched VmConnectVsock");
    };

    let vm = vm.clone();
    let outcome = gate::bounded(VSOCK_CONNECT_TIMEOUT, move || vm.connect_vsock(port));

    match outcome {
        Some(Ok(conn)) => {
            let raw = conn.as_raw_fd();
            let dup = unsafe { libc::dup(raw) };
            if dup < 0 {
                let err = std::io::Error::last_os_error();
                let _ = fd::send_marker_and_fd(&stream, None);
                let _ = write_frame(
                    &mut stream,
                    &ControlEnvelope::Response(ControlResponse::err(
                        request.request_id,
                        ErrorKind::Io,
                        format!("dup failed: {err}"),
                    )),
                );
                return;
            }
            if fd::send_marker_and_fd(&stream, Some(dup)).is_err() {
                unsafe {
                    libc::close(dup);
                }
            }
            // Ownership of `dup` has passed to the peer; our own copy
            // (`conn`) is closed when it drops at the end of this function
            // (spec §9 "must duplicate-then-close its own copy").
            let mut response = ControlResponse::ok(request.request_id);
            response.fd_attached = Some(true);
            let _ = write_frame(&mut stream, &ControlEnvelope::Response(response));
        }
        Some(Err(e)) => {
            let _ = fd::send_marker_and_fd(&stream, None);
            let _ = write_frame(
                &mut stream,
                &ControlEnvelope::Response(ControlResponse::err(
                    request.request_id,
                    e.kind(),
                    e.to_string(),
                )),
            );
        }
        None => {
            // Timed out; the connect may still succeed later, but its
            // result (including any fd) is discarded by `gate::bounded`
            // when the late send finds nobody listening (spec §7).
            let _ = fd::send_marker_and_fd(&stream, None);
            let mut response =
                ControlResponse::err(request.request_id, ErrorKind::Timeout, "vsock connect timed out");
            response.fd_attached = Some(false);
            let _ = write_frame(&mut stream, &ControlEnvelope::Response(response));
        }
    }
}

/// Persistent shape: the single control connection a helper keeps open.
fn run_persistent_connection(
    stream: std::os::unix::net::UnixStream,
    first_request: ControlRequest,
    vm: Arc<dyn VirtualizationHost>,
) {
    let writer = Arc::new(Mutex::new(stream.try_clone().expect("clone control stream")));
    let mut reader = stream;
    let sessions: Arc<Mutex<HashMap<String, Arc<ProcessSession>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let mut request = Some(first_request);
    loop {
        let request = match request.take() {
            Some(r) => r,
            None => match read_frame::<_, ControlEnvelope>(&mut reader) {
                Ok(ControlEnvelope::Request(r)) => r,
                Ok(_) => {
                    warn!("control connection received a non-request envelope");
                    continue;
                }
                Err(ctrm_protocol::Error::UnexpectedEof) => {
                    debug!("control connection closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "control frame decode error, closing connection");
                    break;
                }
            },
        };

        let should_quit = matches!(request.method, RequestMethod::SidecarQuit);
        let response = dispatch(request.clone(), &vm, &sessions, &writer);
        {
            let mut guard = writer.lock().unwrap_or_else(|p| p.into_inner());
            if write_frame(&mut *guard, &ControlEnvelope::Response(response)).is_err() {
                break;
            }
        }
        if should_quit {
            info!("sidecar.quit received, terminating");
            std::process::exit(0);
        }
    }
}

fn dispatch(
    request: ControlRequest,
    vm: &Arc<dyn VirtualizationHost>,
    sessions: &Arc<Mutex<HashMap<String, Arc<ProcessSession>>>>,
    writer: &Arc<Mutex<std::os::unix::net::UnixStream>>,
) -> ControlResponse {
    let id = request.request_id;
    match request.method {
        RequestMethod::VmBootstrapStart => match vm.bootstrap_start() {
            Ok(()) => ControlResponse::ok(id),
            Err(e) => ControlResponse::err(id, e.kind(), e.to_string()),
        },
        RequestMethod::ProcessStart { port, process_id, exec } => {
            match start_process(vm, sessions, writer, port, process_id, exec) {
                Ok(()) => ControlResponse::ok(id),
                Err(e) => ControlResponse::err(id, e.kind(), e.to_string()),
            }
        }
        RequestMethod::ProcessStdin { process_id, data } => {
            forward(sessions, &process_id, id, &Frame::Stdin { data })
        }
        RequestMethod::ProcessSignal { process_id, signal } => {
            forward(sessions, &process_id, id, &Frame::Signal { signal })
        }
        RequestMethod::ProcessResize { process_id, width, height } => {
            forward(sessions, &process_id, id, &Frame::Resize { width, height })
        }
        RequestMethod::ProcessClose { process_id } => {
            forward(sessions, &process_id, id, &Frame::Close)
        }
        RequestMethod::VmStop => match vm.stop() {
            Ok(()) => ControlResponse::ok(id),
            Err(e) => ControlResponse::err(id, e.kind(), e.to_string()),
        },
        RequestMethod::SidecarQuit => {
            let _ = vm.stop();
            ControlResponse::ok(id)
        }
        RequestMethod::SidecarPing => ControlResponse::ok(id),
        RequestMethod::VmConnectVsock { .. } => {
            // Only valid as the first frame of an ephemeral connection;
            // `handle_connection` routes those away before reaching here.
            ControlResponse::err(id, ErrorKind::Protocol, "vm_connect_vsock requires a fresh connection")
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn start_process(
    vm: &Arc<dyn VirtualizationHost>,
    sessions: &Arc<Mutex<HashMap<String, Arc<ProcessSession>>>>,
    writer: &Arc<Mutex<std::os::unix::net::UnixStream>>,
    port: u32,
    process_id: String,
    exec: ctrm_protocol::ExecSpec,
) -> crate::error::Result<()> {
    let mut conn = vm.connect_vsock(port)?;
    conn.set_read_timeout(Some(AGENT_READY_TIMEOUT))?;

    match read_frame::<_, Frame>(&mut conn) {
        Ok(Frame::Ready) => {}
        Ok(other) => {
            return Err(crate::error::Error::Protocol(ctrm_protocol::Error::protocol(format!(
                "expected ready frame, got {other:?}"
            ))))
        }
        Err(e) => return Err(e.into()),
    }
    conn.set_read_timeout(None)?;

    write_frame(
        &mut conn,
        &Frame::Exec {
            id: 0,
            spec: exec,
        },
    )?;

    let session = ProcessSession::spawn(process_id.clone(), conn, writer.clone())?;
    sessions
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(process_id, session);
    Ok(())
}

fn forward(
    sessions: &Arc<Mutex<HashMap<String, Arc<ProcessSession>>>>,
    process_id: &str,
    request_id: Uuid,
    frame: &Frame,
) -> ControlResponse {
    let session = sessions
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .get(process_id)
        .cloned();

    match session {
        Some(session) => match session.send_frame(frame) {
            Ok(()) => ControlResponse::ok(request_id),
            Err(e) => {
                let err = ControlError { kind: e.kind(), message: e.to_string() };
                ControlResponse { request_id, ok: false, fd_attached: None, error: Some(err) }
            }
        },
        None => ControlResponse::err(
            request_id,
            ErrorKind::NotFound,
            format!("no such process session: {process_id}"),
        ),
    }
}
