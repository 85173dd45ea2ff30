//! Control-socket client: one persistent connection to a running sidecar
//! (spec §4.7), plus ephemeral `vm.connectVsock` dials. Grounded on the
//! shape of the old helper daemon's request/response client: connect once,
//! serialize writes, decode typed responses, surface a tidy `Result`.
//!
//! Unlike the old vsock client, a single connection here carries both
//! request/response pairs *and* asynchronous process-stream events, so a
//! background reader thread demultiplexes by `requestID` (for responses,
//! handed back to whichever `call()` is waiting) and hands events to a
//! caller-supplied sink (`HostHelperManager` is the only one today).

use std::collections::HashMap;
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use ctrm_protocol::{
    read_frame, write_frame, ControlEnvelope, ControlEvent, ControlRequest, ControlResponse,
    RequestMethod,
};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};

type PendingMap = Mutex<HashMap<Uuid, mpsc::SyncSender<ControlResponse>>>;

/// A live connection to a sidecar's persistent control socket.
pub struct ControlClient {
    writer: Mutex<UnixStream>,
    pending: std::sync::Arc<PendingMap>,
    closed: std::sync::Arc<AtomicBool>,
}

impl ControlClient {
    /// Connect and start the background reader. `on_event` is called (from
    /// the reader thread) for every `ControlEvent` that arrives; it must not
    /// block for long since it runs inline with response demultiplexing.
    pub fn connect(
        socket_path: &Path,
        on_event: Box<dyn Fn(ControlEvent) + Send + Sync>,
    ) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).map_err(|e| Error::io(e, socket_path))?;
        let reader_stream = stream.try_clone().map_err(|e| Error::io(e, socket_path))?;
        let pending: std::sync::Arc<PendingMap> = std::sync::Arc::new(Mutex::new(HashMap::new()));
        let closed = std::sync::Arc::new(AtomicBool::new(false));

        {
            let pending = pending.clone();
            let closed = closed.clone();
            std::thread::spawn(move || reader_loop(reader_stream, pending, closed, on_event));
        }

        Ok(Self { writer: Mutex::new(stream), pending, closed })
    }

    /// Send a request and block for its matching response, up to `timeout`.
    pub fn call(&self, method: RequestMethod, timeout: Duration) -> Result<ControlResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::sidecar("control connection is closed"));
        }

        let request = ControlRequest::new(method);
        let (tx, rx) = mpsc::sync_channel(1);
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(request.request_id, tx);

        {
            let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = write_frame(&mut *writer, &ControlEnvelope::Request(request.clone())) {
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&request.request_id);
                return Err(e.into());
            }
        }

        match rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&request.request_id);
                Err(Error::timeout(format!(
                    "no response within {timeout:?} for {:?}",
                    request.method
                )))
            }
        }
    }
}

fn reader_loop(
    mut stream: UnixStream,
    pending: std::sync::Arc<PendingMap>,
    closed: std::sync::Arc<AtomicBool>,
    on_event: Box<dyn Fn(ControlEvent) + Send + Sync>,
) {
    loop {
        match read_frame::<_, ControlEnvelope>(&mut stream) {
            Ok(ControlEnvelope::Response(response)) => {
                if let Some(sender) = pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&response.request_id)
                {
                    let _ = sender.send(response);
                }
            }
            Ok(ControlEnvelope::Event(event)) => on_event(event),
            Ok(ControlEnvelope::Request(_)) => {
                warn!("control client received a request envelope, ignoring");
            }
            Err(e) => {
                warn!(error = %e, "control connection reader exiting");
                break;
            }
        }
    }

    closed.store(true, Ordering::Release);
    let mut pending = pending.lock().unwrap_or_else(|p| p.into_inner());
    for (request_id, sender) in pending.drain() {
        let _ = sender.send(ControlResponse::err(
            request_id,
            ctrm_protocol::ErrorKind::Io,
            "control connection closed before a response arrived",
        ));
    }
}

/// Open a fresh ephemeral connection for one `vm.connectVsock` call (spec
/// §4.7): write the request, read the marker+fd, then the response.
pub fn dial_vsock(socket_path: &Path, port: u32) -> Result<(Option<OwnedFd>, ControlResponse)> {
    let mut stream = UnixStream::connect(socket_path).map_err(|e| Error::io(e, socket_path))?;
    let request = ControlRequest::new(RequestMethod::VmConnectVsock { port });
    write_frame(&mut stream, &ControlEnvelope::Request(request))?;

    let fd = recv_marker_and_fd(&stream).map_err(|e| Error::io(e, socket_path))?;
    let response = match read_frame::<_, ControlEnvelope>(&mut stream)? {
        ControlEnvelope::Response(response) => response,
        _ => return Err(Error::sidecar("expected a response after the vsock-dial marker")),
    };
    Ok((fd, response))
}

/// Mirrors `ctrm-sidecar::fd::recv_marker_and_fd`'s receive half; duplicated
/// rather than depended on, same rationale as `launcher::socket_path`.
fn recv_marker_and_fd(stream: &UnixStream) -> std::io::Result<Option<OwnedFd>> {
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, RecvMsg};

    let mut marker = [0u8; 1];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
    let mut iov = [IoSliceMut::new(&mut marker)];

    let msg: RecvMsg<()> = recvmsg(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(std::io::Error::from)?;

    if marker[0] == 0 {
        return Ok(None);
    }

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&raw) = fds.first() {
                return Ok(Some(unsafe { OwnedFd::from_raw_fd(raw) }));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::net::UnixListener;

    fn unique_socket(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("ctrm-client-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn call_round_trips_a_ping() {
        let path = unique_socket("ping");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request: ControlEnvelope = read_frame(&mut stream).unwrap();
            let ControlEnvelope::Request(request) = request else { panic!() };
            write_frame(
                &mut stream,
                &ControlEnvelope::Response(ControlResponse::ok(request.request_id)),
            )
            .unwrap();
        });

        let client = ControlClient::connect(&path, Box::new(|_| {})).unwrap();
        let response = client.call(RequestMethod::SidecarPing, Duration::from_secs(2)).unwrap();
        assert!(response.ok);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn events_reach_the_supplied_sink() {
        let path = unique_socket("events");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _: ControlEnvelope = read_frame(&mut stream).unwrap();
            write_frame(
                &mut stream,
                &ControlEnvelope::Event(ControlEvent::ProcessExit {
                    process_id: "p1".into(),
                    exit_code: 0,
                }),
            )
            .unwrap();
            // Keep the connection open briefly so the client reads the event.
            std::thread::sleep(Duration::from_millis(200));
        });

        let (tx, rx) = mpsc::channel();
        let client = ControlClient::connect(
            &path,
            Box::new(move |event| {
                let _ = tx.send(event);
            }),
        )
        .unwrap();
        // Send something so the fake server starts its response/event flow.
        let _ = client.call(RequestMethod::SidecarPing, Duration::from_millis(50));

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.process_id(), "p1");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn call_times_out_when_nobody_answers() {
        let path = unique_socket("silence");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            // Accept but never write a response.
            std::thread::sleep(Duration::from_secs(2));
            drop(stream);
        });

        let client = ControlClient::connect(&path, Box::new(|_| {})).unwrap();
        let err = client
            .call(RequestMethod::SidecarPing, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn dial_vsock_reports_no_fd_against_a_plain_ping_responder() {
        let path = unique_socket("dial");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _: ControlEnvelope = read_frame(&mut stream).unwrap();
            let mut marker_sock = stream.try_clone().unwrap();
            marker_sock.write_all(&[0u8]).unwrap();
            write_frame(
                &mut stream,
                &ControlEnvelope::Response(ControlResponse::err(
                    Uuid::new_v4(),
                    ctrm_protocol::ErrorKind::Timeout,
                    "no vm",
                )),
            )
            .unwrap();
        });

        let (fd, response) = dial_vsock(&path, 7000).unwrap();
        assert!(fd.is_none());
        assert!(!response.ok);
        let _ = std::fs::remove_file(&path);
    }
}
