//! End-to-end control-socket scenarios (spec §8 scenarios 3-6).
//!
//! Stands in a fake guest agent (a bare `ctrm_protocol` frame loop, not the
//! real `ctrm-agent` binary) behind a [`ctrm_sidecar::LoopbackHost`] so the
//! sidecar's dispatch, session bridging, and timeout paths can be exercised
//! without a hypervisor.

use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::time::Duration;

use ctrm_protocol::{
    read_frame, write_frame, ControlEnvelope, ControlEvent, ControlRequest, ControlResponse,
    ExecSpec, Frame, RequestMethod,
};
use ctrm_sidecar::{server, LoopbackHost};

fn spawn_fake_echo_agent(socket_path: std::path::PathBuf) {
    std::thread::spawn(move || {
        let listener = UnixListener::bind(&socket_path).unwrap();
        for stream in listener.incoming() {
            let mut stream = stream.unwrap();
            write_frame(&mut stream, &Frame::Ready).unwrap();
            let exec: Frame = read_frame(&mut stream).unwrap();
            let Frame::Exec { .. } = exec else { panic!("expected exec") };
            write_frame(&mut stream, &Frame::Stdout { data: b"hi\n".to_vec() }).unwrap();
            write_frame(&mut stream, &Frame::Exit { exit_code: 0 }).unwrap();
        }
    });
}

fn start_sidecar() -> (std::path::PathBuf, tempfile::TempDir) {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static NEXT: AtomicUsize = AtomicUsize::new(0);

    let dir = tempfile::tempdir().unwrap();
    let sandbox_id = format!(
        "test-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    );
    let control_path = server::socket_path(&sandbox_id);
    let agent_dir = dir.path().join("agents");
    std::fs::create_dir_all(&agent_dir).unwrap();

    let host = Arc::new(LoopbackHost::new(agent_dir.clone()));
    host.bootstrap_start().unwrap();

    let run_path = control_path.clone();
    std::thread::spawn(move || {
        server::run(&run_path, host).unwrap();
    });
    // Give the listener a moment to bind.
    std::thread::sleep(Duration::from_millis(100));

    spawn_fake_echo_agent(agent_dir.join("port-7000.sock"));
    (control_path, dir)
}

fn send_request(stream: &mut UnixStream, method: RequestMethod) -> ControlResponse {
    let request = ControlRequest::new(method);
    write_frame(stream, &ControlEnvelope::Request(request)).unwrap();
    match read_frame(stream).unwrap() {
        ControlEnvelope::Response(r) => r,
        other => panic!("expected response, got {other:?}"),
    }
}

#[test]
fn process_start_streams_stdout_then_exit_in_order() {
    let (control_path, _dir) = start_sidecar();
    let mut stream = UnixStream::connect(&control_path).unwrap();

    let resp = send_request(
        &mut stream,
        RequestMethod::ProcessStart {
            port: 7000,
            process_id: "p1".into(),
            exec: ExecSpec {
                executable: "/bin/echo".into(),
                arguments: vec!["hi".into()],
                environment: vec![],
                working_directory: None,
                terminal: false,
            },
        },
    );
    assert!(resp.ok, "process.start should succeed: {:?}", resp.error);

    let mut saw_stdout = false;
    loop {
        match read_frame(&mut stream).unwrap() {
            ControlEnvelope::Event(ControlEvent::ProcessStdout { data, .. }) => {
                saw_stdout = true;
                assert_eq!(data, b"hi\n");
            }
            ControlEnvelope::Event(ControlEvent::ProcessExit { exit_code, .. }) => {
                assert_eq!(exit_code, 0);
                break;
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }
    assert!(saw_stdout, "exit must not arrive before stdout (spec §8 ordering)");
}

#[test]
fn vsock_connect_to_nothing_replies_with_no_fd_and_an_error() {
    let (control_path, _dir) = start_sidecar();
    let mut stream = UnixStream::connect(&control_path).unwrap();

    let request = ControlRequest::new(RequestMethod::VmConnectVsock { port: 9999 });
    write_frame(&mut stream, &ControlEnvelope::Request(request)).unwrap();

    // The vsock-connect reply shape is a marker byte (and optional fd)
    // ahead of the JSON response (spec §4.7). No listener exists on port
    // 9999, so `LoopbackHost::connect_vsock` fails immediately rather than
    // exhausting the 3s bound; either way no fd is ever attached.
    let fd = ctrm_sidecar::fd::recv_marker_and_fd(&stream).unwrap();
    assert!(fd.is_none());

    let resp = match read_frame(&mut stream).unwrap() {
        ControlEnvelope::Response(r) => r,
        other => panic!("expected response, got {other:?}"),
    };
    assert!(!resp.ok);
    assert!(resp.error.is_some());
}

#[test]
fn unknown_process_id_is_not_found() {
    let (control_path, _dir) = start_sidecar();
    let mut stream = UnixStream::connect(&control_path).unwrap();

    let resp = send_request(
        &mut stream,
        RequestMethod::ProcessStdin {
            process_id: "does-not-exist".into(),
            data: vec![1],
        },
    );
    assert!(!resp.ok);
    assert_eq!(resp.error.unwrap().kind, ctrm_protocol::ErrorKind::NotFound);
}

#[test]
fn sidecar_ping_is_a_lightweight_health_check() {
    let (control_path, _dir) = start_sidecar();
    let mut stream = UnixStream::connect(&control_path).unwrap();
    let resp = send_request(&mut stream, RequestMethod::SidecarPing);
    assert!(resp.ok);
}
