//! Process-stream session bridging (spec §4.7, §4.8, §5, §8).
//!
//! One [`ProcessSession`] owns one guest-agent connection for the lifetime
//! of one process. Its reader thread translates [`ctrm_protocol::Frame`]s
//! from the agent into [`ctrm_protocol::ControlEvent`]s written to the
//! shared control-connection writer, guaranteeing at-most-one `exit` event
//! and that it is always the last event delivered for the process (spec §8).

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ctrm_protocol::{read_frame, write_frame, ControlEnvelope, ControlEvent, Frame};
use tracing::{debug, warn};

use crate::error::Result;

type ControlWriter = Arc<Mutex<UnixStream>>;

/// A single process's agent connection plus the lock serializing writes to
/// it (spec §5: "writes are serialized by a per-stream lock").
pub struct ProcessSession {
    process_id: String,
    agent_writer: Mutex<UnixStream>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSession {
    /// Take ownership of a fresh, already-ready-frame-consumed agent
    /// connection and start its reader thread, which bridges every
    /// subsequent agent frame to a control event on `control_writer`.
    pub fn spawn(
        process_id: String,
        agent_conn: UnixStream,
        control_writer: ControlWriter,
    ) -> Result<Arc<Self>> {
        let agent_writer = agent_conn.try_clone()?;
        let mut agent_reader = agent_conn;

        let session = Arc::new(Self {
            process_id: process_id.clone(),
            agent_writer: Mutex::new(agent_writer),
            reader: Mutex::new(None),
        });

        let handle = std::thread::spawn(move || {
            reader_loop(process_id, &mut agent_reader, control_writer);
        });
        *session.reader.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        Ok(session)
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut guard = self.agent_writer.lock().unwrap_or_else(|p| p.into_inner());
        write_frame(&mut *guard, frame)?;
        Ok(())
    }
}

fn emit_event(control_writer: &ControlWriter, event: ControlEvent) {
    let mut guard = control_writer.lock().unwrap_or_else(|p| p.into_inner());
    if let Err(e) = write_frame(&mut *guard, &ControlEnvelope::Event(event)) {
        warn!(error = %e, "failed to emit control event, control connection likely gone");
    }
}

/// Drains agent frames until EOF/error or the child's `exit` frame arrives,
/// then emits exactly one `process.exit` (spec §8 "at-most-one-exit").
/// Every `stdout`/`stderr`/`error` event the agent sent is forwarded before
/// that final exit, by construction: this loop processes frames in the
/// order the agent wrote them (spec §5 ordering guarantee).
fn reader_loop(process_id: String, agent_reader: &mut UnixStream, control_writer: ControlWriter) {
    let mut exited = false;

    loop {
        let frame: Frame = match read_frame(agent_reader) {
            Ok(frame) => frame,
            Err(ctrm_protocol::Error::UnexpectedEof) => {
                debug!(process_id, "agent connection closed");
                break;
            }
            Err(e) => {
                warn!(process_id, error = %e, "agent frame decode error");
                break;
            }
        };

        match frame {
            Frame::Stdout { data } => emit_event(
                &control_writer,
                ControlEvent::ProcessStdout {
                    process_id: process_id.clone(),
                    data,
                },
            ),
            Frame::Stderr { data } => emit_event(
                &control_writer,
                ControlEvent::ProcessStderr {
                    process_id: process_id.clone(),
                    data,
                },
            ),
            Frame::Error { message } => emit_event(
                &control_writer,
                ControlEvent::ProcessError {
                    process_id: process_id.clone(),
                    message,
                },
            ),
            Frame::Exit { exit_code } => {
                emit_event(
                    &control_writer,
                    ControlEvent::ProcessExit {
                        process_id: process_id.clone(),
                        exit_code,
                    },
                );
                exited = true;
            }
            Frame::Ready | Frame::Exec { .. } | Frame::Stdin { .. } | Frame::Signal { .. }
            | Frame::Resize { .. } | Frame::Close => {
                debug!(process_id, "ignoring frame the sidecar never receives from the agent");
            }
        }
    }

    if !exited {
        // Reader terminated abnormally (peer EOF/IO error) without a
        // guest-agent exit frame; synthesize one so waiters cannot stall
        // (spec §4.7, §8).
        emit_event(
            &control_writer,
            ControlEvent::ProcessExit {
                process_id,
                exit_code: 1,
            },
        );
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        let _ = self.agent_writer.lock().map(|mut w| w.flush());
    }
}
