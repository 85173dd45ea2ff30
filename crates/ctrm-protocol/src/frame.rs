//! Guest-agent wire frames (spec §3, §4.6).
//!
//! A fresh connection first receives a [`Frame::Ready`]. Only [`Frame::Exec`]
//! carries a correlation id: a guest-agent connection owns at most one child
//! process at a time, so every later frame on the connection implicitly
//! targets that process.

use serde::{Deserialize, Serialize};

use crate::envelope::ExecSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Sent immediately on accept, before any other frame (spec §4.6).
    Ready,

    /// Starts (or replaces) the connection's child process.
    Exec {
        id: u64,
        #[serde(flatten)]
        spec: ExecSpec,
    },

    /// Bytes to write to the active child's stdin.
    Stdin {
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
    },

    /// Deliver a signal (as a raw signal number) to the active child.
    Signal { signal: i32 },

    /// Resize the active child's pty, if it has one.
    Resize { width: u16, height: u16 },

    /// Close the active child's stdin (EOF). See DESIGN.md for the
    /// documented no-op behavior when the child is pty-backed.
    Close,

    /// A chunk of the child's stdout.
    Stdout {
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
    },

    /// A chunk of the child's stderr.
    Stderr {
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
    },

    /// The active child exited; emitted exactly once per child.
    Exit { exit_code: i32 },

    /// A descriptive, non-fatal-by-itself error (spec §4.6: accompanies
    /// `exit{1}` for fatal-to-the-exec cases, stands alone otherwise).
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_has_no_extra_fields() {
        let json = serde_json::to_string(&Frame::Ready).unwrap();
        assert_eq!(json, r#"{"type":"ready"}"#);
    }

    #[test]
    fn exec_flattens_spec_fields_alongside_id() {
        let frame = Frame::Exec {
            id: 42,
            spec: ExecSpec {
                executable: "/bin/echo".into(),
                arguments: vec!["hi".into()],
                environment: vec![],
                working_directory: None,
                terminal: false,
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "exec");
        assert_eq!(json["id"], 42);
        assert_eq!(json["executable"], "/bin/echo");
        let back: Frame = serde_json::from_value(json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn stdin_data_is_base64_in_json_not_an_array() {
        let frame = Frame::Stdin {
            data: vec![104, 105],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"data\":\"aGk=\""));
    }

    #[test]
    fn round_trip_every_variant() {
        let frames = vec![
            Frame::Ready,
            Frame::Stdin { data: vec![1, 2, 3] },
            Frame::Signal { signal: 15 },
            Frame::Resize {
                width: 80,
                height: 24,
            },
            Frame::Close,
            Frame::Stdout { data: vec![] },
            Frame::Stderr { data: vec![9] },
            Frame::Exit { exit_code: 0 },
            Frame::Error {
                message: "boom".into(),
            },
        ];
        for frame in frames {
            let (encoded, _len) = {
                let enc = crate::encode_message(&frame).unwrap();
                let (decoded, consumed): (Frame, usize) =
                    crate::decode_message(&enc).unwrap();
                (decoded, consumed)
            };
            assert_eq!(encoded, frame);
        }
    }
}
