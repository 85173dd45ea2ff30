//! Sidecar control-socket envelopes (spec §3, §4.7).
//!
//! `{kind ∈ {request, response, event}, payload}`. Requests carry a
//! `requestID`, a `method` tag, and method-specific fields; responses echo
//! `requestID` and carry `ok`/`fdAttached`/`error`; events carry an
//! `eventType` tag, an optional `processID`, and event-specific fields.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// The executable spec carried by `exec` frames and `process.start` requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecSpec {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: Vec<(String, String)>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub terminal: bool,
}

/// Control-protocol request methods (spec §4.7). Internally tagged on
/// `method`; flattened into [`ControlRequest`] alongside `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RequestMethod {
    VmBootstrapStart,
    VmConnectVsock {
        port: u32,
    },
    ProcessStart {
        port: u32,
        process_id: String,
        exec: ExecSpec,
    },
    ProcessStdin {
        process_id: String,
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
    },
    ProcessSignal {
        process_id: String,
        signal: i32,
    },
    ProcessResize {
        process_id: String,
        width: u16,
        height: u16,
    },
    ProcessClose {
        process_id: String,
    },
    VmStop,
    SidecarQuit,
    /// Health-check method; not named by spec.md but present on every
    /// control-protocol peer in the pack (see SPEC_FULL.md §4 item 7).
    SidecarPing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub request_id: Uuid,
    #[serde(flatten)]
    pub method: RequestMethod,
}

impl ControlRequest {
    pub fn new(method: RequestMethod) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub request_id: Uuid,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd_attached: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

impl ControlResponse {
    pub fn ok(request_id: Uuid) -> Self {
        Self {
            request_id,
            ok: true,
            fd_attached: None,
            error: None,
        }
    }

    pub fn err(request_id: Uuid, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            request_id,
            ok: false,
            fd_attached: None,
            error: Some(ControlError {
                kind,
                message: message.into(),
            }),
        }
    }
}

/// Server-to-client events (spec §4.7). Internally tagged on `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ControlEvent {
    ProcessStdout {
        process_id: String,
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
    },
    ProcessStderr {
        process_id: String,
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
    },
    ProcessError {
        process_id: String,
        message: String,
    },
    /// Exactly once per process (spec §8: at-most-one-exit).
    ProcessExit {
        process_id: String,
        exit_code: i32,
    },
}

impl ControlEvent {
    pub fn process_id(&self) -> &str {
        match self {
            ControlEvent::ProcessStdout { process_id, .. }
            | ControlEvent::ProcessStderr { process_id, .. }
            | ControlEvent::ProcessError { process_id, .. }
            | ControlEvent::ProcessExit { process_id, .. } => process_id,
        }
    }
}

/// Top-level control-socket envelope (spec §3: `kind ∈ {request, response, event}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlEnvelope {
    Request(ControlRequest),
    Response(ControlResponse),
    Event(ControlEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_flattens_method_tag_next_to_request_id() {
        let req = ControlRequest::new(RequestMethod::VmConnectVsock { port: 1024 });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "vm_connect_vsock");
        assert_eq!(json["port"], 1024);
        assert!(json.get("request_id").is_some());
        let back: ControlRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn envelope_round_trips_each_kind() {
        let request_id = Uuid::new_v4();
        let envelopes = vec![
            ControlEnvelope::Request(ControlRequest::new(RequestMethod::VmStop)),
            ControlEnvelope::Response(ControlResponse::ok(request_id)),
            ControlEnvelope::Response(ControlResponse::err(
                request_id,
                ErrorKind::Timeout,
                "no listener",
            )),
            ControlEnvelope::Event(ControlEvent::ProcessExit {
                process_id: "p1".into(),
                exit_code: 0,
            }),
        ];
        for envelope in envelopes {
            let json = serde_json::to_string(&envelope).unwrap();
            let back: ControlEnvelope = serde_json::from_str(&json).unwrap();
            assert_eq!(back, envelope);
        }
    }

    #[test]
    fn response_omits_absent_optional_fields() {
        let resp = ControlResponse::ok(Uuid::new_v4());
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("fd_attached"));
        assert!(!json.contains("error"));
    }
}
