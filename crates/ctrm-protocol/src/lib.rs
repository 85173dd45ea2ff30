//! Wire types shared by the guest agent and the sidecar control server.
//!
//! Both protocols use the same framing (4-byte big-endian length prefix,
//! JSON payload, §4.1) and the same conventions for binary fields (base64
//! inside JSON). This crate owns the framing, the guest-agent `Frame`
//! schema, and the sidecar control `Envelope` schema so both binaries and
//! the host helper decode against one definition.

mod b64;
mod envelope;
mod error;
mod frame;
mod framing;

pub use envelope::{
    ControlError, ControlEvent, ControlEnvelope, ControlRequest, ControlResponse, ExecSpec,
    RequestMethod,
};
pub use error::{Error, ErrorKind, Result};
pub use frame::Frame;
pub use framing::{decode_message, encode_message, read_frame, write_frame, MAX_FRAME_SIZE};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexports_are_reachable() {
        let _ = MAX_FRAME_SIZE;
        let _: Result<()> = Ok(());
    }
}
