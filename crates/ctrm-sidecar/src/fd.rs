//! `SCM_RIGHTS` fd passing on the ephemeral `vm.connectVsock` connection
//! (spec §4.7, §9). Grounded on the ancillary-data pattern in
//! `examples/orbstack-swift-nio/wormhole` (`recv_rpc_client` /
//! `wormhole-proxy`), adapted from async to the blocking per-connection
//! model the rest of this sidecar uses.

use std::io::IoSlice;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, RecvMsg};

/// Send a single marker byte, optionally followed by one fd via `SCM_RIGHTS`.
///
/// The caller owns `fd` until this call returns; on success ownership has
/// passed to the peer and `fd` must not be used again (spec §9: "must
/// duplicate-then-close its own copy so the fd lifetime is entirely on the
/// receiver" — duplication happens at the call site, this just transmits).
pub fn send_marker_and_fd(stream: &UnixStream, fd: Option<RawFd>) -> std::io::Result<()> {
    let marker = [fd.is_some() as u8];
    let iov = [IoSlice::new(&marker)];
    match fd {
        Some(fd) => {
            let fds = [fd];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map_err(std::io::Error::from)?;
        }
        None => {
            sendmsg::<()>(stream.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
                .map_err(std::io::Error::from)?;
        }
    }
    Ok(())
}

/// Read the marker byte and, if set, the ancillary fd that follows it.
pub fn recv_marker_and_fd(stream: &UnixStream) -> std::io::Result<Option<OwnedFd>> {
    let mut marker = [0u8; 1];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
    let mut iov = [std::io::IoSliceMut::new(&mut marker)];

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
    use std::os::fd::IntoRawFd;

    #[test]
    fn round_trips_marker_without_fd() {
        let (a, b) = UnixStream::pair().unwrap();
        send_marker_and_fd(&a, None).unwrap();
        let fd = recv_marker_and_fd(&b).unwrap();
        assert!(fd.is_none());
    }

    #[test]
    fn round_trips_marker_with_fd() {
        let (a, b) = UnixStream::pair().unwrap();
        let (payload_a, payload_b) = UnixStream::pair().unwrap();
        drop(payload_b);
        let raw = payload_a.into_raw_fd();
        send_marker_and_fd(&a, Some(raw)).unwrap();
        unsafe {
            libc::close(raw);
        }
        let fd = recv_marker_and_fd(&b).unwrap();
        assert!(fd.is_some());
    }
}
