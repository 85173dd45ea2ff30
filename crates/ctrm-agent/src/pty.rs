//! PTY allocation and resize for terminal-mode `exec` (spec §4.6: "TTY mode:
//! allocate a pty; attach the slave to child stdio; read from the master.").

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::pty::{openpty, OpenptyResult, Winsize};

/// Open a fresh pty sized `cols x rows`.
pub fn open(cols: u16, rows: u16) -> io::Result<OpenptyResult> {
    openpty(
        Some(&Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }),
        None,
    )
    .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
}

/// Duplicate a borrowed fd into a new, independently-closable `OwnedFd`.
///
/// Used to hand the pty slave to the child's stdin/stdout/stderr as three
/// separate descriptors while the agent keeps the original.
pub fn dup_fd(fd: &OwnedFd) -> io::Result<OwnedFd> {
    let raw = unsafe { libc::dup(fd.as_raw_fd()) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// `ioctl(fd, TIOCSWINSZ, ...)` on an already-open pty master.
pub fn resize(fd: RawFd, cols: u16, rows: u16) -> io::Result<()> {
    let ws = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
