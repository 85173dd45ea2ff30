//! Host-side terminal plumbing for the `exec` CLI's interactive mode.
//!
//! Out of scope for the core (spec §1: "the XPC routing surface above the
//! helper" owns the real TTY), but a CLI that drives `process.resize` and
//! forwards host stdin needs raw mode and a way to multiplex stdin against
//! the control socket without blocking forever on either. Mirrors
//! `ctrm-agent/src/pty.rs`'s style: nix for the typed wrappers it has
//! (termios, poll), plain `libc::ioctl` for the one thing nix doesn't wrap.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::sys::termios::{self, SetArg, Termios};

/// Puts a tty fd into raw mode for the lifetime of the guard, restoring the
/// original `termios` settings on drop.
pub struct RawModeGuard {
    fd: RawFd,
    original: Termios,
}

impl RawModeGuard {
    /// `fd` must refer to a tty (see [`stdin_is_tty`]).
    pub fn enable(fd: RawFd) -> io::Result<Self> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let original = termios::tcgetattr(borrowed).map_err(io_err)?;

        let mut raw = original.clone();
        raw.input_flags &= !(termios::InputFlags::BRKINT
            | termios::InputFlags::ICRNL
            | termios::InputFlags::INPCK
            | termios::InputFlags::ISTRIP
            | termios::InputFlags::IXON);
        raw.output_flags &= !termios::OutputFlags::OPOST;
        raw.control_flags |= termios::ControlFlags::CS8;
        raw.local_flags &= !(termios::LocalFlags::ECHO
            | termios::LocalFlags::ICANON
            | termios::LocalFlags::IEXTEN
            | termios::LocalFlags::ISIG);
        raw.control_chars[termios::SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[termios::SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(borrowed, SetArg::TCSAFLUSH, &raw).map_err(io_err)?;
        Ok(Self { fd, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let _ = termios::tcsetattr(borrowed, SetArg::TCSAFLUSH, &self.original);
    }
}

fn io_err(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// True when `fd` is attached to a tty (used to decide `terminal: true` on
/// the `exec` spec and whether raw mode applies at all).
pub fn stdin_is_tty(fd: RawFd) -> bool {
    unsafe { libc::isatty(fd) == 1 }
}

/// `ioctl(fd, TIOCGWINSZ, ...)`, mirroring `ctrm-agent::pty::resize`'s use
/// of the raw ioctl for the one call nix leaves unwrapped.
pub fn get_terminal_size(fd: RawFd) -> io::Result<(u16, u16)> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((ws.ws_col, ws.ws_row))
}

/// Outcome of a [`poll_io`] call across stdin and a socket fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollResult {
    pub stdin_ready: bool,
    pub socket_ready: bool,
    pub hup: bool,
}

/// `poll()` over stdin and a control/session fd with a bounded wait, so an
/// interactive `exec` can pump whichever side has data without a dedicated
/// thread per direction.
pub fn poll_io(stdin_fd: RawFd, socket_fd: RawFd, timeout_ms: i32) -> io::Result<PollResult> {
    let mut fds = [
        libc::pollfd { fd: stdin_fd, events: libc::POLLIN, revents: 0 },
        libc::pollfd { fd: socket_fd, events: libc::POLLIN, revents: 0 },
    ];
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(PollResult { stdin_ready: false, socket_ready: false, hup: false });
        }
        return Err(err);
    }
    let hup_bits = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
    Ok(PollResult {
        stdin_ready: fds[0].revents & libc::POLLIN != 0,
        socket_ready: fds[1].revents & libc::POLLIN != 0,
        hup: fds[0].revents & hup_bits != 0 || fds[1].revents & hup_bits != 0,
    })
}

/// Stdin set to non-blocking mode for the lifetime of the guard (so a read
/// that would block instead returns `WouldBlock`, letting the `exec` loop
/// fall through to the next `poll_io` instead of stalling on a half-closed
/// peer).
pub struct NonBlockingStdin {
    fd: RawFd,
    original_flags: libc::c_int,
}

impl NonBlockingStdin {
    pub fn enable(fd: RawFd) -> io::Result<Self> {
        let original_flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if original_flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, original_flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd, original_flags })
    }
}

impl Drop for NonBlockingStdin {
    fn drop(&mut self) {
        unsafe {
            libc::fcntl(self.fd, libc::F_SETFL, self.original_flags);
        }
    }
}
