//! One-shot, bounded-wait completion gate (spec §9 "Callback-to-task bridging").
//!
//! Wraps a callback-style API (here: our own blocking calls, standing in for
//! the virtualization host's completion-callback APIs) in a bounded wait so a
//! non-delivering callback cannot hang a caller. If the callback fires after
//! the wait has already given up, the late result is dropped — for an
//! `OwnedFd`/`UnixStream` result this closes the descriptor, so ownership
//! never leaks to two places at once (spec §9 "Ownership for late fds").

use std::sync::mpsc;
use std::time::Duration;

/// Run `f` on a new thread; wait up to `timeout` for it to finish.
///
/// Returns `None` on timeout. The spawned thread keeps running to
/// completion regardless; its result is simply discarded (dropped) if
/// nobody is left to receive it.
pub fn bounded<T, F>(timeout: Duration, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let value = f();
        // Err here means the receiver already gave up; `value` is dropped,
        // closing any fd it owns.
        let _ = tx.send(value);
    });
    rx.recv_timeout(timeout).ok()
}
