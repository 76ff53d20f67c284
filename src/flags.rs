use crate::error::{Error, Result};
use crate::registry::{registry, EndpointKey, PipeState};
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc::c_int;
use std::os::fd::{AsFd, AsRawFd, RawFd};

/// Which flag word a request addresses, mirroring `F_GETFD`/`F_SETFD`
/// and `F_GETFL`/`F_SETFL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagRequest {
    /// Descriptor flags (`FD_CLOEXEC`).
    Descriptor,
    /// File status flags (`O_NONBLOCK` and friends).
    Status,
}

fn generic_get(fd: RawFd, request: FlagRequest) -> nix::Result<c_int> {
    match request {
        FlagRequest::Descriptor => fcntl(fd, FcntlArg::F_GETFD),
        FlagRequest::Status => fcntl(fd, FcntlArg::F_GETFL),
    }
}

fn generic_set(fd: RawFd, request: FlagRequest, value: c_int) -> nix::Result<c_int> {
    match request {
        FlagRequest::Descriptor => fcntl(fd, FcntlArg::F_SETFD(FdFlag::from_bits_truncate(value))),
        FlagRequest::Status => fcntl(fd, FcntlArg::F_SETFL(OFlag::from_bits_truncate(value))),
    }
}

// Some((key, state)) when fd is a live channel endpoint.
fn endpoint_state(fd: RawFd) -> nix::Result<Option<(EndpointKey, PipeState)>> {
    let Some(key) = EndpointKey::of(fd)? else {
        return Ok(None);
    };
    Ok(registry().endpoint(&key).map(|record| (key, record.state)))
}

/// Reads a flag word. For channel endpoints the status word also
/// reports `O_NONBLOCK` when the pipe is in no-wait state.
pub fn get_flags(fd: impl AsFd, request: FlagRequest) -> Result<c_int> {
    let fd = fd.as_fd().as_raw_fd();
    let mut ret = generic_get(fd, request).map_err(Error::Flags)?;
    if request == FlagRequest::Status {
        if let Some((_, state)) = endpoint_state(fd).map_err(Error::Flags)? {
            if state.nowait {
                ret |= OFlag::O_NONBLOCK.bits();
            }
        }
    }
    Ok(ret)
}

/// Writes a flag word. For channel endpoints, setting the status word
/// also moves the pipe between wait and no-wait state, keeping its read
/// mode. That second step only fails if the endpoint is closed
/// concurrently; the generic flags are then put back and the call fails.
pub fn set_flags(fd: impl AsFd, request: FlagRequest, value: c_int) -> Result<c_int> {
    let fd = fd.as_fd().as_raw_fd();
    let previous = generic_get(fd, request).map_err(Error::Flags)?;
    let ret = generic_set(fd, request, value).map_err(Error::Flags)?;
    if request != FlagRequest::Status {
        return Ok(ret);
    }
    let pushed = endpoint_state(fd).and_then(|found| match found {
        Some((key, state)) => {
            let state = PipeState {
                nowait: value & OFlag::O_NONBLOCK.bits() != 0,
                read_mode: state.read_mode,
            };
            tracing::trace!(fd, ?state, "pushing pipe state");
            registry().set_pipe_state(&key, state)
        }
        None => Ok(()),
    });
    restore_on_failure(fd, request, previous, pushed)?;
    Ok(ret)
}

// A live endpoint's record cannot vanish while its descriptor is open,
// so `pushed` only fails when the endpoint is closed by another thread
// mid-call. The generic flags go back to `previous` either way.
fn restore_on_failure(
    fd: RawFd,
    request: FlagRequest,
    previous: c_int,
    pushed: nix::Result<()>,
) -> Result<()> {
    let Err(e) = pushed else {
        return Ok(());
    };
    if let Err(undo) = generic_set(fd, request, previous) {
        tracing::warn!(fd, "could not restore flags after failed pipe state update: {undo}");
    }
    Err(Error::Flags(e))
}

/// Pipe-specific state of a channel endpoint, or `None` for any other
/// descriptor.
pub fn pipe_state(fd: impl AsFd) -> Result<Option<PipeState>> {
    endpoint_state(fd.as_fd().as_raw_fd())
        .map(|found| found.map(|(_, state)| state))
        .map_err(Error::Flags)
}

pub fn is_nonblocking(fd: impl AsFd) -> Result<bool> {
    let flags = get_flags(fd, FlagRequest::Status)?;
    Ok(flags & OFlag::O_NONBLOCK.bits() != 0)
}

/// Switches `O_NONBLOCK` on or off through [`set_flags`].
pub fn set_nonblocking(fd: impl AsFd, nonblocking: bool) -> Result<()> {
    let fd = fd.as_fd();
    let mut flags = get_flags(fd, FlagRequest::Status)?;
    if nonblocking {
        flags |= OFlag::O_NONBLOCK.bits();
    } else {
        flags &= !OFlag::O_NONBLOCK.bits();
    }
    set_flags(fd, FlagRequest::Status, flags).map(drop)
}

pub fn is_cloexec(fd: impl AsFd) -> Result<bool> {
    let flags = get_flags(fd, FlagRequest::Descriptor)?;
    Ok(flags & FdFlag::FD_CLOEXEC.bits() != 0)
}

pub fn set_cloexec(fd: impl AsFd, cloexec: bool) -> Result<()> {
    let fd = fd.as_fd();
    let mut flags = get_flags(fd, FlagRequest::Descriptor)?;
    if cloexec {
        flags |= FdFlag::FD_CLOEXEC.bits();
    } else {
        flags &= !FdFlag::FD_CLOEXEC.bits();
    }
    set_flags(fd, FlagRequest::Descriptor, flags).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ReadMode;
    use nix::errno::Errno;
    use std::io::Read;

    #[test]
    fn nonblocking_round_trips_on_endpoint() {
        let (mut r, w) = crate::pipe().unwrap();
        assert!(!is_nonblocking(&r).unwrap());
        assert_eq!(pipe_state(&r).unwrap(), Some(PipeState::default()));

        set_nonblocking(&r, true).unwrap();
        assert!(is_nonblocking(&r).unwrap());
        set_nonblocking(&r, true).unwrap();
        assert!(is_nonblocking(&r).unwrap());
        let state = pipe_state(&r).unwrap().unwrap();
        assert!(state.nowait);
        assert_eq!(state.read_mode, ReadMode::Byte);

        let mut buf = [0u8; 4];
        let err = r.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);

        set_nonblocking(&r, false).unwrap();
        assert!(!is_nonblocking(&r).unwrap());
        assert!(!pipe_state(&r).unwrap().unwrap().nowait);
        // the write side is untouched
        assert!(!is_nonblocking(&w).unwrap());
    }

    #[test]
    fn cloexec_set_on_creation() {
        let (r, w) = crate::pipe().unwrap();
        assert!(is_cloexec(&r).unwrap());
        assert!(is_cloexec(&w).unwrap());
        set_cloexec(&w, false).unwrap();
        assert!(!is_cloexec(&w).unwrap());
    }

    #[test]
    fn plain_files_use_generic_flags() {
        let file = tempfile::tempfile().unwrap();
        assert_eq!(pipe_state(&file).unwrap(), None);
        assert!(!is_nonblocking(&file).unwrap());
        set_nonblocking(&file, true).unwrap();
        assert!(is_nonblocking(&file).unwrap());
        set_nonblocking(&file, false).unwrap();
        assert!(!is_nonblocking(&file).unwrap());
    }

    #[test]
    fn failed_pipe_state_push_restores_flags() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        let previous = generic_get(fd, FlagRequest::Status).unwrap();
        generic_set(fd, FlagRequest::Status, previous | OFlag::O_NONBLOCK.bits()).unwrap();
        assert!(is_nonblocking(&file).unwrap());

        let err = restore_on_failure(fd, FlagRequest::Status, previous, Err(Errno::EBADF))
            .unwrap_err();
        assert!(matches!(err, Error::Flags(Errno::EBADF)), "{err:?}");
        assert!(!is_nonblocking(&file).unwrap());
        assert_eq!(generic_get(fd, FlagRequest::Status).unwrap(), previous);

        restore_on_failure(fd, FlagRequest::Status, previous, Ok(())).unwrap();
    }

    #[test]
    fn foreign_pipes_are_not_endpoints() {
        let (r, _w) = nix::unistd::pipe().unwrap();
        assert_eq!(pipe_state(&r).unwrap(), None);
        set_nonblocking(&r, true).unwrap();
        assert!(is_nonblocking(&r).unwrap());
    }
}
