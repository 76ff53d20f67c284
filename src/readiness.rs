use crate::error::{Error, Result};
use crate::registry::{registry, EndpointKey, Role};
use crate::semaphore::EventSemaphore;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::Arc;

/// Which supplied endpoint a readiness wait woke up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member {
    /// The first argument of [`await_readiness`], usually the write end
    /// feeding a child's stdin.
    Input = 1,
    /// The second argument, usually the read end of a child's stdout.
    Output = 2,
}

struct Opened<'fd> {
    member: Member,
    fd: BorrowedFd<'fd>,
    interest: PollFlags,
    sem: Arc<EventSemaphore>,
}

fn open_member(member: Member, fd: BorrowedFd<'_>) -> Result<Opened<'_>> {
    let key = EndpointKey::of(fd.as_raw_fd())
        .and_then(|key| key.ok_or(Errno::EINVAL))
        .map_err(|e| Error::wait("resolve endpoint", e))?;
    let identity = registry()
        .endpoint(&key)
        .map(|record| record.identity.clone())
        .ok_or_else(|| Error::wait("resolve endpoint", Errno::EINVAL))?;
    let sem = EventSemaphore::open(&identity.sem_name())?;
    let interest = match key.role() {
        Role::Read => PollFlags::POLLIN,
        Role::Write => PollFlags::POLLOUT,
    };
    Ok(Opened {
        member,
        fd,
        interest,
        sem,
    })
}

fn wait_any(opened: &[Opened<'_>]) -> Result<Member> {
    let mut fds: Vec<PollFd<'_>> = opened
        .iter()
        .map(|m| PollFd::new(m.fd, m.interest))
        .collect();
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::wait("poll", e)),
        }
    }
    let mut fired = None;
    for (m, pfd) in opened.iter().zip(&fds) {
        if pfd.revents().is_some_and(|r| !r.is_empty()) {
            m.sem.post();
            fired.get_or_insert(m.member);
        }
    }
    fired.ok_or_else(|| Error::wait("poll", Errno::EAGAIN))
}

/// Blocks until one of the given channel endpoints changes state: data
/// or space became available, or the peer went away. There is no
/// timeout. Waking up does not promise that the next read or write will
/// succeed, so callers retry with non-blocking I/O.
///
/// Returns the member that fired, or `None` straight away when no
/// endpoint is given. Descriptors that are not live channel endpoints
/// are a [`Error::Wait`].
///
/// Example:
/// ```
/// # use semapipe::*;
/// # use std::io::Write;
/// # use std::os::fd::AsFd;
/// let (r, mut w) = pipe()?;
/// w.write_all(b"x")?;
/// assert_eq!(await_readiness(None, Some(r.as_fd()))?, Some(Member::Output));
/// assert_eq!(await_readiness(None, None)?, None);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn await_readiness(
    input: Option<BorrowedFd<'_>>,
    output: Option<BorrowedFd<'_>>,
) -> Result<Option<Member>> {
    let opened = [(Member::Input, input), (Member::Output, output)]
        .into_iter()
        .filter_map(|(member, fd)| fd.map(|fd| open_member(member, fd)))
        .collect::<Result<Vec<_>>>()?;
    if opened.is_empty() {
        return Ok(None);
    }
    tracing::trace!(members = opened.len(), "waiting for readiness");
    let fired = wait_any(&opened);
    for m in opened.iter().rev() {
        m.sem.reset();
    }
    fired.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;
    use std::time::{Duration, Instant};

    const DELAY: Duration = Duration::from_millis(150);

    #[test]
    fn wakes_on_write() {
        let (r, mut w) = crate::pipe().unwrap();
        let start = Instant::now();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(DELAY);
            w.write_all(b"late").unwrap();
            w
        });
        let fired = await_readiness(None, Some(r.as_fd())).unwrap();
        assert_eq!(fired, Some(Member::Output));
        assert!(start.elapsed() >= DELAY / 2);
        let _w = writer.join().unwrap();
    }

    #[test]
    fn wakes_on_disconnect() {
        let (mut r, w) = crate::pipe().unwrap();
        let start = Instant::now();
        let closer = std::thread::spawn(move || {
            std::thread::sleep(DELAY);
            drop(w);
        });
        assert_eq!(
            await_readiness(Some(r.as_fd()), None).unwrap(),
            Some(Member::Input)
        );
        assert!(start.elapsed() >= DELAY / 2);
        closer.join().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn pending_data_returns_at_once() {
        let (r, mut w) = crate::pipe().unwrap();
        w.write_all(b"ready").unwrap();
        for _ in 0..3 {
            assert!(await_readiness(None, Some(r.as_fd())).unwrap().is_some());
        }
    }

    #[test]
    fn reports_the_member_that_fired() {
        let (quiet_r, _quiet_w) = crate::pipe().unwrap();
        let (busy_r, mut busy_w) = crate::pipe().unwrap();
        busy_w.write_all(b"!").unwrap();
        let fired = await_readiness(Some(quiet_r.as_fd()), Some(busy_r.as_fd())).unwrap();
        assert_eq!(fired, Some(Member::Output));
        let fired = await_readiness(Some(busy_r.as_fd()), Some(quiet_r.as_fd())).unwrap();
        assert_eq!(fired, Some(Member::Input));
    }

    #[test]
    fn semaphores_are_consumed() {
        let (r, mut w) = crate::pipe().unwrap();
        w.write_all(b"x").unwrap();
        await_readiness(None, Some(r.as_fd())).unwrap();
        let sem = EventSemaphore::open(&r.identity().sem_name()).unwrap();
        assert!(!sem.is_posted());
    }

    #[test]
    fn zero_members_is_a_no_op() {
        assert_eq!(await_readiness(None, None).unwrap(), None);
    }

    #[test]
    fn foreign_descriptors_are_wait_errors() {
        let file = tempfile::tempfile().unwrap();
        assert!(matches!(
            await_readiness(Some(file.as_fd()), None),
            Err(Error::Wait { .. })
        ));
        let (plain_r, _plain_w) = nix::unistd::pipe().unwrap();
        assert!(matches!(
            await_readiness(None, Some(plain_r.as_fd())),
            Err(Error::Wait { .. })
        ));
    }
}
