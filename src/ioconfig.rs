use crate::channel::Endpoint;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::dup2;
use std::os::fd::{AsRawFd, RawFd};

pub(crate) type IOConfig = Box<dyn ConfigureIO>;

pub(crate) trait ConfigureIO {
    // NOTE: runs in the forked child before exec. Only async-signal-safe
    // calls here: no allocation, no locks, and never drop an Endpoint
    // (its Drop takes the registry lock). The child execs or _exits, so
    // ownership doesn't matter.
    fn child_post_fork(&self) -> nix::Result<()>;
    // NOTE: drop Endpoints in the parent hook. The parent keeps only
    // the ends it talks to the child through.
    fn parent_post_fork(&mut self) {}
}

/// Places a channel endpoint into one of the child's standard slots.
/// The parent's copy is closed once the child has been spawned.
pub(crate) struct RedirectEndpoint {
    endpoint: Option<Endpoint>,
    slot: RawFd,
}

impl RedirectEndpoint {
    pub(crate) fn new(endpoint: Endpoint, slot: RawFd) -> IOConfig {
        Box::new(Self {
            endpoint: Some(endpoint),
            slot,
        })
    }
}

impl ConfigureIO for RedirectEndpoint {
    fn child_post_fork(&self) -> nix::Result<()> {
        let Some(fd) = self.endpoint.as_ref().map(|x| x.as_raw_fd()) else {
            return Ok(());
        };
        if fd == self.slot {
            // dup2 onto itself keeps FD_CLOEXEC, which would close the
            // slot at exec
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map(drop)
        } else {
            dup2(fd, self.slot).map(drop)
        }
    }

    fn parent_post_fork(&mut self) {
        self.endpoint.take();
    }
}
