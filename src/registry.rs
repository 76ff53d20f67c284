use crate::naming::ChannelIdentity;
use crate::semaphore::EventSemaphore;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::{fstat, lstat, Mode, SFlag};
use nix::unistd::{getuid, mkdir};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Which side of a simplex channel a descriptor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Read,
    Write,
}

/// How reads on a pipe are delimited. Channels are always created in
/// byte mode; the message bit is carried through flag updates
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    #[default]
    Byte,
    Message,
}

/// Pipe-specific state kept alongside the descriptor's generic flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipeState {
    pub nowait: bool,
    pub read_mode: ReadMode,
}

/// Identifies the open pipe behind a descriptor. Duplicated
/// descriptors share the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EndpointKey {
    dev: u64,
    ino: u64,
    role: Role,
}

impl EndpointKey {
    /// Returns `Ok(None)` when `fd` is valid but not a pipe.
    pub(crate) fn of(fd: RawFd) -> nix::Result<Option<Self>> {
        let st = fstat(fd)?;
        if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFIFO {
            return Ok(None);
        }
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
        let access = flags & OFlag::O_ACCMODE;
        let role = if access == OFlag::O_RDONLY {
            Role::Read
        } else if access == OFlag::O_WRONLY {
            Role::Write
        } else {
            // our endpoints are never opened read-write
            return Ok(None);
        };
        Ok(Some(Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            role,
        }))
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EndpointRecord {
    pub(crate) identity: ChannelIdentity,
    pub(crate) state: PipeState,
}

struct SemaphoreEntry {
    sem: Arc<EventSemaphore>,
    attached: usize,
}

/// Process-wide bookkeeping: which pipes are channel endpoints, which
/// semaphores are live, and which pipe directories are in use.
#[derive(Default)]
pub(crate) struct Registry {
    endpoints: HashMap<EndpointKey, EndpointRecord>,
    semaphores: HashMap<String, SemaphoreEntry>,
    pipe_dirs: HashMap<PathBuf, usize>,
}

// Creates `path` (not its parents) with mode 0700, or accepts an existing
// directory only if it is ours and nobody else can write into it.
fn ensure_private_dir(path: &Path) -> nix::Result<()> {
    match mkdir(path, Mode::S_IRWXU) {
        Ok(()) | Err(Errno::EEXIST) => (),
        Err(e) => return Err(e),
    }
    let st = lstat(path)?;
    if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFDIR {
        return Err(Errno::ENOTDIR);
    }
    let shared = Mode::from_bits_truncate(st.st_mode) & (Mode::S_IWGRP | Mode::S_IWOTH);
    if st.st_uid != getuid().as_raw() || !shared.is_empty() {
        tracing::warn!(dir = %path.display(), uid = st.st_uid, "refusing pipe directory");
        return Err(Errno::EACCES);
    }
    Ok(())
}

pub(crate) fn registry() -> MutexGuard<'static, Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY
        .get_or_init(Default::default)
        .lock()
        // the maps stay consistent even if a holder panicked
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Registry {
    pub(crate) fn create_semaphore(&mut self, sem: Arc<EventSemaphore>) -> nix::Result<()> {
        let name = sem.name().to_owned();
        if self.semaphores.contains_key(&name) {
            return Err(Errno::EEXIST);
        }
        self.semaphores.insert(name, SemaphoreEntry { sem, attached: 0 });
        Ok(())
    }

    pub(crate) fn open_semaphore(&self, name: &str) -> nix::Result<Arc<EventSemaphore>> {
        self.semaphores
            .get(name)
            .map(|entry| Arc::clone(&entry.sem))
            .ok_or(Errno::ENOENT)
    }

    /// Drops a semaphore regardless of attachments. Used when channel
    /// creation unwinds.
    pub(crate) fn remove_semaphore(&mut self, name: &str) {
        self.semaphores.remove(name);
    }

    /// Records `key` as an endpoint of `sem`'s channel.
    pub(crate) fn attach(
        &mut self,
        sem: &EventSemaphore,
        key: EndpointKey,
        state: PipeState,
    ) -> nix::Result<()> {
        if self.endpoints.contains_key(&key) {
            return Err(Errno::EBUSY);
        }
        let entry = self.semaphores.get_mut(sem.name()).ok_or(Errno::ENOENT)?;
        entry.attached += 1;
        self.endpoints.insert(
            key,
            EndpointRecord {
                identity: sem.identity().clone(),
                state,
            },
        );
        Ok(())
    }

    /// Forgets an endpoint. The channel's semaphore goes away with its
    /// last endpoint.
    pub(crate) fn detach(&mut self, key: &EndpointKey) {
        let Some(record) = self.endpoints.remove(key) else {
            return;
        };
        let name = record.identity.sem_name();
        if let Some(entry) = self.semaphores.get_mut(&name) {
            entry.attached = entry.attached.saturating_sub(1);
            if entry.attached == 0 {
                self.semaphores.remove(&name);
                tracing::debug!(sem = %name, "semaphore released");
            }
        }
    }

    pub(crate) fn endpoint(&self, key: &EndpointKey) -> Option<&EndpointRecord> {
        self.endpoints.get(key)
    }

    pub(crate) fn set_pipe_state(
        &mut self,
        key: &EndpointKey,
        state: PipeState,
    ) -> nix::Result<()> {
        let record = self.endpoints.get_mut(key).ok_or(Errno::EBADF)?;
        record.state = state;
        Ok(())
    }

    /// Ensures the private `base` and its per-process `dir` exist and
    /// pins `dir` until [`Self::release_pipe_dir`].
    pub(crate) fn acquire_pipe_dir(&mut self, base: &Path, dir: &Path) -> nix::Result<()> {
        if !self.pipe_dirs.contains_key(dir) {
            ensure_private_dir(base)?;
            ensure_private_dir(dir)?;
        }
        *self.pipe_dirs.entry(dir.to_owned()).or_insert(0) += 1;
        Ok(())
    }

    /// Unpins `dir`, removing it once no channel creation needs it.
    pub(crate) fn release_pipe_dir(&mut self, dir: &Path) {
        let Some(users) = self.pipe_dirs.get_mut(dir) else {
            return;
        };
        *users -= 1;
        if *users == 0 {
            self.pipe_dirs.remove(dir);
            if let Err(e) = std::fs::remove_dir(dir) {
                tracing::warn!(dir = %dir.display(), "could not remove pipe directory: {e}");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn has_semaphore_with_prefix(&self, prefix: &str) -> bool {
        self.semaphores.keys().any(|name| name.starts_with(prefix))
    }
}
