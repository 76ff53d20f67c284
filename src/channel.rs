use crate::config::NamespaceConfig;
use crate::error::{Error, Result};
use crate::flags;
use crate::naming::ChannelIdentity;
use crate::registry::{registry, EndpointKey, PipeState, Role};
use crate::semaphore::{EventSemaphore, SemaphoreGuard};
use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, unlink};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// One side of a channel. Reading and writing go straight to the
/// underlying pipe; flags are managed with the functions in
/// [`crate::flags`]. Dropping an endpoint closes it.
#[derive(Debug)]
pub struct Endpoint {
    file: File,
    role: Role,
    identity: ChannelIdentity,
    key: EndpointKey,
}

impl Endpoint {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn identity(&self) -> &ChannelIdentity {
        &self.identity
    }

    pub fn is_nonblocking(&self) -> Result<bool> {
        flags::is_nonblocking(self)
    }

    pub fn is_cloexec(&self) -> Result<bool> {
        flags::is_cloexec(self)
    }

    /// If this endpoint occupies descriptor `slot`, moves it to the
    /// lowest free descriptor above the standard streams and closes the
    /// original. The new descriptor is close-on-exec.
    pub fn move_off(&mut self, slot: RawFd) -> Result<()> {
        if self.file.as_raw_fd() != slot {
            return Ok(());
        }
        let moved = fcntl(slot, FcntlArg::F_DUPFD_CLOEXEC(3))
            .map_err(|e| Error::resource("duplicate endpoint", e))?;
        // SAFETY: `moved` was just returned by F_DUPFD_CLOEXEC and is
        // owned by nobody else.
        let moved = unsafe { File::from_raw_fd(moved) };
        tracing::trace!(from = slot, to = moved.as_raw_fd(), "endpoint moved");
        // the old descriptor closes as it is replaced
        self.file = moved;
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        registry().detach(&self.key);
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Where channels are named and how they are sized. Most callers use
/// [`Namespace::global()`] through [`crate::pipe()`] and
/// [`crate::create_child()`].
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    config: NamespaceConfig,
}

impl Namespace {
    pub fn new(config: NamespaceConfig) -> Self {
        Self { config }
    }

    /// The process-wide namespace, configured from the environment on
    /// first use. See [`NamespaceConfig::from_env()`].
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<Namespace> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(NamespaceConfig::from_env()))
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    /// Recovers a channel identity from a pipe name in this namespace.
    pub fn identity_from_pipe_name(&self, pipe_name: &Path) -> Option<ChannelIdentity> {
        ChannelIdentity::from_pipe_name(&self.config, pipe_name)
    }

    /// Creates a simplex channel and returns its `(read, write)`
    /// endpoints. Both start in blocking, close-on-exec mode. On
    /// failure nothing created along the way survives.
    ///
    /// Example:
    /// ```
    /// # use semapipe::*;
    /// # use std::io::{Read, Write};
    /// let (mut r, mut w) = Namespace::global().create_channel()?;
    /// w.write_all(b"ping")?;
    /// drop(w);
    /// let mut got = String::new();
    /// r.read_to_string(&mut got)?;
    /// assert_eq!(got, "ping");
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn create_channel(&self) -> Result<(Endpoint, Endpoint)> {
        let identity = ChannelIdentity::next(&self.config);
        let pipe_name = identity.pipe_name();

        let fifo = Fifo::create(&identity)?;
        // opening the read side without waiting is the connect step; it
        // must happen before anyone can open the write side
        let read_file = open_side(&pipe_name, OFlag::O_RDONLY)?;
        let write_file = open_side(&pipe_name, OFlag::O_WRONLY)?;
        // both sides are open; the name has done its job
        fifo.remove()?;
        set_buffer_size(&read_file, self.config.buffer_size_bytes())?;

        let sem = SemaphoreGuard::new(EventSemaphore::create(&identity)?);
        let read = attach(&sem, read_file, &identity)?;
        let write = attach(&sem, write_file, &identity)?;
        sem.disarm();

        for end in [&read, &write] {
            flags::set_nonblocking(end, false)
                .and_then(|_| flags::set_cloexec(end, true))
                .map_err(|e| match e {
                    Error::Flags(errno) => Error::resource("set endpoint flags", errno),
                    other => other,
                })?;
        }
        tracing::debug!(
            ?identity,
            read = read.as_raw_fd(),
            write = write.as_raw_fd(),
            "channel created"
        );
        Ok((read, write))
    }
}

/// Creates a channel in the global namespace, like `pipe(2)`.
///
/// Example:
/// ```
/// # use semapipe::*;
/// # use std::io::{Read, Write};
/// let (mut r, mut w) = pipe()?;
/// assert_eq!(r.identity(), w.identity());
/// w.write_all(b"abc")?;
/// let mut buf = [0u8; 3];
/// r.read_exact(&mut buf)?;
/// assert_eq!(&buf, b"abc");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn pipe() -> Result<(Endpoint, Endpoint)> {
    Namespace::global().create_channel()
}

// The named pipe between mkfifo and unlink. Dropping it unlinks the
// name and unpins the per-process directory.
struct Fifo {
    path: Option<PathBuf>,
    dir: PathBuf,
}

impl Fifo {
    fn create(identity: &ChannelIdentity) -> Result<Self> {
        let dir = identity.pipe_dir();
        let path = identity.pipe_name();
        registry()
            .acquire_pipe_dir(identity.pipe_base(), &dir)
            .map_err(|e| Error::resource("create pipe directory", e))?;
        if let Err(e) = mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR) {
            registry().release_pipe_dir(&dir);
            return Err(Error::resource("create pipe", e));
        }
        Ok(Self {
            path: Some(path),
            dir,
        })
    }

    fn remove(mut self) -> Result<()> {
        match self.path.take() {
            Some(path) => unlink(&path).map_err(|e| Error::resource("remove pipe name", e)),
            None => Ok(()),
        }
    }
}

impl Drop for Fifo {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = unlink(&path) {
                tracing::warn!(path = %path.display(), "could not remove pipe: {e}");
            }
        }
        registry().release_pipe_dir(&self.dir);
    }
}

fn open_side(path: &Path, access: OFlag) -> Result<File> {
    // no O_CREAT: the write side only opens an existing pipe, and
    // O_NONBLOCK keeps both opens from waiting on a peer
    let fd = open(path, access | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| Error::resource("open pipe", e))?;
    // SAFETY: `fd` was just opened and is owned by nobody else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_buffer_size(file: &File, size: usize) -> Result<()> {
    let size =
        i32::try_from(size).map_err(|_| Error::resource("size pipe buffer", Errno::EINVAL))?;
    fcntl(file.as_raw_fd(), FcntlArg::F_SETPIPE_SZ(size))
        .map(drop)
        .map_err(|e| Error::resource("size pipe buffer", e))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_buffer_size(_file: &File, _size: usize) -> Result<()> {
    Ok(())
}

fn attach(sem: &SemaphoreGuard, file: File, identity: &ChannelIdentity) -> Result<Endpoint> {
    let key = EndpointKey::of(file.as_raw_fd())
        .and_then(|key| key.ok_or(Errno::EINVAL))
        .map_err(|e| Error::resource("identify pipe", e))?;
    registry()
        .attach(sem.sem(), key, PipeState::default())
        .map_err(|e| Error::resource("attach semaphore", e))?;
    Ok(Endpoint {
        file,
        role: key.role(),
        identity: identity.clone(),
        key,
    })
}
