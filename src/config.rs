use nix::unistd::getuid;
use std::path::{Path, PathBuf};

/// Default size, in bytes, of each channel's kernel buffer.
pub const PIPE_BUFFER_SIZE: usize = 32 * 1024;
/// Default root of the semaphore namespace.
pub const SEM_NAME_BASE: &str = "/sem/semapipe";

pub const ENV_PIPE_DIR: &str = "SEMAPIPE_PIPE_DIR";
pub const ENV_SEM_BASE: &str = "SEMAPIPE_SEM_BASE";
pub const ENV_BUFFER_SIZE: &str = "SEMAPIPE_BUFFER_SIZE";

/// Per-user pipe base: `$XDG_RUNTIME_DIR/semapipe` when the session
/// has a runtime directory, `<tmp>/semapipe-<uid>` otherwise. Other
/// users never share it.
pub fn default_pipe_base() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR").filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir).join("semapipe"),
        None => std::env::temp_dir().join(format!("semapipe-{}", getuid())),
    }
}

/// Settings for a [`crate::Namespace`]: where channel pipes are
/// created, how semaphores are named, and how large each pipe buffer
/// is.
///
/// Example:
/// ```
/// # use semapipe::*;
/// let mut config = NamespaceConfig::new();
/// config.pipe_base(std::env::temp_dir().join("my-app-pipes"))
///     .sem_base("/sem/my-app")
///     .buffer_size(64 * 1024);
/// let ns = Namespace::new(config);
/// assert_eq!(ns.config().sem_base_str(), "/sem/my-app");
/// ```
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    pipe_base: PathBuf,
    sem_base: String,
    buffer_size: usize,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            pipe_base: default_pipe_base(),
            sem_base: SEM_NAME_BASE.to_owned(),
            buffer_size: PIPE_BUFFER_SIZE,
        }
    }
}

impl NamespaceConfig {
    /// Returns the built-in defaults, ignoring the environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the defaults and applies any `SEMAPIPE_*`
    /// environment overrides. Unparseable buffer sizes are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os(ENV_PIPE_DIR).filter(|v| !v.is_empty()) {
            config.pipe_base(dir);
        }
        if let Ok(base) = std::env::var(ENV_SEM_BASE) {
            if !base.is_empty() {
                config.sem_base(base);
            }
        }
        match std::env::var(ENV_BUFFER_SIZE).map(|v| v.parse::<usize>()) {
            Ok(Ok(size)) if size > 0 => {
                config.buffer_size(size);
            }
            Ok(_) => tracing::warn!("ignoring invalid {ENV_BUFFER_SIZE}"),
            Err(_) => (),
        }
        config
    }

    /// Directory under which per-process pipe directories are created.
    /// It is created with mode 0700 if missing; an existing one must be
    /// a directory owned by the current user and not writable by group
    /// or others, or channel creation fails.
    pub fn pipe_base(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.pipe_base = dir.into();
        self
    }

    /// Prefix of every semaphore name. A trailing `/` is dropped.
    pub fn sem_base(&mut self, base: impl Into<String>) -> &mut Self {
        let mut base = base.into();
        while base.len() > 1 && base.ends_with('/') {
            base.pop();
        }
        self.sem_base = base;
        self
    }

    /// Kernel buffer size requested for each pipe.
    pub fn buffer_size(&mut self, size: usize) -> &mut Self {
        self.buffer_size = size;
        self
    }

    pub fn pipe_base_path(&self) -> &Path {
        &self.pipe_base
    }

    pub fn sem_base_str(&self) -> &str {
        &self.sem_base
    }

    pub fn buffer_size_bytes(&self) -> usize {
        self.buffer_size
    }
}
