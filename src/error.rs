use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported at the crate boundary. Every operation releases
/// what it allocated before returning one of these.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A named pipe or semaphore could not be created, attached, or
    /// opened.
    #[error("channel resource failure during {op}: {source}")]
    Resource {
        op: &'static str,
        #[source]
        source: Errno,
    },

    /// The command line did not tokenize into a program and arguments.
    #[error("invalid command line: {0:?}")]
    Argument(String),

    /// The readiness wait could not be composed or failed while
    /// blocking.
    #[error("readiness wait failed during {op}: {source}")]
    Wait {
        op: &'static str,
        #[source]
        source: Errno,
    },

    /// The descriptor flag request failed. After a failed set the flags
    /// are restored to what they were before the call.
    #[error("descriptor flag request failed: {0}")]
    Flags(#[source] Errno),

    /// The child process could not be started.
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: Errno,
    },
}

impl Error {
    pub(crate) fn resource(op: &'static str, source: Errno) -> Self {
        Self::Resource { op, source }
    }

    pub(crate) fn wait(op: &'static str, source: Errno) -> Self {
        Self::Wait { op, source }
    }
}

// std::fs reports io::Error; everything else in the crate speaks Errno.
pub(crate) fn errno_of(e: &std::io::Error) -> Errno {
    e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}
