use crate::channel::{Endpoint, Namespace};
use crate::error::{errno_of, Error, Result};
use crate::flags;
use crate::ioconfig::{IOConfig, RedirectEndpoint};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::wait::waitpid;
use nix::unistd::{fork, pipe2, ForkResult, Pid};
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};

const STDIN_FILENO: RawFd = 0;
const STDOUT_FILENO: RawFd = 1;

/// A running child process and the parent's ends of its stdin and
/// stdout channels. Both ends are non-blocking.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    stdin: Endpoint,
    stdout: Endpoint,
}

impl ChildProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }
    /// Write end feeding the child's stdin. Drop it to send EOF.
    pub fn stdin(&mut self) -> &mut Endpoint {
        &mut self.stdin
    }
    /// Read end receiving the child's stdout.
    pub fn stdout(&mut self) -> &mut Endpoint {
        &mut self.stdout
    }
    pub fn into_parts(self) -> (Pid, Endpoint, Endpoint) {
        (self.pid, self.stdin, self.stdout)
    }
}

// Program path and argv, ready for execvp before the fork happens.
struct CommandLine {
    path: CString,
    argv: Vec<CString>,
}

impl CommandLine {
    fn parse(command_line: &str) -> Result<Self> {
        let words = shlex::split(command_line)
            .filter(|words| !words.is_empty())
            .ok_or_else(|| Error::Argument(command_line.to_owned()))?;
        let argv = words
            .into_iter()
            .map(CString::new)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::Argument(command_line.to_owned()))?;
        Ok(Self {
            path: argv[0].clone(),
            argv,
        })
    }

    fn program(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

impl Namespace {
    /// Starts `command_line` with its stdin and stdout connected to two
    /// fresh channels of this namespace. The program is looked up on
    /// `PATH`. The parent's own standard streams are left untouched.
    ///
    /// Example:
    /// ```
    /// # use semapipe::*;
    /// # use std::io::Read;
    /// # use std::os::fd::AsFd;
    /// let mut child = Namespace::global().create_child("echo hello")?;
    /// let mut out = Vec::new();
    /// loop {
    ///     let mut buf = [0u8; 64];
    ///     match child.stdout().read(&mut buf) {
    ///         Ok(0) => break,
    ///         Ok(n) => out.extend_from_slice(&buf[..n]),
    ///         Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
    ///             await_readiness(None, Some(child.stdout().as_fd()))?;
    ///         }
    ///         Err(e) => return Err(e.into()),
    ///     }
    /// }
    /// assert_eq!(out, b"hello\n");
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn create_child(&self, command_line: &str) -> Result<ChildProcess> {
        let cmdline = CommandLine::parse(command_line)?;

        let (mut stdin_r, stdin_w) = self.create_channel()?;
        stdin_r.move_off(STDOUT_FILENO)?;
        let (stdout_r, mut stdout_w) = self.create_channel()?;
        stdout_w.move_off(STDIN_FILENO)?;

        let mut redirects = [
            RedirectEndpoint::new(stdin_r, STDIN_FILENO),
            RedirectEndpoint::new(stdout_w, STDOUT_FILENO),
        ];
        let pid = spawn(&cmdline, &redirects)?;
        tracing::debug!(%pid, command = command_line, "child spawned");
        // the child has its own copies now
        for config in redirects.iter_mut() {
            config.parent_post_fork();
        }

        flags::set_nonblocking(&stdin_w, true)?;
        flags::set_nonblocking(&stdout_r, true)?;
        Ok(ChildProcess {
            pid,
            stdin: stdin_w,
            stdout: stdout_r,
        })
    }
}

/// Starts `command_line` in the global namespace. See
/// [`Namespace::create_child()`].
pub fn create_child(command_line: &str) -> Result<ChildProcess> {
    Namespace::global().create_child(command_line)
}

// fork + execvp without waiting. An exec failure in the child comes back
// as an errno over a close-on-exec pipe: EOF means the exec happened.
fn spawn(cmdline: &CommandLine, redirects: &[IOConfig]) -> Result<Pid> {
    let (status_r, status_w) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::resource("create exec status pipe", e))?;
    let mut argv: Vec<*const libc::c_char> = cmdline.argv.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    // SAFETY: between fork and exec the child only calls dup2, fcntl,
    // execvp, write and _exit, all async-signal-safe, on data prepared
    // before the fork.
    let forked = unsafe { fork() }.map_err(|source| Error::Spawn {
        program: cmdline.program(),
        source,
    })?;
    match forked {
        ForkResult::Child => {
            let errno = match redirects.iter().try_for_each(|config| config.child_post_fork()) {
                Ok(()) => {
                    unsafe { libc::execvp(cmdline.path.as_ptr(), argv.as_ptr()) };
                    Errno::last()
                }
                Err(errno) => errno,
            };
            let code = (errno as i32).to_ne_bytes();
            unsafe {
                libc::write(status_w.as_raw_fd(), code.as_ptr().cast(), code.len());
                libc::_exit(127)
            }
        }
        ForkResult::Parent { child } => {
            drop(status_w);
            let mut status = File::from(status_r);
            let mut code = [0u8; 4];
            let mut filled = 0;
            while filled < code.len() {
                match status.read(&mut code[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(Error::resource("read exec status", errno_of(&e))),
                }
            }
            if filled == 0 {
                return Ok(child);
            }
            // exec failed; the child is already on its way out
            if let Err(e) = waitpid(child, None) {
                tracing::warn!(%child, "could not reap failed child: {e}");
            }
            let source = if filled == code.len() {
                Errno::from_raw(i32::from_ne_bytes(code))
            } else {
                Errno::EIO
            };
            Err(Error::Spawn {
                program: cmdline.program(),
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_tokenizes() {
        let cmd = CommandLine::parse("gzip -d -c 'my file.gz'").unwrap();
        assert_eq!(cmd.program(), "gzip");
        let args: Vec<_> = cmd.argv.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(args, ["gzip", "-d", "-c", "my file.gz"]);
    }

    #[test]
    fn bad_command_lines_are_argument_errors() {
        for bad in ["", "   ", "echo 'unterminated", "a\0b"] {
            assert!(
                matches!(CommandLine::parse(bad), Err(Error::Argument(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = create_child("semapipe-no-such-program-here --flag").unwrap_err();
        match err {
            Error::Spawn { program, source } => {
                assert_eq!(program, "semapipe-no-such-program-here");
                assert_eq!(source, Errno::ENOENT);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn parent_ends_are_nonblocking() {
        let mut child = create_child("cat").unwrap();
        assert!(child.stdin().is_nonblocking().unwrap());
        assert!(child.stdout().is_nonblocking().unwrap());
        assert!(child.pid().as_raw() > 0);
        let (pid, stdin, stdout) = child.into_parts();
        drop((stdin, stdout));
        waitpid(pid, None).unwrap();
    }
}
