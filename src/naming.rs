use crate::config::NamespaceConfig;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Shared by every namespace: names already embed the pid, so one
// counter per process keeps them distinct even when bases coincide.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// The name of one channel. Both the pipe name and the semaphore name
/// are derived from `{base, pid, id}`, so either can be computed from
/// the other.
///
/// Two identities are equal when their pid and id match; the bases only
/// decide where the names live.
#[derive(Clone)]
pub struct ChannelIdentity {
    pid: u32,
    id: u64,
    pipe_base: Arc<Path>,
    sem_base: Arc<str>,
}

impl ChannelIdentity {
    /// Allocates a fresh identity in the given namespace.
    pub(crate) fn next(config: &NamespaceConfig) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1;
        Self {
            pid: std::process::id(),
            id,
            pipe_base: Arc::from(config.pipe_base_path()),
            sem_base: Arc::from(config.sem_base_str()),
        }
    }

    /// Recovers the identity a pipe name was derived from. Returns
    /// `None` for names outside `config`'s pipe namespace.
    pub fn from_pipe_name(config: &NamespaceConfig, pipe_name: &Path) -> Option<Self> {
        let rest = pipe_name.strip_prefix(config.pipe_base_path()).ok()?;
        let mut parts = rest.iter().map(|p| p.to_str());
        let pid = u32::from_str_radix(parts.next()??, 16).ok()?;
        let id = u64::from_str_radix(parts.next()??, 16).ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            pid,
            id,
            pipe_base: Arc::from(config.pipe_base_path()),
            sem_base: Arc::from(config.sem_base_str()),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pipe_base(&self) -> &Path {
        &self.pipe_base
    }

    /// Per-process directory that holds this identity's pipe.
    pub fn pipe_dir(&self) -> PathBuf {
        self.pipe_base.join(format!("{:x}", self.pid))
    }

    /// `<pipe-base>/<pid-hex>/<id-hex>`
    pub fn pipe_name(&self) -> PathBuf {
        self.pipe_dir().join(format!("{:x}", self.id))
    }

    /// `<sem-base>/<pid-hex>/<id-hex>`
    pub fn sem_name(&self) -> String {
        format!("{}/{:x}/{:x}", self.sem_base, self.pid, self.id)
    }
}

impl PartialEq for ChannelIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid && self.id == other.id
    }
}
impl Eq for ChannelIdentity {}

impl Hash for ChannelIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pid.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Debug for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelIdentity({:x}/{:x})", self.pid, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config() -> NamespaceConfig {
        let mut config = NamespaceConfig::new();
        config.pipe_base("/tmp/np-test").sem_base("/sem/np-test");
        config
    }

    #[test]
    fn names_share_pid_and_id() {
        let ident = ChannelIdentity::next(&config());
        let tail = format!("{:x}/{:x}", ident.pid(), ident.id());
        assert_eq!(ident.sem_name(), format!("/sem/np-test/{tail}"));
        assert_eq!(ident.pipe_name(), Path::new("/tmp/np-test").join(&tail));
    }

    #[test]
    fn pipe_name_parses_back() {
        let config = config();
        let ident = ChannelIdentity::next(&config);
        let parsed = ChannelIdentity::from_pipe_name(&config, &ident.pipe_name())
            .expect("Should have parsed own pipe name");
        assert_eq!(parsed, ident);
        assert_eq!(parsed.sem_name(), ident.sem_name());

        assert!(ChannelIdentity::from_pipe_name(&config, Path::new("/elsewhere/1/2")).is_none());
        assert!(ChannelIdentity::from_pipe_name(&config, &ident.pipe_dir()).is_none());
    }

    #[test]
    fn concurrent_identities_are_distinct() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    let config = config();
                    (0..500)
                        .map(|_| ChannelIdentity::next(&config))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for ident in handle.join().unwrap() {
                assert!(seen.insert(ident), "identity collision");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
