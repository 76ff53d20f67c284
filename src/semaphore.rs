use crate::error::{Error, Result};
use crate::naming::ChannelIdentity;
use crate::registry::registry;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Named event semaphore attached to both endpoints of a channel.
///
/// It starts unsignaled. Whoever observes a state change on the channel
/// posts it, and whoever consumes the change resets it. The semaphore
/// lives in the process-wide namespace until the last endpoint of its
/// channel is closed.
///
/// [`crate::await_readiness`] posts and resets within a single call, so
/// from outside the crate a semaphore is only ever seen unsignaled;
/// [`Self::reset`] is public so callers can clear it by name.
#[derive(Debug)]
pub struct EventSemaphore {
    name: String,
    identity: ChannelIdentity,
    posts: AtomicU32,
}

impl EventSemaphore {
    /// Registers a new, unsignaled semaphore under `identity`'s
    /// semaphore name. Fails if the name is already taken.
    pub(crate) fn create(identity: &ChannelIdentity) -> Result<Arc<Self>> {
        let sem = Arc::new(Self {
            name: identity.sem_name(),
            identity: identity.clone(),
            posts: AtomicU32::new(0),
        });
        registry()
            .create_semaphore(Arc::clone(&sem))
            .map_err(|e| Error::resource("create semaphore", e))?;
        Ok(sem)
    }

    /// Opens a live semaphore by name.
    pub fn open(name: &str) -> Result<Arc<Self>> {
        registry()
            .open_semaphore(name)
            .map_err(|e| Error::wait("open semaphore", e))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &ChannelIdentity {
        &self.identity
    }

    pub(crate) fn post(&self) {
        self.posts.fetch_add(1, Ordering::AcqRel);
    }

    /// Consumes the signal, returning how many posts were pending.
    pub fn reset(&self) -> u32 {
        self.posts.swap(0, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub(crate) fn is_posted(&self) -> bool {
        self.posts.load(Ordering::Acquire) > 0
    }
}

/// Removes a freshly created semaphore unless disarmed. Channel creation
/// holds one until both endpoints are attached.
pub(crate) struct SemaphoreGuard {
    sem: Arc<EventSemaphore>,
    armed: bool,
}

impl SemaphoreGuard {
    pub(crate) fn new(sem: Arc<EventSemaphore>) -> Self {
        Self { sem, armed: true }
    }

    pub(crate) fn sem(&self) -> &EventSemaphore {
        &self.sem
    }

    pub(crate) fn disarm(mut self) -> Arc<EventSemaphore> {
        self.armed = false;
        Arc::clone(&self.sem)
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        if self.armed {
            registry().remove_semaphore(self.sem.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamespaceConfig;

    #[test]
    fn create_open_post_reset() {
        let ident = ChannelIdentity::next(&NamespaceConfig::new());
        let guard = SemaphoreGuard::new(EventSemaphore::create(&ident).unwrap());
        assert!(!guard.sem().is_posted());

        let opened = EventSemaphore::open(&ident.sem_name()).unwrap();
        opened.post();
        opened.post();
        assert!(guard.sem().is_posted());
        assert_eq!(guard.sem().reset(), 2);
        assert_eq!(opened.reset(), 0);

        // name is unique while live
        assert!(matches!(
            EventSemaphore::create(&ident),
            Err(Error::Resource { .. })
        ));

        drop(guard);
        assert!(matches!(
            EventSemaphore::open(&ident.sem_name()),
            Err(Error::Wait { .. })
        ));
    }
}
