use tracing::debug;

use crate::channel::Listener;
use crate::error::{HandoffError, Result};
use crate::secret::Secret;
use crate::store::{store, SessionId};

/// Ownership of one published secret.
///
/// While a lease is alive the secret sits in the global store and a helper
/// can fetch it over the local channel. Dropping the lease purges the entry
/// and tears the channel down, whether or not the helper ever asked.
pub struct Lease {
    id: SessionId,
    listener: Option<Listener>,
}

impl Lease {
    /// Publish `secret` for an out-of-process helper.
    ///
    /// Must be called within a Tokio runtime. On failure nothing is left
    /// behind in the store. The channel is line-based, so a secret holding
    /// `\n` or `\r` is refused.
    pub fn publish(secret: Secret) -> Result<Self> {
        if secret.expose().contains(['\n', '\r']) {
            return Err(HandoffError::LineBreakInSecret);
        }
        let mut lease = Self {
            id: store().put(secret),
            listener: None,
        };
        lease.listener = Some(Listener::bind(lease.id)?);
        Ok(lease)
    }

    /// Id the helper must present, exported to it via the environment.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Purge the secret now.
    pub fn release(self) {}
}

impl Drop for Lease {
    fn drop(&mut self) {
        store().purge(&self.id);
        self.listener.take();
        debug!("handoff lease released");
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drop_purges_unread_secret() {
        let lease = Lease::publish(Secret::new("pw")).unwrap();
        let id = lease.id();
        assert!(store().contains(&id));

        drop(lease);
        assert!(!store().contains(&id));
    }

    #[tokio::test]
    async fn test_leases_do_not_share_entries() {
        let a = Lease::publish(Secret::new("a")).unwrap();
        let b = Lease::publish(Secret::new("b")).unwrap();
        assert_ne!(a.id(), b.id());

        let b_id = b.id();
        a.release();
        assert!(store().contains(&b_id));
        drop(b);
        assert!(!store().contains(&b_id));
    }

    #[tokio::test]
    async fn test_line_break_in_secret_refused() {
        for secret in ["first\nsecond", "trailing\r", "\n"] {
            assert!(matches!(
                Lease::publish(Secret::new(secret)),
                Err(HandoffError::LineBreakInSecret)
            ));
        }
    }
}
