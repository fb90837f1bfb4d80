//! Local channel between a transport and its askpass helper.
//!
//! Each published secret gets its own Unix socket, named after the owning
//! process id and the session id. The helper connects, sends the session id
//! on one line and receives the secret on one line. The server `take`s the
//! entry, so a second request gets an empty reply.

use std::path::PathBuf;
use std::time::Duration;

use crate::store::SessionId;

/// Upper bound on one request/response exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest request line accepted (a session id plus newline).
const MAX_REQUEST_LEN: u64 = 128;

/// Socket path used for `id` published by process `pid`.
pub fn socket_path(pid: u32, id: &SessionId) -> PathBuf {
    let dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
    dir.join(format!("sshforge-{pid}-{id}.sock"))
}

#[cfg(unix)]
pub(crate) use unix::Listener;

#[cfg(unix)]
pub use unix::fetch;

#[cfg(not(unix))]
pub(crate) use fallback::Listener;

#[cfg(not(unix))]
pub use fallback::fetch;

#[cfg(unix)]
mod unix {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{UnixListener, UnixStream};
    use tokio::task::JoinHandle;
    use tracing::{debug, warn};

    use super::{socket_path, EXCHANGE_TIMEOUT, MAX_REQUEST_LEN};
    use crate::error::{HandoffError, Result};
    use crate::secret::Secret;
    use crate::store::{store, SessionId};

    /// Serves one session id until dropped. Dropping removes the socket file.
    pub(crate) struct Listener {
        path: PathBuf,
        task: Option<JoinHandle<()>>,
    }

    impl Listener {
        /// Bind the socket for `id`. Must be called within a Tokio runtime.
        pub(crate) fn bind(id: SessionId) -> Result<Self> {
            let path = socket_path(std::process::id(), &id);
            // A leftover file can only come from a crashed process that had
            // our pid; it is never a live listener.
            let _ = std::fs::remove_file(&path);

            let listener = UnixListener::bind(&path)?;
            let mut this = Self { path, task: None };
            std::fs::set_permissions(&this.path, std::fs::Permissions::from_mode(0o600))?;

            this.task = Some(tokio::spawn(serve(listener, id)));
            debug!(path = %this.path.display(), "handoff listener bound");
            Ok(this)
        }
    }

    impl Drop for Listener {
        fn drop(&mut self) {
            if let Some(task) = self.task.take() {
                task.abort();
            }
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(%e, path = %self.path.display(), "failed to remove handoff socket");
                }
            }
        }
    }

    async fn serve(listener: UnixListener, id: SessionId) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    match tokio::time::timeout(EXCHANGE_TIMEOUT, answer(stream, &id)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(%e, "handoff request rejected"),
                        Err(_) => debug!("handoff request timed out"),
                    }
                }
                Err(e) => {
                    warn!(%e, "handoff listener accept failed");
                    break;
                }
            }
        }
    }

    async fn answer(stream: UnixStream, id: &SessionId) -> Result<()> {
        let peer = stream.peer_cred()?;
        // SAFETY: getuid has no preconditions and cannot fail.
        let own_uid = unsafe { libc::getuid() };
        if peer.uid() != own_uid {
            return Err(HandoffError::Protocol(format!(
                "peer uid {} does not own this session",
                peer.uid()
            )));
        }

        let (read_half, mut write_half) = stream.into_split();
        let mut request = String::new();
        BufReader::new(read_half.take(MAX_REQUEST_LEN))
            .read_line(&mut request)
            .await?;

        let requested: SessionId = request.trim_end().parse()?;
        if requested != *id {
            return Err(HandoffError::Protocol("session id mismatch".into()));
        }

        match store().take(id) {
            Ok(secret) => {
                write_half.write_all(secret.expose().as_bytes()).await?;
                write_half.write_all(b"\n").await?;
                debug!("handoff secret delivered");
            }
            Err(HandoffError::NotFound) => debug!("handoff secret already consumed"),
            Err(e) => return Err(e),
        }
        write_half.shutdown().await?;
        Ok(())
    }

    /// Helper side: ask process `pid` for the secret published under `id`.
    ///
    /// Returns `Ok(None)` when the entry was already consumed or purged.
    pub async fn fetch(pid: u32, id: &SessionId) -> Result<Option<Secret>> {
        tokio::time::timeout(EXCHANGE_TIMEOUT, request(pid, id))
            .await
            .map_err(|_| HandoffError::Timeout)?
    }

    async fn request(pid: u32, id: &SessionId) -> Result<Option<Secret>> {
        let mut stream = UnixStream::connect(socket_path(pid, id)).await?;
        stream.write_all(format!("{id}\n").as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(Some(Secret::from(line)))
    }
}

#[cfg(not(unix))]
mod fallback {
    use crate::error::{HandoffError, Result};
    use crate::secret::Secret;
    use crate::store::SessionId;

    pub(crate) struct Listener;

    impl Listener {
        pub(crate) fn bind(_id: SessionId) -> Result<Self> {
            Err(HandoffError::Unsupported)
        }
    }

    pub async fn fetch(_pid: u32, _id: &SessionId) -> Result<Option<Secret>> {
        Err(HandoffError::Unsupported)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::lease::Lease;
    use crate::secret::Secret;
    use crate::store::store;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_fetch_returns_secret_once() {
        let lease = Lease::publish(Secret::new("s3cret")).unwrap();
        let pid = std::process::id();

        let first = fetch(pid, &lease.id()).await.unwrap();
        assert_eq!(first.as_ref().map(Secret::expose), Some("s3cret"));
        assert!(!store().contains(&lease.id()));

        let second = fetch(pid, &lease.id()).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_release_removes_socket() {
        let lease = Lease::publish(Secret::new("s3cret")).unwrap();
        let id = lease.id();
        let path = socket_path(std::process::id(), &id);
        assert!(path.exists());

        lease.release();
        assert!(!path.exists());
        assert!(!store().contains(&id));
        assert!(fetch(std::process::id(), &id).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_session_id_gets_nothing() {
        let lease = Lease::publish(Secret::new("s3cret")).unwrap();
        let other = store().put(Secret::new("other"));

        // Connect to this lease's socket but ask for another entry.
        let path = socket_path(std::process::id(), &lease.id());
        let mut stream = tokio::net::UnixStream::connect(path).await.unwrap();
        stream.write_all(format!("{other}\n").as_bytes()).await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();

        assert!(reply.is_empty());
        assert!(store().contains(&lease.id()));
        assert!(store().contains(&other));
        store().purge(&other);
    }

    #[test]
    fn test_socket_path_names_pid_and_session() {
        let id = store().put(Secret::new("pw"));
        let path = socket_path(4242, &id);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, format!("sshforge-4242-{id}.sock"));
        store().purge(&id);
    }
}
