use super::session::{UploadId, UploadSession, UploadStatus};
use crate::digest::Digest;
use crate::error::{RegistryError, Result};
use crate::storage::{validate_repository, Blob, BlobStore, StorageArea};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;

struct SessionEntry {
    repository: String,
    session: Arc<Mutex<UploadSession>>,
}

/// Table of live upload sessions.
///
/// Each session has its own lock, taken with `try_lock`: a request that finds
/// the session busy fails with `SessionBusy` instead of queueing behind it.
pub struct UploadSessionManager {
    blobs: Arc<dyn BlobStore>,
    sessions: RwLock<HashMap<UploadId, SessionEntry>>,
    timeout: Duration,
}

impl UploadSessionManager {
    pub fn new(blobs: Arc<dyn BlobStore>, timeout: Duration) -> Self {
        Self {
            blobs,
            sessions: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub async fn initiate(&self, repository: &str) -> Result<UploadId> {
        validate_repository(repository)?;
        let staged = self.blobs.begin_write(StorageArea::Registry).await?;
        let session = UploadSession::new(repository, staged);
        let id = session.id;

        self.sessions.write().await.insert(
            id,
            SessionEntry {
                repository: repository.to_string(),
                session: Arc::new(Mutex::new(session)),
            },
        );

        tracing::info!(repository = repository, upload = %id, "Upload session started");
        Ok(id)
    }

    /// Take exclusive hold of a session for one operation.
    async fn acquire(&self, repository: &str, id: &UploadId) -> Result<OwnedMutexGuard<UploadSession>> {
        let session = {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(entry) if entry.repository == repository => entry.session.clone(),
                _ => return Err(RegistryError::upload_not_found(id)),
            }
        };

        let guard = session
            .try_lock_owned()
            .map_err(|_| RegistryError::SessionBusy(id.to_string()))?;

        // Finished while we were looking it up
        if guard.state.is_terminal() {
            return Err(RegistryError::upload_not_found(id));
        }
        Ok(guard)
    }

    async fn remove(&self, id: &UploadId) {
        self.sessions.write().await.remove(id);
    }

    /// Append one in-memory chunk at `offset`.
    pub async fn append_chunk(
        &self,
        repository: &str,
        id: &UploadId,
        offset: u64,
        data: Bytes,
    ) -> Result<u64> {
        let body = futures::stream::once(async move { Ok::<_, std::io::Error>(data) });
        self.append_stream(repository, id, Some(offset), body).await
    }

    /// Append a streamed chunk. `offset` of `None` appends at the current end.
    ///
    /// Returns the new offset. If the stream fails part way, the staged file
    /// is cut back to where it was before the call.
    pub async fn append_stream<S, E>(
        &self,
        repository: &str,
        id: &UploadId,
        offset: Option<u64>,
        body: S,
    ) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut session = self.acquire(repository, id).await?;

        let current = session.offset();
        if let Some(requested) = offset {
            if requested != current {
                return Err(RegistryError::RangeMismatch { requested, current });
            }
        }

        let next = session.state.append()?;
        self.write_body(&mut session, body).await?;
        session.state = next;
        session.touch();

        tracing::debug!(
            upload = %id,
            offset = session.offset(),
            appended = session.offset() - current,
            "Chunk appended"
        );
        Ok(session.offset())
    }

    async fn write_body<S, E>(&self, session: &mut UploadSession, body: S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        let staged = session
            .staged
            .as_mut()
            .ok_or(RegistryError::InvalidState {
                state: "closed",
                event: "append to",
            })?;
        let start = staged.len();
        let mut body = std::pin::pin!(body);

        let mut failure = None;
        while let Some(chunk) = body.next().await {
            let written = match chunk {
                Ok(chunk) => self.blobs.append(staged, &chunk).await,
                Err(e) => Err(RegistryError::Io(std::io::Error::other(e))),
            };
            if let Err(e) = written {
                failure = Some(e);
                break;
            }
        }

        match failure {
            None => Ok(()),
            Some(e) => {
                tracing::warn!(
                    upload = %session.id,
                    offset = start,
                    error = %e,
                    "Chunk failed part way, rolling back"
                );
                self.blobs.truncate(staged, start).await?;
                Err(e)
            }
        }
    }

    /// Finish an upload, verifying everything staged against `expected`.
    pub async fn commit(&self, repository: &str, id: &UploadId, expected: &Digest) -> Result<Blob> {
        let empty = futures::stream::empty::<std::result::Result<Bytes, std::io::Error>>();
        self.commit_with_chunk(repository, id, expected, empty).await
    }

    /// Append a final chunk (the PUT body) and commit in one step.
    pub async fn commit_with_chunk<S, E>(
        &self,
        repository: &str,
        id: &UploadId,
        expected: &Digest,
        body: S,
    ) -> Result<Blob>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut session = self.acquire(repository, id).await?;

        // Validate the transition before touching any data
        session.state.begin_verify()?;

        let before = session.offset();
        self.write_body(&mut session, body).await?;
        if session.offset() > before {
            session.state = session.state.append()?;
        }
        session.state = session.state.begin_verify()?;
        session.touch();

        let staged = session
            .staged
            .as_mut()
            .ok_or(RegistryError::InvalidState {
                state: "closed",
                event: "commit",
            })?;

        match self.blobs.commit(staged, expected).await {
            Ok(blob) => {
                session.state = session.state.verified()?;
                session.staged = None;
                drop(session);
                self.remove(id).await;
                tracing::info!(
                    repository = repository,
                    upload = %id,
                    digest = %blob.digest,
                    size = blob.size,
                    "Upload committed"
                );
                Ok(blob)
            }
            Err(e) => {
                session.state = session.state.rejected()?;
                tracing::warn!(
                    repository = repository,
                    upload = %id,
                    error = %e,
                    "Upload commit failed, session kept open"
                );
                Err(e)
            }
        }
    }

    pub async fn cancel(&self, repository: &str, id: &UploadId) -> Result<()> {
        let mut session = self.acquire(repository, id).await?;
        session.state = session.state.cancel()?;

        let staged = session.staged.take();
        drop(session);
        self.remove(id).await;

        if let Some(staged) = staged {
            self.blobs.discard(staged).await?;
        }
        tracing::info!(repository = repository, upload = %id, "Upload cancelled");
        Ok(())
    }

    /// Offset and state. Waits for a busy session rather than failing.
    pub async fn status(&self, repository: &str, id: &UploadId) -> Result<UploadStatus> {
        let session = {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(entry) if entry.repository == repository => entry.session.clone(),
                _ => return Err(RegistryError::upload_not_found(id)),
            }
        };

        let session = session.lock().await;
        if session.state.is_terminal() {
            return Err(RegistryError::upload_not_found(id));
        }
        Ok(UploadStatus::from(&*session))
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Expire every session idle for longer than the timeout.
    ///
    /// Busy sessions are in use and therefore not idle; they are skipped.
    pub async fn sweep_expired(&self) -> usize {
        let candidates: Vec<(UploadId, Arc<Mutex<UploadSession>>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.session.clone()))
            .collect();

        let mut expired = 0;
        for (id, session) in candidates {
            let Ok(mut session) = session.try_lock_owned() else {
                continue;
            };
            if session.last_activity.elapsed() < self.timeout {
                continue;
            }
            let Ok(next) = session.state.expire() else {
                continue;
            };
            session.state = next;
            let staged = session.staged.take();
            let repository = session.repository.clone();
            drop(session);
            self.remove(&id).await;

            if let Some(staged) = staged {
                if let Err(e) = self.blobs.discard(staged).await {
                    tracing::error!(upload = %id, error = %e, "Failed to remove expired upload data");
                }
            }
            tracing::info!(repository = %repository, upload = %id, "Upload session expired");
            expired += 1;
        }
        expired
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval`.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = self.sweep_expired().await;
                if expired > 0 {
                    tracing::debug!(expired = expired, "Upload sweep finished");
                }
            }
        })
    }
}

impl std::fmt::Debug for UploadSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSessionManager")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
