use crate::error::{RegistryError, Result};
use crate::storage::TempBlob;
use chrono::{DateTime, Utc};
use std::time::Instant;
use uuid::Uuid;

pub type UploadId = Uuid;

/// Lifecycle of a chunked upload.
///
/// ```text
/// Initiated --append--> Receiving --begin_verify--> Verifying --verified--> Committed
///     |                   ^   |                         |
///     |                   |   +--cancel--> Cancelled     |
///     +--begin_verify---> |                              |
///                         +----------rejected------------+
/// Initiated | Receiving --expire--> Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Initiated,
    Receiving,
    Verifying,
    Committed,
    Cancelled,
    Expired,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Initiated => "initiated",
            UploadState::Receiving => "receiving",
            UploadState::Verifying => "verifying",
            UploadState::Committed => "committed",
            UploadState::Cancelled => "cancelled",
            UploadState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Committed | UploadState::Cancelled | UploadState::Expired
        )
    }

    fn invalid(self, event: &'static str) -> RegistryError {
        RegistryError::InvalidState {
            state: self.as_str(),
            event,
        }
    }

    pub fn append(self) -> Result<Self> {
        match self {
            UploadState::Initiated | UploadState::Receiving => Ok(UploadState::Receiving),
            other => Err(other.invalid("append to")),
        }
    }

    pub fn begin_verify(self) -> Result<Self> {
        match self {
            UploadState::Initiated | UploadState::Receiving => Ok(UploadState::Verifying),
            other => Err(other.invalid("commit")),
        }
    }

    pub fn verified(self) -> Result<Self> {
        match self {
            UploadState::Verifying => Ok(UploadState::Committed),
            other => Err(other.invalid("complete")),
        }
    }

    /// Verification failed; content is kept and the upload may continue.
    pub fn rejected(self) -> Result<Self> {
        match self {
            UploadState::Verifying => Ok(UploadState::Receiving),
            other => Err(other.invalid("reject")),
        }
    }

    pub fn cancel(self) -> Result<Self> {
        match self {
            UploadState::Initiated | UploadState::Receiving => Ok(UploadState::Cancelled),
            other => Err(other.invalid("cancel")),
        }
    }

    pub fn expire(self) -> Result<Self> {
        match self {
            UploadState::Initiated | UploadState::Receiving => Ok(UploadState::Expired),
            other => Err(other.invalid("expire")),
        }
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One in-progress upload. The offset is always the staged length.
#[derive(Debug)]
pub struct UploadSession {
    pub(crate) id: UploadId,
    pub(crate) repository: String,
    pub(crate) state: UploadState,
    pub(crate) staged: Option<TempBlob>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) last_activity: Instant,
}

impl UploadSession {
    pub(crate) fn new(repository: &str, staged: TempBlob) -> Self {
        Self {
            id: Uuid::new_v4(),
            repository: repository.to_string(),
            state: UploadState::Initiated,
            staged: Some(staged),
            started_at: Utc::now(),
            last_activity: Instant::now(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.staged.as_ref().map(TempBlob::len).unwrap_or(0)
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    pub id: UploadId,
    pub repository: String,
    pub offset: u64,
    pub state: UploadState,
    pub started_at: DateTime<Utc>,
}

impl From<&UploadSession> for UploadStatus {
    fn from(session: &UploadSession) -> Self {
        Self {
            id: session.id,
            repository: session.repository.clone(),
            offset: session.offset(),
            state: session.state,
            started_at: session.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::UploadState::*;

    #[test]
    fn happy_path() {
        let s = Initiated.append().unwrap();
        assert_eq!(s, Receiving);
        let s = s.append().unwrap().begin_verify().unwrap();
        assert_eq!(s, Verifying);
        assert_eq!(s.verified().unwrap(), Committed);
    }

    #[test]
    fn rejected_goes_back_to_receiving() {
        let s = Receiving.begin_verify().unwrap().rejected().unwrap();
        assert_eq!(s, Receiving);
        assert_eq!(Initiated.begin_verify().unwrap().rejected().unwrap(), Receiving);
    }

    #[test]
    fn terminal_states_refuse_everything() {
        for state in [Committed, Cancelled, Expired] {
            assert!(state.is_terminal());
            assert!(state.append().is_err());
            assert!(state.begin_verify().is_err());
            assert!(state.cancel().is_err());
            assert!(state.expire().is_err());
        }
    }

    #[test]
    fn verifying_cannot_be_cancelled_or_appended() {
        assert!(Verifying.cancel().is_err());
        assert!(Verifying.append().is_err());
        assert!(Receiving.verified().is_err());
        assert!(Receiving.rejected().is_err());
    }
}
