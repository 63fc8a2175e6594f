//! Conversation archive
//!
//! Key-value store for finished stream transcripts, addressed by session id.
//! Writes are fire-and-forget from the streaming side: a failing archive is
//! logged and never fails a negotiation or a stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use infermesh_core::StreamStatus;

use crate::{ClientError, Result};

/// Message history of one stream session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub session_id: String,
    pub job_id: String,
    pub peer_id: String,
    /// Prompt the job was negotiated with, if known
    #[serde(default)]
    pub prompt: Option<String>,
    /// Delivered token contents, in index order
    pub tokens: Vec<String>,
    /// Index of the first delivered token
    pub first_index: u64,
    pub final_status: StreamStatus,
    pub started_at: u64,
    pub finished_at: u64,
}

impl Transcript {
    /// Concatenated output
    pub fn text(&self) -> String {
        self.tokens.concat()
    }
}

#[async_trait]
pub trait ConversationArchive: Send + Sync + 'static {
    async fn put(&self, session_id: &str, transcript: Transcript) -> Result<()>;

    async fn get(&self, session_id: &str) -> Result<Option<Transcript>>;
}

/// In-process archive
#[derive(Default)]
pub struct MemoryArchive {
    entries: RwLock<HashMap<String, Transcript>>,
    failing: AtomicBool,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClientError::Archive("archive unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationArchive for MemoryArchive {
    async fn put(&self, session_id: &str, transcript: Transcript) -> Result<()> {
        self.check()?;
        self.entries.write().insert(session_id.to_string(), transcript);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Transcript>> {
        self.check()?;
        Ok(self.entries.read().get(session_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript() -> Transcript {
        Transcript {
            session_id: "s1".to_string(),
            job_id: "job".to_string(),
            peer_id: "peer".to_string(),
            prompt: Some("hello".to_string()),
            tokens: vec!["Hel".to_string(), "lo".to_string()],
            first_index: 0,
            final_status: StreamStatus::Closed,
            started_at: 1,
            finished_at: 2,
        }
    }

    #[tokio::test]
    async fn test_put_get() {
        let archive = MemoryArchive::new();
        archive.put("s1", transcript()).await.unwrap();
        let stored = archive.get("s1").await.unwrap().unwrap();
        assert_eq!(stored.text(), "Hello");
        assert!(archive.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_archive() {
        let archive = MemoryArchive::new();
        archive.set_failing(true);
        assert!(matches!(
            archive.put("s1", transcript()).await,
            Err(ClientError::Archive(_))
        ));
        archive.set_failing(false);
        archive.put("s1", transcript()).await.unwrap();
        assert_eq!(archive.len(), 1);
    }
}
