//! Registry of connected worker sessions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::model::WorkerToken;

/// One open worker stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSession {
    pub worker_token: WorkerToken,
    pub remote_address: String,
    pub supported_modules: Vec<String>,
    /// Advisory; the dispatcher never enforces it.
    pub concurrency: usize,
    pub connected_at: DateTime<Utc>,
}

/// Sessions keyed by worker token, shared by every connection task.
#[derive(Debug, Default)]
pub struct WorkerSessions {
    inner: Mutex<HashMap<WorkerToken, WorkerSession>>,
}

impl WorkerSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: WorkerSession) {
        let mut sessions = self.inner.lock().await;
        sessions.insert(session.worker_token.clone(), session);
    }

    pub async fn remove(&self, token: &WorkerToken) -> Option<WorkerSession> {
        self.inner.lock().await.remove(token)
    }

    /// Snapshot of all sessions, oldest connection first.
    pub async fn list(&self) -> Vec<WorkerSession> {
        let mut sessions: Vec<WorkerSession> = self.inner.lock().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn session(token: &str, connected_at: DateTime<Utc>) -> WorkerSession {
        WorkerSession {
            worker_token: WorkerToken(token.into()),
            remote_address: "127.0.0.1:5000".into(),
            supported_modules: vec!["Hayabusa".into()],
            concurrency: 1,
            connected_at,
        }
    }

    #[tokio::test]
    async fn list_is_oldest_first_and_remove_forgets() {
        let sessions = WorkerSessions::new();
        let now = Utc::now();
        sessions.insert(session("late", now)).await;
        sessions.insert(session("early", now - Duration::seconds(5))).await;

        let tokens: Vec<String> = sessions.list().await.into_iter().map(|s| s.worker_token.0).collect();
        assert_eq!(tokens, ["early", "late"]);

        assert!(sessions.remove(&WorkerToken("early".into())).await.is_some());
        assert!(sessions.remove(&WorkerToken("early".into())).await.is_none());
        assert_eq!(sessions.list().await.len(), 1);
    }
}
