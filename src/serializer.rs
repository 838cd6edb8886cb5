use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::adapter::{Adapter, AdapterResult};

/// A single process-wide mutual-exclusion gate shared by every
/// [`SerializedAdapter`] in the process, ensuring at most one adapter call
/// is in flight anywhere at a time.
/// Adapters may talk to non-threadsafe backends (a single DB connection, a
/// shared filesystem handle); this trades throughput for a simple
/// correctness story rather than pushing thread-safety onto every adapter
/// implementor.
pub type AdapterGate = Arc<Mutex<()>>;

pub fn new_gate() -> AdapterGate {
    Arc::new(Mutex::new(()))
}

/// Wraps one connection's adapter instance so every call through it
/// acquires the shared [`AdapterGate`] first: one method per adapter
/// method, each just acquire-call-release.
pub struct SerializedAdapter {
    gate: AdapterGate,
    inner: Box<dyn Adapter>,
}

impl SerializedAdapter {
    pub fn new(gate: AdapterGate, inner: Box<dyn Adapter>) -> Self {
        SerializedAdapter { gate, inner }
    }

    pub async fn connection_opened(&mut self, addr: IpAddr, port: u16) -> AdapterResult<()> {
        let _permit = self.gate.lock().await;
        self.inner.connection_opened(addr, port).await
    }

    pub async fn read_only_mode_allowed(&mut self) -> AdapterResult<bool> {
        let _permit = self.gate.lock().await;
        self.inner.read_only_mode_allowed().await
    }

    pub async fn verify_login_credentials(&mut self, username: &str, password: &str) -> AdapterResult<bool> {
        let _permit = self.gate.lock().await;
        self.inner.verify_login_credentials(username, password).await
    }

    pub async fn login_successful(&mut self, username: &str, read_only: bool) -> AdapterResult<()> {
        let _permit = self.gate.lock().await;
        self.inner.login_successful(username, read_only).await
    }

    pub async fn get_message_count(&mut self) -> AdapterResult<usize> {
        let _permit = self.gate.lock().await;
        self.inner.get_message_count().await
    }

    pub async fn get_message_content(&mut self, index: usize, encoding: &str) -> AdapterResult<String> {
        let _permit = self.gate.lock().await;
        self.inner.get_message_content(index, encoding).await
    }

    pub async fn get_message_unique_id(&mut self, index: usize) -> AdapterResult<String> {
        let _permit = self.gate.lock().await;
        self.inner.get_message_unique_id(index).await
    }

    pub async fn is_message_marked_as_deleted(&mut self, index: usize) -> AdapterResult<bool> {
        let _permit = self.gate.lock().await;
        self.inner.is_message_marked_as_deleted(index).await
    }

    pub async fn mark_message_as_deleted(&mut self, index: usize) -> AdapterResult<()> {
        let _permit = self.gate.lock().await;
        self.inner.mark_message_as_deleted(index).await
    }

    pub async fn unmark_messages_marked_as_deleted(&mut self) -> AdapterResult<()> {
        let _permit = self.gate.lock().await;
        self.inner.unmark_messages_marked_as_deleted().await
    }

    pub async fn commit_deletions(&mut self) -> AdapterResult<()> {
        let _permit = self.gate.lock().await;
        self.inner.commit_deletions().await
    }

    pub async fn connection_closed(&mut self) -> AdapterResult<()> {
        let _permit = self.gate.lock().await;
        self.inner.connection_closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::MockAdapter;

    #[tokio::test]
    async fn calls_pass_through_to_the_inner_adapter() {
        let gate = new_gate();
        let mock = MockAdapter::new("alice", "hunter2", vec![("u1", "From: a\r\n\r\nhi")]);
        let mut adapter = SerializedAdapter::new(gate, Box::new(mock));

        assert!(adapter.verify_login_credentials("alice", "hunter2").await.unwrap());
        assert_eq!(adapter.get_message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn gate_serializes_concurrent_callers() {
        let gate = new_gate();
        let first = gate.clone().lock_owned().await;
        let second_gate = gate.clone();
        let attempt = tokio::spawn(async move { second_gate.try_lock().is_err() });
        assert!(attempt.await.unwrap());
        drop(first);
    }
}
