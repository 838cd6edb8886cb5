use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

/// The only polymorphic collaborator in the system: the
/// pluggable abstraction that supplies messages to the server. A concrete
/// adapter (filesystem directory store, SQL-backed store) is out of this
/// crate's scope; only the capability set it must satisfy is specified
/// here.
///
/// A fresh adapter is constructed per accepted connection by the
/// configured [`AdapterFactory`]. Methods are called in this order for a
/// normal session: `connection_opened` -> zero or more
/// `verify_login_credentials` -> `login_successful` -> any number of
/// read/mark/unmark calls -> `commit_deletions` (only if authenticated and
/// not read-only) -> `connection_closed`. `connection_closed` is always
/// called on teardown, even if an earlier step failed.
///
/// All index arguments are in `[0, get_message_count())` and are never the
/// index of a currently-deleted message, except when passed to
/// `is_message_marked_as_deleted`.
///
/// Every method may fail with [`AdapterError::CloseConnection`], which the
/// core treats as a hard session abort; no further response is sent on
/// that path other than closing the socket.
#[async_trait]
pub trait Adapter: Send {
    async fn connection_opened(&mut self, _addr: IpAddr, _port: u16) -> AdapterResult<()> {
        Ok(())
    }

    /// Whether the non-standard XPRO read-only extension is offered to
    /// this session. Defaults to `true`.
    async fn read_only_mode_allowed(&mut self) -> AdapterResult<bool> {
        Ok(true)
    }

    /// May be called any number of times before the first `true`; never
    /// called again afterward.
    async fn verify_login_credentials(&mut self, username: &str, password: &str) -> AdapterResult<bool>;

    /// Called exactly once per session, after the first successful
    /// credential check clears the exclusivity registry.
    async fn login_successful(&mut self, username: &str, read_only: bool) -> AdapterResult<()>;

    /// Total message count, including messages marked as deleted.
    async fn get_message_count(&mut self) -> AdapterResult<usize>;

    /// An RFC 822 message. `encoding` ("ascii" or "utf-8") is advisory: an
    /// adapter may return content that fails to encode under it, in which
    /// case the server answers `-ERR [UTF8]` rather than failing the call.
    async fn get_message_content(&mut self, index: usize, encoding: &str) -> AdapterResult<String>;

    /// Must be `[0x21-0x7E]{1,70}`; session-wide uniqueness is checked by
    /// the core, not the adapter.
    async fn get_message_unique_id(&mut self, index: usize) -> AdapterResult<String>;

    async fn is_message_marked_as_deleted(&mut self, index: usize) -> AdapterResult<bool>;

    async fn mark_message_as_deleted(&mut self, index: usize) -> AdapterResult<()>;

    async fn unmark_messages_marked_as_deleted(&mut self) -> AdapterResult<()>;

    async fn commit_deletions(&mut self) -> AdapterResult<()>;

    async fn connection_closed(&mut self) -> AdapterResult<()>;
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// An adapter's failure modes. The original has exactly one adapter-side
/// exception, `AdapterCloseConnectionException`; `Other` is a deliberate
/// generalization this crate adds because an idiomatic Rust trait needs a
/// `Result` return type for every fallible method, not just the one the
/// original chose to make exception-based. An adapter can use `Other` for
/// a transient failure it wants surfaced as `-ERR [SYS/TEMP]` without
/// killing the session (see DESIGN.md).
#[derive(Debug)]
pub enum AdapterError {
    /// Unrecoverable: the core closes the connection immediately.
    CloseConnection(String),
    /// Recoverable: the core answers the current command with
    /// `-ERR [SYS/TEMP] Internal server error` and keeps the session open.
    Other(anyhow::Error),
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::CloseConnection(msg) => write!(f, "adapter requested connection close: {msg}"),
            AdapterError::Other(err) => write!(f, "adapter error: {err}"),
        }
    }
}

impl std::error::Error for AdapterError {}

/// Produces a fresh adapter instance for each accepted connection. Must be
/// safely callable from many connection-handling tasks concurrently, so
/// it's `Send + Sync` even though the adapter instances it returns are
/// each owned by a single task thereafter.
pub type AdapterFactory = Arc<dyn Fn() -> Box<dyn Adapter> + Send + Sync>;

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashSet;

    /// An in-memory adapter used by the dispatcher/handler unit tests:
    /// fixed set of messages, a username/password pair, and an in-memory
    /// deletion-mark set.
    pub struct MockAdapter {
        pub valid_user: String,
        pub valid_pass: String,
        pub messages: Vec<(String, String)>, // (unique_id, content)
        pub deleted: HashSet<usize>,
        pub read_only_allowed: bool,
        pub committed: bool,
        pub login_called: bool,
    }

    impl MockAdapter {
        pub fn new(valid_user: &str, valid_pass: &str, messages: Vec<(&str, &str)>) -> Self {
            MockAdapter {
                valid_user: valid_user.to_string(),
                valid_pass: valid_pass.to_string(),
                messages: messages
                    .into_iter()
                    .map(|(uid, content)| (uid.to_string(), content.to_string()))
                    .collect(),
                deleted: HashSet::new(),
                read_only_allowed: true,
                committed: false,
                login_called: false,
            }
        }
    }

    #[async_trait]
    impl Adapter for MockAdapter {
        async fn read_only_mode_allowed(&mut self) -> AdapterResult<bool> {
            Ok(self.read_only_allowed)
        }

        async fn verify_login_credentials(&mut self, username: &str, password: &str) -> AdapterResult<bool> {
            Ok(username == self.valid_user && password == self.valid_pass)
        }

        async fn login_successful(&mut self, _username: &str, _read_only: bool) -> AdapterResult<()> {
            self.login_called = true;
            Ok(())
        }

        async fn get_message_count(&mut self) -> AdapterResult<usize> {
            Ok(self.messages.len())
        }

        async fn get_message_content(&mut self, index: usize, _encoding: &str) -> AdapterResult<String> {
            Ok(self.messages[index].1.clone())
        }

        async fn get_message_unique_id(&mut self, index: usize) -> AdapterResult<String> {
            Ok(self.messages[index].0.clone())
        }

        async fn is_message_marked_as_deleted(&mut self, index: usize) -> AdapterResult<bool> {
            Ok(self.deleted.contains(&index))
        }

        async fn mark_message_as_deleted(&mut self, index: usize) -> AdapterResult<()> {
            self.deleted.insert(index);
            Ok(())
        }

        async fn unmark_messages_marked_as_deleted(&mut self) -> AdapterResult<()> {
            self.deleted.clear();
            Ok(())
        }

        async fn commit_deletions(&mut self) -> AdapterResult<()> {
            self.committed = true;
            Ok(())
        }

        async fn connection_closed(&mut self) -> AdapterResult<()> {
            Ok(())
        }
    }
}
