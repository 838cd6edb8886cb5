use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use pop3_proto::tokenize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, instrument, warn};

use crate::adapter::{Adapter, AdapterError};
use crate::dispatcher::{Dispatcher, Limits};
use crate::line_reader::LineReader;
use crate::registry::ExclusivityRegistry;
use crate::response::Response;
use crate::serializer::{AdapterGate, SerializedAdapter};
use crate::session::SessionState;

/// Identifies one accepted connection for the lifetime of its worker: a
/// monotonically increasing id (used as the exclusivity registry key),
/// the accept timestamp, and the peer address.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub id: u64,
    pub accepted_at: Instant,
    pub peer: SocketAddr,
}

/// Orchestrates one session end to end: send the greeting,
/// loop receiving and dispatching command lines, and always tear down
/// (informing the adapter and deregistering from the exclusivity table)
/// no matter which path got there, the way a try/finally block would,
/// minus the socket close itself, which the caller's `S` owns and drops
/// for us.
///
/// The greeting-and-loop body runs under `catch_unwind` so that teardown
/// still happens even if a handler panics partway through. Past teardown,
/// an unexpected panic is logged and swallowed unless `debug` is set, in
/// which case it's re-raised so it surfaces the way it would without this
/// wrapper.
#[instrument(skip_all, fields(connection_id = info.id, peer = %info.peer))]
pub async fn handle_connection<S>(
    stream: S,
    info: ConnectionInfo,
    adapter: Box<dyn Adapter>,
    gate: AdapterGate,
    registry: &ExclusivityRegistry,
    limits: Limits,
    timeout: Duration,
    debug_mode: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    debug!("client connected");

    let mut session = SessionState::new();
    let mut adapter = SerializedAdapter::new(gate, adapter);
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = LineReader::new(read_half, timeout);

    let outcome = AssertUnwindSafe(async {
        let opened = adapter.connection_opened(info.peer.ip(), info.peer.port()).await;
        let aborted_on_open = matches!(opened, Err(AdapterError::CloseConnection(_)));
        if let Err(e) = opened {
            warn!(error = %e, "connection_opened failed");
        }

        if !aborted_on_open {
            let greeting = Response::ok("The POP3 server is ready").encode(&session);
            if write_all(&mut write_half, &greeting).await.is_ok() {
                run_command_loop(&mut lines, &mut write_half, &mut session, &mut adapter, registry, info.id, limits).await;
            }
        }
    })
    .catch_unwind()
    .await;

    if outcome.is_err() {
        error!("connection worker panicked; tearing down anyway");
    }

    if let Err(e) = adapter.connection_closed().await {
        warn!(error = %e, "connection_closed failed");
    }
    registry.remove(info.id);
    debug!("client disconnected");

    if let Err(panic) = outcome {
        if debug_mode {
            std::panic::resume_unwind(panic);
        }
    }
}

/// The receive-dispatch loop. Each command is read,
/// dispatched, and its response fully written before the next line is
/// read: commands and responses are strictly serial within one session
/// Returns once a fatal condition or a
/// close-after-send response ends the session.
async fn run_command_loop<R, W>(
    lines: &mut LineReader<R>,
    write_half: &mut W,
    session: &mut SessionState,
    adapter: &mut SerializedAdapter,
    registry: &ExclusivityRegistry,
    connection_id: u64,
    limits: Limits,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(fatal) => {
                debug!(?fatal, "session aborted by the line receiver");
                return;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            if write_all(write_half, &Response::err("Empty command").encode(session)).await.is_err() {
                return;
            }
            continue;
        }

        let (verb, args) = tokenize(trimmed);
        let mut dispatcher = Dispatcher {
            connection_id,
            session,
            adapter,
            registry,
            limits,
        };
        let outcome = dispatcher.dispatch(&verb, &args).await;

        let response = match outcome {
            Ok(response) => response,
            Err(fatal) => {
                debug!(?fatal, "session aborted by the dispatcher");
                return;
            }
        };

        let should_close = response.closes_connection();
        if write_all(write_half, &response.encode(session)).await.is_err() {
            return;
        }
        if should_close {
            return;
        }
    }
}

async fn write_all<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_all(bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::MockAdapter;
    use crate::serializer::new_gate;
    use tokio::io::duplex;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            id: 1,
            accepted_at: Instant::now(),
            peer: "127.0.0.1:4242".parse().unwrap(),
        }
    }

    fn limits() -> Limits {
        Limits {
            max_invalid_commands_per_session: -1,
            max_invalid_passwords_per_session: 3,
            failed_login_delay: Duration::from_millis(0),
        }
    }

    #[tokio::test]
    async fn sends_greeting_then_ok_for_quit() {
        let (mut client, server) = duplex(4096);
        let registry = ExclusivityRegistry::new();
        let adapter: Box<dyn Adapter> = Box::new(MockAdapter::new("alice", "pw", vec![]));

        let handle = tokio::spawn(async move {
            handle_connection(server, info(), adapter, new_gate(), &registry, limits(), Duration::from_secs(5), false).await;
        });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut buf = vec![0u8; 4096];
        client.write_all(b"QUIT\r\n").await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("+OK The POP3 server is ready\r\n"));
        assert!(text.contains("+OK Session is ending (nobody was logged in)\r\n"));

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unauthenticated_quit_does_not_insert_into_registry() {
        let (mut client, server) = duplex(4096);
        let registry = ExclusivityRegistry::new();
        let adapter: Box<dyn Adapter> = Box::new(MockAdapter::new("alice", "pw", vec![]));

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let handle = tokio::spawn(async move {
            handle_connection(server, info(), adapter, new_gate(), &registry, limits(), Duration::from_secs(5), false).await;
            registry
        });

        client.write_all(b"QUIT\r\n").await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = client.read(&mut buf).await.unwrap();

        let registry = handle.await.unwrap();
        assert!(registry.try_insert(1, "alice", false));
    }

    /// An adapter whose `get_message_count` panics, used to verify that
    /// teardown (`connection_closed`, deregistration) still runs when the
    /// command loop panics partway through, and that the panic is
    /// swallowed or re-raised according to the `debug_mode` flag.
    struct PanicOnCountAdapter {
        closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Adapter for PanicOnCountAdapter {
        async fn verify_login_credentials(&mut self, _u: &str, _p: &str) -> crate::adapter::AdapterResult<bool> {
            Ok(true)
        }
        async fn login_successful(&mut self, _u: &str, _ro: bool) -> crate::adapter::AdapterResult<()> {
            Ok(())
        }
        async fn get_message_count(&mut self) -> crate::adapter::AdapterResult<usize> {
            panic!("adapter backend exploded")
        }
        async fn get_message_content(&mut self, _i: usize, _e: &str) -> crate::adapter::AdapterResult<String> {
            Ok(String::new())
        }
        async fn get_message_unique_id(&mut self, _i: usize) -> crate::adapter::AdapterResult<String> {
            Ok("id".to_string())
        }
        async fn is_message_marked_as_deleted(&mut self, _i: usize) -> crate::adapter::AdapterResult<bool> {
            Ok(false)
        }
        async fn mark_message_as_deleted(&mut self, _i: usize) -> crate::adapter::AdapterResult<()> {
            Ok(())
        }
        async fn unmark_messages_marked_as_deleted(&mut self) -> crate::adapter::AdapterResult<()> {
            Ok(())
        }
        async fn commit_deletions(&mut self) -> crate::adapter::AdapterResult<()> {
            Ok(())
        }
        async fn connection_closed(&mut self) -> crate::adapter::AdapterResult<()> {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn panic_in_command_loop_still_tears_down_and_is_swallowed_without_debug() {
        let (mut client, server) = duplex(4096);
        let registry = ExclusivityRegistry::new();
        let closed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let adapter: Box<dyn Adapter> = Box::new(PanicOnCountAdapter { closed: closed.clone() });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let handle = tokio::spawn(async move {
            handle_connection(server, info(), adapter, new_gate(), &registry, limits(), Duration::from_secs(5), false).await;
        });

        client.write_all(b"USER alice\r\nPASS pw\r\nSTAT\r\n").await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = client.read(&mut buf).await.unwrap();

        // The task itself doesn't panic: `debug_mode` is false, so the
        // panic is logged and swallowed after teardown.
        handle.await.unwrap();
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panic_in_command_loop_is_reraised_after_teardown_in_debug_mode() {
        let (mut client, server) = duplex(4096);
        let registry = ExclusivityRegistry::new();
        let closed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let adapter: Box<dyn Adapter> = Box::new(PanicOnCountAdapter { closed: closed.clone() });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let handle = tokio::spawn(async move {
            handle_connection(server, info(), adapter, new_gate(), &registry, limits(), Duration::from_secs(5), true).await;
        });

        client.write_all(b"USER alice\r\nPASS pw\r\nSTAT\r\n").await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = client.read(&mut buf).await.unwrap();

        // With `debug_mode` set, the panic is re-raised after teardown, so
        // the spawned task itself ends up panicked.
        assert!(handle.await.is_err());
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
