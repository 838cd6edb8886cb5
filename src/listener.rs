use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::adapter::AdapterFactory;
use crate::config::{Config, ListenEndpoint};
use crate::dispatcher::Limits;
use crate::error::Error;
use crate::handler::{handle_connection, ConnectionInfo};
use crate::registry::ExclusivityRegistry;
use crate::serializer::{new_gate, AdapterGate};
use crate::tls::build_acceptor;

/// Small, fixed listen backlog; nothing here needs a deep one.
const LISTEN_BACKLOG: i32 = 64;

enum BoundSocket {
    Plain(TcpListener, SocketAddr),
    Tls(TcpListener, SocketAddr, TlsAcceptor),
}

impl BoundSocket {
    fn addr(&self) -> SocketAddr {
        match self {
            BoundSocket::Plain(_, addr) => *addr,
            BoundSocket::Tls(_, addr, _) => *addr,
        }
    }

    fn is_tls(&self) -> bool {
        matches!(self, BoundSocket::Tls(..))
    }
}

/// Binds sockets, accepts connections, and spawns one worker per
/// connection, capped by `max_concurrent_clients`. Owns the
/// two process-wide services every worker shares: the exclusivity
/// registry and the adapter serialization gate, both created once, here,
/// and handed to every accepted connection's worker.
pub struct Listener {
    registry: Arc<ExclusivityRegistry>,
    gate: AdapterGate,
}

impl Listener {
    pub fn new() -> Self {
        Listener {
            registry: Arc::new(ExclusivityRegistry::new()),
            gate: new_gate(),
        }
    }

    /// Binds every configured endpoint, applies working-directory/umask
    /// and (after binding) privilege drop on unix, then accepts
    /// connections until an interruption signal arrives. Each accepted
    /// socket is dispatched to its own worker task; a worker count at or
    /// above `max_concurrent_clients` causes the new socket to be closed
    /// immediately instead.
    pub async fn run(&self, config: Config) -> Result<(), Error> {
        #[cfg(unix)]
        crate::privilege::apply_working_directory_and_umask(&config)?;

        let mut sockets = Vec::new();
        for endpoint in &config.listen {
            sockets.push(self.bind_endpoint(endpoint)?);
        }
        if sockets.is_empty() {
            return Err(Error::NoListenSockets);
        }

        #[cfg(unix)]
        if let Some(target) = &config.drop_privileges {
            crate::privilege::drop_privileges_if_needed(target)?;
        }

        self.log_startup(&sockets);

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_clients));
        let next_id = Arc::new(AtomicU64::new(1));
        let limits = Limits {
            max_invalid_commands_per_session: config.max_invalid_commands_per_session,
            max_invalid_passwords_per_session: config.max_invalid_passwords_per_session,
            failed_login_delay: config.failed_login_delay,
        };

        let mut workers = Vec::new();
        for bound in sockets {
            workers.push(tokio::spawn(accept_loop(
                bound,
                self.registry.clone(),
                self.gate.clone(),
                semaphore.clone(),
                next_id.clone(),
                config.adapter_factory.clone(),
                limits,
                config.client_timeout,
                config.debug,
            )));
        }

        let _ = tokio::signal::ctrl_c().await;
        info!("interrupted, closing listening sockets");
        for worker in workers {
            worker.abort();
        }

        Ok(())
    }

    fn bind_endpoint(&self, endpoint: &ListenEndpoint) -> Result<BoundSocket, Error> {
        let addr = SocketAddr::new(endpoint.address, endpoint.port);
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Error::Io)?;
        socket.set_reuse_address(true).map_err(Error::Io)?;
        if domain == Domain::IPV6 {
            // Keep IPv4 and IPv6 as separate sockets rather than one
            // dual-stack listener.
            socket.set_only_v6(true).map_err(Error::Io)?;
        }
        socket.bind(&addr.into()).map_err(Error::Io)?;
        socket.listen(LISTEN_BACKLOG).map_err(Error::Io)?;
        socket.set_nonblocking(true).map_err(Error::Io)?;

        let listener = TcpListener::from_std(socket.into()).map_err(Error::Io)?;

        match &endpoint.tls {
            Some(tls_config) => {
                let acceptor = build_acceptor(tls_config)?;
                Ok(BoundSocket::Tls(listener, addr, acceptor))
            }
            None => Ok(BoundSocket::Plain(listener, addr)),
        }
    }

    fn log_startup(&self, sockets: &[BoundSocket]) {
        let addrs: Vec<String> = sockets.iter().map(|s| s.addr().to_string()).collect();
        info!(listening_on = %addrs.join(", "), "server started");
        for socket in sockets {
            if !socket.is_tls() {
                warn!(addr = %socket.addr(), "listening socket is not TLS-secured; traffic on it is plaintext");
            }
        }
    }
}

impl Default for Listener {
    fn default() -> Self {
        Listener::new()
    }
}

async fn accept_loop(
    bound: BoundSocket,
    registry: Arc<ExclusivityRegistry>,
    gate: AdapterGate,
    semaphore: Arc<Semaphore>,
    next_id: Arc<AtomicU64>,
    adapter_factory: AdapterFactory,
    limits: Limits,
    timeout: std::time::Duration,
    debug_mode: bool,
) {
    loop {
        let accepted = match &bound {
            BoundSocket::Plain(listener, _) => listener.accept().await,
            BoundSocket::Tls(listener, _, _) => listener.accept().await,
        };
        let (stream, peer) = match accepted {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "accept() failed");
                continue;
            }
        };

        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // At the concurrent-client cap: close the new socket
                // immediately rather than queue it.
                drop(stream);
                continue;
            }
        };

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let info = ConnectionInfo {
            id,
            accepted_at: Instant::now(),
            peer,
        };
        let adapter = (adapter_factory)();
        let registry = registry.clone();
        let gate = gate.clone();

        match &bound {
            BoundSocket::Plain(..) => {
                tokio::spawn(async move {
                    let _permit = permit;
                    handle_connection(stream, info, adapter, gate, &registry, limits, timeout, debug_mode).await;
                });
            }
            BoundSocket::Tls(_, _, acceptor) => {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    // A failed handshake is non-fatal: keep accepting on
                    // this socket.
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            handle_connection(tls_stream, info, adapter, gate, &registry, limits, timeout, debug_mode)
                                .await
                        }
                        Err(e) => warn!(error = %e, "TLS handshake failed"),
                    }
                });
            }
        }
    }
}
