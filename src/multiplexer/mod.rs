//! Single-threaded connection reactor
//!
//! The multiplexer owns every listening socket and polls them from one
//! accept loop. Admitted connections become local tasks on the same thread,
//! so no session ever runs in parallel with another and the shared `Core`
//! needs no locks. Must be driven from a current-thread runtime.

mod connection;
mod state;

pub use self::state::Core;

use self::connection::Connection;

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::LocalSet;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info, warn};

use crate::telemetry::SECURITY;

/// Pause after a failed accept, so a persistent error (EMFILE) does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A bound listener, keyed by the logical port handlers are resolved with
#[derive(Debug, Clone, Copy)]
pub struct ListeningSocket {
    pub port: u16,
    pub address: SocketAddr,
    pub backlog: u32,
}

pub struct Multiplexer {
    core: Rc<Core>,
    host: String,
    backlog: u32,
    eviction_interval: Duration,
    sockets: BTreeMap<u16, ListeningSocket>,
    listeners: StreamMap<u16, TcpListenerStream>,
}

impl Multiplexer {
    pub fn new(core: Core, host: &str, backlog: u32, eviction_interval: Duration) -> Self {
        Self {
            core: Rc::new(core),
            host: host.to_string(),
            backlog,
            eviction_interval,
            sockets: BTreeMap::new(),
            listeners: StreamMap::new(),
        }
    }

    /// Bind `host:port`. Failure is fatal for startup and is not retried.
    pub fn listen(&mut self, port: u16) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("Invalid listen host '{}'", self.host))?;
        self.listen_on(port, SocketAddr::new(ip, port))
    }

    /// Bind `address` and serve it as logical `port`
    pub fn listen_on(&mut self, port: u16, address: SocketAddr) -> Result<SocketAddr> {
        if self.sockets.contains_key(&port) {
            anyhow::bail!("Port {} is already listening", port);
        }

        debug!("Binding socket to {} for port {}", address, port);
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("Failed to create socket")?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(address)
            .with_context(|| format!("Failed to bind {}", address))?;
        let listener = socket
            .listen(self.backlog)
            .with_context(|| format!("Failed to listen on {}", address))?;
        let bound = listener.local_addr()?;

        self.sockets.insert(
            port,
            ListeningSocket {
                port,
                address: bound,
                backlog: self.backlog,
            },
        );
        self.listeners.insert(port, TcpListenerStream::new(listener));
        info!("Listening on port {} ({})...", port, bound);
        Ok(bound)
    }

    #[cfg(test)]
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.sockets.get(&port).map(|s| s.address)
    }

    pub fn sockets(&self) -> impl Iterator<Item = &ListeningSocket> {
        self.sockets.values()
    }

    #[cfg(test)]
    pub fn core(&self) -> Rc<Core> {
        self.core.clone()
    }

    /// Run the reactor until an unrecoverable error, or until the caller
    /// drops this future. Dropping it closes every socket.
    pub async fn run(self) -> Result<()> {
        let local = LocalSet::new();
        local.run_until(self.event_loop()).await
    }

    async fn event_loop(mut self) -> Result<()> {
        if self.listeners.is_empty() {
            anyhow::bail!("No listening sockets registered");
        }
        info!("Reactor started with {} listening sockets", self.listeners.len());
        for socket in self.sockets() {
            debug!("Port {} on {} (backlog {})", socket.port, socket.address, socket.backlog);
        }

        let mut eviction = tokio::time::interval(self.eviction_interval);
        eviction.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        eviction.tick().await;

        loop {
            tokio::select! {
                Some((port, accepted)) = self.listeners.next() => match accepted {
                    Ok(stream) => self.accept_connection(port, stream),
                    Err(e) => accept_failed(port, &e).await,
                },
                _ = eviction.tick() => {
                    self.core.evict_stale();
                }
            }
        }
    }

    fn accept_connection(&self, port: u16, stream: TcpStream) {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Accepted socket on port {} has no peer address: {}", port, e);
                return;
            }
        };
        debug!("Accepted connection from {} on port {}", peer, port);

        let handler = match self.core.admit(peer, port) {
            Ok(handler) => handler,
            Err(rejection) => {
                warn!("Refused {} on port {}: {}. Closing connection.", peer, port, rejection);
                warn!(
                    target: SECURITY,
                    peer = %peer,
                    port,
                    reason = %rejection,
                    "Connection from {} refused: {}",
                    peer.ip(),
                    rejection
                );
                drop(stream);
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer, e);
        }
        info!("Handler found for port {} ({})", port, handler.service());

        let conn = Connection::new(stream, peer, port);
        self.core.register(&conn);
        tokio::task::spawn_local(connection::serve(self.core.clone(), conn, handler));
    }
}

async fn accept_failed(port: u16, error: &std::io::Error) {
    warn!("Accept error on port {}: {}", port, error);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}
