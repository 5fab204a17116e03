//! State shared by the accept loop and every session task
//!
//! Everything here lives on the reactor thread, so interior mutability is
//! plain `RefCell`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, info};

use super::connection::{Connection, ConnectionId};
use crate::access::AccessGate;
use crate::capture::PayloadCapture;
use crate::handlers::{ConnectionHandler, CoreServices, HandlerRegistry};

/// Why a connection was closed at accept time
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("source network not allowed")]
    Disallowed,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("too many live connections")]
    TooManyConnections,
    #[error("no handler bound to port")]
    NoHandler,
}

/// Table entry for a registered connection
#[derive(Debug, Clone, Copy)]
struct LiveConnection {
    peer: SocketAddr,
    started: Instant,
}

pub struct Core {
    gate: RefCell<AccessGate>,
    registry: HandlerRegistry,
    capture: PayloadCapture,
    connections: RefCell<HashMap<ConnectionId, LiveConnection>>,
    max_connections_per_ip: Option<usize>,
    read_buffer_bytes: usize,
}

impl Core {
    pub fn new(gate: AccessGate, registry: HandlerRegistry, capture: PayloadCapture) -> Self {
        Self {
            gate: RefCell::new(gate),
            registry,
            capture,
            connections: RefCell::new(HashMap::new()),
            max_connections_per_ip: None,
            read_buffer_bytes: 4096,
        }
    }

    /// 0 means unlimited
    pub fn with_max_connections_per_ip(mut self, limit: usize) -> Self {
        self.max_connections_per_ip = (limit > 0).then_some(limit);
        self
    }

    pub fn with_read_buffer_bytes(mut self, bytes: usize) -> Self {
        self.read_buffer_bytes = bytes.max(1);
        self
    }

    pub fn read_buffer_bytes(&self) -> usize {
        self.read_buffer_bytes
    }

    /// Admission pipeline, in order: allow-list, rate window, per-IP cap,
    /// handler binding. The first failing check decides.
    pub fn admit(&self, peer: SocketAddr, port: u16) -> Result<Rc<dyn ConnectionHandler>, Rejection> {
        let ip = peer.ip();
        if !self.gate.borrow().is_allowed(ip) {
            return Err(Rejection::Disallowed);
        }
        if self.gate.borrow_mut().rate_limit_exceeded(ip) {
            return Err(Rejection::RateLimited);
        }
        if let Some(limit) = self.max_connections_per_ip {
            if self.live_connections_from(peer) >= limit {
                return Err(Rejection::TooManyConnections);
            }
        }
        self.registry.resolve(port).ok_or(Rejection::NoHandler)
    }

    pub fn register(&self, conn: &Connection) {
        let previous = self.connections.borrow_mut().insert(
            conn.id(),
            LiveConnection {
                peer: conn.peer(),
                started: conn.started(),
            },
        );
        debug_assert!(previous.is_none(), "connection registered twice");
        self.log_connection_start(conn.peer(), conn.local_port());
        debug!("{} live connections", self.connection_count());
    }

    /// Unregister and release the socket. Safe to call any number of times;
    /// only the call that actually unregistered logs the end of the
    /// connection. Returns whether anything was released.
    pub fn cleanup(&self, conn: &mut Connection) -> bool {
        let entry = self.connections.borrow_mut().remove(&conn.id());
        let released = conn.release();
        if let Some(entry) = entry {
            self.log_connection_end(entry.peer, entry.started);
        }
        entry.is_some() || released
    }

    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    fn live_connections_from(&self, peer: SocketAddr) -> usize {
        let ip = peer.ip();
        self.connections
            .borrow()
            .values()
            .filter(|live| live.peer.ip() == ip)
            .count()
    }

    pub fn evict_stale(&self) -> usize {
        self.gate.borrow_mut().evict_stale(Instant::now())
    }
}

impl CoreServices for Core {
    fn capture_payload(&self, peer: SocketAddr, data: &[u8]) {
        if let Some(captured) = self.capture.record(peer, data) {
            debug!(hash = %captured.content_hash, len = captured.len, "Capture recorded for {}", peer);
        }
    }

    fn log_connection_start(&self, peer: SocketAddr, port: u16) {
        info!("Connection started from {} on port {}", peer, port);
    }

    fn log_connection_end(&self, peer: SocketAddr, started: Instant) {
        info!(
            "Connection from {} ended. Duration: {:.2} seconds",
            peer,
            started.elapsed().as_secs_f64()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::RateLimitPolicy;
    use crate::config::EmulationConfig;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    fn core(dir: &tempfile::TempDir, networks: &[&str], threshold: usize) -> Core {
        let gate = AccessGate::new(
            networks.iter().map(|n| n.parse().unwrap()).collect(),
            RateLimitPolicy {
                window: Duration::from_secs(60),
                threshold,
            },
        );
        let registry = HandlerRegistry::from_config(&[21, 80], &[], &EmulationConfig::default()).unwrap();
        let capture = PayloadCapture::new(dir.path().join("payloads"), dir.path().join("sessions")).unwrap();
        Core::new(gate, registry, capture)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    async fn loopback_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    #[test]
    fn test_admission_order() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core(&tmp, &["10.0.0.0/8"], 1);

        // Disallowed IPs never touch the rate window
        assert_eq!(core.admit(addr("203.0.113.1:5000"), 21).err(), Some(Rejection::Disallowed));
        assert_eq!(core.gate.borrow().tracked_ips(), 0);

        assert_eq!(core.admit(addr("10.0.0.5:5000"), 21).unwrap().service(), "ftp");
        assert_eq!(core.admit(addr("10.0.0.5:5001"), 21).err(), Some(Rejection::RateLimited));
    }

    #[test]
    fn test_unbound_port_rejected_after_gate() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core(&tmp, &["0.0.0.0/0"], 10);
        assert_eq!(core.admit(addr("10.0.0.5:5000"), 8080).err(), Some(Rejection::NoHandler));
        assert_eq!(core.admit(addr("10.0.0.5:5001"), 80).unwrap().service(), "http");
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core(&tmp, &["127.0.0.0/8"], 10);
        let (mut client, server, peer) = loopback_pair().await;

        let mut conn = Connection::new(server, peer, 21);
        core.register(&conn);
        assert_eq!(core.connection_count(), 1);

        assert!(core.cleanup(&mut conn));
        assert!(!core.cleanup(&mut conn));
        assert_eq!(core.connection_count(), 0);

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_per_ip_connection_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let core = core(&tmp, &["127.0.0.0/8"], 10).with_max_connections_per_ip(1);
        let (_client, server, peer) = loopback_pair().await;

        assert!(core.admit(peer, 21).is_ok());
        let mut conn = Connection::new(server, peer, 21);
        core.register(&conn);

        assert_eq!(
            core.admit(addr("127.0.0.1:6000"), 21).err(),
            Some(Rejection::TooManyConnections)
        );
        // Other sources are unaffected
        assert!(core.admit(addr("127.0.0.2:6000"), 21).is_ok());

        core.cleanup(&mut conn);
        assert!(core.admit(addr("127.0.0.1:6001"), 21).is_ok());
    }
}
