//! Accepted connections and their per-readiness dispatch

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::Core;
use crate::handlers::{ConnectionHandler, CoreServices, HandlerError, Session};
use crate::telemetry::SECURITY;

pub type ConnectionId = Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),
}

/// An admitted connection. The socket is released exactly once, by
/// `Core::cleanup`.
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    local_port: u16,
    started: Instant,
    stream: Option<TcpStream>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, local_port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            local_port,
            started: Instant::now(),
            stream: Some(stream),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Drop the socket if still held. Returns whether it was.
    pub(super) fn release(&mut self) -> bool {
        self.stream.take().is_some()
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read(buf).await,
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.write_all(data).await,
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }
}

enum Flow {
    Continue,
    Close,
}

/// Session task for one admitted connection. Runs on the reactor's
/// `LocalSet`; nothing in here outlives a failure of this connection.
pub(super) async fn serve(core: Rc<Core>, mut conn: Connection, handler: Rc<dyn ConnectionHandler>) {
    let peer = conn.peer();
    debug!(id = %conn.id(), service = handler.service(), "Session opened for {}", peer);

    let mut session = handler.open(peer);
    let mut buf = vec![0u8; core.read_buffer_bytes()];

    let outcome = match session.greeting() {
        Some(greeting) => conn.write(&greeting).await.map_err(SessionError::from),
        None => Ok(()),
    };

    if let Err(e) = outcome {
        report(peer, &e);
    } else {
        loop {
            match dispatch(&core, &mut conn, session.as_mut(), &mut buf).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(e) => {
                    report(peer, &e);
                    break;
                }
            }
        }
    }

    core.cleanup(&mut conn);
}

/// One readiness event: read what is available, let the session answer,
/// capture the bytes, write the reply.
async fn dispatch(
    core: &Rc<Core>,
    conn: &mut Connection,
    session: &mut dyn Session,
    buf: &mut [u8],
) -> Result<Flow, SessionError> {
    let n = conn.read(buf).await?;
    let peer = conn.peer();
    if n == 0 {
        info!("No data received. Closing connection from {}", peer);
        return Ok(Flow::Close);
    }

    let data = &buf[..n];
    debug!("Received {} bytes from {}: {:?}", n, peer, String::from_utf8_lossy(data));

    let services: &dyn CoreServices = core.as_ref();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| session.handle(data, peer, services)));

    // Malformed input is captured too; it is usually the interesting part
    services.capture_payload(peer, data);

    let reply = match outcome {
        Ok(reply) => reply?,
        Err(_) => return Err(HandlerError::Panicked.into()),
    };

    if !reply.data.is_empty() {
        conn.write(&reply.data).await?;
    }

    Ok(if reply.close { Flow::Close } else { Flow::Continue })
}

fn report(peer: SocketAddr, error: &SessionError) {
    match error {
        SessionError::Io(e) => {
            warn!("Error handling connection from {}: {}", peer, e);
        }
        SessionError::Handler(e) => {
            warn!("Error handling connection from {}: {}", peer, e);
            warn!(target: SECURITY, peer = %peer, "Error handling connection from {}: {}", peer, e);
        }
    }
}
