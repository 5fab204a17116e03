//! Protocol handlers module
//!
//! A handler is bound to a listening port at startup and opens one `Session`
//! per admitted connection. Sessions are state machines: the reactor feeds
//! them exactly the bytes of one readiness event and writes back whatever
//! `Reply` they return. They never read from the socket themselves.

pub mod ftp;
pub mod http;
pub mod line;
pub mod pop3;
pub mod smtp;
pub mod ssh;
pub mod telnet;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::{EmulationConfig, HandlerBindingConfig};

/// Conventional service per port, used when a port has no explicit binding
pub const DEFAULT_BINDINGS: &[(u16, &str)] = &[
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (80, "http"),
    (110, "pop3"),
];

pub const KNOWN_HANDLERS: &[&str] = &["ftp", "ssh", "telnet", "smtp", "http", "pop3"];

pub fn is_known(identifier: &str) -> bool {
    KNOWN_HANDLERS.contains(&identifier)
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("handler panicked")]
    Panicked,
}

/// The only core facilities a session may use
pub trait CoreServices {
    fn capture_payload(&self, peer: SocketAddr, data: &[u8]);
    fn log_connection_start(&self, peer: SocketAddr, port: u16);
    fn log_connection_end(&self, peer: SocketAddr, started: Instant);
}

/// Bytes to send back, and whether to close afterwards
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reply {
    pub data: Vec<u8>,
    pub close: bool,
}

impl Reply {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn close(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            close: true,
        }
    }

    /// Queue a CRLF-terminated line
    pub fn line(&mut self, text: &str) {
        self.data.extend_from_slice(text.as_bytes());
        self.data.extend_from_slice(b"\r\n");
    }
}

pub trait ConnectionHandler {
    fn service(&self) -> &'static str;

    /// Fresh per-connection state
    fn open(&self, peer: SocketAddr) -> Box<dyn Session>;
}

pub trait Session {
    /// Sent once right after admission
    fn greeting(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Handle one chunk of inbound bytes
    fn handle(
        &mut self,
        input: &[u8],
        peer: SocketAddr,
        core: &dyn CoreServices,
    ) -> Result<Reply, HandlerError>;
}

/// Static table of the built-in stubs
pub fn builtin(identifier: &str, emulation: &EmulationConfig) -> Option<Rc<dyn ConnectionHandler>> {
    let handler: Rc<dyn ConnectionHandler> = match identifier {
        "ftp" => Rc::new(ftp::FtpHandler::new(&emulation.ftp_banner)),
        "ssh" => Rc::new(ssh::SshHandler::new(&emulation.ssh_banner)),
        "telnet" => Rc::new(telnet::TelnetHandler::new(&emulation.telnet_banner)),
        "smtp" => Rc::new(smtp::SmtpHandler::new(&emulation.smtp_banner)),
        "pop3" => Rc::new(pop3::Pop3Handler::new(&emulation.pop3_banner)),
        "http" => Rc::new(http::HttpHandler::new(&emulation.http_server)),
        _ => return None,
    };
    Some(handler)
}

/// Port → handler table, fixed after startup
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<u16, Rc<dyn ConnectionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit bindings win; any listed port without one gets its
    /// conventional service, if it has one.
    pub fn from_config(
        ports: &[u16],
        bindings: &[HandlerBindingConfig],
        emulation: &EmulationConfig,
    ) -> anyhow::Result<Self> {
        let mut registry = Self::new();

        for binding in bindings {
            let handler = builtin(&binding.handler, emulation)
                .ok_or_else(|| anyhow::anyhow!("Unknown handler '{}' for port {}", binding.handler, binding.port))?;
            registry.bind(binding.port, handler);
        }

        for port in ports {
            if registry.handlers.contains_key(port) {
                continue;
            }
            match DEFAULT_BINDINGS.iter().find(|(p, _)| p == port) {
                Some((_, identifier)) => {
                    if let Some(handler) = builtin(identifier, emulation) {
                        registry.bind(*port, handler);
                    }
                }
                None => debug!("No handler for port {}", port),
            }
        }

        Ok(registry)
    }

    pub fn bind(&mut self, port: u16, handler: Rc<dyn ConnectionHandler>) {
        info!("Loaded {} handler for port {}", handler.service(), port);
        self.handlers.insert(port, handler);
    }

    pub fn resolve(&self, port: u16) -> Option<Rc<dyn ConnectionHandler>> {
        self.handlers.get(&port).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Core stand-in for handler unit tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    pub struct RecordingCore {
        pub captures: RefCell<Vec<Vec<u8>>>,
    }

    impl CoreServices for RecordingCore {
        fn capture_payload(&self, _peer: SocketAddr, data: &[u8]) {
            self.captures.borrow_mut().push(data.to_vec());
        }

        fn log_connection_start(&self, _peer: SocketAddr, _port: u16) {}

        fn log_connection_end(&self, _peer: SocketAddr, _started: Instant) {}
    }

    pub fn peer() -> SocketAddr {
        "10.0.0.5:40000".parse().unwrap()
    }

    /// Feed one chunk and return the reply as text
    pub fn feed(session: &mut dyn Session, input: &str) -> (String, bool) {
        let core = RecordingCore::default();
        let reply = session.handle(input.as_bytes(), peer(), &core).unwrap();
        (String::from_utf8(reply.data).unwrap(), reply.close)
    }
}
