//! SSH honeypot handler
//!
//! Sends an identification banner and records the client's identification
//! line. No key exchange is attempted.

use std::net::SocketAddr;
use tracing::info;

use super::{ConnectionHandler, CoreServices, HandlerError, Reply, Session};

/// RFC 4253 caps the identification line at 255 bytes
const MAX_IDENT: usize = 255;

pub struct SshHandler {
    banner: String,
}

impl SshHandler {
    pub fn new(banner: &str) -> Self {
        Self {
            banner: banner.to_string(),
        }
    }
}

impl ConnectionHandler for SshHandler {
    fn service(&self) -> &'static str {
        "ssh"
    }

    fn open(&self, _peer: SocketAddr) -> Box<dyn Session> {
        Box::new(SshSession {
            banner: self.banner.clone(),
            ident: Vec::new(),
        })
    }
}

struct SshSession {
    banner: String,
    ident: Vec<u8>,
}

impl Session for SshSession {
    fn greeting(&mut self) -> Option<Vec<u8>> {
        Some(format!("{}\r\n", self.banner).into_bytes())
    }

    fn handle(
        &mut self,
        input: &[u8],
        peer: SocketAddr,
        _core: &dyn CoreServices,
    ) -> Result<Reply, HandlerError> {
        self.ident.extend_from_slice(input);

        let end = self.ident.iter().position(|b| *b == b'\n');
        if end.is_none() && self.ident.len() <= MAX_IDENT {
            return Ok(Reply::none());
        }

        let line = &self.ident[..end.unwrap_or(self.ident.len()).min(MAX_IDENT)];
        let client = String::from_utf8_lossy(line);
        let client = client.trim();
        if client.starts_with("SSH-") {
            info!("SSH client banner from {}: {}", peer, client);
        } else {
            info!("Non-SSH client on SSH port from {}: {:?}", peer, client);
        }
        Ok(Reply::close(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{feed, peer};
    use super::*;

    #[test]
    fn test_banner_then_close_after_client_ident() {
        let mut session = SshHandler::new("SSH-2.0-OpenSSH_7.9p1 Debian-10+deb9u1").open(peer());
        assert_eq!(
            session.greeting().unwrap(),
            b"SSH-2.0-OpenSSH_7.9p1 Debian-10+deb9u1\r\n"
        );
        assert_eq!(feed(session.as_mut(), "SSH-2.0-libssh"), (String::new(), false));
        assert_eq!(feed(session.as_mut(), "_0.9.6\r\n"), (String::new(), true));
    }

    #[test]
    fn test_garbage_without_newline_closes_at_cap() {
        let mut session = SshHandler::new("SSH-2.0-x").open(peer());
        let junk = "A".repeat(MAX_IDENT + 1);
        assert!(feed(session.as_mut(), &junk).1);
    }
}
