//! SMTP honeypot handler

use std::net::SocketAddr;
use tracing::{debug, info};

use super::line::{split_command, LineBuffer};
use super::{ConnectionHandler, CoreServices, HandlerError, Reply, Session};

pub struct SmtpHandler {
    banner: String,
}

impl SmtpHandler {
    pub fn new(banner: &str) -> Self {
        Self {
            banner: banner.to_string(),
        }
    }
}

impl ConnectionHandler for SmtpHandler {
    fn service(&self) -> &'static str {
        "smtp"
    }

    fn open(&self, _peer: SocketAddr) -> Box<dyn Session> {
        Box::new(SmtpSession {
            banner: self.banner.clone(),
            lines: LineBuffer::default(),
            state: SmtpState::Command,
            sender: None,
            recipients: Vec::new(),
            body_lines: 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmtpState {
    Command,
    /// Between DATA and the lone "."
    Data,
    Closed,
}

struct SmtpSession {
    banner: String,
    lines: LineBuffer,
    state: SmtpState,
    sender: Option<String>,
    recipients: Vec<String>,
    body_lines: usize,
}

impl Session for SmtpSession {
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
        for line in self.lines.push(input)? {
            match self.state {
                SmtpState::Data => self.data_line(&line, peer, &mut reply),
                _ => self.command(&line, peer, &mut reply),
            }
            if self.state == SmtpState::Closed {
                reply.close = true;
                break;
            }
        }
        Ok(reply)
    }
}

impl SmtpSession {
    fn command(&mut self, line: &str, peer: SocketAddr, reply: &mut Reply) {
        debug!("SMTP command from {}: {}", peer, line);
        let (verb, arg) = split_command(line);

        match verb.as_str() {
            "HELO" | "EHLO" => reply.line("250 Hello"),
            "MAIL" if arg.to_ascii_uppercase().starts_with("FROM:") => {
                self.sender = Some(arg[5..].trim().to_string());
                reply.line("250 OK");
            }
            "RCPT" if arg.to_ascii_uppercase().starts_with("TO:") => {
                self.recipients.push(arg[3..].trim().to_string());
                reply.line("250 OK");
            }
            "DATA" => {
                self.state = SmtpState::Data;
                self.body_lines = 0;
                reply.line("354 End data with <CR><LF>.<CR><LF>");
            }
            "RSET" => {
                self.sender = None;
                self.recipients.clear();
                reply.line("250 OK");
            }
            "NOOP" => reply.line("250 OK"),
            "QUIT" => {
                self.state = SmtpState::Closed;
                reply.line("221 Bye");
            }
            _ => reply.line("500 Command not understood"),
        }
    }

    fn data_line(&mut self, line: &str, peer: SocketAddr, reply: &mut Reply) {
        if line == "." {
            info!(
                "SMTP message from {}: {} lines, sender {:?}, recipients {:?}",
                peer, self.body_lines, self.sender, self.recipients
            );
            self.state = SmtpState::Command;
            self.sender = None;
            self.recipients.clear();
            reply.line("250 OK");
        } else {
            self.body_lines += 1;
        }
    }
}
