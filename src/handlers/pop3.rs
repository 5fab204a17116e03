//! POP3 honeypot handler with a fake two-message mailbox

use std::net::SocketAddr;
use tracing::{debug, info};

use super::line::{split_command, LineBuffer};
use super::{ConnectionHandler, CoreServices, HandlerError, Reply, Session};

struct Message {
    id: u32,
    size: usize,
    content: &'static str,
}

const MAILBOX: &[(u32, &str)] = &[
    (1, "Subject: Test Message 1\r\n\r\nThis is a test message 1."),
    (2, "Subject: Test Message 2\r\n\r\nThis is a test message 2."),
];

pub struct Pop3Handler {
    banner: String,
}

impl Pop3Handler {
    pub fn new(banner: &str) -> Self {
        Self {
            banner: banner.to_string(),
        }
    }
}

impl ConnectionHandler for Pop3Handler {
    fn service(&self) -> &'static str {
        "pop3"
    }

    fn open(&self, _peer: SocketAddr) -> Box<dyn Session> {
        let messages = MAILBOX
            .iter()
            .map(|&(id, content)| Message {
                id,
                size: content.len(),
                content,
            })
            .collect();
        Box::new(Pop3Session {
            banner: self.banner.clone(),
            lines: LineBuffer::default(),
            state: Pop3State::Authorization { username: None },
            messages,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pop3State {
    Authorization { username: Option<String> },
    Transaction,
    Closed,
}

struct Pop3Session {
    banner: String,
    lines: LineBuffer,
    state: Pop3State,
    messages: Vec<Message>,
}

impl Session for Pop3Session {
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
            self.command(&line, peer, &mut reply);
            if self.state == Pop3State::Closed {
                reply.close = true;
                break;
            }
        }
        Ok(reply)
    }
}

impl Pop3Session {
    fn command(&mut self, line: &str, peer: SocketAddr, reply: &mut Reply) {
        let (command, arg) = split_command(line);
        if command.is_empty() {
            return;
        }
        debug!("POP3 command from {}: {}", peer, line);
        let authenticated = self.state == Pop3State::Transaction;

        match command.as_str() {
            "USER" if arg.is_empty() => reply.line("-ERR No user name provided"),
            "USER" => {
                self.state = Pop3State::Authorization {
                    username: Some(arg.to_string()),
                };
                reply.line("+OK User accepted");
            }
            "PASS" if arg.is_empty() => reply.line("-ERR No password provided"),
            "PASS" => {
                let username = match &self.state {
                    Pop3State::Authorization { username } => username.clone().unwrap_or_default(),
                    _ => String::new(),
                };
                info!("POP3 login: {}:{} from {}", username, arg, peer);
                self.state = Pop3State::Transaction;
                reply.line("+OK Pass accepted");
            }
            "STAT" if authenticated => {
                let total: usize = self.messages.iter().map(|m| m.size).sum();
                reply.line(&format!("+OK {} {}", self.messages.len(), total));
            }
            "LIST" if authenticated => {
                reply.line(&format!("+OK {} messages", self.messages.len()));
                for message in &self.messages {
                    reply.line(&format!("{} {}", message.id, message.size));
                }
                reply.line(".");
            }
            "RETR" if authenticated => match self.find(arg) {
                Ok(index) => {
                    let message = &self.messages[index];
                    reply.line(&format!("+OK {} octets", message.size));
                    reply.line(message.content);
                    reply.line(".");
                }
                Err(error) => reply.line(error),
            },
            "DELE" if authenticated => match self.find(arg) {
                Ok(index) => {
                    self.messages.remove(index);
                    reply.line("+OK Message deleted");
                }
                Err(error) => reply.line(error),
            },
            "QUIT" => {
                self.state = Pop3State::Closed;
                reply.line("+OK POP3 server signing off");
            }
            _ => reply.line("-ERR Unknown command"),
        }
    }

    fn find(&self, arg: &str) -> Result<usize, &'static str> {
        if arg.is_empty() {
            return Err("-ERR No message number provided");
        }
        let id: u32 = arg.parse().map_err(|_| "-ERR Invalid message number")?;
        self.messages
            .iter()
            .position(|m| m.id == id)
            .ok_or("-ERR No such message")
    }
}
