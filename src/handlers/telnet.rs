//! Telnet honeypot handler with proper IAC negotiation

use std::net::SocketAddr;
use tracing::{debug, info};

use super::line::MAX_LINE;
use super::{ConnectionHandler, CoreServices, HandlerError, Reply, Session};

// Telnet command bytes
const IAC: u8 = 255;  // Interpret As Command
const WILL: u8 = 251;
const WONT: u8 = 252;
const DO: u8 = 253;
const DONT: u8 = 254;
const SB: u8 = 250;   // Subnegotiation Begin
const SE: u8 = 240;   // Subnegotiation End

/// Shell commands accepted before the session is cut off
const COMMAND_LIMIT: usize = 20;

pub struct TelnetHandler {
    banner: String,
}

impl TelnetHandler {
    pub fn new(banner: &str) -> Self {
        Self {
            banner: banner.to_string(),
        }
    }
}

impl ConnectionHandler for TelnetHandler {
    fn service(&self) -> &'static str {
        "telnet"
    }

    fn open(&self, _peer: SocketAddr) -> Box<dyn Session> {
        Box::new(TelnetSession {
            banner: self.banner.clone(),
            decoder: IacDecoder::default(),
            line: Vec::new(),
            state: TelnetState::Login,
            username: String::new(),
            commands: 0,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum IacState {
    #[default]
    Data,
    Command,
    /// WILL/WONT/DO/DONT seen, option byte next
    Option(u8),
    Subneg,
    SubnegIac,
}

/// Strips IAC sequences; state survives chunk boundaries
#[derive(Debug, Default)]
struct IacDecoder {
    state: IacState,
}

impl IacDecoder {
    fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &byte in input {
            self.state = match (self.state, byte) {
                (IacState::Data, IAC) => IacState::Command,
                (IacState::Data, b) => {
                    out.push(b);
                    IacState::Data
                }
                // Escaped IAC (255 255) = literal 255
                (IacState::Command, IAC) => {
                    out.push(IAC);
                    IacState::Data
                }
                (IacState::Command, cmd @ (WILL | WONT | DO | DONT)) => IacState::Option(cmd),
                (IacState::Command, SB) => IacState::Subneg,
                (IacState::Command, _) => IacState::Data,
                (IacState::Option(cmd), option) => {
                    debug!("Telnet IAC {} option {}", cmd, option);
                    IacState::Data
                }
                (IacState::Subneg, IAC) => IacState::SubnegIac,
                (IacState::Subneg, _) => IacState::Subneg,
                (IacState::SubnegIac, SE) => IacState::Data,
                (IacState::SubnegIac, _) => IacState::Subneg,
            };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TelnetState {
    Login,
    Password,
    Shell,
    Closed,
}

struct TelnetSession {
    banner: String,
    decoder: IacDecoder,
    line: Vec<u8>,
    state: TelnetState,
    username: String,
    commands: usize,
}

impl Session for TelnetSession {
    fn greeting(&mut self) -> Option<Vec<u8>> {
        Some(format!("\r\n{}\r\nlogin: ", self.banner).into_bytes())
    }

    fn handle(
        &mut self,
        input: &[u8],
        peer: SocketAddr,
        core: &dyn CoreServices,
    ) -> Result<Reply, HandlerError> {
        let mut data = Vec::with_capacity(input.len());
        self.decoder.feed(input, &mut data);

        let mut reply = Reply::none();
        for byte in data {
            // Handle line endings
            if byte == b'\n' || byte == b'\r' {
                // Skip empty lines caused by \r\n sequences
                if self.line.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&self.line).into_owned();
                self.line.clear();
                self.input_line(line, peer, core, &mut reply);
                if self.state == TelnetState::Closed {
                    reply.close = true;
                    break;
                }
                continue;
            }

            // Regular character
            if (32..127).contains(&byte) {
                if self.line.len() >= MAX_LINE {
                    return Err(HandlerError::LineTooLong { limit: MAX_LINE });
                }
                self.line.push(byte);
            }
        }
        Ok(reply)
    }
}

impl TelnetSession {
    fn input_line(&mut self, input: String, peer: SocketAddr, core: &dyn CoreServices, reply: &mut Reply) {
        debug!("Telnet received from {} in state {:?}: {:?}", peer, self.state, input);

        match self.state {
            TelnetState::Login => {
                self.username = input;
                reply.data.extend_from_slice(b"Password: ");
                self.state = TelnetState::Password;
            }
            TelnetState::Password => {
                info!("Telnet login: {}:{} from {}", self.username, input, peer);
                reply.line("");
                reply.line(&format!("Welcome to {}", self.banner));
                self.prompt(reply);
                self.state = TelnetState::Shell;
            }
            TelnetState::Shell => {
                self.commands += 1;
                // Decoded line, without IAC sequences
                core.capture_payload(peer, input.as_bytes());

                // Simulate some basic commands
                let response = match input.split_whitespace().next() {
                    Some("exit") | Some("quit") | Some("logout") => {
                        reply.line("logout");
                        self.state = TelnetState::Closed;
                        return;
                    }
                    Some("pwd") => "/home/user\r\n".to_string(),
                    Some("whoami") => format!("{}\r\n", self.username),
                    Some("id") => "uid=1000(user) gid=1000(user) groups=1000(user)\r\n".to_string(),
                    Some("uname") => "Linux ubuntu 5.4.0-42-generic x86_64 GNU/Linux\r\n".to_string(),
                    Some("ls") => "Desktop  Documents  Downloads\r\n".to_string(),
                    Some("cat") | Some("cd") => String::new(),
                    Some(other) => format!("bash: {}: command not found\r\n", other),
                    None => String::new(),
                };
                reply.data.extend_from_slice(response.as_bytes());

                // Limit interaction
                if self.commands >= COMMAND_LIMIT {
                    debug!("Telnet command limit reached for {}", peer);
                    self.state = TelnetState::Closed;
                    return;
                }
                self.prompt(reply);
            }
            TelnetState::Closed => {}
        }
    }

    fn prompt(&self, reply: &mut Reply) {
        reply.data.extend_from_slice(format!("{}@ubuntu:~$ ", self.username).as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{peer, RecordingCore};
    use super::*;

    fn run(session: &mut dyn Session, core: &RecordingCore, input: &[u8]) -> (String, bool) {
        let reply = session.handle(input, peer(), core).unwrap();
        (String::from_utf8(reply.data).unwrap(), reply.close)
    }

    #[test]
    fn test_iac_split_across_chunks() {
        let mut decoder = IacDecoder::default();
        let mut out = Vec::new();
        decoder.feed(&[b'a', IAC], &mut out);
        decoder.feed(&[DO, 24, b'b', IAC, SB, 24, 1, IAC], &mut out);
        decoder.feed(&[SE, IAC, IAC, b'c'], &mut out);
        assert_eq!(out, vec![b'a', b'b', IAC, b'c']);
    }

    #[test]
    fn test_login_then_shell() {
        let core = RecordingCore::default();
        let mut session = TelnetHandler::new("Ubuntu 20.04 LTS").open(peer());
        assert_eq!(session.greeting().unwrap(), b"\r\nUbuntu 20.04 LTS\r\nlogin: ");

        let negotiation = [IAC, WILL, 31, IAC, DO, 1];
        let mut first = negotiation.to_vec();
        first.extend_from_slice(b"root\r\n");
        assert_eq!(run(session.as_mut(), &core, &first).0, "Password: ");

        let (text, _) = run(session.as_mut(), &core, b"toor\r\n");
        assert!(text.contains("Welcome to Ubuntu 20.04 LTS"));
        assert!(text.ends_with("root@ubuntu:~$ "));

        assert_eq!(run(session.as_mut(), &core, b"whoami\r\n").0, "root\r\nroot@ubuntu:~$ ");
        assert_eq!(
            run(session.as_mut(), &core, b"wget x\r\n").0,
            "bash: wget: command not found\r\nroot@ubuntu:~$ "
        );
        assert_eq!(run(session.as_mut(), &core, b"exit\r\n"), ("logout\r\n".to_string(), true));

        let captures = core.captures.borrow();
        assert_eq!(captures.len(), 3);
        assert_eq!(captures[0], b"whoami");
    }

    #[test]
    fn test_command_limit_closes() {
        let core = RecordingCore::default();
        let mut session = TelnetHandler::new("x").open(peer());
        run(session.as_mut(), &core, b"u\r\np\r\n");
        for _ in 0..COMMAND_LIMIT - 1 {
            assert!(!run(session.as_mut(), &core, b"ls\r\n").1);
        }
        assert!(run(session.as_mut(), &core, b"ls\r\n").1);
    }
}
