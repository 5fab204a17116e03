//! HTTP honeypot handler: one canned page per connection

use std::net::SocketAddr;
use tracing::info;

use super::{ConnectionHandler, CoreServices, HandlerError, Reply, Session};

const MAX_HEAD: usize = 8192;

const BODY: &str = "<html><head><title>Welcome</title></head><body><h1>It works!</h1></body></html>\n";

pub struct HttpHandler {
    server: String,
}

impl HttpHandler {
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
        }
    }
}

impl ConnectionHandler for HttpHandler {
    fn service(&self) -> &'static str {
        "http"
    }

    fn open(&self, _peer: SocketAddr) -> Box<dyn Session> {
        Box::new(HttpSession {
            server: self.server.clone(),
            head: Vec::new(),
        })
    }
}

struct HttpSession {
    server: String,
    head: Vec<u8>,
}

/// Request line and the headers worth logging
#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    method: String,
    path: String,
    user_agent: Option<String>,
}

impl Session for HttpSession {
    fn handle(
        &mut self,
        input: &[u8],
        peer: SocketAddr,
        _core: &dyn CoreServices,
    ) -> Result<Reply, HandlerError> {
        self.head.extend_from_slice(input);

        let Some(end) = head_end(&self.head) else {
            if self.head.len() > MAX_HEAD {
                info!("HTTP request head from {} exceeds {} bytes", peer, MAX_HEAD);
                return Ok(Reply::close(status_only(431, "Request Header Fields Too Large")));
            }
            return Ok(Reply::none());
        };

        let request = parse_head(&self.head[..end])
            .ok_or_else(|| HandlerError::Malformed("bad HTTP request line".to_string()))?;
        info!(
            method = %request.method,
            path = %request.path,
            user_agent = request.user_agent.as_deref().unwrap_or("-"),
            "HTTP {} {} from {}",
            request.method,
            request.path,
            peer
        );

        Ok(Reply::close(self.page()))
    }
}

impl HttpSession {
    fn page(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 200 OK\r\nServer: {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.server,
            BODY.len(),
            BODY
        )
        .into_bytes()
    }
}

fn status_only(code: u16, reason: &str) -> Vec<u8> {
    format!("HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", code, reason).into_bytes()
}

/// Offset just past the blank line ending the request head
fn head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn parse_head(head: &[u8]) -> Option<RequestHead> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.lines();

    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();

    let user_agent = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("user-agent"))
        .map(|(_, value)| value.trim().to_string());

    Some(RequestHead {
        method,
        path,
        user_agent,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::{feed, peer, RecordingCore};
    use super::*;

    #[test]
    fn test_request_split_across_chunks() {
        let mut session = HttpHandler::new("Apache/2.4.41 (Ubuntu)").open(peer());
        assert!(session.greeting().is_none());
        assert_eq!(feed(session.as_mut(), "GET /admin HTTP/1.1\r\nHost: x\r\n"), (String::new(), false));

        let (text, close) = feed(session.as_mut(), "User-Agent: zgrab/0.x\r\n\r\n");
        assert!(close);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Server: Apache/2.4.41 (Ubuntu)\r\n"));
        assert!(text.ends_with(BODY));
    }

    #[test]
    fn test_parse_head() {
        let head = parse_head(b"POST /cgi-bin/luci HTTP/1.0\nuser-agent:  curl/8.0 \nAccept: */*\n\n").unwrap();
        assert_eq!(
            head,
            RequestHead {
                method: "POST".to_string(),
                path: "/cgi-bin/luci".to_string(),
                user_agent: Some("curl/8.0".to_string()),
            }
        );
    }

    #[test]
    fn test_garbage_request_line_is_malformed() {
        let core = RecordingCore::default();
        let mut session = HttpHandler::new("x").open(peer());
        assert!(matches!(
            session.handle(b"\r\n\r\n", peer(), &core),
            Err(HandlerError::Malformed(_))
        ));
    }

    #[test]
    fn test_oversized_head_gets_431() {
        let mut session = HttpHandler::new("x").open(peer());
        let (text, close) = feed(session.as_mut(), &"A".repeat(MAX_HEAD + 1));
        assert!(close);
        assert!(text.starts_with("HTTP/1.1 431"));
    }
}
