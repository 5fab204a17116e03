//! Line framing across readiness events

use bytes::BytesMut;

use super::HandlerError;

pub const MAX_LINE: usize = 4096;

/// Accumulates partial input and yields complete lines (LF or CRLF terminated)
pub struct LineBuffer {
    buf: BytesMut,
    limit: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(MAX_LINE)
    }
}

impl LineBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Append `input` and drain every complete line, without terminators.
    /// A pending partial line longer than the limit is an error.
    pub fn push(&mut self, input: &[u8]) -> Result<Vec<String>, HandlerError> {
        self.buf.extend_from_slice(input);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            let raw = &raw[..pos];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.len() > self.limit {
                return Err(HandlerError::LineTooLong { limit: self.limit });
            }
            lines.push(String::from_utf8_lossy(raw).into_owned());
        }

        if self.buf.len() > self.limit {
            self.buf.clear();
            return Err(HandlerError::LineTooLong { limit: self.limit });
        }
        Ok(lines)
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Split a command line into an upper-cased verb and its trimmed argument
pub fn split_command(line: &str) -> (String, &str) {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut lines = LineBuffer::default();
        assert!(lines.push(b"USER te").unwrap().is_empty());
        assert_eq!(lines.pending(), 7);
        assert_eq!(lines.push(b"st\r\nPASS x\nQU").unwrap(), vec!["USER test", "PASS x"]);
        assert_eq!(lines.push(b"IT\r\n").unwrap(), vec!["QUIT"]);
        assert_eq!(lines.pending(), 0);
    }

    #[test]
    fn test_clear_drops_partial_line() {
        let mut lines = LineBuffer::default();
        assert!(lines.push(b"STOR x\r\nbody").unwrap() == vec!["STOR x"]);
        lines.clear();
        assert_eq!(lines.pending(), 0);
        assert_eq!(lines.push(b"PWD\r\n").unwrap(), vec!["PWD"]);
    }

    #[test]
    fn test_overlong_partial_line_rejected() {
        let mut lines = LineBuffer::new(8);
        assert!(lines.push(b"123456").is_ok());
        assert!(matches!(
            lines.push(b"789"),
            Err(HandlerError::LineTooLong { limit: 8 })
        ));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut lines = LineBuffer::default();
        assert_eq!(lines.push(b"ab\xffcd\n").unwrap(), vec!["ab\u{fffd}cd"]);
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("user  alice "), ("USER".to_string(), "alice"));
        assert_eq!(split_command("QUIT"), ("QUIT".to_string(), ""));
        assert_eq!(split_command("MAIL FROM:<a@b>"), ("MAIL".to_string(), "FROM:<a@b>"));
    }
}
