//! Parsed server responses.
//!
//! A [`Message`] is the unit handed to the session state machine and to the
//! current job: two ordered part sequences, one for the line content and one
//! for the bracketed response code, preserving arrival order. Parts are kept
//! at the byte level; interpretation (status words, FETCH attributes, ...) is
//! the consumer's business.

/// One element of a parsed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    /// An atom, quoted string, or literal payload.
    Str(Vec<u8>),
    /// A parenthesized list of raw tokens.
    ///
    /// Nested structure is not parsed at this layer; a nested list appears as
    /// a single raw token including its parentheses. `NIL` is represented as
    /// an empty list, which keeps it distinguishable from the empty string.
    List(Vec<Vec<u8>>),
}

/// A parsed server response line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Parts outside the bracketed section, in arrival order.
    pub content: Vec<Part>,
    /// Parts inside the `[...]` response code, if any.
    pub response_code: Vec<Part>,
}

impl Message {
    /// Returns the bytes of the content part at `index`, if it is a string.
    #[must_use]
    pub fn content_str(&self, index: usize) -> Option<&[u8]> {
        match self.content.get(index) {
            Some(Part::Str(bytes)) => Some(bytes),
            _ => None,
        }
    }

    /// Renders the message back to wire-shaped bytes, without the CRLF.
    ///
    /// The output is canonical rather than byte-identical to the input: parts
    /// re-parse to equal part sequences, which is what the wire logger and
    /// the parser tests rely on.
    #[must_use]
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut content = self.content.iter();

        // The response code sits after the status word on real lines, so it
        // is re-inserted after the first two content parts.
        for part in content.by_ref().take(2) {
            write_part(&mut out, part);
            out.push(b' ');
        }
        if !self.response_code.is_empty() {
            out.push(b'[');
            for (i, part) in self.response_code.iter().enumerate() {
                if i > 0 {
                    out.push(b' ');
                }
                write_part(&mut out, part);
            }
            out.extend_from_slice(b"] ");
        }
        for part in content {
            write_part(&mut out, part);
            out.push(b' ');
        }
        if out.last() == Some(&b' ') {
            out.pop();
        }
        out
    }

    /// Renders the content parts starting at `skip`, trimmed.
    ///
    /// Used for the server greeting and for BYE text, where the leading `*`
    /// and status word are stripped.
    #[must_use]
    pub fn render_content_from(&self, skip: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, part) in self.content.iter().skip(skip).enumerate() {
            if i > 0 {
                out.push(b' ');
            }
            write_part(&mut out, part);
        }
        out
    }
}

fn write_part(out: &mut Vec<u8>, part: &Part) {
    match part {
        Part::Str(bytes) => write_token(out, bytes),
        Part::List(items) if items.is_empty() => out.extend_from_slice(b"NIL"),
        Part::List(items) => {
            out.push(b'(');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b' ');
                }
                if item.first() == Some(&b'(') {
                    // Nested list kept as a raw token.
                    out.extend_from_slice(item);
                } else {
                    write_token(out, item);
                }
            }
            out.push(b')');
        }
    }
}

fn write_token(out: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.iter().any(|&b| b == b'\r' || b == b'\n') {
        // CRLF can only survive inside a literal.
        out.extend_from_slice(format!("{{{}}}\r\n", bytes.len()).as_bytes());
        out.extend_from_slice(bytes);
    } else if bytes.is_empty() || bytes.iter().copied().any(needs_quoting) {
        out.push(b'"');
        for &b in bytes {
            if b == b'"' || b == b'\\' {
                out.push(b'\\');
            }
            out.push(b);
        }
        out.push(b'"');
    } else {
        out.extend_from_slice(bytes);
    }
}

const fn needs_quoting(b: u8) -> bool {
    matches!(b, b' ' | b'"' | b'\\' | b'(' | b')' | b'{' | b'[' | b']') || b < 0x20 || b == 0x7F
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_content_str() {
        let message = Message {
            content: vec![
                Part::Str(b"*".to_vec()),
                Part::Str(b"OK".to_vec()),
                Part::List(vec![b"a".to_vec()]),
            ],
            response_code: Vec::new(),
        };
        assert_eq!(message.content_str(0), Some(b"*".as_slice()));
        assert_eq!(message.content_str(1), Some(b"OK".as_slice()));
        assert_eq!(message.content_str(2), None);
        assert_eq!(message.content_str(3), None);
    }

    #[test]
    fn test_render_plain_line() {
        let message = Message {
            content: vec![
                Part::Str(b"*".to_vec()),
                Part::Str(b"OK".to_vec()),
                Part::Str(b"IMAP".to_vec()),
                Part::Str(b"ready".to_vec()),
            ],
            response_code: Vec::new(),
        };
        assert_eq!(message.render(), b"* OK IMAP ready");
    }

    #[test]
    fn test_render_with_response_code() {
        let message = Message {
            content: vec![
                Part::Str(b"A000002".to_vec()),
                Part::Str(b"OK".to_vec()),
                Part::Str(b"done".to_vec()),
            ],
            response_code: vec![Part::Str(b"READ-WRITE".to_vec())],
        };
        assert_eq!(message.render(), b"A000002 OK [READ-WRITE] done");
    }

    #[test]
    fn test_render_nil_and_list() {
        let message = Message {
            content: vec![
                Part::Str(b"*".to_vec()),
                Part::Str(b"OK".to_vec()),
                Part::List(Vec::new()),
                Part::List(vec![b"\\Seen".to_vec(), b"NIL".to_vec()]),
            ],
            response_code: Vec::new(),
        };
        assert_eq!(message.render(), b"* OK NIL (\\Seen NIL)");
    }

    #[test]
    fn test_render_quotes_when_needed() {
        let message = Message {
            content: vec![
                Part::Str(b"*".to_vec()),
                Part::Str(b"OK".to_vec()),
                Part::Str(b"two words".to_vec()),
                Part::Str(b"".to_vec()),
            ],
            response_code: Vec::new(),
        };
        assert_eq!(message.render(), b"* OK \"two words\" \"\"");
    }

    #[test]
    fn test_render_literal_for_crlf_payload() {
        let message = Message {
            content: vec![
                Part::Str(b"*".to_vec()),
                Part::Str(b"OK".to_vec()),
                Part::Str(b"a\r\nb".to_vec()),
            ],
            response_code: Vec::new(),
        };
        assert_eq!(message.render(), b"* OK {4}\r\na\r\nb");
    }

    #[test]
    fn test_render_greeting_text() {
        let message = Message {
            content: vec![
                Part::Str(b"*".to_vec()),
                Part::Str(b"OK".to_vec()),
                Part::Str(b"IMAP".to_vec()),
                Part::Str(b"ready".to_vec()),
            ],
            response_code: Vec::new(),
        };
        assert_eq!(message.render_content_from(2), b"IMAP ready");
    }
}
