//! Incremental IMAP response parser.
//!
//! The parser works in two phases per response. Phase one scans the buffered
//! bytes for a CRLF that terminates the response, treating CRLF inside an
//! announced literal as payload; until that scan succeeds, nothing is
//! consumed. Phase two tokenizes the response left to right through
//! capability-style queries (`has_string`, `has_list`, `has_literal`,
//! `has_response_code`, ...) that the message-assembly loop drives.
//!
//! Reads that run out of data set the insufficient-data flag and the caller
//! rolls the buffer back via the saved cursor, so a partial parse has no
//! visible effect. Structurally inconsistent input (a byte no query can
//! claim, with data buffered) is reported as a parse error, which is fatal to
//! the connection.

use crate::buffer::ByteBuffer;
use crate::error::{Error, Result};
use crate::message::{Message, Part};

/// Literal sizes above this are treated as a protocol violation.
const MAX_LITERAL_SIZE: usize = 100 * 1024 * 1024; // 100 MB

/// Incremental parser over a [`ByteBuffer`].
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: ByteBuffer,
    literal_remaining: usize,
    saved_literal_remaining: usize,
    insufficient: bool,
    violation: Option<String>,
}

impl StreamParser {
    /// Creates an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes to the parse buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.append(bytes);
    }

    /// Returns the number of unconsumed buffered bytes.
    #[must_use]
    pub fn available_data_size(&self) -> usize {
        self.buffer.available()
    }

    /// Returns true if the last attempted read could not complete.
    #[must_use]
    pub fn insufficient_data(&self) -> bool {
        self.insufficient
    }

    /// Phase one: returns true when a complete response is buffered.
    ///
    /// A response is complete when a CRLF is found outside any literal and
    /// every literal announced before it is fully buffered.
    pub fn parse(&mut self) -> bool {
        let data = self.buffer.remaining();
        let mut i = 0;
        while i < data.len() {
            match data[i] {
                b'\r' => match data.get(i + 1) {
                    Some(&b'\n') => return true,
                    Some(_) => i += 1,
                    None => return false,
                },
                b'{' => {
                    let mut j = i + 1;
                    let mut size: usize = 0;
                    let mut digits = false;
                    while let Some(&b) = data.get(j) {
                        if b.is_ascii_digit() {
                            digits = true;
                            size = size.saturating_mul(10).saturating_add(usize::from(b - b'0'));
                            j += 1;
                        } else {
                            break;
                        }
                    }
                    match data.get(j) {
                        Some(&b'}') if digits => {
                            if size > MAX_LITERAL_SIZE {
                                self.violation =
                                    Some(format!("literal too large: {size} bytes"));
                                return true;
                            }
                            match (data.get(j + 1), data.get(j + 2)) {
                                (Some(&b'\r'), Some(&b'\n')) => {
                                    let end = j + 3 + size;
                                    if end > data.len() {
                                        return false;
                                    }
                                    i = end;
                                }
                                (Some(&b'\r'), None) | (None, _) => return false,
                                // "{N}" not followed by CRLF is ordinary data.
                                _ => i = j + 1,
                            }
                        }
                        Some(_) => i += 1,
                        // The prefix may continue in the next read.
                        None => return false,
                    }
                }
                _ => i += 1,
            }
        }
        false
    }

    /// Returns true if the next token is an atom or quoted string.
    pub fn has_string(&mut self) -> bool {
        self.skip_spaces();
        !matches!(
            self.buffer.peek(),
            Some(b'(' | b')' | b'[' | b']' | b'{' | b'\r' | b'\n') | None
        )
    }

    /// Returns true if the next token is a parenthesized list.
    pub fn has_list(&mut self) -> bool {
        self.skip_spaces();
        self.buffer.peek() == Some(b'(')
    }

    /// Returns true at the opening of a bracketed response code, consuming it.
    pub fn has_response_code(&mut self) -> bool {
        self.skip_spaces();
        if self.buffer.peek() == Some(b'[') {
            self.buffer.advance(1);
            true
        } else {
            false
        }
    }

    /// Returns true at the closing of a bracketed response code, consuming it.
    pub fn at_response_code_end(&mut self) -> bool {
        self.skip_spaces();
        if self.buffer.peek() == Some(b']') {
            self.buffer.advance(1);
            true
        } else {
            false
        }
    }

    /// Returns true at the CRLF terminating the response, consuming it.
    pub fn at_command_end(&mut self) -> bool {
        self.skip_spaces();
        if self.buffer.peek() == Some(b'\r') && self.buffer.peek_at(1) == Some(b'\n') {
            self.buffer.advance(2);
            true
        } else {
            if self.buffer.peek().is_none() {
                self.insufficient = true;
            }
            false
        }
    }

    /// Returns true if the next token is a literal, consuming its `{N}` CRLF
    /// prefix and arming [`Self::read_literal_part`].
    pub fn has_literal(&mut self) -> bool {
        self.skip_spaces();
        if self.buffer.peek() != Some(b'{') {
            return false;
        }
        let mut offset = 1;
        let mut size: usize = 0;
        let mut digits = false;
        loop {
            match self.buffer.peek_at(offset) {
                Some(b) if b.is_ascii_digit() => {
                    digits = true;
                    size = size.saturating_mul(10).saturating_add(usize::from(b - b'0'));
                    offset += 1;
                }
                Some(b'}') if digits => {
                    offset += 1;
                    break;
                }
                Some(_) => return false,
                None => {
                    self.insufficient = true;
                    return false;
                }
            }
        }
        if size > MAX_LITERAL_SIZE {
            self.violation = Some(format!("literal too large: {size} bytes"));
            return false;
        }
        match (self.buffer.peek_at(offset), self.buffer.peek_at(offset + 1)) {
            (Some(b'\r'), Some(b'\n')) => {
                self.buffer.advance(offset + 2);
                self.literal_remaining = size;
                true
            }
            (Some(b'\r'), None) | (None, _) => {
                self.insufficient = true;
                false
            }
            _ => false,
        }
    }

    /// Returns true when the current literal has been fully consumed.
    #[must_use]
    pub fn at_literal_end(&self) -> bool {
        self.literal_remaining == 0
    }

    /// Consumes up to the rest of the current literal, bounded by what is
    /// buffered. Sets the insufficient-data flag if bytes are still owed.
    pub fn read_literal_part(&mut self) -> Vec<u8> {
        let take = self.literal_remaining.min(self.buffer.available());
        let part = self.buffer.remaining()[..take].to_vec();
        self.buffer.advance(take);
        self.literal_remaining -= take;
        if self.literal_remaining > 0 {
            self.insufficient = true;
        }
        part
    }

    /// Reads an atom, quoted string, or whole literal as bytes.
    pub fn read_string(&mut self) -> Vec<u8> {
        self.skip_spaces();
        match self.buffer.peek() {
            Some(b'"') => self.read_quoted(),
            Some(b'{') => {
                if self.has_literal() {
                    self.read_whole_literal()
                } else {
                    Vec::new()
                }
            }
            Some(_) => self.read_atom(),
            None => {
                self.insufficient = true;
                Vec::new()
            }
        }
    }

    /// Reads a parenthesized list as a flat sequence of raw tokens.
    ///
    /// Quoted strings are unescaped, literals are replaced by their payload,
    /// and a nested list is kept as one raw token including its parentheses.
    pub fn read_parenthesized_list(&mut self) -> Vec<Vec<u8>> {
        self.skip_spaces();
        let mut items = Vec::new();
        if self.buffer.peek() != Some(b'(') {
            return items;
        }
        self.buffer.advance(1);
        loop {
            self.skip_spaces();
            match self.buffer.peek() {
                Some(b')') => {
                    self.buffer.advance(1);
                    break;
                }
                Some(b'(') => items.push(self.read_nested_raw()),
                Some(b'"') => items.push(self.read_quoted()),
                Some(b'{') => {
                    if self.has_literal() {
                        items.push(self.read_whole_literal());
                    } else if !self.insufficient {
                        self.violation = Some("malformed literal prefix in list".to_string());
                    }
                }
                Some(b'\r' | b'\n') => {
                    self.violation = Some("unterminated parenthesized list".to_string());
                    break;
                }
                Some(_) => items.push(self.read_list_atom()),
                None => {
                    self.insufficient = true;
                    break;
                }
            }
            if self.insufficient || self.violation.is_some() {
                break;
            }
        }
        items
    }

    /// Attempts to assemble one complete [`Message`].
    ///
    /// Returns `Ok(None)` when more bytes are needed (the buffer is rolled
    /// back), `Ok(Some(message))` on success (the consumed bytes are
    /// trimmed), and an error on structurally inconsistent input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] when the buffered data cannot belong to any
    /// valid response; the caller is expected to abort the transport.
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        if self.buffer.available() == 0 {
            return Ok(None);
        }
        self.insufficient = false;
        self.violation = None;

        if !self.parse() {
            return Ok(None);
        }
        if self.violation.is_some() {
            return Err(self.take_violation());
        }

        self.save_state();
        let mut message = Message::default();
        let mut in_code = false;

        while !self.at_command_end() {
            if self.has_string() {
                let string = self.read_string();
                if !self.insufficient {
                    let part = if string == b"NIL" {
                        Part::List(Vec::new())
                    } else {
                        Part::Str(string)
                    };
                    push_part(&mut message, in_code, part);
                }
            } else if self.has_list() {
                let list = self.read_parenthesized_list();
                if !self.insufficient && self.violation.is_none() {
                    push_part(&mut message, in_code, Part::List(list));
                }
            } else if self.has_response_code() {
                in_code = true;
            } else if self.at_response_code_end() {
                in_code = false;
            } else if self.has_literal() {
                let literal = self.read_whole_literal();
                if !self.insufficient {
                    push_part(&mut message, in_code, Part::Str(literal));
                }
            } else {
                if !self.insufficient && self.violation.is_none() {
                    self.violation = Some("unrecognized response data".to_string());
                }
                break;
            }
            if self.violation.is_some() {
                break;
            }
        }

        if self.violation.is_some() {
            return Err(self.take_violation());
        }
        if self.insufficient {
            self.restore_state();
            return Ok(None);
        }
        self.trim();
        Ok(Some(message))
    }

    fn skip_spaces(&mut self) {
        while self.buffer.peek() == Some(b' ') {
            self.buffer.advance(1);
        }
    }

    fn read_whole_literal(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while !self.at_literal_end() {
            out.extend_from_slice(&self.read_literal_part());
            if self.insufficient {
                break;
            }
        }
        out
    }

    fn read_atom(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(b) = self.buffer.peek() {
            if matches!(b, b' ' | b'(' | b')' | b'[' | b']' | b'{' | b'"' | b'\r' | b'\n') {
                break;
            }
            out.push(b);
            self.buffer.advance(1);
        }
        out
    }

    // Inside a list, brackets are ordinary bytes (BODY[], BODY[HEADER]).
    fn read_list_atom(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(b) = self.buffer.peek() {
            if matches!(b, b' ' | b'(' | b')' | b'"' | b'{' | b'\r' | b'\n') {
                break;
            }
            out.push(b);
            self.buffer.advance(1);
        }
        out
    }

    fn read_quoted(&mut self) -> Vec<u8> {
        self.buffer.advance(1);
        let mut out = Vec::new();
        loop {
            match self.buffer.take() {
                Some(b'"') => break,
                Some(b'\\') => match self.buffer.take() {
                    Some(b) => out.push(b),
                    None => {
                        self.insufficient = true;
                        break;
                    }
                },
                Some(b) => out.push(b),
                None => {
                    self.insufficient = true;
                    break;
                }
            }
        }
        out
    }

    fn read_nested_raw(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut depth = 0usize;
        loop {
            match self.buffer.peek() {
                Some(b'(') => {
                    depth += 1;
                    out.push(b'(');
                    self.buffer.advance(1);
                }
                Some(b')') => {
                    depth = depth.saturating_sub(1);
                    out.push(b')');
                    self.buffer.advance(1);
                    if depth == 0 {
                        break;
                    }
                }
                Some(b'"') => {
                    out.push(b'"');
                    self.buffer.advance(1);
                    loop {
                        match self.buffer.take() {
                            Some(b'\\') => {
                                out.push(b'\\');
                                match self.buffer.take() {
                                    Some(next) => out.push(next),
                                    None => {
                                        self.insufficient = true;
                                        return out;
                                    }
                                }
                            }
                            Some(b'"') => {
                                out.push(b'"');
                                break;
                            }
                            Some(b) => out.push(b),
                            None => {
                                self.insufficient = true;
                                return out;
                            }
                        }
                    }
                }
                Some(b'\r' | b'\n') => {
                    self.violation = Some("unterminated nested list".to_string());
                    return out;
                }
                Some(b) => {
                    out.push(b);
                    self.buffer.advance(1);
                }
                None => {
                    self.insufficient = true;
                    return out;
                }
            }
        }
        out
    }

    fn save_state(&mut self) {
        self.buffer.save_cursor();
        self.saved_literal_remaining = self.literal_remaining;
    }

    fn restore_state(&mut self) {
        self.buffer.restore_cursor();
        self.literal_remaining = self.saved_literal_remaining;
    }

    fn trim(&mut self) {
        self.buffer.trim();
    }

    fn take_violation(&mut self) -> Error {
        Error::Parse {
            position: self.buffer.position(),
            message: self
                .violation
                .take()
                .unwrap_or_else(|| "inconsistent response data".to_string()),
        }
    }
}

fn push_part(message: &mut Message, in_code: bool, part: Part) {
    if in_code {
        message.response_code.push(part);
    } else {
        message.content.push(part);
    }
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

    fn parse_all(input: &[u8]) -> Vec<Message> {
        let mut parser = StreamParser::new();
        parser.append(input);
        let mut messages = Vec::new();
        while let Some(message) = parser.read_message().unwrap() {
            messages.push(message);
        }
        messages
    }

    fn parse_byte_at_a_time(input: &[u8]) -> Vec<Message> {
        let mut parser = StreamParser::new();
        let mut messages = Vec::new();
        for &b in input {
            parser.append(&[b]);
            while let Some(message) = parser.read_message().unwrap() {
                messages.push(message);
            }
        }
        messages
    }

    #[test]
    fn test_untagged_ok() {
        let messages = parse_all(b"* OK IMAP ready\r\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].content,
            vec![
                Part::Str(b"*".to_vec()),
                Part::Str(b"OK".to_vec()),
                Part::Str(b"IMAP".to_vec()),
                Part::Str(b"ready".to_vec()),
            ]
        );
        assert!(messages[0].response_code.is_empty());
    }

    #[test]
    fn test_tagged_with_response_code() {
        let messages = parse_all(b"A000002 OK [READ-WRITE] done\r\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].content,
            vec![
                Part::Str(b"A000002".to_vec()),
                Part::Str(b"OK".to_vec()),
                Part::Str(b"done".to_vec()),
            ]
        );
        assert_eq!(
            messages[0].response_code,
            vec![Part::Str(b"READ-WRITE".to_vec())]
        );
    }

    #[test]
    fn test_response_code_with_arguments() {
        let messages = parse_all(b"* OK [UIDVALIDITY 3857529045] UIDs valid\r\n");
        assert_eq!(
            messages[0].response_code,
            vec![
                Part::Str(b"UIDVALIDITY".to_vec()),
                Part::Str(b"3857529045".to_vec()),
            ]
        );
        assert_eq!(
            messages[0].content,
            vec![
                Part::Str(b"*".to_vec()),
                Part::Str(b"OK".to_vec()),
                Part::Str(b"UIDs".to_vec()),
                Part::Str(b"valid".to_vec()),
            ]
        );
    }

    #[test]
    fn test_quoted_string_with_escapes() {
        let messages = parse_all(b"* OK \"he said \\\"hi\\\" \\\\ bye\"\r\n");
        assert_eq!(
            messages[0].content[2],
            Part::Str(b"he said \"hi\" \\ bye".to_vec())
        );
    }

    #[test]
    fn test_nil_is_empty_list() {
        let messages = parse_all(b"* OK NIL \"\"\r\n");
        assert_eq!(messages[0].content[2], Part::List(Vec::new()));
        // The empty quoted string stays a string part.
        assert_eq!(messages[0].content[3], Part::Str(Vec::new()));
    }

    #[test]
    fn test_parenthesized_list() {
        let messages = parse_all(b"* FLAGS (\\Answered \\Flagged NIL \"two words\")\r\n");
        assert_eq!(
            messages[0].content[2],
            Part::List(vec![
                b"\\Answered".to_vec(),
                b"\\Flagged".to_vec(),
                b"NIL".to_vec(),
                b"two words".to_vec(),
            ])
        );
    }

    #[test]
    fn test_nested_list_is_raw_token() {
        let messages = parse_all(b"* X (a (b c) d)\r\n");
        assert_eq!(
            messages[0].content[2],
            Part::List(vec![b"a".to_vec(), b"(b c)".to_vec(), b"d".to_vec()])
        );
    }

    #[test]
    fn test_literal_in_list() {
        let messages = parse_all(b"* 1 FETCH (BODY[] {11}\r\nHello world)\r\nA000003 OK\r\n");
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[0].content[3],
            Part::List(vec![b"BODY[]".to_vec(), b"Hello world".to_vec()])
        );
        assert_eq!(messages[1].content_str(0), Some(b"A000003".as_slice()));
    }

    #[test]
    fn test_literal_with_crlf_payload() {
        let messages = parse_all(b"* OK {10}\r\nab\r\ncd\r\nef trailing\r\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content[2], Part::Str(b"ab\r\ncd\r\nef".to_vec()));
        assert_eq!(messages[0].content[3], Part::Str(b"trailing".to_vec()));
    }

    #[test]
    fn test_literal_of_length_zero() {
        let messages = parse_all(b"* OK {0}\r\n done\r\n");
        assert_eq!(messages[0].content[2], Part::Str(Vec::new()));
        assert_eq!(messages[0].content[3], Part::Str(b"done".to_vec()));
    }

    #[test]
    fn test_literal_split_across_reads() {
        let mut parser = StreamParser::new();
        parser.append(b"* 1 FETCH (BODY[] {11}\r\nHello ");
        assert!(parser.read_message().unwrap().is_none());

        parser.append(b"world)\r\n");
        let message = parser.read_message().unwrap().unwrap();
        assert_eq!(
            message.content[3],
            Part::List(vec![b"BODY[]".to_vec(), b"Hello world".to_vec()])
        );
    }

    #[test]
    fn test_partial_line_has_no_visible_effect() {
        let mut parser = StreamParser::new();
        parser.append(b"* OK partial");
        assert!(parser.read_message().unwrap().is_none());
        assert_eq!(parser.available_data_size(), 12);

        parser.append(b" line\r\n");
        let message = parser.read_message().unwrap().unwrap();
        assert_eq!(message.content_str(3), Some(b"line".as_slice()));
        assert_eq!(parser.available_data_size(), 0);
    }

    #[test]
    fn test_incremental_equivalence() {
        let inputs: &[&[u8]] = &[
            b"* OK IMAP ready\r\n",
            b"A000001 OK LOGIN completed\r\n",
            b"* 5 EXISTS\r\n* 0 RECENT\r\nA000002 OK [READ-WRITE] SELECT done\r\n",
            b"* 1 FETCH (BODY[] {11}\r\nHello world)\r\nA000003 OK\r\n",
            b"* OK [UIDNEXT 4392] next\r\n",
            b"* LIST (\\Noselect) \"/\" \"spam & eggs\"\r\n",
            b"* OK {0}\r\n\r\n",
            b"* OK NIL (a NIL \"q s\")\r\n",
        ];
        for input in inputs {
            assert_eq!(
                parse_all(input),
                parse_byte_at_a_time(input),
                "incremental mismatch for {:?}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn test_round_trip_list_of_strings_and_nils() {
        let original = parse_all(b"* X (alpha NIL \"two words\" \"\")\r\n").remove(0);
        let mut rendered = original.render();
        rendered.extend_from_slice(b"\r\n");
        let reparsed = parse_all(&rendered).remove(0);
        assert_eq!(original, reparsed);
    }

    #[test]
    fn test_round_trip_literal_bytes() {
        let original = parse_all(b"* X {12}\r\nbytes\r\n\x01\x02end\r\n").remove(0);
        assert_eq!(original.content[2], Part::Str(b"bytes\r\n\x01\x02end".to_vec()));
        let mut rendered = original.render();
        rendered.extend_from_slice(b"\r\n");
        let reparsed = parse_all(&rendered).remove(0);
        assert_eq!(original, reparsed);
    }

    #[test]
    fn test_inconsistent_data_is_fatal() {
        let mut parser = StreamParser::new();
        parser.append(b"* OK )stray\r\n");
        // "* OK " parses, then the stray close paren matches no query.
        let result = parser.read_message();
        assert!(matches!(result, Err(Error::Parse { .. })));
    }

    #[test]
    fn test_oversized_literal_is_fatal() {
        let mut parser = StreamParser::new();
        parser.append(b"* OK {999999999999}\r\n");
        let result = parser.read_message();
        assert!(matches!(result, Err(Error::Parse { .. })));
    }

    #[test]
    fn test_multiple_responses_in_one_chunk() {
        let messages = parse_all(b"* 5 EXISTS\r\n* 0 RECENT\r\nA1 OK done\r\n");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content_str(2), Some(b"EXISTS".as_slice()));
        assert_eq!(messages[2].content_str(0), Some(b"A1".as_slice()));
    }

    #[test]
    fn test_continuation_line() {
        let messages = parse_all(b"+ Ready for literal\r\n");
        assert_eq!(messages[0].content_str(0), Some(b"+".as_slice()));
    }
}
