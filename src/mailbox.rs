//! Mailbox-name handling for SELECT and EXAMINE arguments.

/// Extracts and decodes the mailbox name from SELECT/EXAMINE arguments.
///
/// The argument between the first and second double quote is taken and run
/// through the modified-UTF-7 decoder of RFC 3501 section 5.1.3. Encoding for
/// outbound commands is the caller's responsibility.
pub(crate) fn upcoming_mailbox(args: &[u8]) -> String {
    let raw = extract_quoted(args).unwrap_or(args);
    utf7_imap::decode_utf7_imap(String::from_utf8_lossy(raw).into_owned())
}

fn extract_quoted(args: &[u8]) -> Option<&[u8]> {
    let start = args.iter().position(|&b| b == b'"')? + 1;
    let len = args[start..].iter().position(|&b| b == b'"')?;
    Some(&args[start..start + len])
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
    fn test_plain_quoted_name() {
        assert_eq!(upcoming_mailbox(b"\"INBOX\""), "INBOX");
    }

    #[test]
    fn test_quoted_name_with_trailing_arguments() {
        assert_eq!(
            upcoming_mailbox(b"\"INBOX\" (CONDSTORE)"),
            "INBOX".to_string()
        );
    }

    #[test]
    fn test_unquoted_name_is_taken_whole() {
        assert_eq!(upcoming_mailbox(b"INBOX"), "INBOX");
    }

    #[test]
    fn test_modified_utf7_decoding() {
        // "Entw&APw-rfe" is German "Entwürfe" in modified UTF-7.
        assert_eq!(upcoming_mailbox(b"\"Entw&APw-rfe\""), "Entw\u{fc}rfe");
    }
}
