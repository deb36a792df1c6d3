//! Peer wire format: raw UTF-8 handshake, then one socket read per message.
//!
//! There is no length prefix. The first read on a fresh connection is the
//! remote username; every later read is delivered as one complete message.
//! Writes sent in quick succession may coalesce into one read on the far side.

/// Max bytes read for the handshake (the remote's username).
pub const HANDSHAKE_BUF_SIZE: usize = 1024;

/// Max bytes read per message once established.
pub const RECV_BUF_SIZE: usize = 4096;

/// Bytes to send as the handshake for `username`.
pub fn encode_handshake(username: &str) -> &[u8] {
    username.as_bytes()
}

/// Decode the first read on a connection into a username.
/// Returns None for an empty (or whitespace-only) handshake; the caller drops the connection.
pub fn decode_handshake(bytes: &[u8]) -> Option<String> {
    let name = String::from_utf8_lossy(bytes);
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Decode one received chunk as a message body.
pub fn decode_chunk(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_is_the_username() {
        assert_eq!(encode_handshake("alice"), b"alice");
        assert_eq!(decode_handshake(b"alice"), Some("alice".to_string()));
    }

    #[test]
    fn empty_handshake_rejected() {
        assert_eq!(decode_handshake(b""), None);
        assert_eq!(decode_handshake(b" \r\n"), None);
    }

    #[test]
    fn handshake_trims_line_endings() {
        assert_eq!(decode_handshake(b"bob\n"), Some("bob".to_string()));
    }

    #[test]
    fn chunk_is_lossy_utf8() {
        assert_eq!(decode_chunk("héllo".as_bytes()), "héllo");
        assert_eq!(decode_chunk(&[0x68, 0x69, 0xff]), "hi\u{fffd}");
    }
}
