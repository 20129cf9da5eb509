//! Authentication handshake (spec §4.5): an 8-byte hex nonce from the
//! proxy, a newline-terminated callsign and a 16-byte MD5 response from the
//! client, checked against the configured password and the callsign
//! allow/deny lists.

use std::fmt;

use rand::Rng;
use regex::Regex;
use shared::{digest, net::TcpStreamConn, protocol};

const MAX_CALLSIGN_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    /// No `\n` terminator found within the callsign field, or the
    /// connection dropped mid-handshake.
    BadRequest,
    /// The client's 16-byte response did not match the expected digest.
    BadPassword,
    /// The callsign is denied, or not on an active allow list.
    AccessDenied,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeError::BadRequest => "malformed handshake request",
            HandshakeError::BadPassword => "password mismatch",
            HandshakeError::AccessDenied => "callsign denied",
        };
        f.write_str(s)
    }
}

impl std::error::Error for HandshakeError {}

/// Generates a 32-bit nonce from the OS RNG.
fn generate_nonce() -> u32 {
    rand::rng().random()
}

/// Runs the full handshake over `conn` and returns the authenticated
/// callsign on success. On failure, the appropriate `SYSTEM` frame has
/// already been sent to the client before the error is returned.
pub async fn perform_handshake(
    conn: &TcpStreamConn,
    password: &str,
    calls_allowed: Option<&Regex>,
    calls_denied: Option<&Regex>,
) -> Result<String, HandshakeError> {
    let nonce = generate_nonce();
    conn.send(digest::nonce_to_hex(nonce).as_bytes())
        .await
        .map_err(|_| HandshakeError::BadRequest)?;

    let expected = digest::password_response(password, nonce);

    // Read the fixed first 16 bytes: callsign, its terminating `\n`, and as
    // much of the 16-byte response as fits in the remainder.
    let mut buf = vec![0u8; 16];
    conn.recv(&mut buf).await.map_err(|_| HandshakeError::BadRequest)?;

    let newline_at = buf[..=MAX_CALLSIGN_LEN.min(buf.len() - 1)]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(HandshakeError::BadRequest)?;
    let callsign = String::from_utf8(buf[..newline_at].to_vec())
        .map_err(|_| HandshakeError::BadRequest)?;

    let remaining = newline_at + 1; // additional bytes needed to complete the response
    buf.resize(buf.len() + remaining, 0);
    let tail_start = 16;
    conn.recv(&mut buf[tail_start..])
        .await
        .map_err(|_| HandshakeError::BadRequest)?;

    let response = &buf[newline_at + 1..newline_at + 1 + 16];

    if response != expected {
        let _ = protocol::write_frame(
            conn,
            protocol::MessageType::System,
            0,
            &[protocol::SystemCode::BadPassword as u8],
        )
        .await;
        return Err(HandshakeError::BadPassword);
    }

    let denied = calls_denied.is_some_and(|re| re.is_match(&callsign));
    let not_allowed = calls_allowed.is_some_and(|re| !re.is_match(&callsign));
    if denied || not_allowed {
        let _ = protocol::write_frame(
            conn,
            protocol::MessageType::System,
            0,
            &[protocol::SystemCode::AccessDenied as u8],
        )
        .await;
        return Err(HandshakeError::AccessDenied);
    }

    Ok(callsign)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::net::{TcpListenerConn, TcpStreamConn};

    async fn connected_pair() -> (TcpStreamConn, tokio::net::TcpStream) {
        let listener = TcpListenerConn::listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().await.unwrap();
        let server_task = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let server_conn = server_task.await.unwrap();
        (server_conn, client)
    }

    #[tokio::test]
    async fn accepts_matching_response_and_allowed_callsign() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (server_conn, mut client) = connected_pair().await;
        let allowed = Regex::new("^KM0H$").unwrap();

        let server = tokio::spawn(async move {
            perform_handshake(&server_conn, "PUBLIC", Some(&allowed), None).await
        });

        let mut nonce_hex = [0u8; 8];
        client.read_exact(&mut nonce_hex).await.unwrap();
        let nonce = digest::hex_to_nonce(std::str::from_utf8(&nonce_hex).unwrap()).unwrap();
        let response = digest::password_response("PUBLIC", nonce);

        let mut request = b"KM0H\n".to_vec();
        request.extend_from_slice(&response);
        client.write_all(&request).await.unwrap();

        let callsign = server.await.unwrap().unwrap();
        assert_eq!(callsign, "KM0H");
    }

    #[tokio::test]
    async fn rejects_bad_password() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (server_conn, mut client) = connected_pair().await;
        let server = tokio::spawn(async move {
            perform_handshake(&server_conn, "PUBLIC", None, None).await
        });

        let mut nonce_hex = [0u8; 8];
        client.read_exact(&mut nonce_hex).await.unwrap();

        let mut request = b"KM0H\n".to_vec();
        request.extend_from_slice(&[0u8; 16]);
        client.write_all(&request).await.unwrap();

        assert_eq!(server.await.unwrap().unwrap_err(), HandshakeError::BadPassword);
    }

    #[tokio::test]
    async fn rejects_denied_callsign() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (server_conn, mut client) = connected_pair().await;
        let denied = Regex::new("^KKM0H$").unwrap();
        let server = tokio::spawn(async move {
            perform_handshake(&server_conn, "PUBLIC", None, Some(&denied)).await
        });

        let mut nonce_hex = [0u8; 8];
        client.read_exact(&mut nonce_hex).await.unwrap();
        let nonce = digest::hex_to_nonce(std::str::from_utf8(&nonce_hex).unwrap()).unwrap();
        let response = digest::password_response("PUBLIC", nonce);

        let mut request = b"KKM0H\n".to_vec();
        request.extend_from_slice(&response);
        client.write_all(&request).await.unwrap();

        assert_eq!(
            server.await.unwrap().unwrap_err(),
            HandshakeError::AccessDenied
        );
    }

    #[test]
    fn regex_contract_matches_unanchored_examples() {
        let re = Regex::new("^(KM0H|KD0JLT)$").unwrap();
        assert!(re.is_match("KM0H"));
        assert!(re.is_match("KD0JLT"));
        assert!(!re.is_match("KKM0H"));
        assert!(!re.is_match(""));

        let any = Regex::new(".*").unwrap();
        assert!(any.is_match("anything"));
        assert!(any.is_match(""));
    }
}
