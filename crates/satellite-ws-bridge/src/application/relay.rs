//! Relay rules between WebSocket frames and Satellite lines.
//!
//! The hub speaks newline-terminated lines over TCP.  WebSocket clients send
//! text frames that may hold one line, several lines, or a line without its
//! terminator.  These functions decide what crosses the bridge in each
//! direction.  They do no I/O.
//!
//! ```text
//! client → hub:  frame "A\nB"        →  "A\n", "B\n"
//! hub → client:  line "PONG 123"     →  one text frame "PONG 123"
//!                line "PONG ws-bridge-keepalive"  →  dropped
//! ```

use std::time::Duration;

use thiserror::Error;

/// Payload of the bridge's own keepalive `PING`.
pub const KEEPALIVE_PAYLOAD: &str = "ws-bridge-keepalive";

/// Keepalive intervals a client may stay silent before it counts as gone.
pub const CLIENT_SILENCE_INTERVALS: u32 = 3;

/// Errors while turning a WebSocket frame into lines.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// A binary frame did not hold UTF-8 text.
    #[error("binary frame is not valid UTF-8: {0}")]
    InvalidUtf8(String),
}

/// Splits one text frame into hub lines, each ending in `\n`.
///
/// `\r\n` terminators are accepted and blank lines are dropped.
pub fn frame_to_lines(text: &str) -> Vec<String> {
    text.split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(|line| format!("{line}\n"))
        .collect()
}

/// Same as [`frame_to_lines`] for a binary frame carrying UTF-8 text.
///
/// # Errors
///
/// Returns [`BridgeError::InvalidUtf8`] if `data` is not UTF-8.
pub fn binary_frame_to_lines(data: &[u8]) -> Result<Vec<String>, BridgeError> {
    let text = std::str::from_utf8(data).map_err(|e| BridgeError::InvalidUtf8(e.to_string()))?;
    Ok(frame_to_lines(text))
}

/// The line the bridge sends to keep the hub's heartbeat satisfied.
pub fn keepalive_line() -> String {
    format!("PING {KEEPALIVE_PAYLOAD}\n")
}

/// Whether a client last heard from `silent_for` ago still counts as alive.
///
/// The bridge pings the client every `ping_interval`, and any frame,
/// including the automatic pong, counts as hearing from it.  Only a live
/// client earns a keepalive towards the hub.
pub fn client_is_alive(silent_for: Duration, ping_interval: Duration) -> bool {
    silent_for < ping_interval.saturating_mul(CLIENT_SILENCE_INTERVALS)
}

/// Returns `true` for the hub's reply to [`keepalive_line`].
///
/// The client never sent that `PING`, so it must not see the `PONG`.
pub fn is_keepalive_reply(line: &str) -> bool {
    let mut words = line.split_whitespace();
    words.next() == Some("PONG") && words.next() == Some(KEEPALIVE_PAYLOAD) && words.next().is_none()
}

/// Maps one hub line to the text frame sent to the client, if any.
pub fn hub_line_to_frame(line: &str) -> Option<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || is_keepalive_reply(line) {
        return None;
    }
    Some(line.to_string())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_frame_gets_terminator() {
        assert_eq!(frame_to_lines("PING 1"), vec!["PING 1\n".to_string()]);
    }

    #[test]
    fn test_multi_line_frame_is_split() {
        // Arrange
        let frame = "ADD-DEVICE DEVICEID=a\r\nKEY-PRESS DEVICEID=a KEY=1 PRESSED=1\n\n";

        // Act
        let lines = frame_to_lines(frame);

        // Assert
        assert_eq!(
            lines,
            vec![
                "ADD-DEVICE DEVICEID=a\n".to_string(),
                "KEY-PRESS DEVICEID=a KEY=1 PRESSED=1\n".to_string(),
            ]
        );
    }

    #[test]
    fn test_blank_frame_produces_nothing() {
        assert!(frame_to_lines(" \n\r\n").is_empty());
    }

    #[test]
    fn test_binary_frame_with_text_is_relayed() {
        assert_eq!(binary_frame_to_lines(b"QUIT").unwrap(), vec!["QUIT\n".to_string()]);
    }

    #[test]
    fn test_binary_frame_with_invalid_utf8_is_rejected() {
        assert!(matches!(
            binary_frame_to_lines(&[0xff, 0xfe]),
            Err(BridgeError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_keepalive_reply_is_swallowed() {
        assert!(is_keepalive_reply("PONG ws-bridge-keepalive"));
        assert_eq!(hub_line_to_frame("PONG ws-bridge-keepalive\r\n"), None);
    }

    #[test]
    fn test_client_pong_is_forwarded() {
        assert!(!is_keepalive_reply("PONG 42"));
        assert!(!is_keepalive_reply("PONG ws-bridge-keepalive extra"));
        assert_eq!(hub_line_to_frame("PONG 42\n"), Some("PONG 42".to_string()));
    }

    #[test]
    fn test_client_is_alive_within_three_intervals() {
        let interval = Duration::from_secs(2);

        assert!(client_is_alive(Duration::ZERO, interval));
        assert!(client_is_alive(Duration::from_millis(5_999), interval));
        assert!(!client_is_alive(Duration::from_secs(6), interval));
        assert!(!client_is_alive(Duration::from_secs(60), interval));
    }

    #[test]
    fn test_keepalive_line_round_trips_through_filter() {
        let ping = keepalive_line();
        assert!(ping.ends_with('\n'));
        let pong = ping.replacen("PING", "PONG", 1);
        assert_eq!(hub_line_to_frame(&pong), None);
    }
}
