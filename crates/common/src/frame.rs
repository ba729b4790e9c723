//! Server-to-client WebSocket framing.
//!
//! Every frame is binary: one tag byte followed by the payload. Tags are
//! opaque wire constants, not bit flags.

use bytes::Bytes;

/// Full snapshot frame: payload is the packed-nibble grid.
pub const STATE_TAG: u8 = 0x02;

/// Single cell event frame: payload is the 8-byte encoded cell.
pub const UPDATE_TAG: u8 = 0x04;

/// Build a STATE frame around a packed snapshot.
pub fn state_frame(snapshot: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(1 + snapshot.len());
    buf.push(STATE_TAG);
    buf.extend_from_slice(snapshot);
    Bytes::from(buf)
}

/// Build an UPDATE frame around a raw encoded cell event.
pub fn update_frame(event: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(1 + event.len());
    buf.push(UPDATE_TAG);
    buf.extend_from_slice(event);
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_fixed() {
        assert_eq!(STATE_TAG, 0x02);
        assert_eq!(UPDATE_TAG, 0x04);
    }

    #[test]
    fn frames_prefix_payload() {
        let state = state_frame(&[0xAB, 0xCD]);
        assert_eq!(&state[..], &[STATE_TAG, 0xAB, 0xCD]);

        let update = update_frame(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(update[0], UPDATE_TAG);
        assert_eq!(&update[1..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
