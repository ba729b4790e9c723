//! Broadcast-bus payload format.
//!
//! The synchronizer publishes the stream-assigned millisecond timestamp in
//! front of the raw cell event. Subscribers bucket their local update
//! caches by that timestamp, so cache epochs and store window epochs come
//! from the same source: the stream ID's millisecond prefix.

/// Bus payload size: 8-byte big-endian millis plus the 8-byte event.
pub const BUS_PAYLOAD_LEN: usize = 16;

/// Build a bus payload from the stream millis and the raw event.
pub fn encode_bus_payload(stream_ms: i64, event: &[u8; 8]) -> [u8; BUS_PAYLOAD_LEN] {
    let mut buf = [0u8; BUS_PAYLOAD_LEN];
    buf[..8].copy_from_slice(&stream_ms.to_be_bytes());
    buf[8..].copy_from_slice(event);
    buf
}

/// Split a bus payload back into stream millis and raw event.
pub fn decode_bus_payload(payload: &[u8]) -> Option<(i64, [u8; 8])> {
    if payload.len() < BUS_PAYLOAD_LEN {
        return None;
    }
    let mut ms = [0u8; 8];
    ms.copy_from_slice(&payload[..8]);
    let mut event = [0u8; 8];
    event.copy_from_slice(&payload[8..BUS_PAYLOAD_LEN]);
    Some((i64::from_be_bytes(ms), event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let event = [1, 2, 3, 4, 5, 6, 7, 8];
        let payload = encode_bus_payload(1_704_067_200_123, &event);
        assert_eq!(payload.len(), BUS_PAYLOAD_LEN);
        assert_eq!(decode_bus_payload(&payload), Some((1_704_067_200_123, event)));
    }

    #[test]
    fn short_payloads_are_rejected() {
        assert_eq!(decode_bus_payload(&[0u8; 8]), None);
        assert_eq!(decode_bus_payload(&[]), None);
    }
}
