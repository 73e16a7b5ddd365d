//! Wire frame layout (spec §6): `servlet_id: u32, seq: u32, size: u32`
//! followed by `size` opaque payload bytes. For responses, the payload's
//! first four bytes are a response code (`rc`), read by the core before
//! handing the remainder to servlet-layer parsing.

pub const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub servlet_id: u32,
    pub seq: u32,
    pub size: u32,
}

/// High 16 bits of a servlet id: the servlet *type*, used for load
/// balancing and the servlet table lookup.
pub fn servlet_type(servlet_id: u32) -> u16 {
    (servlet_id >> 16) as u16
}

/// Encode one frame (header + payload) and append it to `out`.
pub fn encode(out: &mut Vec<u8>, servlet_id: u32, seq: u32, payload: &[u8]) {
    out.reserve(HEADER_LEN + payload.len());
    out.extend_from_slice(&servlet_id.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

/// If `buf` holds at least one complete frame, drain it from the front
/// and return `(header, payload)`. Otherwise leaves `buf` untouched and
/// returns `None` — the caller re-tries once more bytes arrive.
pub fn try_parse(buf: &mut Vec<u8>) -> Option<(FrameHeader, Vec<u8>)> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let servlet_id = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let seq = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let size = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    let total = HEADER_LEN + size as usize;
    if buf.len() < total {
        return None;
    }

    let payload = buf[HEADER_LEN..total].to_vec();
    buf.drain(0..total);
    Some((FrameHeader { servlet_id, seq, size }, payload))
}

/// Read a response's leading `rc` field out of its payload, returning the
/// rc and the remainder (the actual response body).
pub fn read_rc(payload: &[u8]) -> Option<(i32, &[u8])> {
    if payload.len() < 4 {
        return None;
    }
    let rc = i32::from_be_bytes(payload[0..4].try_into().unwrap());
    Some((rc, &payload[4..]))
}

/// Build a response payload: `rc` followed by `body`.
pub fn encode_response(rc: i32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&rc.to_be_bytes());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_frame() {
        let mut buf = Vec::new();
        encode(&mut buf, 0x0001_0002, 7, b"hello");
        let (header, payload) = try_parse(&mut buf).unwrap();
        assert_eq!(header.servlet_id, 0x0001_0002);
        assert_eq!(header.seq, 7);
        assert_eq!(header.size, 5);
        assert_eq!(payload, b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn leaves_a_partial_frame_untouched() {
        let mut buf = Vec::new();
        encode(&mut buf, 1, 1, b"0123456789");
        buf.truncate(buf.len() - 3);
        let before = buf.clone();
        assert!(try_parse(&mut buf).is_none());
        assert_eq!(buf, before);
    }

    #[test]
    fn parses_back_to_back_frames_one_at_a_time() {
        let mut buf = Vec::new();
        encode(&mut buf, 1, 1, b"aa");
        encode(&mut buf, 2, 2, b"bbb");

        let (h1, p1) = try_parse(&mut buf).unwrap();
        assert_eq!((h1.servlet_id, &p1[..]), (1, &b"aa"[..]));
        let (h2, p2) = try_parse(&mut buf).unwrap();
        assert_eq!((h2.servlet_id, &p2[..]), (2, &b"bbb"[..]));
        assert!(buf.is_empty());
    }

    #[test]
    fn servlet_type_is_the_high_16_bits() {
        assert_eq!(servlet_type(0x0001_0002), 0x0001);
    }

    #[test]
    fn response_rc_round_trips() {
        let payload = encode_response(0, b"body");
        let (rc, body) = read_rc(&payload).unwrap();
        assert_eq!(rc, 0);
        assert_eq!(body, b"body");
    }
}
