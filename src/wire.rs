//! Core protocol wire format. All multi-byte integers are little-endian.

use byteorder::{ByteOrder, LittleEndian};

/// Every Core protocol packet begins with this byte.
pub const CORE_PREFIX: u8 = 0x00;

/// Connection-init, variant A (`00 01 ...`).
pub const SUBTYPE_CONNECT_INIT_A: u8 = 0x01;
/// Key response: the outbound client connection completed handshake.
pub const SUBTYPE_KEY_RESPONSE: u8 = 0x02;
/// Reliable-wrapped payload.
pub const SUBTYPE_RELIABLE: u8 = 0x03;
/// Ack of one reliable sequence number.
pub const SUBTYPE_ACK: u8 = 0x04;
/// Time-sync request.
pub const SUBTYPE_TIME_SYNC_REQUEST: u8 = 0x05;
/// Time-sync response.
pub const SUBTYPE_TIME_SYNC_RESPONSE: u8 = 0x06;
/// Graceful disconnect.
pub const SUBTYPE_DROP: u8 = 0x07;
/// Big-data chunk.
pub const SUBTYPE_BIG_DATA_CHUNK: u8 = 0x08;
/// Big-data terminator.
pub const SUBTYPE_BIG_DATA_END: u8 = 0x09;
/// Sized-data chunk.
pub const SUBTYPE_SIZED_DATA: u8 = 0x0A;
/// Request to cancel an outbound sized-send.
pub const SUBTYPE_CANCEL_SIZED_RECEIVE: u8 = 0x0B;
/// Ack that an inbound sized-receive was cancelled.
pub const SUBTYPE_SIZED_CANCELLED: u8 = 0x0C;
/// Grouped packet envelope.
pub const SUBTYPE_GROUPED: u8 = 0x0E;
/// Continuum-style connection-init (`00 11 ...`).
pub const SUBTYPE_CONNECT_INIT_B: u8 = 0x11;
/// Continuum key response / special dispatch.
pub const SUBTYPE_SPECIAL: u8 = 0x13;

/// Largest net-handler subtype index (`[0x00, b]` with `b` in `0..=NET_HANDLER_MAX`).
pub const NET_HANDLER_MAX: u8 = 0x13;

/// Grouped-frame envelope ceiling.
pub const GAME_PACKET_LIMIT: usize = 520;
/// Unreliable single-packet payload ceiling.
pub const UNRELIABLE_PAYLOAD_LIMIT: usize = 512;
/// Byte length of a reliable packet header (`00 03 seq[4]`).
pub const RELIABLE_HEADER_LEN: usize = 6;
/// Byte length of an ack packet.
pub const ACK_LEN: usize = 6;
/// Maximum payload carried by one big-data chunk.
pub const MAX_BIG_CHUNK_PAYLOAD: usize = 480;
/// Maximum payload carried by one sized-data chunk.
pub const SIZED_CHUNK_SIZE: usize = 480;
/// Maximum length of a single grouped-frame inner item.
pub const MAX_GROUPED_ITEM_LEN: usize = 255;
/// Hard cap on big-data accumulation, unless overridden by `MaxBigPacket`.
pub const DEFAULT_MAX_BIG_PACKET: usize = 524_288;

/// True if `data` begins with the Core protocol prefix byte.
pub fn is_core(data: &[u8]) -> bool {
    data.first() == Some(&CORE_PREFIX)
}

/// True if `data` is a connection-init packet (`00 01 ...` or `00 11 ...`).
pub fn is_connect_init(data: &[u8]) -> bool {
    data.len() >= 2
        && data[0] == CORE_PREFIX
        && (data[1] == SUBTYPE_CONNECT_INIT_A || data[1] == SUBTYPE_CONNECT_INIT_B)
}

/// Writes a reliable header (`00 03 seq[4]`) followed by `payload` into `out`.
pub fn write_reliable(out: &mut Vec<u8>, seq: i32, payload: &[u8]) {
    out.reserve(RELIABLE_HEADER_LEN + payload.len());
    out.push(CORE_PREFIX);
    out.push(SUBTYPE_RELIABLE);
    let mut seq_buf = [0u8; 4];
    LittleEndian::write_i32(&mut seq_buf, seq);
    out.extend_from_slice(&seq_buf);
    out.extend_from_slice(payload);
}

/// Parses a reliable header, returning `(seq, inner_payload)`.
pub fn parse_reliable(data: &[u8]) -> Option<(i32, &[u8])> {
    if data.len() < RELIABLE_HEADER_LEN || data[0] != CORE_PREFIX || data[1] != SUBTYPE_RELIABLE {
        return None;
    }
    let seq = LittleEndian::read_i32(&data[2..6]);
    Some((seq, &data[6..]))
}

/// Builds a standalone ack packet (`00 04 seq[4]`).
pub fn write_ack(seq: i32) -> [u8; ACK_LEN] {
    let mut out = [0u8; ACK_LEN];
    out[0] = CORE_PREFIX;
    out[1] = SUBTYPE_ACK;
    LittleEndian::write_i32(&mut out[2..6], seq);
    out
}

/// Parses an ack packet, returning the acknowledged sequence number.
pub fn parse_ack(data: &[u8]) -> Option<i32> {
    if data.len() != ACK_LEN || data[0] != CORE_PREFIX || data[1] != SUBTYPE_ACK {
        return None;
    }
    Some(LittleEndian::read_i32(&data[2..6]))
}

/// A parsed time-sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncRequest {
    /// Client-local timestamp to be echoed back verbatim.
    pub client_time: u32,
    /// Packets the client reports having received.
    pub pkts_recv: u32,
    /// Packets the client reports having sent.
    pub pkts_sent: u32,
}

/// Parses `[0x00, 0x05, client_time[4], pkts_recv[4], pkts_sent[4]]`.
pub fn parse_time_sync_request(data: &[u8]) -> Option<TimeSyncRequest> {
    if data.len() != 14 || data[0] != CORE_PREFIX || data[1] != SUBTYPE_TIME_SYNC_REQUEST {
        return None;
    }
    Some(TimeSyncRequest {
        client_time: LittleEndian::read_u32(&data[2..6]),
        pkts_recv: LittleEndian::read_u32(&data[6..10]),
        pkts_sent: LittleEndian::read_u32(&data[10..14]),
    })
}

/// Builds `[0x00, 0x06, client_time[4], server_time[4]]`.
pub fn write_time_sync_response(client_time: u32, server_time: u32) -> [u8; 10] {
    let mut out = [0u8; 10];
    out[0] = CORE_PREFIX;
    out[1] = SUBTYPE_TIME_SYNC_RESPONSE;
    LittleEndian::write_u32(&mut out[2..6], client_time);
    LittleEndian::write_u32(&mut out[6..10], server_time);
    out
}

/// The disconnect packet (`00 07`), a fixed two bytes.
pub const DROP_PACKET: [u8; 2] = [CORE_PREFIX, SUBTYPE_DROP];

/// The sized-cancel-request packet (`00 0B`).
pub const CANCEL_SIZED_RECEIVE_PACKET: [u8; 2] = [CORE_PREFIX, SUBTYPE_CANCEL_SIZED_RECEIVE];

/// The sized-cancelled-ack packet (`00 0C`).
pub const SIZED_CANCELLED_PACKET: [u8; 2] = [CORE_PREFIX, SUBTYPE_SIZED_CANCELLED];

/// Writes `[0x00, 0x08, payload...]` (big-data chunk) or, if `last`, `0x09` (big-data end).
pub fn write_big_data(out: &mut Vec<u8>, payload: &[u8], last: bool) {
    out.push(CORE_PREFIX);
    out.push(if last {
        SUBTYPE_BIG_DATA_END
    } else {
        SUBTYPE_BIG_DATA_CHUNK
    });
    out.extend_from_slice(payload);
}

/// Writes `[0x00, 0x0A, total_size[4], chunk...]`.
pub fn write_sized_data(out: &mut Vec<u8>, total_size: u32, chunk: &[u8]) {
    out.push(CORE_PREFIX);
    out.push(SUBTYPE_SIZED_DATA);
    let mut total_buf = [0u8; 4];
    LittleEndian::write_u32(&mut total_buf, total_size);
    out.extend_from_slice(&total_buf);
    out.extend_from_slice(chunk);
}

/// Parses `[0x00, 0x0A, total_size[4], chunk...]`, returning `(total_size, chunk)`.
pub fn parse_sized_data(data: &[u8]) -> Option<(u32, &[u8])> {
    if data.len() < 6 || data[0] != CORE_PREFIX || data[1] != SUBTYPE_SIZED_DATA {
        return None;
    }
    let total = LittleEndian::read_u32(&data[2..6]);
    Some((total, &data[6..]))
}

/// Builds a grouped-packet envelope (`00 0E (len[1] packet[len])+`) from `items`,
/// greedily packing as many as fit within [`GAME_PACKET_LIMIT`]. Returns the number
/// of leading `items` actually consumed.
pub fn write_grouped<'a, I>(out: &mut Vec<u8>, items: I) -> usize
where
    I: IntoIterator<Item = &'a [u8]>,
{
    out.push(CORE_PREFIX);
    out.push(SUBTYPE_GROUPED);
    let mut consumed = 0;
    for item in items {
        if item.len() > MAX_GROUPED_ITEM_LEN {
            break;
        }
        if out.len() + 1 + item.len() > GAME_PACKET_LIMIT {
            break;
        }
        out.push(item.len() as u8);
        out.extend_from_slice(item);
        consumed += 1;
    }
    consumed
}

/// Iterates the inner items of a grouped-packet envelope's payload (the bytes after
/// `00 0E`). Stops (silently) at the first truncated/malformed length prefix.
pub struct GroupedItems<'a> {
    rest: &'a [u8],
}

impl<'a> GroupedItems<'a> {
    /// Builds an iterator over `payload`, the bytes following `00 0E`.
    pub fn new(payload: &'a [u8]) -> Self {
        Self { rest: payload }
    }
}

impl<'a> Iterator for GroupedItems<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let (&len, rest) = self.rest.split_first()?;
        let len = len as usize;
        if rest.len() < len {
            self.rest = &[];
            return None;
        }
        let (item, rest) = rest.split_at(len);
        self.rest = rest;
        Some(item)
    }
}

/// Parses `[0x00, 0x0E, ...]`, returning the inner-item payload slice.
pub fn parse_grouped(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 2 || data[0] != CORE_PREFIX || data[1] != SUBTYPE_GROUPED {
        return None;
    }
    Some(&data[2..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliable_roundtrip() {
        let mut buf = Vec::new();
        write_reliable(&mut buf, 42, b"hello");
        let (seq, payload) = parse_reliable(&buf).unwrap();
        assert_eq!(seq, 42);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn ack_roundtrip() {
        let packet = write_ack(7);
        assert_eq!(parse_ack(&packet), Some(7));
    }

    #[test]
    fn grouped_roundtrip() {
        let mut buf = Vec::new();
        let items: Vec<&[u8]> = vec![&[0x11, 0x22], &[0x33, 0x44, 0x55]];
        let consumed = write_grouped(&mut buf, items.iter().copied());
        assert_eq!(consumed, 2);

        let payload = parse_grouped(&buf).unwrap();
        let got: Vec<&[u8]> = GroupedItems::new(payload).collect();
        assert_eq!(got, items);
    }

    #[test]
    fn grouped_frame_never_exceeds_envelope() {
        let mut buf = Vec::new();
        let item = [0xAAu8; 255];
        let items = std::iter::repeat(&item[..]).take(10);
        write_grouped(&mut buf, items);
        assert!(buf.len() <= GAME_PACKET_LIMIT);
    }

    #[test]
    fn time_sync_roundtrip() {
        let req_bytes = {
            let mut b = vec![CORE_PREFIX, SUBTYPE_TIME_SYNC_REQUEST];
            b.extend_from_slice(&10000u32.to_le_bytes());
            b.extend_from_slice(&5u32.to_le_bytes());
            b.extend_from_slice(&7u32.to_le_bytes());
            b
        };
        let req = parse_time_sync_request(&req_bytes).unwrap();
        assert_eq!(req.client_time, 10000);
        assert_eq!(req.pkts_recv, 5);
        assert_eq!(req.pkts_sent, 7);

        let resp = write_time_sync_response(req.client_time, 99);
        assert_eq!(&resp[0..2], &[CORE_PREFIX, SUBTYPE_TIME_SYNC_RESPONSE]);
        assert_eq!(LittleEndian::read_u32(&resp[2..6]), 10000);
        assert_eq!(LittleEndian::read_u32(&resp[6..10]), 99);
    }
}
