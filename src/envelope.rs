//! Wire framing for the intake Unix datagram socket and the upstream TCP stream.
//!
//! Intake: `[u16 BE length][length bytes of JSON]`, one record per datagram.
//! Upstream: `<record bytes> 0x00` — the NUL byte is the sole delimiter, no
//! length prefix. GELF forbids embedded NULs in a record, so this is
//! unambiguous.

use crate::error::BrokerError;

/// Datagrams of this length or shorter are liveness probes, not records.
pub const PROBE_MAX_LEN: usize = 1;

/// Decode one intake datagram into its inner record bytes.
///
/// Returns `Ok(None)` for a probe datagram (length ≤ 1) — accepted, not
/// enqueued. The only documented probe is a single `0x00` byte; any other
/// datagram this short is still dropped rather than enqueued, but logged,
/// since it doesn't match the documented liveness-probe shape. Returns
/// `Err` for a malformed envelope: a declared length that doesn't match
/// the datagram size.
pub fn decode_intake(datagram: &[u8]) -> Result<Option<&[u8]>, BrokerError> {
    if datagram.len() <= PROBE_MAX_LEN {
        if datagram.len() == PROBE_MAX_LEN && datagram[0] != 0 {
            log::warn!(
                "intake datagram of length 1 is not the documented 0x00 probe byte: {:#04x}",
                datagram[0]
            );
        }
        return Ok(None);
    }
    let declared = u16::from_be_bytes([datagram[0], datagram[1]]) as usize;
    let body = &datagram[2..];
    if declared != body.len() {
        return Err(BrokerError::IntakeFraming(format!(
            "declared length {declared} does not match body length {}",
            body.len()
        )));
    }
    Ok(Some(body))
}

/// Encode a record for the Unix intake wire format (used by tests that act
/// as a producer, and by any loopback self-probe).
pub fn encode_intake(record: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + record.len());
    buf.extend_from_slice(&(record.len() as u16).to_be_bytes());
    buf.extend_from_slice(record);
    buf
}

/// Encode a record as an upstream frame: the bytes followed by a single NUL.
pub fn encode_upstream(record: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(record.len() + 1);
    buf.extend_from_slice(record);
    buf.push(0);
    buf
}

/// The well-formed keep-alive frame: `{}` plus NUL.
pub fn keepalive_frame() -> Vec<u8> {
    encode_upstream(b"{}")
}
