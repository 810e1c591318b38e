// =============================================================================
// FIX 4.4 wire format — tag=value framing, checksum, message builder
// =============================================================================
//
// Messages are SOH-delimited `tag=value` pairs terminated by `10=CCC<SOH>`.
// The parser is a single pass over a received frame, borrowing every value
// from the input buffer. The checksum is the modulo-256 sum of every byte
// preceding the `10=` field.
// =============================================================================

use thiserror::Error;

/// Field delimiter.
pub const SOH: u8 = 0x01;

pub const BEGIN_STRING: &str = "FIX.4.4";

// Session-level tags.
pub const TAG_BEGIN_STRING: u32 = 8;
pub const TAG_BODY_LENGTH: u32 = 9;
pub const TAG_CHECKSUM: u32 = 10;
pub const TAG_MSG_SEQ_NUM: u32 = 34;
pub const TAG_MSG_TYPE: u32 = 35;
pub const TAG_POSS_DUP_FLAG: u32 = 43;
pub const TAG_SENDER_COMP_ID: u32 = 49;
pub const TAG_SENDING_TIME: u32 = 52;
pub const TAG_TARGET_COMP_ID: u32 = 56;
pub const TAG_BEGIN_SEQ_NO: u32 = 7;
pub const TAG_END_SEQ_NO: u32 = 16;
pub const TAG_NEW_SEQ_NO: u32 = 36;
pub const TAG_GAP_FILL_FLAG: u32 = 123;
pub const TAG_ENCRYPT_METHOD: u32 = 98;
pub const TAG_HEART_BT_INT: u32 = 108;
pub const TAG_TEST_REQ_ID: u32 = 112;
pub const TAG_TEXT: u32 = 58;
pub const TAG_REF_SEQ_NUM: u32 = 45;
pub const TAG_REF_MSG_TYPE: u32 = 372;
pub const TAG_BUSINESS_REJECT_REASON: u32 = 380;

// Application tags.
pub const TAG_AVG_PX: u32 = 6;
pub const TAG_CL_ORD_ID: u32 = 11;
pub const TAG_ORIG_CL_ORD_ID: u32 = 41;
pub const TAG_ORDER_ID: u32 = 37;
pub const TAG_ORDER_QTY: u32 = 38;
pub const TAG_ORD_STATUS: u32 = 39;
pub const TAG_ORD_TYPE: u32 = 40;
pub const TAG_PRICE: u32 = 44;
pub const TAG_STOP_PX: u32 = 99;
pub const TAG_SIDE: u32 = 54;
pub const TAG_SYMBOL: u32 = 55;
pub const TAG_TIME_IN_FORCE: u32 = 59;
pub const TAG_LAST_PX: u32 = 31;
pub const TAG_LAST_QTY: u32 = 32;
pub const TAG_EXEC_TYPE: u32 = 150;
pub const TAG_MD_REQ_ID: u32 = 262;
pub const TAG_SUBSCRIPTION_TYPE: u32 = 263;
pub const TAG_MARKET_DEPTH: u32 = 264;
pub const TAG_NO_MD_ENTRY_TYPES: u32 = 267;
pub const TAG_NO_MD_ENTRIES: u32 = 268;
pub const TAG_MD_ENTRY_TYPE: u32 = 269;
pub const TAG_MD_ENTRY_PX: u32 = 270;
pub const TAG_NO_RELATED_SYM: u32 = 146;
pub const TAG_POS_REQ_ID: u32 = 710;

// =============================================================================
// Message types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Heartbeat,             // 0
    TestRequest,           // 1
    ResendRequest,         // 2
    SessionReject,         // 3
    SequenceReset,         // 4
    Logout,                // 5
    Logon,                 // A
    NewOrderSingle,        // D
    OrderCancelRequest,    // F
    OrderCancelReplace,    // G
    ExecutionReport,       // 8
    OrderCancelReject,     // 9
    MarketDataRequest,     // V
    MarketDataSnapshot,    // W
    MarketDataIncremental, // X
    RequestForPositions,   // AN
    PositionReport,        // AP
    BusinessReject,        // j
}

impl MsgType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "0",
            Self::TestRequest => "1",
            Self::ResendRequest => "2",
            Self::SessionReject => "3",
            Self::SequenceReset => "4",
            Self::Logout => "5",
            Self::Logon => "A",
            Self::NewOrderSingle => "D",
            Self::OrderCancelRequest => "F",
            Self::OrderCancelReplace => "G",
            Self::ExecutionReport => "8",
            Self::OrderCancelReject => "9",
            Self::MarketDataRequest => "V",
            Self::MarketDataSnapshot => "W",
            Self::MarketDataIncremental => "X",
            Self::RequestForPositions => "AN",
            Self::PositionReport => "AP",
            Self::BusinessReject => "j",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "0" => Self::Heartbeat,
            "1" => Self::TestRequest,
            "2" => Self::ResendRequest,
            "3" => Self::SessionReject,
            "4" => Self::SequenceReset,
            "5" => Self::Logout,
            "A" => Self::Logon,
            "D" => Self::NewOrderSingle,
            "F" => Self::OrderCancelRequest,
            "G" => Self::OrderCancelReplace,
            "8" => Self::ExecutionReport,
            "9" => Self::OrderCancelReject,
            "V" => Self::MarketDataRequest,
            "W" => Self::MarketDataSnapshot,
            "X" => Self::MarketDataIncremental,
            "AN" => Self::RequestForPositions,
            "AP" => Self::PositionReport,
            "j" => Self::BusinessReject,
            _ => return None,
        })
    }

    /// Session-level (admin) messages are gap-filled instead of resent.
    pub fn is_admin(self) -> bool {
        matches!(
            self,
            Self::Heartbeat
                | Self::TestRequest
                | Self::ResendRequest
                | Self::SessionReject
                | Self::SequenceReset
                | Self::Logout
                | Self::Logon
        )
    }
}

// =============================================================================
// Parse errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("checksum mismatch: declared {declared}, computed {computed}")]
    ChecksumMismatch { declared: u32, computed: u32 },
}

// =============================================================================
// RawMessage — borrowed single-pass parse
// =============================================================================

/// A parsed message whose values borrow from the received frame.
#[derive(Debug)]
pub struct RawMessage<'a> {
    fields: Vec<(u32, &'a str)>,
}

impl<'a> RawMessage<'a> {
    /// Parse one complete frame (`8=FIX.4.4...10=CCC<SOH>`), validating the
    /// checksum before anything else is trusted.
    pub fn parse(frame: &'a [u8]) -> Result<Self, ParseError> {
        if frame.is_empty() {
            return Err(ParseError::Malformed("empty frame".into()));
        }

        let mut fields: Vec<(u32, &'a str)> = Vec::with_capacity(16);
        let mut checksum_declared: Option<u32> = None;
        let mut checksum_region_end = 0;

        let mut pos = 0;
        while pos < frame.len() {
            let Some(rel_soh) = frame[pos..].iter().position(|&b| b == SOH) else {
                return Err(ParseError::Malformed("unterminated field".into()));
            };
            let field = &frame[pos..pos + rel_soh];
            let Some(eq) = field.iter().position(|&b| b == b'=') else {
                return Err(ParseError::Malformed("field without '='".into()));
            };
            let tag: u32 = std::str::from_utf8(&field[..eq])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ParseError::Malformed("non-numeric tag".into()))?;
            let value = std::str::from_utf8(&field[eq + 1..])
                .map_err(|_| ParseError::Malformed("non-utf8 value".into()))?;

            if tag == TAG_CHECKSUM {
                checksum_declared = Some(
                    value
                        .parse()
                        .map_err(|_| ParseError::Malformed("bad checksum value".into()))?,
                );
                checksum_region_end = pos;
                fields.push((tag, value));
                break;
            }
            fields.push((tag, value));
            pos += rel_soh + 1;
        }

        let Some(declared) = checksum_declared else {
            return Err(ParseError::Malformed("missing checksum field".into()));
        };
        let computed = frame[..checksum_region_end]
            .iter()
            .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
            % 256;
        if computed != declared {
            return Err(ParseError::ChecksumMismatch { declared, computed });
        }

        match fields.first() {
            Some((TAG_BEGIN_STRING, v)) if *v == BEGIN_STRING => {}
            _ => return Err(ParseError::Malformed("missing or wrong BeginString".into())),
        }

        Ok(Self { fields })
    }

    pub fn get(&self, tag: u32) -> Option<&'a str> {
        self.fields.iter().find(|(t, _)| *t == tag).map(|(_, v)| *v)
    }

    pub fn get_u64(&self, tag: u32) -> Option<u64> {
        self.get(tag)?.parse().ok()
    }

    pub fn get_f64(&self, tag: u32) -> Option<f64> {
        self.get(tag)?.parse().ok()
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_str(self.get(TAG_MSG_TYPE)?)
    }

    pub fn seq_num(&self) -> Option<u64> {
        self.get_u64(TAG_MSG_SEQ_NUM)
    }

    pub fn poss_dup(&self) -> bool {
        self.get(TAG_POSS_DUP_FLAG) == Some("Y")
    }

    /// All fields in wire order. Repeated tags (repeating groups) are kept.
    pub fn fields(&self) -> &[(u32, &'a str)] {
        &self.fields
    }

    /// An owned copy of the application payload for delivery beyond the
    /// read buffer's lifetime.
    pub fn to_owned_fields(&self) -> Vec<(u32, String)> {
        self.fields
            .iter()
            .map(|(t, v)| (*t, (*v).to_string()))
            .collect()
    }
}

// =============================================================================
// Frame extraction
// =============================================================================

/// Pull every complete frame out of a rolling receive buffer, leaving any
/// trailing partial message in place.
pub fn extract_frames(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        // Locate the start of a message.
        let Some(start) = find(buffer, b"8=FIX") else {
            // No start marker: keep only a short tail that could be the
            // beginning of one.
            if buffer.len() > 8 {
                let drop_len = buffer.len() - 8;
                buffer.drain(..drop_len);
            }
            break;
        };
        if start > 0 {
            buffer.drain(..start);
        }

        // Locate the terminating checksum field.
        let Some(cks) = find(buffer, &[SOH, b'1', b'0', b'=']) else {
            break;
        };
        let Some(rel_end) = buffer[cks + 1..].iter().position(|&b| b == SOH) else {
            break;
        };
        let end = cks + 1 + rel_end + 1;
        let frame: Vec<u8> = buffer.drain(..end).collect();
        frames.push(frame);
    }
    frames
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// =============================================================================
// Builder
// =============================================================================

/// Builds an outbound message: header, body, body length and checksum.
pub struct MessageBuilder {
    msg_type: MsgType,
    fields: Vec<(u32, String)>,
}

impl MessageBuilder {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, tag: u32, value: impl ToString) -> Self {
        self.fields.push((tag, value.to_string()));
        self
    }

    /// Assemble the wire bytes with the given header values.
    pub fn build(&self, seq: u64, sender: &str, target: &str, sending_time: &str) -> Vec<u8> {
        let mut body = Vec::with_capacity(128);
        push_field(&mut body, TAG_MSG_TYPE, self.msg_type.as_str());
        push_field(&mut body, TAG_SENDER_COMP_ID, sender);
        push_field(&mut body, TAG_TARGET_COMP_ID, target);
        push_field(&mut body, TAG_MSG_SEQ_NUM, &seq.to_string());
        push_field(&mut body, TAG_SENDING_TIME, sending_time);
        for (tag, value) in &self.fields {
            push_field(&mut body, *tag, value);
        }

        let mut out = Vec::with_capacity(body.len() + 32);
        push_field(&mut out, TAG_BEGIN_STRING, BEGIN_STRING);
        push_field(&mut out, TAG_BODY_LENGTH, &body.len().to_string());
        out.extend_from_slice(&body);

        let checksum = out
            .iter()
            .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
            % 256;
        push_field(&mut out, TAG_CHECKSUM, &format!("{checksum:03}"));
        out
    }
}

fn push_field(buf: &mut Vec<u8>, tag: u32, value: &str) {
    buf.extend_from_slice(tag.to_string().as_bytes());
    buf.push(b'=');
    buf.extend_from_slice(value.as_bytes());
    buf.push(SOH);
}

/// FIX UTCTimestamp with milliseconds.
pub fn sending_time_now() -> String {
    chrono::Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn build_heartbeat(seq: u64) -> Vec<u8> {
        MessageBuilder::new(MsgType::Heartbeat).build(seq, "US", "THEM", "20240101-00:00:00.000")
    }

    #[test]
    fn builder_roundtrips_through_parser() {
        let bytes = MessageBuilder::new(MsgType::Logon)
            .field(TAG_ENCRYPT_METHOD, 0)
            .field(TAG_HEART_BT_INT, 30)
            .build(1, "MERIDIAN", "LPBANK", "20240101-12:00:00.000");

        let msg = RawMessage::parse(&bytes).unwrap();
        assert_eq!(msg.msg_type(), Some(MsgType::Logon));
        assert_eq!(msg.seq_num(), Some(1));
        assert_eq!(msg.get(TAG_SENDER_COMP_ID), Some("MERIDIAN"));
        assert_eq!(msg.get(TAG_HEART_BT_INT), Some("30"));
        assert!(!msg.poss_dup());
    }

    #[test]
    fn checksum_is_validated() {
        let mut bytes = build_heartbeat(5);
        // Corrupt one body byte without touching the checksum field.
        let idx = bytes.len() / 2;
        bytes[idx] ^= 0x01;
        match RawMessage::parse(&bytes) {
            Err(ParseError::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn body_length_counts_bytes_after_tag9() {
        let bytes = build_heartbeat(1);
        let text = String::from_utf8_lossy(&bytes);
        let body_len: usize = text
            .split('\x01')
            .find_map(|f| f.strip_prefix("9="))
            .unwrap()
            .parse()
            .unwrap();
        // Region between "9=N<SOH>" and "10=".
        let after_len = text.find('\x01').unwrap() + 1; // end of 8=
        let after_body_tag = text[after_len..].find('\x01').unwrap() + after_len + 1;
        let cks_at = text.rfind("10=").unwrap();
        assert_eq!(body_len, cks_at - after_body_tag);
    }

    #[test]
    fn missing_checksum_is_malformed() {
        let bytes = b"8=FIX.4.4\x019=12\x0135=0\x0134=1\x01".to_vec();
        assert!(matches!(
            RawMessage::parse(&bytes),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn extract_frames_handles_partials_and_coalesced() {
        let m1 = build_heartbeat(1);
        let m2 = build_heartbeat(2);

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&m1);
        buffer.extend_from_slice(&m2[..10]); // partial second message

        let frames = extract_frames(&mut buffer);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], m1);

        buffer.extend_from_slice(&m2[10..]);
        let frames = extract_frames(&mut buffer);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], m2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn extract_frames_skips_garbage_prefix() {
        let m = build_heartbeat(3);
        let mut buffer = b"junkjunk".to_vec();
        buffer.extend_from_slice(&m);
        let frames = extract_frames(&mut buffer);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], m);
    }

    #[test]
    fn repeated_group_tags_are_preserved() {
        // Market data snapshot with bid and offer entries.
        let bytes = MessageBuilder::new(MsgType::MarketDataSnapshot)
            .field(TAG_SYMBOL, "EURUSD")
            .field(TAG_NO_MD_ENTRIES, 2)
            .field(TAG_MD_ENTRY_TYPE, 0)
            .field(TAG_MD_ENTRY_PX, 1.10000)
            .field(TAG_MD_ENTRY_TYPE, 1)
            .field(TAG_MD_ENTRY_PX, 1.10020)
            .build(9, "LP", "US", "20240101-00:00:00.000");
        let msg = RawMessage::parse(&bytes).unwrap();
        let entries: Vec<_> = msg
            .fields()
            .iter()
            .filter(|(t, _)| *t == TAG_MD_ENTRY_PX)
            .collect();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn msg_type_table_is_total() {
        for t in [
            "0", "1", "2", "3", "4", "5", "A", "D", "F", "G", "8", "9", "V", "W", "X", "AN",
            "AP", "j",
        ] {
            let parsed = MsgType::from_str(t).unwrap();
            assert_eq!(parsed.as_str(), t);
        }
        assert!(MsgType::from_str("ZZ").is_none());
        assert!(MsgType::Logon.is_admin());
        assert!(!MsgType::NewOrderSingle.is_admin());
    }
}
