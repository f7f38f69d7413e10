//! HQV link-layer framing: BLE fragment reassembly/segmentation.
//!
//! On the wire a frame is `type(1) | length_hi(1) | length_lo(1) | header(1) | payload(0..1152)`,
//! where `length` counts the header octet plus the payload (`len(payload) + 1`).

use log::warn;

const MESSAGE_TYPE: u8 = 0x01;
const MAX_PAYLOAD: usize = 1152;
const MAX_FRAME: usize = 1156;
const PREFIX_LEN: usize = 4;

/// Splits a single compound HQV payload into its inner logical messages when
/// residual bytes remain in the receive buffer after a frame has been fully
/// consumed. The offsets `0..14` and `18..` were observed empirically on
/// newer peripherals and are not otherwise understood; see the design notes
/// for why this lives behind a trait instead of being inlined into
/// [`HqvCodec::ingest`].
pub trait CompoundSplitPolicy: Send {
    /// Given the payload of a just-delivered frame, return the additional
    /// inner payloads it should be split into (in delivery order), or an
    /// empty vec if the payload is not compound.
    fn split(&self, payload: &[u8]) -> Vec<Vec<u8>>;
}

/// The fixed-offset split used in production: `payload[0..14]` and
/// `payload[18..]`. Only applied when there is residual buffer data after
/// the frame, matching the observed behavior exactly.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedOffsetSplit;

impl CompoundSplitPolicy for FixedOffsetSplit {
    fn split(&self, payload: &[u8]) -> Vec<Vec<u8>> {
        if payload.len() < 18 {
            return Vec::new();
        }
        vec![payload[0..14].to_vec(), payload[18..].to_vec()]
    }
}

/// A header+payload tuple delivered by [`HqvCodec::ingest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HqvMessage {
    pub header: u8,
    pub payload: Vec<u8>,
}

/// Reassembles BLE notification fragments into whole HQV frames and splits
/// outbound UDP datagrams into BLE-sized fragments.
///
/// Owned exclusively by one `GatewaySession`; not `Clone`, not shared.
pub struct HqvCodec {
    buf: Vec<u8>,
    split_policy: Box<dyn CompoundSplitPolicy>,
}

impl Default for HqvCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HqvCodec {
    pub fn new() -> Self {
        Self::with_split_policy(Box::new(FixedOffsetSplit))
    }

    pub fn with_split_policy(split_policy: Box<dyn CompoundSplitPolicy>) -> Self {
        HqvCodec {
            buf: Vec::new(),
            split_policy,
        }
    }

    /// Appends `fragment` to the receive buffer and returns every frame (and
    /// any compound-split inner messages) that became deliverable as a
    /// result. Never panics; malformed prefixes purge the buffer silently
    /// (logged at `warn`).
    pub fn ingest(&mut self, fragment: &[u8]) -> Vec<HqvMessage> {
        self.buf.extend_from_slice(fragment);

        let mut out = Vec::new();
        loop {
            if self.buf.len() < PREFIX_LEN {
                break;
            }

            let msg_type = self.buf[0];
            let length = u16::from_be_bytes([self.buf[1], self.buf[2]]) as usize;
            let header = self.buf[3];

            let headers_valid = msg_type == MESSAGE_TYPE
                && is_header_valid(header)
                && length > 0
                && length <= MAX_FRAME - PREFIX_LEN + 1;

            if !headers_valid {
                warn!(
                    "hqv_codec: purging buffer of {} bytes on malformed prefix (type={:#04x} length={} header={:#04x})",
                    self.buf.len(), msg_type, length, header
                );
                self.buf.clear();
                break;
            }

            let frame_len = length + 3; // 3 prefix octets excluding the header-counted one
            if self.buf.len() < frame_len {
                break; // awaiting-body
            }

            let payload = self.buf[PREFIX_LEN..frame_len].to_vec();
            self.buf.drain(0..frame_len);

            let has_residue = !self.buf.is_empty();

            if has_residue {
                let inner = self.split_policy.split(&payload);
                out.push(HqvMessage {
                    header,
                    payload,
                });
                for chunk in inner {
                    out.push(HqvMessage {
                        header,
                        payload: chunk,
                    });
                }
            } else {
                out.push(HqvMessage { header, payload });
            }
            // residue, if any, is reprocessed as the start of the next frame
        }
        out
    }

    /// Produces the BLE fragment sequence for one outbound datagram.
    /// Fails precondition if `payload` exceeds 1152 octets or `header` is
    /// not in `0..=3`.
    pub fn wrap(payload: &[u8], header: u8, mtu: u16) -> crate::Result<Vec<Vec<u8>>> {
        if payload.len() > MAX_PAYLOAD {
            return Err(crate::AgentError::Precondition(format!(
                "payload of {} octets exceeds the {} octet maximum",
                payload.len(),
                MAX_PAYLOAD
            )));
        }
        if !is_header_valid(header) {
            return Err(crate::AgentError::Precondition(format!(
                "header {header:#04x} is not in 0..=3"
            )));
        }

        let length = (payload.len() + 1) as u16;
        let mut out = Vec::with_capacity(PREFIX_LEN + payload.len());
        out.push(MESSAGE_TYPE);
        out.extend_from_slice(&length.to_be_bytes());
        out.push(header);
        out.extend_from_slice(payload);

        let chunk_size = mtu.saturating_sub(3).max(1) as usize;
        Ok(out.chunks(chunk_size).map(|c| c.to_vec()).collect())
    }
}

fn is_header_valid(header: u8) -> bool {
    header <= 3
}

/// Local(0)/Remote(1) server selector, combined with a transport-security
/// bit into the two-bit HQV `header` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    Unencrypted,
    Dtls,
}

/// Combines a server type and transport security selection into the HQV
/// `header` octet truth table: `(Local, Clear)=0`, `(Remote, Clear)=1`,
/// `(Local, Dtls)=2`, `(Remote, Dtls)=3`.
pub fn to_packet_header(server: ServerType, security: TransportSecurity) -> u8 {
    let server_bit = matches!(server, ServerType::Remote) as u8;
    let security_bit = matches!(security, TransportSecurity::Dtls) as u8;
    server_bit | (security_bit << 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_reassembles_across_two_fragments() {
        let mut codec = HqvCodec::new();
        assert!(codec.ingest(&[0x01, 0x00, 0x05, 0x03, 0xAA, 0xBB]).is_empty());
        let out = codec.ingest(&[0xCC, 0xDD]);
        assert_eq!(
            out,
            vec![HqvMessage {
                header: 0x03,
                payload: vec![0xAA, 0xBB, 0xCC, 0xDD]
            }]
        );
    }

    #[test]
    fn ingest_two_whole_frames_in_two_pieces() {
        let mut codec = HqvCodec::new();
        let out1 = codec.ingest(&[0x01, 0x00, 0x05, 0x03, 0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(
            out1,
            vec![HqvMessage {
                header: 0x03,
                payload: vec![0xAA, 0xBB, 0xCC, 0xDD]
            }]
        );
        let out2 = codec.ingest(&[0x01, 0x00, 0x03, 0x03, 0xEE, 0xFF]);
        assert_eq!(
            out2,
            vec![HqvMessage {
                header: 0x03,
                payload: vec![0xEE, 0xFF]
            }]
        );
    }

    #[test]
    fn compound_notification_splits_residual_frame() {
        let mut codec = HqvCodec::new();
        let payload: Vec<u8> = (0..30u8).collect();
        let mut wire = vec![0x01, 0x00, (payload.len() + 1) as u8, 0x03];
        wire.extend_from_slice(&payload);
        wire.push(0xFF); // a single residual byte — not enough for a full next header

        let out = codec.ingest(&wire);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].payload, payload);
        assert_eq!(out[1].payload, payload[0..14]);
        assert_eq!(out[2].payload, payload[18..]);
    }

    #[test]
    fn single_byte_feed_matches_whole_frame_feed() {
        let whole = {
            let mut c = HqvCodec::new();
            c.ingest(&[0x01, 0x00, 0x05, 0x03, 0xAA, 0xBB, 0xCC, 0xDD])
        };

        let mut c = HqvCodec::new();
        let mut byte_by_byte = Vec::new();
        for b in [0x01u8, 0x00, 0x05, 0x03, 0xAA, 0xBB, 0xCC, 0xDD] {
            byte_by_byte.extend(c.ingest(&[b]));
        }
        assert_eq!(whole, byte_by_byte);
    }

    #[test]
    fn length_zero_is_rejected() {
        let mut codec = HqvCodec::new();
        let out = codec.ingest(&[0x01, 0x00, 0x00, 0x03]);
        assert!(out.is_empty());
        assert!(codec.buf.is_empty(), "buffer should be purged");
    }

    #[test]
    fn length_beyond_max_rejected_max_accepted() {
        // length = 1154 implies an on-wire frame of 1157 octets, over the 1156 cap: rejected.
        let mut codec = HqvCodec::new();
        let out = codec.ingest(&[0x01, (1154u16 >> 8) as u8, 1154u16 as u8, 0x00]);
        assert!(out.is_empty());
        assert!(codec.buf.is_empty());

        // length = 1153 implies a full 1152-octet payload, exactly at the cap: accepted.
        let mut codec = HqvCodec::new();
        let mut wire = vec![0x01, (1153u16 >> 8) as u8, 1153u16 as u8, 0x00];
        wire.extend(std::iter::repeat(0u8).take(1152));
        let out = codec.ingest(&wire);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload.len(), 1152);
    }

    #[test]
    fn wrap_round_trips_payload() {
        let payload = vec![1u8, 2, 3, 4, 5];
        let fragments = HqvCodec::wrap(&payload, 3, 23).unwrap();
        let mut codec = HqvCodec::new();
        let mut delivered = Vec::new();
        for f in fragments {
            delivered.extend(codec.ingest(&f));
        }
        assert_eq!(delivered, vec![HqvMessage { header: 3, payload }]);
    }

    #[test]
    fn wrap_with_mtu_23_on_20_byte_payload_splits_20_then_4() {
        let payload = vec![0u8; 20];
        let fragments = HqvCodec::wrap(&payload, 1, 23).unwrap();
        let lengths: Vec<usize> = fragments.iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![20, 4]);
    }

    #[test]
    fn wrap_rejects_oversize_payload_and_bad_header() {
        assert!(HqvCodec::wrap(&vec![0u8; 1153], 0, 23).is_err());
        assert!(HqvCodec::wrap(&[0u8], 4, 23).is_err());
    }

    #[test]
    fn to_packet_header_truth_table() {
        assert_eq!(
            to_packet_header(ServerType::Local, TransportSecurity::Unencrypted),
            0
        );
        assert_eq!(
            to_packet_header(ServerType::Remote, TransportSecurity::Unencrypted),
            1
        );
        assert_eq!(
            to_packet_header(ServerType::Local, TransportSecurity::Dtls),
            2
        );
        assert_eq!(
            to_packet_header(ServerType::Remote, TransportSecurity::Dtls),
            3
        );
    }
}
