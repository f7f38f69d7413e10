//! STX/ETX byte-stuffed framing for the control TCP/WebSocket channel.

const STX: u8 = 0x02;
const ETX: u8 = 0x03;
const ESC: u8 = 0x1B;

const ESC_STX: u8 = 0x82;
const ESC_ETX: u8 = 0x83;
const ESC_ESC: u8 = 0x9B;

/// Encodes `body` as `STX ++ stuff(body) ++ ETX`, escaping any `STX`/`ETX`/`ESC`
/// octet that occurs in `body` itself.
pub fn encode(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(STX);
    for &b in body {
        match b {
            STX => {
                out.push(ESC);
                out.push(ESC_STX);
            }
            ETX => {
                out.push(ESC);
                out.push(ESC_ETX);
            }
            ESC => {
                out.push(ESC);
                out.push(ESC_ESC);
            }
            _ => out.push(b),
        }
    }
    out.push(ETX);
    out
}

/// Decodes a single complete `STX ... ETX` frame (without the delimiters) back
/// into its original body. For stateful reassembly across partial socket
/// reads use [`Decoder`] instead.
///
/// A byte following `ESC` that is not one of `{0x82, 0x83, 0x9B}` is a
/// protocol error for the frame; returns `None` in that case.
pub fn decode(framed: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(framed.len());
    let mut iter = framed.iter().copied();
    while let Some(b) = iter.next() {
        if b == ESC {
            match iter.next()? {
                ESC_STX => out.push(STX),
                ESC_ETX => out.push(ETX),
                ESC_ESC => out.push(ESC),
                _ => return None,
            }
        } else {
            out.push(b);
        }
    }
    Some(out)
}

/// Stateful reassembly of the control byte stream across socket reads: `STX`
/// starts buffering, `ETX` finalizes and yields one decoded frame body. A new
/// `STX` seen before a matching `ETX` discards the pending buffer (resync to
/// the newest frame start).
#[derive(Debug, Default)]
pub struct Decoder {
    buffering: bool,
    pending: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes read from the socket. Returns every fully-framed,
    /// unescaped body completed by this call, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for &b in bytes {
            match b {
                STX => {
                    self.buffering = true;
                    self.pending.clear();
                }
                ETX if self.buffering => {
                    self.buffering = false;
                    let escaped_off_by_one = self.unescape_pending();
                    self.pending.clear();
                    if let Some(body) = escaped_off_by_one {
                        out.push(body);
                    }
                }
                _ => {
                    if self.buffering {
                        self.pending.push(b);
                    }
                    // stray bytes outside a frame are ignored
                }
            }
        }
        out
    }

    fn unescape_pending(&self) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(self.pending.len());
        let mut iter = self.pending.iter().copied();
        while let Some(b) = iter.next() {
            if b == ESC {
                match iter.next()? {
                    ESC_STX => out.push(STX),
                    ESC_ETX => out.push(ETX),
                    ESC_ESC => out.push(ESC),
                    _ => return None,
                }
            } else {
                out.push(b);
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_escapes_special_bytes() {
        let encoded = encode(&[0x02, 0x03, 0x1B, 0x00]);
        assert_eq!(
            encoded,
            vec![0x02, 0x1B, 0x82, 0x1B, 0x83, 0x1B, 0x9B, 0x00, 0x03]
        );
    }

    #[test]
    fn decode_inverts_encode_for_arbitrary_bytes() {
        for body in [
            vec![],
            vec![0x00],
            vec![0x02, 0x03, 0x1B],
            (0u8..=255).collect::<Vec<u8>>(),
        ] {
            let framed = encode(&body);
            // strip STX/ETX for the pure `decode` API
            let inner = &framed[1..framed.len() - 1];
            assert_eq!(decode(inner), Some(body));
        }
    }

    #[test]
    fn decode_rejects_bad_escape_sequence() {
        assert_eq!(decode(&[ESC, 0x00]), None);
    }

    #[test]
    fn decoder_reassembles_across_partial_reads() {
        let mut decoder = Decoder::new();
        let framed = encode(b"hello");
        let (first, second) = framed.split_at(3);
        assert!(decoder.push(first).is_empty());
        let frames = decoder.push(second);
        assert_eq!(frames, vec![b"hello".to_vec()]);
    }

    #[test]
    fn decoder_discards_pending_on_new_stx() {
        let mut decoder = Decoder::new();
        let mut stream = encode(b"stale");
        stream.truncate(stream.len() - 1); // drop the ETX so it never completes
        stream.extend(encode(b"fresh"));

        let frames = decoder.push(&stream);
        assert_eq!(frames, vec![b"fresh".to_vec()]);
    }
}
