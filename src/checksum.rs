//! Internet checksum (RFC 791 / RFC 1071) and incremental update (RFC 1624).
//!
//! Ported from a C++ networking toolkit's `IpChecksum` streaming accumulator
//! and `IpPacket::adjustChecksum` incremental-update family. The original
//! reads 64-bit words through a reinterpret-casted pointer for speed; this
//! port instead treats the input as a stream of big-endian 16-bit words
//! (RFC 1071 notes the one's-complement sum is independent of the byte order
//! chosen, as long as the odd trailing byte is handled consistently), which
//! needs no `unsafe` alignment tricks and still folds to efficient code.

/// Streaming one's-complement checksum accumulator. Feed it bytes across any
/// number of [`IpChecksum::add_bytes`] calls — chunk boundaries do not need
/// to land on 2-byte word boundaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpChecksum {
    sum: u32,
    /// Set when the stream position is odd, i.e. the last byte fed in is a
    /// pending high byte of the next word.
    pending_high: Option<u8>,
}

impl IpChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.sum = 0;
        self.pending_high = None;
    }

    /// Appends more data to the running checksum.
    pub fn add_bytes(&mut self, mut data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if let Some(hi) = self.pending_high.take() {
            self.sum += u16::from_be_bytes([hi, data[0]]) as u32;
            data = &data[1..];
        }

        let mut chunks = data.chunks_exact(2);
        for word in &mut chunks {
            self.sum += u16::from_be_bytes([word[0], word[1]]) as u32;
        }

        if let [last] = chunks.remainder() {
            self.pending_high = Some(*last);
        }

        // Fold back into 32 bits periodically so `sum` never overflows even
        // across many add_bytes calls on large payloads.
        if self.sum > 0xFFFF_0000 {
            self.sum = (self.sum & 0xFFFF) + (self.sum >> 16);
        }
    }

    /// Returns the IP checksum of the data passed so far (negated, ready to
    /// store in a packet header), without consuming the accumulator.
    pub fn checksum(&self) -> u16 {
        let mut sum = self.sum;
        if let Some(hi) = self.pending_high {
            sum += (hi as u32) << 8;
        }
        while (sum >> 16) != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }

    /// One-shot convenience wrapper.
    pub fn of(data: &[u8]) -> u16 {
        let mut c = IpChecksum::new();
        c.add_bytes(data);
        c.checksum()
    }
}

/// Adjusts a stored checksum in place for a signed difference applied to the
/// summed data, handling both forward and backward carries. `checksum` is in
/// stored (negated) form, same as what a packet header carries on the wire.
pub fn adjust_checksum_diff(checksum: u16, diff: i32) -> u16 {
    let modif: i64 = diff as i64 + checksum as i64;

    if modif < 0 {
        let mut m = -modif;
        m = (m >> 16) + (m & 0xFFFF);
        m += m >> 16;
        !(m as u16)
    } else {
        let mut m = modif;
        m = (m >> 16) + (m & 0xFFFF);
        m += m >> 16;
        m as u16
    }
}

/// Adjusts a checksum for replacing a 32-bit field (e.g. an IPv4 address)
/// from `old_value` to `new_value`, both in the same (network) byte order
/// the checksum itself was computed over.
pub fn adjust_checksum_u32(checksum: u16, old_value: u32, new_value: u32) -> u16 {
    let diff = (old_value >> 16) as i32 - (new_value >> 16) as i32
        + ((old_value & 0xFFFF) as i32 - (new_value & 0xFFFF) as i32);
    adjust_checksum_diff(checksum, diff)
}

/// Adjusts a checksum for replacing a 16-bit field (e.g. a port number) from
/// `old_value` to `new_value`.
pub fn adjust_checksum_u16(checksum: u16, old_value: u16, new_value: u16) -> u16 {
    adjust_checksum_diff(checksum, old_value as i32 - new_value as i32)
}

/// Adjusts a checksum for replacing an arbitrary same-length byte field
/// (e.g. an IPv6 address) from `old_bytes` to `new_bytes`, summing the
/// signed difference of each 16-bit word the way `IpPacket::setAddress`
/// does for IPv6 addresses (word-at-a-time, not a single 128-bit value).
/// `old_bytes`/`new_bytes` must have the same even length.
pub fn adjust_checksum_bytes(checksum: u16, old_bytes: &[u8], new_bytes: &[u8]) -> u16 {
    debug_assert_eq!(old_bytes.len(), new_bytes.len());
    debug_assert_eq!(old_bytes.len() % 2, 0);
    let mut diff: i32 = 0;
    for (old_word, new_word) in old_bytes.chunks_exact(2).zip(new_bytes.chunks_exact(2)) {
        let old = u16::from_be_bytes([old_word[0], old_word[1]]);
        let new = u16::from_be_bytes([new_word[0], new_word[1]]);
        diff += old as i32 - new as i32;
    }
    adjust_checksum_diff(checksum, diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_checksum_is_all_ones() {
        assert_eq!(IpChecksum::new().checksum(), 0xFFFF);
    }

    #[test]
    fn known_rfc1071_example() {
        // 0x0001 0xF203 0xF4F5 0xF6F7 sums to a known checksum of 0x220D.
        let data = [0x00, 0x01, 0xF2, 0x03, 0xF4, 0xF5, 0xF6, 0xF7];
        assert_eq!(IpChecksum::of(&data), 0x220D);
    }

    #[test]
    fn chunked_feed_matches_single_shot() {
        let data: Vec<u8> = (0u8..=255).collect();
        let whole = IpChecksum::of(&data);

        let mut c = IpChecksum::new();
        for chunk in data.chunks(3) {
            c.add_bytes(chunk);
        }
        assert_eq!(c.checksum(), whole);
    }

    #[test]
    fn odd_length_trailing_byte_handled() {
        let data = [0xAB, 0xCD, 0xEF];
        let whole = IpChecksum::of(&data);

        let mut c = IpChecksum::new();
        c.add_bytes(&data[..1]);
        c.add_bytes(&data[1..]);
        assert_eq!(c.checksum(), whole);
    }

    #[test]
    fn adjust_checksum_u16_matches_recompute() {
        let header = [0x45u8, 0x00, 0x00, 0x28, 0x00, 0x00, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00];
        let base = IpChecksum::of(&header);

        let old_port = u16::from_be_bytes([header[0], header[1]]);
        let new_port = 0x1234u16;
        let adjusted = adjust_checksum_u16(base, old_port, new_port);

        let mut modified = header;
        modified[0] = (new_port >> 8) as u8;
        modified[1] = new_port as u8;
        let recomputed = IpChecksum::of(&modified);

        assert_eq!(adjusted, recomputed);
    }

    #[test]
    fn adjust_checksum_u32_matches_recompute() {
        let header = [0x45u8, 0x00, 0x00, 0x28, 0x00, 0x00, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00];
        let base = IpChecksum::of(&header);

        let old_val = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let new_val = 0xAABBCCDDu32;
        let adjusted = adjust_checksum_u32(base, old_val, new_val);

        let mut modified = header;
        modified[4..8].copy_from_slice(&new_val.to_be_bytes());
        let recomputed = IpChecksum::of(&modified);

        assert_eq!(adjusted, recomputed);
    }
}
