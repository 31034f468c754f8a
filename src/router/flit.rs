//! Flits and packets.
//!
//! A packet is a sequence of flits: one Head, zero or more Body flits and a
//! terminating Tail, or a single Single flit. Only the header (Head or
//! Single) carries routing bits; the rest follow the path it opened.

use std::fmt;

use super::bits;

/// Position of a flit within its packet.
///
/// The 2-bit encoding is `Body=0, Head=1, Tail=2, Single=3`: bit 0 marks a
/// header, bit 1 marks the end of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlitPosition {
    Body,
    Head,
    Tail,
    Single,
}

impl FlitPosition {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => FlitPosition::Body,
            1 => FlitPosition::Head,
            2 => FlitPosition::Tail,
            _ => FlitPosition::Single,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            FlitPosition::Body => 0,
            FlitPosition::Head => 1,
            FlitPosition::Tail => 2,
            FlitPosition::Single => 3,
        }
    }

    /// Head or Single: carries routing information.
    pub fn is_header(self) -> bool {
        self.to_bits() & 0b01 != 0
    }

    /// Tail or Single: closes the packet.
    pub fn is_tail(self) -> bool {
        self.to_bits() & 0b10 != 0
    }
}

impl fmt::Display for FlitPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlitPosition::Body => "B",
            FlitPosition::Head => "H",
            FlitPosition::Tail => "T",
            FlitPosition::Single => "S",
        };
        write!(f, "{}", s)
    }
}

/// Smallest schedulable unit of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flit {
    /// Data bits; for headers the low bits hold the route
    pub payload: u64,
    /// Position within the packet
    pub position: FlitPosition,
    /// Packet tag; the virtual channel lives in its low bits
    pub packet_id: u32,
}

impl Flit {
    pub fn new(payload: u64, position: FlitPosition, packet_id: u32) -> Self {
        Self { payload, position, packet_id }
    }

    pub fn head(payload: u64, packet_id: u32) -> Self {
        Self::new(payload, FlitPosition::Head, packet_id)
    }

    pub fn body(payload: u64, packet_id: u32) -> Self {
        Self::new(payload, FlitPosition::Body, packet_id)
    }

    pub fn tail(payload: u64, packet_id: u32) -> Self {
        Self::new(payload, FlitPosition::Tail, packet_id)
    }

    pub fn single(payload: u64, packet_id: u32) -> Self {
        Self::new(payload, FlitPosition::Single, packet_id)
    }

    pub fn is_header(&self) -> bool {
        self.position.is_header()
    }

    pub fn is_tail(&self) -> bool {
        self.position.is_tail()
    }

    /// Virtual channel encoded in the low `index_width(num_vcs)` bits of the
    /// packet id. Always 0 with a single VC.
    ///
    /// The result may be out of range when `num_vcs` is not a power of two;
    /// the router treats that as a protocol violation.
    pub fn virtual_channel(&self, num_vcs: usize) -> usize {
        if num_vcs <= 1 {
            return 0;
        }
        let width = bits::index_width(num_vcs);
        bits::get_field(self.packet_id as u64, 0, width) as usize
    }
}

impl fmt::Display for Flit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{},{:#x},id={}>", self.position, self.payload, self.packet_id)
    }
}

/// Packet id combining a tag with a virtual channel in the low bits.
pub fn packet_id(tag: u32, vc: usize, num_vcs: usize) -> u32 {
    if num_vcs <= 1 {
        return tag;
    }
    let width = bits::index_width(num_vcs);
    (tag << width) | (vc as u32)
}

/// Split a packet into flits.
///
/// The header carries `header_payload`. Each entry of `body` becomes a
/// further flit; the last one is the Tail. An empty body yields a single
/// Single flit.
pub fn packetize(packet_id: u32, header_payload: u64, body: &[u64]) -> Vec<Flit> {
    if body.is_empty() {
        return vec![Flit::single(header_payload, packet_id)];
    }

    let mut flits = Vec::with_capacity(body.len() + 1);
    flits.push(Flit::head(header_payload, packet_id));
    for (i, &payload) in body.iter().enumerate() {
        if i + 1 == body.len() {
            flits.push(Flit::tail(payload, packet_id));
        } else {
            flits.push(Flit::body(payload, packet_id));
        }
    }
    flits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_encoding() {
        for bits in 0..4u8 {
            assert_eq!(FlitPosition::from_bits(bits).to_bits(), bits);
        }
        assert!(FlitPosition::Head.is_header());
        assert!(FlitPosition::Single.is_header());
        assert!(!FlitPosition::Body.is_header());
        assert!(!FlitPosition::Tail.is_header());

        assert!(FlitPosition::Tail.is_tail());
        assert!(FlitPosition::Single.is_tail());
        assert!(!FlitPosition::Head.is_tail());
        assert!(!FlitPosition::Body.is_tail());
    }

    #[test]
    fn test_virtual_channel_from_packet_id() {
        let id = packet_id(5, 3, 4);
        let flit = Flit::head(0, id);
        assert_eq!(flit.virtual_channel(4), 3);
        assert_eq!(flit.virtual_channel(1), 0);
        assert_eq!(id >> 2, 5);
    }

    #[test]
    fn test_packetize() {
        let flits = packetize(7, 0xAB, &[1, 2, 3]);
        let positions: Vec<_> = flits.iter().map(|f| f.position).collect();
        assert_eq!(
            positions,
            vec![FlitPosition::Head, FlitPosition::Body, FlitPosition::Body, FlitPosition::Tail]
        );
        assert_eq!(flits[0].payload, 0xAB);
        assert_eq!(flits[3].payload, 3);
        assert!(flits.iter().all(|f| f.packet_id == 7));

        let single = packetize(1, 0x5, &[]);
        assert_eq!(single, vec![Flit::single(0x5, 1)]);
    }
}
