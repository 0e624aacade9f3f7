//! Wire format of reliable-sequenced packets.

use {
    crate::seq::Seq,
    core::{convert::Infallible, fmt},
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// Maximum length of a whole reliable packet, header included.
///
/// This is also the stride of each packet slot in the send and receive rings.
pub const MTU: usize = 1400;

/// Maximum length of the payload carried by one reliable packet.
pub const MAX_PAYLOAD_LEN: usize = MTU - PacketHeader::ENCODE_LEN;

/// Discriminates what a reliable packet carries.
///
/// Unknown values may be decoded off the wire; the stage discards packets
/// which are neither [`PacketType::PAYLOAD`] nor [`PacketType::ACK`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct PacketType(pub u16);

impl PacketType {
    /// Packet carries application data, and must be acknowledged.
    pub const PAYLOAD: Self = Self(0);
    /// Packet only carries acknowledgement information.
    pub const ACK: Self = Self(1);
}

impl fmt::Debug for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::PAYLOAD => f.write_str("Payload"),
            Self::ACK => f.write_str("Ack"),
            Self(other) => f.debug_tuple("PacketType").field(&other).finish(),
        }
    }
}

/// Fixed-layout header prepended to every reliable packet.
///
/// # Layout
///
/// ```text
/// 0               2               4               6               8
/// +---------------+---------------+---------------+---------------+
/// |  packet_type  |processing_time|   sequence    |acked_sequence |
/// +---------------+---------------+---------------+---------------+
/// |            ack_mask           |
/// +-------------------------------+
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct PacketHeader {
    /// What this packet carries.
    pub packet_type: PacketType,
    /// How long, in milliseconds, the sender held on to
    /// [`PacketHeader::acked_sequence`] between receiving it and sending this
    /// packet.
    ///
    /// The receiver subtracts this from its RTT sample, so that delays in the
    /// peer's app do not inflate the RTT estimate.
    pub processing_time: u16,
    /// Sequence of this packet.
    ///
    /// Ack packets do not consume a sequence, so this is meaningless for them.
    pub sequence: Seq,
    /// Latest sequence which the sender has received from us.
    pub acked_sequence: Seq,
    /// Bit `k` is set if the sender has received sequence
    /// `acked_sequence - k` from us.
    ///
    /// If this is 0, the sender has not received anything from us yet.
    pub ack_mask: u32,
}

impl fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PacketHeader")
            .field("packet_type", &self.packet_type)
            .field("processing_time", &self.processing_time)
            .field("sequence", &self.sequence)
            .field("acked_sequence", &self.acked_sequence)
            .field("ack_mask", &format_args!("{:032b}", self.ack_mask))
            .finish()
    }
}

impl FixedEncodeLen for PacketType {
    const ENCODE_LEN: usize = u16::ENCODE_LEN;
}

impl Encode for PacketType {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for PacketType {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

impl FixedEncodeLen for PacketHeader {
    const ENCODE_LEN: usize = PacketType::ENCODE_LEN
        + u16::ENCODE_LEN
        + Seq::ENCODE_LEN
        + Seq::ENCODE_LEN
        + u32::ENCODE_LEN;
}

impl Encode for PacketHeader {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.packet_type)?;
        dst.write(&self.processing_time)?;
        dst.write(&self.sequence)?;
        dst.write(&self.acked_sequence)?;
        dst.write(&self.ack_mask)?;
        Ok(())
    }
}

impl Decode for PacketHeader {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            packet_type: src.read()?,
            processing_time: src.read()?,
            sequence: src.read()?,
            acked_sequence: src.read()?,
            ack_mask: src.read()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        octs::{BytesMut, test::*},
    };

    #[test]
    fn header_is_twelve_bytes() {
        assert_eq!(12, PacketHeader::ENCODE_LEN);
        assert_eq!(1388, MAX_PAYLOAD_LEN);
    }

    #[test]
    fn encode_decode() {
        hint_round_trip(&PacketHeader {
            packet_type: PacketType::ACK,
            processing_time: 10,
            sequence: Seq(3),
            acked_sequence: Seq(u16::MAX),
            ack_mask: 0b1011,
        });
    }

    #[test]
    fn field_order_on_wire() {
        let header = PacketHeader {
            packet_type: PacketType::PAYLOAD,
            processing_time: 0x0102,
            sequence: Seq(0x0304),
            acked_sequence: Seq(0x0506),
            ack_mask: 0x0708_090a,
        };
        let mut buf = BytesMut::new();
        buf.write(&header).unwrap();
        assert_eq!([0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10], buf[..]);
    }
}
