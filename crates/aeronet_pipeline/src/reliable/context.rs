//! Typed structures stored inside the reliable stage's regions.
//!
//! # Shared region
//!
//! ```text
//! [SharedContext][PacketTimers; window] (local)[PacketTimers; window] (remote)
//! ```
//!
//! # Send and receive regions
//!
//! ```text
//! [Context][PacketInformation; window][[u8; MTU]; window]
//! ```

use {
    super::{ReliableParams, packet::MTU, rtt::RttInfo},
    crate::{
        region::{Region, RegionError, time_from_raw, time_into_raw},
        seq::{Seq, seq_from_raw, seq_into_raw},
    },
    core::convert::Infallible,
    octs::{BufTooShortOr, Bytes, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// Error code describing the last fault the reliable stage ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorCode {
    /// Received a packet too old to fit into the receive window.
    StalePacket = -1,
    /// Received a packet which was already received.
    DuplicatedPacket = -2,
    /// Attempted to send while the send window was full.
    OutgoingQueueIsFull = -7,
    /// A region was smaller than the stage needs.
    InsufficientMemory = -8,
}

impl ErrorCode {
    fn into_raw(code: Option<Self>) -> i32 {
        code.map_or(0, |code| code as i32)
    }

    const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            -1 => Some(Self::StalePacket),
            -2 => Some(Self::DuplicatedPacket),
            -7 => Some(Self::OutgoingQueueIsFull),
            -8 => Some(Self::InsufficientMemory),
            _ => None,
        }
    }
}

/// Cumulative packet counts for one connection's reliable stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Statistics {
    /// Payload packets received, including rejected ones.
    pub packets_received: u32,
    /// Payload packets sent, not counting resends.
    pub packets_sent: u32,
    /// Packets which left the receive window without ever arriving.
    pub packets_dropped: u32,
    /// Packets received older than the latest received packet.
    pub packets_out_of_order: u32,
    /// Packets received more than once.
    pub packets_duplicated: u32,
    /// Packets received too old to fit into the receive window.
    pub packets_stale: u32,
    /// Packets resent because they were not acknowledged in time.
    pub packets_resent: u32,
}

/// Tracks the latest sequence and acknowledgement state in one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SequenceBufferContext {
    pub sequence: Option<Seq>,
    pub acked: Option<Seq>,
    pub ack_mask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SharedContext {
    pub window_size: u16,
    pub minimum_resend_time: u32,
    /// `sequence` is the next sequence we will send; `acked` and `ack_mask`
    /// are the latest acknowledgement state the peer reported.
    pub sent: SequenceBufferContext,
    /// `sequence` is the latest sequence we received; `acked` is the latest
    /// one we reported back to the peer.
    pub received: SequenceBufferContext,
    pub stats: Statistics,
    pub error_code: Option<ErrorCode>,
    pub rtt: RttInfo,
    pub timer_offset: u32,
    pub timer_stride: u32,
    pub remote_timer_offset: u32,
    pub remote_timer_stride: u32,
}

/// Per-direction ring-buffer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Context {
    pub capacity: u16,
    pub index_stride: u32,
    pub index_offset: u32,
    pub data_stride: u32,
    pub data_offset: u32,
    pub resume: Option<Seq>,
    pub delivered: Option<Seq>,
    pub last_sent_time: Option<i64>,
    pub previous_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PacketInformation {
    pub sequence: Option<Seq>,
    pub size: u32,
    pub send_time: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PacketTimers {
    pub sequence: Option<Seq>,
    pub processing_time: u16,
    pub sent_time: Option<i64>,
    pub receive_time: Option<i64>,
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn to_usize(n: u32) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

/// Bytes needed by each of the send and receive regions.
pub(crate) const fn process_capacity(window_size: u16) -> usize {
    let window = window_size as usize;
    Context::ENCODE_LEN + window * PacketInformation::ENCODE_LEN + window * MTU
}

/// Bytes needed by the shared region.
pub(crate) const fn shared_capacity(window_size: u16) -> usize {
    SharedContext::ENCODE_LEN + 2 * window_size as usize * PacketTimers::ENCODE_LEN
}

impl SharedContext {
    pub fn new(params: &ReliableParams) -> Self {
        let window = usize::from(params.window_size);
        Self {
            window_size: params.window_size,
            minimum_resend_time: params.minimum_resend_time,
            sent: SequenceBufferContext {
                sequence: Some(Seq(0)),
                acked: None,
                ack_mask: 0,
            },
            received: SequenceBufferContext::default(),
            stats: Statistics::default(),
            error_code: None,
            rtt: RttInfo::default(),
            timer_offset: to_u32(Self::ENCODE_LEN),
            timer_stride: to_u32(PacketTimers::ENCODE_LEN),
            remote_timer_offset: to_u32(Self::ENCODE_LEN + PacketTimers::ENCODE_LEN * window),
            remote_timer_stride: to_u32(PacketTimers::ENCODE_LEN),
        }
    }

    fn timer_index(&self, seq: Seq) -> usize {
        usize::from(seq.0) % usize::from(self.window_size.max(1))
    }

    fn local_timer_offset(&self, seq: Seq) -> usize {
        to_usize(self.timer_offset) + to_usize(self.timer_stride) * self.timer_index(seq)
    }

    fn remote_timer_offset(&self, seq: Seq) -> usize {
        to_usize(self.remote_timer_offset)
            + to_usize(self.remote_timer_stride) * self.timer_index(seq)
    }

    pub fn local_timer(&self, shared: &Region, seq: Seq) -> Result<PacketTimers, RegionError> {
        shared.read(self.local_timer_offset(seq))
    }

    pub fn set_local_timer(
        &self,
        shared: &mut Region,
        seq: Seq,
        timers: &PacketTimers,
    ) -> Result<(), RegionError> {
        shared.write(self.local_timer_offset(seq), timers)
    }

    pub fn remote_timer(&self, shared: &Region, seq: Seq) -> Result<PacketTimers, RegionError> {
        shared.read(self.remote_timer_offset(seq))
    }

    pub fn set_remote_timer(
        &self,
        shared: &mut Region,
        seq: Seq,
        timers: &PacketTimers,
    ) -> Result<(), RegionError> {
        shared.write(self.remote_timer_offset(seq), timers)
    }

    /// Writes this context and resets both timer rings.
    pub fn initialize(&self, shared: &mut Region) -> Result<(), RegionError> {
        shared.write(0, self)?;
        for index in 0..self.window_size {
            let empty = PacketTimers::default();
            self.set_local_timer(shared, Seq(index), &empty)?;
            self.set_remote_timer(shared, Seq(index), &empty)?;
        }
        Ok(())
    }

    pub fn resend_time(&self) -> i64 {
        self.rtt.resend_time(self.minimum_resend_time)
    }
}

impl Context {
    pub fn new(window_size: u16) -> Self {
        let index_offset = Self::ENCODE_LEN;
        let index_stride = PacketInformation::ENCODE_LEN;
        Self {
            capacity: window_size,
            index_stride: to_u32(index_stride),
            index_offset: to_u32(index_offset),
            data_stride: to_u32(MTU),
            data_offset: to_u32(index_offset + index_stride * usize::from(window_size)),
            resume: None,
            delivered: None,
            last_sent_time: None,
            previous_timestamp: None,
        }
    }

    /// Writes this context and marks every slot as empty.
    pub fn initialize(&self, process: &mut Region) -> Result<(), RegionError> {
        process.write(0, self)?;
        for index in 0..self.capacity {
            self.release(process, Seq(index))?;
        }
        Ok(())
    }

    fn index(&self, seq: Seq) -> usize {
        usize::from(seq.0) % usize::from(self.capacity.max(1))
    }

    fn info_offset(&self, seq: Seq) -> usize {
        to_usize(self.index_offset) + to_usize(self.index_stride) * self.index(seq)
    }

    fn slot_offset(&self, seq: Seq) -> usize {
        to_usize(self.data_offset) + to_usize(self.data_stride) * self.index(seq)
    }

    pub fn info(&self, process: &Region, seq: Seq) -> Result<PacketInformation, RegionError> {
        process.read(self.info_offset(seq))
    }

    pub fn set_info(
        &self,
        process: &mut Region,
        seq: Seq,
        info: &PacketInformation,
    ) -> Result<(), RegionError> {
        process.write(self.info_offset(seq), info)
    }

    /// Gets the stored packet information if the slot for `seq` currently
    /// holds exactly `seq`.
    pub fn occupied_info(
        &self,
        process: &Region,
        seq: Seq,
    ) -> Result<Option<PacketInformation>, RegionError> {
        let info = self.info(process, seq)?;
        Ok((info.sequence == Some(seq)).then_some(info))
    }

    /// Claims the slot for `seq`, returning `false` if it is already taken.
    pub fn try_acquire(&self, process: &mut Region, seq: Seq) -> Result<bool, RegionError> {
        let info = self.info(process, seq)?;
        if info.sequence.is_some() {
            return Ok(false);
        }
        self.set_info(
            process,
            seq,
            &PacketInformation {
                sequence: Some(seq),
                ..Default::default()
            },
        )?;
        Ok(true)
    }

    /// Marks the slot for `seq` as empty.
    pub fn release(&self, process: &mut Region, seq: Seq) -> Result<(), RegionError> {
        self.set_info(process, seq, &PacketInformation::default())
    }

    /// Stores `data` in the slot for `seq`.
    pub fn set_packet(
        &self,
        process: &mut Region,
        seq: Seq,
        data: &[u8],
        send_time: Option<i64>,
    ) -> Result<(), RegionError> {
        self.set_packet_segments(process, seq, &[data], send_time)
    }

    /// Stores the concatenation of `segments` in the slot for `seq`.
    ///
    /// Each segment is written directly after the previous one.
    pub fn set_packet_segments(
        &self,
        process: &mut Region,
        seq: Seq,
        segments: &[&[u8]],
        send_time: Option<i64>,
    ) -> Result<(), RegionError> {
        let size: usize = segments.iter().map(|segment| segment.len()).sum();
        let dst = process.slice_mut(self.slot_offset(seq), size)?;
        let mut pos = 0;
        for segment in segments {
            dst[pos..pos + segment.len()].copy_from_slice(segment);
            pos += segment.len();
        }

        self.set_info(
            process,
            seq,
            &PacketInformation {
                sequence: Some(seq),
                size: to_u32(size),
                send_time,
            },
        )
    }

    /// Copies out the bytes stored in the slot for `seq`.
    pub fn packet(&self, process: &Region, seq: Seq, size: u32) -> Result<Bytes, RegionError> {
        let data = process.slice(self.slot_offset(seq), to_usize(size))?;
        Ok(Bytes::copy_from_slice(data))
    }
}

impl FixedEncodeLen for SequenceBufferContext {
    const ENCODE_LEN: usize = i32::ENCODE_LEN * 2 + u32::ENCODE_LEN;
}

impl Encode for SequenceBufferContext {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&seq_into_raw(self.sequence))?;
        dst.write(&seq_into_raw(self.acked))?;
        dst.write(&self.ack_mask)?;
        Ok(())
    }
}

impl Decode for SequenceBufferContext {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            sequence: seq_from_raw(src.read()?),
            acked: seq_from_raw(src.read()?),
            ack_mask: src.read()?,
        })
    }
}

impl FixedEncodeLen for Statistics {
    const ENCODE_LEN: usize = u32::ENCODE_LEN * 7;
}

impl Encode for Statistics {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.packets_received)?;
        dst.write(&self.packets_sent)?;
        dst.write(&self.packets_dropped)?;
        dst.write(&self.packets_out_of_order)?;
        dst.write(&self.packets_duplicated)?;
        dst.write(&self.packets_stale)?;
        dst.write(&self.packets_resent)?;
        Ok(())
    }
}

impl Decode for Statistics {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            packets_received: src.read()?,
            packets_sent: src.read()?,
            packets_dropped: src.read()?,
            packets_out_of_order: src.read()?,
            packets_duplicated: src.read()?,
            packets_stale: src.read()?,
            packets_resent: src.read()?,
        })
    }
}

impl FixedEncodeLen for SharedContext {
    const ENCODE_LEN: usize = u16::ENCODE_LEN
        + u32::ENCODE_LEN
        + SequenceBufferContext::ENCODE_LEN * 2
        + Statistics::ENCODE_LEN
        + i32::ENCODE_LEN
        + RttInfo::ENCODE_LEN
        + u32::ENCODE_LEN * 4;
}

impl Encode for SharedContext {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.window_size)?;
        dst.write(&self.minimum_resend_time)?;
        dst.write(&self.sent)?;
        dst.write(&self.received)?;
        dst.write(&self.stats)?;
        dst.write(&ErrorCode::into_raw(self.error_code))?;
        dst.write(&self.rtt)?;
        dst.write(&self.timer_offset)?;
        dst.write(&self.timer_stride)?;
        dst.write(&self.remote_timer_offset)?;
        dst.write(&self.remote_timer_stride)?;
        Ok(())
    }
}

impl Decode for SharedContext {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            window_size: src.read()?,
            minimum_resend_time: src.read()?,
            sent: src.read()?,
            received: src.read()?,
            stats: src.read()?,
            error_code: ErrorCode::from_raw(src.read()?),
            rtt: src.read()?,
            timer_offset: src.read()?,
            timer_stride: src.read()?,
            remote_timer_offset: src.read()?,
            remote_timer_stride: src.read()?,
        })
    }
}

impl FixedEncodeLen for Context {
    const ENCODE_LEN: usize =
        u16::ENCODE_LEN + u32::ENCODE_LEN * 4 + i32::ENCODE_LEN * 2 + i64::ENCODE_LEN * 2;
}

impl Encode for Context {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.capacity)?;
        dst.write(&self.index_stride)?;
        dst.write(&self.index_offset)?;
        dst.write(&self.data_stride)?;
        dst.write(&self.data_offset)?;
        dst.write(&seq_into_raw(self.resume))?;
        dst.write(&seq_into_raw(self.delivered))?;
        dst.write(&time_into_raw(self.last_sent_time))?;
        dst.write(&time_into_raw(self.previous_timestamp))?;
        Ok(())
    }
}

impl Decode for Context {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            capacity: src.read()?,
            index_stride: src.read()?,
            index_offset: src.read()?,
            data_stride: src.read()?,
            data_offset: src.read()?,
            resume: seq_from_raw(src.read()?),
            delivered: seq_from_raw(src.read()?),
            last_sent_time: time_from_raw(src.read()?),
            previous_timestamp: time_from_raw(src.read()?),
        })
    }
}

impl FixedEncodeLen for PacketInformation {
    const ENCODE_LEN: usize = i32::ENCODE_LEN + u32::ENCODE_LEN + i64::ENCODE_LEN;
}

impl Encode for PacketInformation {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&seq_into_raw(self.sequence))?;
        dst.write(&self.size)?;
        dst.write(&time_into_raw(self.send_time))?;
        Ok(())
    }
}

impl Decode for PacketInformation {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            sequence: seq_from_raw(src.read()?),
            size: src.read()?,
            send_time: time_from_raw(src.read()?),
        })
    }
}

impl FixedEncodeLen for PacketTimers {
    const ENCODE_LEN: usize = i32::ENCODE_LEN + u16::ENCODE_LEN + i64::ENCODE_LEN * 2;
}

impl Encode for PacketTimers {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&seq_into_raw(self.sequence))?;
        dst.write(&self.processing_time)?;
        dst.write(&time_into_raw(self.sent_time))?;
        dst.write(&time_into_raw(self.receive_time))?;
        Ok(())
    }
}

impl Decode for PacketTimers {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            sequence: seq_from_raw(src.read()?),
            processing_time: src.read()?,
            sent_time: time_from_raw(src.read()?),
            receive_time: time_from_raw(src.read()?),
        })
    }
}
