//! Contract which every pipeline stage implements.
//!
//! A stage is invoked by the driver once per packet in each direction, and may
//! additionally ask to be re-invoked:
//! - *resume* - call this stage again immediately, without any new input,
//!   because it already has more buffered work (see [`SendFlags::needs_resume`])
//! - *update* - call this stage again on the next update tick, even if no new
//!   data arrives (see [`SendFlags::needs_update`])
//! - *send update* - on receive, ask for this stage's send path to be run on
//!   the next update tick (see [`RecvFlags::needs_send_update`])

use {
    crate::{
        collection::ConfigError,
        region::{Capacity, ConnectionRegions, Region, RegionError},
    },
    core::convert::Infallible,
    derive_more::{Display, Error},
    octs::{BufTooShortOr, Bytes, BytesMut},
};

/// Outgoing data passed along a pipeline's send chain.
///
/// Data may be split across two segments, which are logically concatenated
/// (`first` then `second`). This lets a stage prepend a header without copying
/// the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundBuffer {
    /// Front segment.
    pub first: Bytes,
    /// Back segment, directly following [`OutboundBuffer::first`].
    pub second: Bytes,
}

impl OutboundBuffer {
    /// Creates a buffer with a single segment.
    #[must_use]
    pub fn new(payload: Bytes) -> Self {
        Self {
            first: payload,
            second: Bytes::new(),
        }
    }

    /// Gets the total number of bytes across both segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    /// Gets if both segments are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty()
    }

    /// Prepends `header` to this buffer.
    ///
    /// If the second segment is free, the header takes the first segment and
    /// the existing data moves into the second, so no payload bytes are copied.
    #[must_use]
    pub fn with_header(self, header: Bytes) -> Self {
        if header.is_empty() {
            self
        } else if self.second.is_empty() {
            Self {
                first: header,
                second: self.first,
            }
        } else {
            let mut first = BytesMut::with_capacity(header.len() + self.first.len());
            first.extend_from_slice(&header);
            first.extend_from_slice(&self.first);
            Self {
                first: first.freeze(),
                second: self.second,
            }
        }
    }

    /// Copies both segments into a single contiguous [`Bytes`].
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        if self.second.is_empty() {
            self.first.clone()
        } else {
            let mut buf = BytesMut::with_capacity(self.len());
            buf.extend_from_slice(&self.first);
            buf.extend_from_slice(&self.second);
            buf.freeze()
        }
    }
}

/// Control flags returned from a stage's send path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    /// Invoke this stage's send path again immediately, with no new input.
    pub needs_resume: bool,
    /// Invoke this stage's send path again on the next update.
    pub needs_update: bool,
}

/// Control flags returned from a stage's receive path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvFlags {
    /// Invoke this stage's receive path again immediately, with no new input.
    pub needs_resume: bool,
    /// Invoke this stage's receive path again on the next update.
    pub needs_update: bool,
    /// Invoke this stage's send path on the next update.
    pub needs_send_update: bool,
}

/// State passed into a stage's send path.
#[derive(Debug)]
pub struct SendContext<'a> {
    /// This stage's send-process region for the connection.
    pub process: &'a mut Region,
    /// This stage's shared region for the connection.
    pub shared: &'a mut Region,
    /// Scratch area for this stage's header.
    ///
    /// Whatever the stage writes here is prepended to the buffer it returns.
    pub header: &'a mut BytesMut,
    /// Current timestamp, in milliseconds.
    pub now: i64,
}

/// State passed into a stage's receive path.
#[derive(Debug)]
pub struct RecvContext<'a> {
    /// This stage's receive-process region for the connection.
    pub process: &'a mut Region,
    /// This stage's shared region for the connection.
    pub shared: &'a mut Region,
    /// Current timestamp, in milliseconds.
    pub now: i64,
}

impl<'a> SendContext<'a> {
    /// Creates a send context over the send and shared regions of `regions`.
    pub fn new(regions: &'a mut ConnectionRegions, header: &'a mut BytesMut, now: i64) -> Self {
        Self {
            process: &mut regions.send,
            shared: &mut regions.shared,
            header,
            now,
        }
    }
}

impl<'a> RecvContext<'a> {
    /// Creates a receive context over the receive and shared regions of
    /// `regions`.
    pub fn new(regions: &'a mut ConnectionRegions, now: i64) -> Self {
        Self {
            process: &mut regions.recv,
            shared: &mut regions.shared,
            now,
        }
    }
}

/// Error which a stage may return from any of its operations.
///
/// Per-packet faults such as stale or duplicate packets are *not* errors;
/// they are absorbed by the stage and only recorded in its statistics.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum StageError {
    /// A region was too small or accessed out of bounds.
    #[display("region error")]
    Region(RegionError),
    /// Failed to write a header into the header scratch area.
    #[display("header buffer too short")]
    HeaderTooShort,
    /// Attempted to send while the whole window of unacknowledged packets is
    /// still outstanding.
    ///
    /// This is not data loss - try sending again later.
    #[display("outgoing queue is full")]
    OutgoingQueueIsFull,
    /// Attempted to send a payload which does not fit into a single packet.
    #[display("payload too large - {len} / {max} bytes")]
    PayloadTooLarge {
        /// Length of the payload.
        len: usize,
        /// Maximum length of a payload.
        max: usize,
    },
    /// A configuration value was out of range.
    #[display("invalid configuration")]
    Config(ConfigError),
    /// No stage exists with the given id.
    #[display("no stage with id {id}")]
    NotFound {
        /// Requested stage id.
        id: u8,
    },
}

impl From<RegionError> for StageError {
    fn from(value: RegionError) -> Self {
        Self::Region(value)
    }
}

impl From<ConfigError> for StageError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<BufTooShortOr<Infallible>> for StageError {
    fn from(_: BufTooShortOr<Infallible>) -> Self {
        Self::HeaderTooShort
    }
}

/// Single step of a pipeline.
///
/// A stage holds no per-connection state itself: everything lives inside the
/// [`ConnectionRegions`] which the driver allocates using
/// [`Stage::capacity`], and passes back in on every call.
pub trait Stage {
    /// Gets how many bytes this stage needs per connection.
    fn capacity(&self) -> Capacity;

    /// Lays out this stage's state inside freshly allocated regions.
    ///
    /// # Errors
    ///
    /// Errors if any region is smaller than [`Stage::capacity`] declares.
    fn initialize_connection(&self, regions: &mut ConnectionRegions) -> Result<(), StageError>;

    /// Processes outgoing data.
    ///
    /// `buf` is empty when this stage is being resumed or updated.
    ///
    /// # Errors
    ///
    /// Errors if the data cannot be sent right now, or the regions are
    /// malformed.
    fn send(
        &self,
        ctx: SendContext<'_>,
        buf: OutboundBuffer,
    ) -> Result<(OutboundBuffer, SendFlags), StageError>;

    /// Processes incoming data.
    ///
    /// `buf` is empty when this stage is being resumed or updated.
    ///
    /// # Errors
    ///
    /// Errors if the regions are malformed.
    fn recv(&self, ctx: RecvContext<'_>, buf: Bytes) -> Result<(Bytes, RecvFlags), StageError>;
}
