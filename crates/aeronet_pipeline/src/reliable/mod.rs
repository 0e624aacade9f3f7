//! Reliable-sequenced stage: every payload is delivered exactly once, in the
//! order it was sent.
//!
//! # Protocol
//!
//! Each packet carries a [`PacketHeader`] with its own sequence number, plus
//! the latest sequence number the sender has received from its peer and a
//! bitmask of the window of sequences before it. This way every packet sent
//! in either direction also acknowledges packets travelling the other way.
//!
//! On the send side, every packet is kept in a ring of `window_size` slots
//! until the peer acknowledges it. A packet which is not acknowledged within
//! the resend time (derived from the [`RttInfo`] estimate) is resent. If the
//! ring is full, sending fails with [`StageError::OutgoingQueueIsFull`] until
//! older packets are acknowledged.
//!
//! On the receive side, packets which arrive ahead of the next expected
//! sequence are buffered in a ring of their own, and handed out (through
//! [`RecvFlags::needs_resume`]) once the gap before them is filled.
//!
//! If nothing was sent for a whole tick but there is a received packet which
//! we have not acknowledged yet, the send path emits an ack-only packet.

mod context;
mod packet;
mod recv;
mod rtt;
mod send;

pub use {
    context::{ErrorCode, Statistics},
    packet::{MAX_PAYLOAD_LEN, MTU, PacketHeader, PacketType},
    rtt::{DEFAULT_MINIMUM_RESEND_TIME, MAXIMUM_RESEND_TIME, RttInfo},
};
use {
    crate::{
        collection::ConfigError,
        region::{Capacity, ConnectionRegions, Region, RegionError},
        stage::{OutboundBuffer, RecvContext, RecvFlags, SendContext, SendFlags, Stage, StageError},
    },
    context::{Context, SharedContext, process_capacity, shared_capacity},
    log::debug,
    octs::{Bytes, FixedEncodeLen},
};

/// Largest supported [`ReliableParams::window_size`].
///
/// Acknowledgements for a whole window must fit into the 32-bit ack mask.
pub const MAX_WINDOW_SIZE: u16 = 32;

/// Configuration for a [`ReliableSequenced`] stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReliableParams {
    /// Maximum number of packets in flight in each direction.
    ///
    /// Must be in `1..=`[`MAX_WINDOW_SIZE`].
    pub window_size: u16,
    /// Lower bound on how long, in milliseconds, to wait for an
    /// acknowledgement before resending a packet.
    ///
    /// Must be no larger than [`MAXIMUM_RESEND_TIME`].
    pub minimum_resend_time: u32,
}

impl Default for ReliableParams {
    fn default() -> Self {
        Self {
            window_size: MAX_WINDOW_SIZE,
            minimum_resend_time: DEFAULT_MINIMUM_RESEND_TIME,
        }
    }
}

impl ReliableParams {
    /// Checks that these parameters are usable.
    ///
    /// # Errors
    ///
    /// Errors if any parameter is out of range.
    ///
    /// # Example
    ///
    /// ```
    /// # use aeronet_pipeline::reliable::ReliableParams;
    /// ReliableParams::default().validate().unwrap();
    ///
    /// let params = ReliableParams {
    ///     window_size: 64,
    ///     ..Default::default()
    /// };
    /// params.validate().unwrap_err();
    /// ```
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 || self.window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::InvalidWindowSize {
                window_size: self.window_size,
                max: MAX_WINDOW_SIZE,
            });
        }
        validate_minimum_resend_time(self.minimum_resend_time)
    }
}

const fn validate_minimum_resend_time(value: u32) -> Result<(), ConfigError> {
    if value > MAXIMUM_RESEND_TIME {
        Err(ConfigError::MinimumResendTimeTooLarge {
            value,
            max: MAXIMUM_RESEND_TIME,
        })
    } else {
        Ok(())
    }
}

/// Stage guaranteeing reliable, in-order delivery.
///
/// See the [module-level documentation](self).
#[derive(Debug, Clone, Default)]
pub struct ReliableSequenced {
    params: ReliableParams,
}

impl ReliableSequenced {
    /// Creates a stage with the given parameters.
    ///
    /// # Errors
    ///
    /// Errors if `params` is not valid.
    pub fn new(params: ReliableParams) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self { params })
    }

    /// Gets the parameters this stage was created with.
    #[must_use]
    pub const fn params(&self) -> &ReliableParams {
        &self.params
    }
}

impl Stage for ReliableSequenced {
    fn capacity(&self) -> Capacity {
        let window = self.params.window_size;
        Capacity {
            header: PacketHeader::ENCODE_LEN,
            send: process_capacity(window),
            recv: process_capacity(window),
            shared: shared_capacity(window),
        }
    }

    fn initialize_connection(&self, regions: &mut ConnectionRegions) -> Result<(), StageError> {
        let capacity = self.capacity();
        regions.shared.ensure_len(capacity.shared)?;
        let mut shared = SharedContext::new(&self.params);
        shared.initialize(&mut regions.shared)?;

        if let Err(err) = regions.ensure_capacity(capacity) {
            debug!("Reliable stage regions too small: {err}");
            shared.error_code = Some(ErrorCode::InsufficientMemory);
            regions.shared.write(0, &shared)?;
            return Err(err.into());
        }

        let ctx = Context::new(self.params.window_size);
        ctx.initialize(&mut regions.send)?;
        ctx.initialize(&mut regions.recv)?;
        Ok(())
    }

    fn send(
        &self,
        ctx: SendContext<'_>,
        buf: OutboundBuffer,
    ) -> Result<(OutboundBuffer, SendFlags), StageError> {
        let mut state = ReliableState::load(ctx.process, ctx.shared, ctx.now)?;
        let result = state.send(ctx.header, buf);
        state.store()?;
        result
    }

    fn recv(&self, ctx: RecvContext<'_>, buf: Bytes) -> Result<(Bytes, RecvFlags), StageError> {
        let mut state = ReliableState::load(ctx.process, ctx.shared, ctx.now)?;
        let result = state.recv(buf);
        state.store()?;
        result
    }
}

/// Gets the packet statistics stored in a reliable stage's shared region.
///
/// # Errors
///
/// Errors if `shared` is not an initialized reliable shared region.
pub fn statistics(shared: &Region) -> Result<Statistics, RegionError> {
    Ok(shared.read::<SharedContext>(0)?.stats)
}

/// Gets the RTT estimate stored in a reliable stage's shared region.
///
/// # Errors
///
/// Errors if `shared` is not an initialized reliable shared region.
pub fn rtt_info(shared: &Region) -> Result<RttInfo, RegionError> {
    Ok(shared.read::<SharedContext>(0)?.rtt)
}

/// Gets the error code recorded by the last operation on a reliable stage.
///
/// # Errors
///
/// Errors if `shared` is not an initialized reliable shared region.
pub fn last_error(shared: &Region) -> Result<Option<ErrorCode>, RegionError> {
    Ok(shared.read::<SharedContext>(0)?.error_code)
}

/// Changes the minimum resend time of an already set up connection.
///
/// # Errors
///
/// Errors if `value` is larger than [`MAXIMUM_RESEND_TIME`], or `shared` is
/// not an initialized reliable shared region.
pub fn set_minimum_resend_time(shared: &mut Region, value: u32) -> Result<(), StageError> {
    validate_minimum_resend_time(value)?;
    let mut ctx = shared.read::<SharedContext>(0)?;
    ctx.minimum_resend_time = value;
    shared.write(0, &ctx)?;
    Ok(())
}

/// Typed view over one connection's reliable regions for a single call.
///
/// The contexts are copied out of the regions on [`ReliableState::load`], and
/// must be written back with [`ReliableState::store`] even if the call fails.
struct ReliableState<'a> {
    shared: SharedContext,
    ctx: Context,
    process: &'a mut Region,
    shared_region: &'a mut Region,
    now: i64,
}

impl<'a> ReliableState<'a> {
    fn load(
        process: &'a mut Region,
        shared_region: &'a mut Region,
        now: i64,
    ) -> Result<Self, RegionError> {
        Ok(Self {
            shared: shared_region.read(0)?,
            ctx: process.read(0)?,
            process,
            shared_region,
            now,
        })
    }

    fn store(&mut self) -> Result<(), RegionError> {
        self.shared_region.write(0, &self.shared)?;
        self.process.write(0, &self.ctx)?;
        Ok(())
    }
}
