//! Dispatch from stage ids to the stages themselves.
//!
//! A pipeline only refers to its stages by [`StageId`], and the driver goes
//! through a [`StageCollection`] to run them. The set of stage kinds is closed
//! (see [`StageKind`]), so dispatch is a plain `match`.

use {
    crate::{
        null::NullStage,
        region::{Capacity, ConnectionRegions},
        reliable::{ReliableParams, ReliableSequenced},
        simulator::{SimulatorOnReceive, SimulatorOnSend, SimulatorParams},
        stage::{OutboundBuffer, RecvContext, RecvFlags, SendContext, SendFlags, Stage, StageError},
        unreliable::UnreliableSequenced,
    },
    derive_more::{Display, Error},
    octs::Bytes,
};

/// Every kind of stage which a pipeline can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StageKind {
    /// [`SimulatorOnReceive`].
    SimulatorOnReceive = 0,
    /// [`SimulatorOnSend`].
    SimulatorOnSend = 1,
    /// [`NullStage`].
    Null = 2,
    /// [`UnreliableSequenced`].
    UnreliableSequenced = 3,
    /// [`ReliableSequenced`].
    ReliableSequenced = 4,
}

/// Numeric identifier of a stage inside a [`StageCollection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StageId(pub u8);

impl StageKind {
    /// All stage kinds, ordered by id.
    pub const ALL: [Self; 5] = [
        Self::SimulatorOnReceive,
        Self::SimulatorOnSend,
        Self::Null,
        Self::UnreliableSequenced,
        Self::ReliableSequenced,
    ];

    /// Gets the id of this stage kind.
    #[must_use]
    pub const fn id(self) -> StageId {
        StageId(self as u8)
    }

    /// Gets the stage kind with the given id.
    ///
    /// ```
    /// # use aeronet_pipeline::collection::{StageId, StageKind};
    /// assert_eq!(Some(StageKind::Null), StageKind::from_id(StageId(2)));
    /// assert_eq!(None, StageKind::from_id(StageId(5)));
    /// ```
    #[must_use]
    pub const fn from_id(id: StageId) -> Option<Self> {
        match id.0 {
            0 => Some(Self::SimulatorOnReceive),
            1 => Some(Self::SimulatorOnSend),
            2 => Some(Self::Null),
            3 => Some(Self::UnreliableSequenced),
            4 => Some(Self::ReliableSequenced),
            _ => None,
        }
    }
}

/// Configuration for one family of stages in a [`DefaultStageCollection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StageParams {
    /// Configures [`ReliableSequenced`].
    Reliable(ReliableParams),
    /// Configures both [`SimulatorOnReceive`] and [`SimulatorOnSend`].
    Simulator(SimulatorParams),
}

/// A stage configuration value was out of range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum ConfigError {
    /// Reliable window size was 0 or larger than the maximum.
    #[display("invalid window size {window_size} - must be between 1 and {max}")]
    InvalidWindowSize {
        /// Requested window size.
        window_size: u16,
        /// Largest allowed window size.
        max: u16,
    },
    /// Reliable minimum resend time was larger than the maximum resend time.
    #[display("minimum resend time of {value} ms is larger than maximum of {max} ms")]
    MinimumResendTimeTooLarge {
        /// Requested minimum resend time.
        value: u32,
        /// Maximum resend time.
        max: u32,
    },
    /// Simulator drop percentage was above 100.
    #[display("drop percentage {percentage} is above 100")]
    InvalidDropPercentage {
        /// Requested drop percentage.
        percentage: u32,
    },
    /// Simulator delay slots would need too much memory per connection.
    #[display("simulator needs {needed} bytes per connection - maximum is {max}")]
    SimulatorTooLarge {
        /// Bytes the delay slots would need.
        needed: u64,
        /// Largest allowed size.
        max: u64,
    },
}

/// Set of stages which pipelines can be built from.
pub trait StageCollection {
    /// Gets the id of the stage of the given kind, if this collection has one.
    fn stage_id(&self, kind: StageKind) -> Option<StageId>;

    /// Gets how many bytes the stage `id` needs per connection.
    ///
    /// # Errors
    ///
    /// Errors if there is no stage with this id.
    fn capacity(&self, id: StageId) -> Result<Capacity, StageError>;

    /// Runs [`Stage::initialize_connection`] on the stage `id`.
    ///
    /// # Errors
    ///
    /// Errors if there is no stage with this id, or the stage fails.
    fn initialize_connection(
        &self,
        id: StageId,
        regions: &mut ConnectionRegions,
    ) -> Result<(), StageError>;

    /// Runs [`Stage::send`] on the stage `id`.
    ///
    /// # Errors
    ///
    /// Errors if there is no stage with this id, or the stage fails.
    fn send(
        &self,
        id: StageId,
        ctx: SendContext<'_>,
        buf: OutboundBuffer,
    ) -> Result<(OutboundBuffer, SendFlags), StageError>;

    /// Runs [`Stage::recv`] on the stage `id`.
    ///
    /// # Errors
    ///
    /// Errors if there is no stage with this id, or the stage fails.
    fn recv(
        &self,
        id: StageId,
        ctx: RecvContext<'_>,
        buf: Bytes,
    ) -> Result<(Bytes, RecvFlags), StageError>;
}

/// Collection holding one of each built-in stage.
#[derive(Debug, Clone, Default)]
pub struct DefaultStageCollection {
    simulator_on_receive: SimulatorOnReceive,
    simulator_on_send: SimulatorOnSend,
    null: NullStage,
    unreliable: UnreliableSequenced,
    reliable: ReliableSequenced,
}

impl DefaultStageCollection {
    /// Creates a collection, configuring its stages with `params`.
    ///
    /// Stages not configured by any of `params` use their default
    /// configuration. If the same family is configured more than once, the
    /// last value wins.
    ///
    /// # Errors
    ///
    /// Errors if any of `params` is not valid.
    ///
    /// # Example
    ///
    /// ```
    /// # use aeronet_pipeline::{
    /// #     collection::{DefaultStageCollection, StageParams},
    /// #     reliable::ReliableParams,
    /// # };
    /// let stages = DefaultStageCollection::new([StageParams::Reliable(ReliableParams {
    ///     window_size: 8,
    ///     ..Default::default()
    /// })])
    /// .unwrap();
    /// assert_eq!(8, stages.reliable().params().window_size);
    /// ```
    pub fn new(params: impl IntoIterator<Item = StageParams>) -> Result<Self, ConfigError> {
        let mut stages = Self::default();
        for params in params {
            match params {
                StageParams::Reliable(params) => {
                    stages.reliable = ReliableSequenced::new(params)?;
                }
                StageParams::Simulator(params) => {
                    stages.simulator_on_receive = SimulatorOnReceive::new(params)?;
                    stages.simulator_on_send = SimulatorOnSend::new(params)?;
                }
            }
        }
        Ok(stages)
    }

    /// Gets the [`SimulatorOnReceive`] stage.
    #[must_use]
    pub const fn simulator_on_receive(&self) -> &SimulatorOnReceive {
        &self.simulator_on_receive
    }

    /// Gets the [`SimulatorOnSend`] stage.
    #[must_use]
    pub const fn simulator_on_send(&self) -> &SimulatorOnSend {
        &self.simulator_on_send
    }

    /// Gets the [`ReliableSequenced`] stage.
    #[must_use]
    pub const fn reliable(&self) -> &ReliableSequenced {
        &self.reliable
    }
}

macro_rules! dispatch {
    ($self:ident, $id:ident, $stage:ident => $body:expr) => {
        match StageKind::from_id($id).ok_or(StageError::NotFound { id: $id.0 })? {
            StageKind::SimulatorOnReceive => {
                let $stage = &$self.simulator_on_receive;
                $body
            }
            StageKind::SimulatorOnSend => {
                let $stage = &$self.simulator_on_send;
                $body
            }
            StageKind::Null => {
                let $stage = &$self.null;
                $body
            }
            StageKind::UnreliableSequenced => {
                let $stage = &$self.unreliable;
                $body
            }
            StageKind::ReliableSequenced => {
                let $stage = &$self.reliable;
                $body
            }
        }
    };
}

impl StageCollection for DefaultStageCollection {
    fn stage_id(&self, kind: StageKind) -> Option<StageId> {
        Some(kind.id())
    }

    fn capacity(&self, id: StageId) -> Result<Capacity, StageError> {
        Ok(dispatch!(self, id, stage => stage.capacity()))
    }

    fn initialize_connection(
        &self,
        id: StageId,
        regions: &mut ConnectionRegions,
    ) -> Result<(), StageError> {
        dispatch!(self, id, stage => stage.initialize_connection(regions))
    }

    fn send(
        &self,
        id: StageId,
        ctx: SendContext<'_>,
        buf: OutboundBuffer,
    ) -> Result<(OutboundBuffer, SendFlags), StageError> {
        dispatch!(self, id, stage => stage.send(ctx, buf))
    }

    fn recv(
        &self,
        id: StageId,
        ctx: RecvContext<'_>,
        buf: Bytes,
    ) -> Result<(Bytes, RecvFlags), StageError> {
        dispatch!(self, id, stage => stage.recv(ctx, buf))
    }
}

/// Collection with no stages, which accepts any id and passes all data
/// through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStageCollection;

impl StageCollection for NullStageCollection {
    fn stage_id(&self, _: StageKind) -> Option<StageId> {
        None
    }

    fn capacity(&self, _: StageId) -> Result<Capacity, StageError> {
        Ok(Capacity::default())
    }

    fn initialize_connection(
        &self,
        _: StageId,
        _: &mut ConnectionRegions,
    ) -> Result<(), StageError> {
        Ok(())
    }

    fn send(
        &self,
        _: StageId,
        _: SendContext<'_>,
        buf: OutboundBuffer,
    ) -> Result<(OutboundBuffer, SendFlags), StageError> {
        Ok((buf, SendFlags::default()))
    }

    fn recv(
        &self,
        _: StageId,
        _: RecvContext<'_>,
        buf: Bytes,
    ) -> Result<(Bytes, RecvFlags), StageError> {
        Ok((buf, RecvFlags::default()))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::region::RegionError,
        assert_matches::assert_matches,
        octs::BytesMut,
    };

    #[test]
    fn ids_are_stable() {
        let stages = DefaultStageCollection::default();
        for (index, kind) in StageKind::ALL.into_iter().enumerate() {
            let id = stages.stage_id(kind).unwrap();
            assert_eq!(usize::from(id.0), index);
            assert_eq!(Some(kind), StageKind::from_id(id));
        }
        assert_eq!(
            Some(StageId(4)),
            stages.stage_id(StageKind::ReliableSequenced)
        );
    }

    #[test]
    fn unknown_id() {
        let stages = DefaultStageCollection::default();
        assert_matches!(
            stages.capacity(StageId(5)),
            Err(StageError::NotFound { id: 5 })
        );
        let mut regions = ConnectionRegions::new(Capacity::default());
        assert_matches!(
            stages.initialize_connection(StageId(200), &mut regions),
            Err(StageError::NotFound { id: 200 })
        );
    }

    #[test]
    fn capacity_is_idempotent() {
        let stages = DefaultStageCollection::default();
        for kind in StageKind::ALL {
            let id = kind.id();
            assert_eq!(stages.capacity(id).unwrap(), stages.capacity(id).unwrap());
        }
        assert_eq!(
            Capacity::default(),
            stages.capacity(StageKind::Null.id()).unwrap()
        );
    }

    #[test]
    fn params_routed_to_stages() {
        let small = DefaultStageCollection::new([
            StageParams::Reliable(ReliableParams {
                window_size: 4,
                ..Default::default()
            }),
            StageParams::Simulator(SimulatorParams {
                max_packet_count: 2,
                ..Default::default()
            }),
        ])
        .unwrap();
        let large = DefaultStageCollection::default();

        let id = StageKind::ReliableSequenced.id();
        assert!(small.capacity(id).unwrap().send < large.capacity(id).unwrap().send);
        assert_eq!(2, small.simulator_on_receive().params().max_packet_count);
        assert_eq!(2, small.simulator_on_send().params().max_packet_count);
    }

    #[test]
    fn invalid_params_rejected() {
        assert_matches!(
            DefaultStageCollection::new([StageParams::Reliable(ReliableParams {
                window_size: 33,
                ..Default::default()
            })]),
            Err(ConfigError::InvalidWindowSize {
                window_size: 33,
                max: 32
            })
        );
    }

    #[test]
    fn exact_capacity_initializes_every_stage() {
        let stages = DefaultStageCollection::default();
        for kind in StageKind::ALL {
            let id = kind.id();
            let capacity = stages.capacity(id).unwrap();
            let mut regions = ConnectionRegions::new(capacity);
            stages.initialize_connection(id, &mut regions).unwrap();
        }
    }

    #[test]
    fn undersized_init_fails() {
        let stages = DefaultStageCollection::default();
        for kind in [
            StageKind::SimulatorOnReceive,
            StageKind::SimulatorOnSend,
            StageKind::UnreliableSequenced,
            StageKind::ReliableSequenced,
        ] {
            let mut regions = ConnectionRegions::new(Capacity::default());
            assert_matches!(
                stages.initialize_connection(kind.id(), &mut regions),
                Err(StageError::Region(RegionError::InsufficientMemory { .. }))
            );
        }
    }

    #[test]
    fn null_collection() {
        let stages = NullStageCollection;
        for kind in StageKind::ALL {
            assert_eq!(None, stages.stage_id(kind));
        }
        assert_eq!(Capacity::default(), stages.capacity(StageId(9)).unwrap());

        let mut regions = ConnectionRegions::new(Capacity::default());
        stages
            .initialize_connection(StageId(9), &mut regions)
            .unwrap();
        let mut header = BytesMut::new();
        let (buf, _) = stages
            .send(
                StageId(9),
                SendContext::new(&mut regions, &mut header, 0),
                OutboundBuffer::new(Bytes::from_static(b"data")),
            )
            .unwrap();
        assert_eq!(b"data"[..], buf.to_bytes()[..]);
        let (buf, _) = stages
            .recv(
                StageId(9),
                RecvContext::new(&mut regions, 0),
                Bytes::from_static(b"data"),
            )
            .unwrap();
        assert_eq!(b"data"[..], buf[..]);
    }
}
