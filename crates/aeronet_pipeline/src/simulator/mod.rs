//! Stages which simulate bad network conditions, for testing.
//!
//! [`SimulatorOnReceive`] acts on incoming packets and [`SimulatorOnSend`] on
//! outgoing ones. Both pass traffic in the other direction through untouched,
//! and both are configured by the same [`SimulatorParams`].
//!
//! For every packet in the simulated direction, the simulator may:
//! - drop it, either every [`SimulatorParams::packet_drop_interval`]th packet
//!   or with a [`SimulatorParams::packet_drop_percentage`] chance
//! - hold it back for [`SimulatorParams::packet_delay_ms`] before letting it
//!   through
//!
//! Random drops are driven by a generator seeded from
//! [`SimulatorParams::random_seed`], so a run with the same seed and traffic
//! always drops the same packets.
//!
//! Packets larger than [`SimulatorParams::max_packet_size`] bypass the
//! simulation entirely.

mod context;

use {
    crate::{
        collection::ConfigError,
        region::{Capacity, ConnectionRegions, Region, RegionError},
        stage::{OutboundBuffer, RecvContext, RecvFlags, SendContext, SendFlags, Stage, StageError},
    },
    context::{DelayedPacket, SimulatorContext, to_usize},
    log::{debug, warn},
    octs::{Bytes, FixedEncodeLen},
    rand::{Rng, RngCore, SeedableRng, rngs::StdRng},
};

/// Largest number of bytes a simulator may use for delay slots per
/// connection.
pub const MAX_DELAY_MEMORY: u64 = 64 * 1024 * 1024;

/// Configuration for the network simulator stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SimulatorParams {
    /// Maximum number of packets held back at once.
    ///
    /// A delayed packet arriving while all slots are taken is dropped.
    ///
    /// Together with [`SimulatorParams::max_packet_size`], this must fit into
    /// [`MAX_DELAY_MEMORY`].
    pub max_packet_count: u32,
    /// Maximum size of a packet which the simulator acts on, in bytes.
    pub max_packet_size: u32,
    /// How long to hold back each packet, in milliseconds.
    pub packet_delay_ms: u32,
    /// If non-zero, every `n`th packet is dropped.
    ///
    /// Packets are counted from 1, so with `n = 5` the 5th, 10th, 15th and
    /// following multiples are dropped, and the first `n - 1` always pass.
    pub packet_drop_interval: u32,
    /// Chance out of 100 that a packet is dropped.
    pub packet_drop_percentage: u32,
    /// Seed for the random generator behind
    /// [`SimulatorParams::packet_drop_percentage`].
    pub random_seed: u64,
}

impl Default for SimulatorParams {
    fn default() -> Self {
        Self {
            max_packet_count: 32,
            max_packet_size: 1500,
            packet_delay_ms: 0,
            packet_drop_interval: 0,
            packet_drop_percentage: 0,
            random_seed: 0,
        }
    }
}

impl SimulatorParams {
    /// Checks that these parameters are usable.
    ///
    /// # Errors
    ///
    /// Errors if [`SimulatorParams::packet_drop_percentage`] is above 100, or
    /// the delay slots need more than [`MAX_DELAY_MEMORY`] bytes.
    ///
    /// # Example
    ///
    /// ```
    /// # use aeronet_pipeline::simulator::SimulatorParams;
    /// SimulatorParams::default().validate().unwrap();
    ///
    /// let params = SimulatorParams {
    ///     max_packet_count: u32::MAX,
    ///     ..Default::default()
    /// };
    /// params.validate().unwrap_err();
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_drop_percentage > 100 {
            return Err(ConfigError::InvalidDropPercentage {
                percentage: self.packet_drop_percentage,
            });
        }
        let needed = self.delay_memory();
        if needed > MAX_DELAY_MEMORY {
            return Err(ConfigError::SimulatorTooLarge {
                needed,
                max: MAX_DELAY_MEMORY,
            });
        }
        Ok(())
    }

    fn delay_memory(&self) -> u64 {
        let slot_len = u64::from(self.max_packet_size)
            .saturating_add(u64::try_from(DelayedPacket::ENCODE_LEN).unwrap_or(u64::MAX));
        u64::from(self.max_packet_count).saturating_mul(slot_len)
    }

    fn process_capacity(&self) -> usize {
        usize::try_from(self.delay_memory()).unwrap_or(usize::MAX)
    }
}

/// Snapshot of a simulator's counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SimulatorStats {
    /// Packets which went through the simulation.
    pub packet_count: u32,
    /// Packets dropped by the drop policy or for lack of a free slot.
    pub drop_count: u32,
    /// Held-back packets which were due, but not yet released, after the last
    /// call.
    pub ready: u32,
    /// Held-back packets which were not due yet after the last call.
    pub waiting: u32,
    /// When the next waiting packet is due.
    pub next_packet_time: Option<i64>,
    /// Timestamp of the last call.
    pub stats_time: i64,
}

/// Gets the counters stored in a simulator's shared region.
///
/// # Errors
///
/// Errors if `shared` is not an initialized simulator shared region.
pub fn statistics(shared: &Region) -> Result<SimulatorStats, RegionError> {
    let ctx = shared.read::<SimulatorContext>(0)?;
    Ok(SimulatorStats {
        packet_count: ctx.packet_count,
        drop_count: ctx.drop_count,
        ready: ctx.ready,
        waiting: ctx.waiting,
        next_packet_time: ctx.next_packet_time,
        stats_time: ctx.stats_time,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SimulateFlags {
    needs_resume: bool,
    needs_update: bool,
}

fn initialize(
    params: &SimulatorParams,
    shared: &mut Region,
    process: &mut Region,
) -> Result<(), StageError> {
    let ctx = SimulatorContext::new(params);
    shared.write(0, &ctx)?;
    ctx.initialize_slots(process)?;
    Ok(())
}

fn simulate(
    shared: &mut Region,
    process: &mut Region,
    now: i64,
    buf: Bytes,
) -> Result<(Bytes, SimulateFlags), StageError> {
    let mut ctx = shared.read::<SimulatorContext>(0)?;
    if buf.len() > to_usize(ctx.max_packet_size) {
        return Ok((buf, SimulateFlags::default()));
    }

    let result = simulate_with(&mut ctx, process, now, buf);
    shared.write(0, &ctx)?;
    result
}

fn simulate_with(
    ctx: &mut SimulatorContext,
    process: &mut Region,
    now: i64,
    buf: Bytes,
) -> Result<(Bytes, SimulateFlags), StageError> {
    let mut flags = SimulateFlags::default();

    if !buf.is_empty() {
        ctx.packet_count = ctx.packet_count.wrapping_add(1);
        if should_drop(ctx) {
            debug!("Simulator dropped packet {}", ctx.packet_count);
            ctx.drop_count = ctx.drop_count.saturating_add(1);
        } else if ctx.packet_delay_ms == 0 {
            return Ok((buf, flags));
        } else if !ctx.delay(process, &buf, now + i64::from(ctx.packet_delay_ms))? {
            warn!(
                "Simulator has no free slot for delaying packet ({} in use)",
                ctx.max_packet_count
            );
            ctx.drop_count = ctx.drop_count.saturating_add(1);
            flags.needs_update = true;
            return Ok((Bytes::new(), flags));
        }
    }

    let released = ctx.release(process, now)?;
    if ctx.ready > 0 {
        flags.needs_resume = true;
    } else if ctx.waiting > 0 {
        flags.needs_update = true;
    }
    Ok((released.unwrap_or_default(), flags))
}

fn should_drop(ctx: &mut SimulatorContext) -> bool {
    if ctx.packet_drop_interval > 0 && ctx.packet_count % ctx.packet_drop_interval == 0 {
        return true;
    }
    if ctx.packet_drop_percentage > 0 {
        let mut rng = StdRng::seed_from_u64(ctx.random_state);
        let roll = rng.gen_range(0.0..100.0);
        ctx.random_state = rng.next_u64();
        return roll < f64::from(ctx.packet_drop_percentage);
    }
    false
}

macro_rules! simulator_stage {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default)]
        pub struct $name {
            params: SimulatorParams,
        }

        impl $name {
            /// Creates a stage with the given parameters.
            ///
            /// # Errors
            ///
            /// Errors if `params` is not valid.
            pub fn new(params: SimulatorParams) -> Result<Self, ConfigError> {
                params.validate()?;
                Ok(Self { params })
            }

            /// Gets the parameters this stage was created with.
            #[must_use]
            pub const fn params(&self) -> &SimulatorParams {
                &self.params
            }
        }
    };
}

simulator_stage! {
    /// Simulator acting on incoming packets.
    SimulatorOnReceive
}

simulator_stage! {
    /// Simulator acting on outgoing packets.
    SimulatorOnSend
}

impl Stage for SimulatorOnReceive {
    fn capacity(&self) -> Capacity {
        Capacity {
            header: 0,
            send: 0,
            recv: self.params.process_capacity(),
            shared: SimulatorContext::ENCODE_LEN,
        }
    }

    fn initialize_connection(&self, regions: &mut ConnectionRegions) -> Result<(), StageError> {
        regions.ensure_capacity(self.capacity())?;
        initialize(&self.params, &mut regions.shared, &mut regions.recv)
    }

    fn send(
        &self,
        _: SendContext<'_>,
        buf: OutboundBuffer,
    ) -> Result<(OutboundBuffer, SendFlags), StageError> {
        Ok((buf, SendFlags::default()))
    }

    fn recv(&self, ctx: RecvContext<'_>, buf: Bytes) -> Result<(Bytes, RecvFlags), StageError> {
        let (buf, flags) = simulate(ctx.shared, ctx.process, ctx.now, buf)?;
        Ok((
            buf,
            RecvFlags {
                needs_resume: flags.needs_resume,
                needs_update: flags.needs_update,
                needs_send_update: false,
            },
        ))
    }
}

impl Stage for SimulatorOnSend {
    fn capacity(&self) -> Capacity {
        Capacity {
            header: 0,
            send: self.params.process_capacity(),
            recv: 0,
            shared: SimulatorContext::ENCODE_LEN,
        }
    }

    fn initialize_connection(&self, regions: &mut ConnectionRegions) -> Result<(), StageError> {
        regions.ensure_capacity(self.capacity())?;
        initialize(&self.params, &mut regions.shared, &mut regions.send)
    }

    fn send(
        &self,
        ctx: SendContext<'_>,
        buf: OutboundBuffer,
    ) -> Result<(OutboundBuffer, SendFlags), StageError> {
        if buf.len() > to_usize(self.params.max_packet_size) {
            return Ok((buf, SendFlags::default()));
        }

        let (buf, flags) = simulate(ctx.shared, ctx.process, ctx.now, buf.to_bytes())?;
        Ok((
            OutboundBuffer::new(buf),
            SendFlags {
                needs_resume: flags.needs_resume,
                needs_update: flags.needs_update,
            },
        ))
    }

    fn recv(&self, _: RecvContext<'_>, buf: Bytes) -> Result<(Bytes, RecvFlags), StageError> {
        Ok((buf, RecvFlags::default()))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches, octs::BytesMut};

    fn setup(params: SimulatorParams) -> (SimulatorOnReceive, ConnectionRegions) {
        let stage = SimulatorOnReceive::new(params).unwrap();
        let mut regions = ConnectionRegions::new(stage.capacity());
        stage.initialize_connection(&mut regions).unwrap();
        (stage, regions)
    }

    fn recv(
        stage: &SimulatorOnReceive,
        regions: &mut ConnectionRegions,
        now: i64,
        buf: &'static [u8],
    ) -> (Bytes, RecvFlags) {
        stage
            .recv(RecvContext::new(regions, now), Bytes::from_static(buf))
            .unwrap()
    }

    fn stats(regions: &ConnectionRegions) -> SimulatorStats {
        statistics(&regions.shared).unwrap()
    }

    #[test]
    fn invalid_percentage() {
        assert_matches!(
            SimulatorOnSend::new(SimulatorParams {
                packet_drop_percentage: 101,
                ..Default::default()
            }),
            Err(ConfigError::InvalidDropPercentage { percentage: 101 })
        );
    }

    #[test]
    fn capacity_only_in_simulated_direction() {
        let params = SimulatorParams {
            max_packet_count: 4,
            max_packet_size: 100,
            ..Default::default()
        };
        let on_recv = SimulatorOnReceive::new(params).unwrap().capacity();
        let on_send = SimulatorOnSend::new(params).unwrap().capacity();
        assert_eq!(4 * (DelayedPacket::ENCODE_LEN + 100), on_recv.recv);
        assert_eq!(0, on_recv.send);
        assert_eq!(on_recv.recv, on_send.send);
        assert_eq!(0, on_send.recv);
        assert_eq!(0, on_send.header);
        assert_eq!(on_recv.shared, on_send.shared);
    }

    #[test]
    fn other_direction_untouched() {
        let (stage, mut regions) = setup(SimulatorParams {
            packet_drop_interval: 1,
            ..Default::default()
        });
        let mut header = BytesMut::new();
        let (buf, flags) = stage
            .send(
                SendContext::new(&mut regions, &mut header, 0),
                OutboundBuffer::new(Bytes::from_static(b"data")),
            )
            .unwrap();
        assert_eq!(b"data"[..], buf.to_bytes()[..]);
        assert_eq!(SendFlags::default(), flags);
        assert!(header.is_empty());
        assert_eq!(0, stats(&regions).packet_count);
    }

    #[test]
    fn drops_every_nth() {
        let (stage, mut regions) = setup(SimulatorParams {
            packet_drop_interval: 3,
            ..Default::default()
        });
        let passed = (0..6)
            .map(|_| !recv(&stage, &mut regions, 0, b"x").0.is_empty())
            .collect::<Vec<_>>();
        assert_eq!(vec![true, true, false, true, true, false], passed);
        assert_eq!(6, stats(&regions).packet_count);
        assert_eq!(2, stats(&regions).drop_count);
    }

    #[test]
    fn interval_drops_same_packets_every_run() {
        let run = || {
            let (stage, mut regions) = setup(SimulatorParams {
                packet_drop_interval: 5,
                ..Default::default()
            });
            (1..=20)
                .filter(|_| recv(&stage, &mut regions, 0, b"x").0.is_empty())
                .collect::<Vec<_>>()
        };
        let dropped = run();
        assert_eq!(vec![5, 10, 15, 20], dropped);
        assert_eq!(dropped, run());
    }

    #[test]
    fn delay_memory_bounded() {
        let params = SimulatorParams {
            max_packet_count: 1 << 16,
            max_packet_size: 1 << 16,
            ..Default::default()
        };
        assert_matches!(
            SimulatorOnReceive::new(params),
            Err(ConfigError::SimulatorTooLarge {
                max: MAX_DELAY_MEMORY,
                ..
            })
        );
        assert_matches!(
            SimulatorOnSend::new(SimulatorParams {
                max_packet_count: u32::MAX,
                max_packet_size: u32::MAX,
                ..Default::default()
            }),
            Err(ConfigError::SimulatorTooLarge { .. })
        );
    }

    #[test]
    fn drops_by_percentage() {
        let params = SimulatorParams {
            packet_drop_percentage: 50,
            random_seed: 1234,
            ..Default::default()
        };
        let run = || {
            let (stage, mut regions) = setup(params);
            (0..200)
                .map(|_| recv(&stage, &mut regions, 0, b"x").0.is_empty())
                .collect::<Vec<_>>()
        };
        let dropped = run();
        assert_eq!(dropped, run());
        let count = dropped.iter().filter(|&&dropped| dropped).count();
        assert!((50..150).contains(&count), "dropped {count}");
    }

    #[test]
    fn full_percentage_drops_all() {
        let (stage, mut regions) = setup(SimulatorParams {
            packet_drop_percentage: 100,
            ..Default::default()
        });
        for _ in 0..20 {
            assert!(recv(&stage, &mut regions, 0, b"x").0.is_empty());
        }
        assert_eq!(20, stats(&regions).drop_count);
    }

    #[test]
    fn delays_until_due() {
        let (stage, mut regions) = setup(SimulatorParams {
            packet_delay_ms: 50,
            ..Default::default()
        });

        let (buf, flags) = recv(&stage, &mut regions, 0, b"late");
        assert!(buf.is_empty());
        assert!(flags.needs_update);
        assert_eq!(1, stats(&regions).waiting);
        assert_eq!(Some(50), stats(&regions).next_packet_time);

        let (buf, flags) = recv(&stage, &mut regions, 49, b"");
        assert!(buf.is_empty());
        assert!(flags.needs_update);

        let (buf, flags) = recv(&stage, &mut regions, 50, b"");
        assert_eq!(b"late"[..], buf[..]);
        assert_eq!(RecvFlags::default(), flags);
        assert_eq!(
            SimulatorStats {
                packet_count: 1,
                drop_count: 0,
                ready: 0,
                waiting: 0,
                next_packet_time: None,
                stats_time: 50,
            },
            stats(&regions)
        );
    }

    #[test]
    fn several_due_released_oldest_first() {
        let (stage, mut regions) = setup(SimulatorParams {
            packet_delay_ms: 10,
            ..Default::default()
        });
        recv(&stage, &mut regions, 0, b"first");
        recv(&stage, &mut regions, 5, b"second");

        let (buf, flags) = recv(&stage, &mut regions, 20, b"");
        assert_eq!(b"first"[..], buf[..]);
        assert!(flags.needs_resume);
        let (buf, flags) = recv(&stage, &mut regions, 20, b"");
        assert_eq!(b"second"[..], buf[..]);
        assert!(!flags.needs_resume);
        assert!(!flags.needs_update);
    }

    #[test]
    fn out_of_slots_drops() {
        let (stage, mut regions) = setup(SimulatorParams {
            max_packet_count: 1,
            packet_delay_ms: 10,
            ..Default::default()
        });
        recv(&stage, &mut regions, 0, b"kept");
        let (buf, flags) = recv(&stage, &mut regions, 0, b"lost");
        assert!(buf.is_empty());
        assert!(flags.needs_update);
        assert_eq!(1, stats(&regions).drop_count);

        assert_eq!(b"kept"[..], recv(&stage, &mut regions, 10, b"").0[..]);
        assert!(recv(&stage, &mut regions, 100, b"").0.is_empty());
    }

    #[test]
    fn oversized_bypasses() {
        let (stage, mut regions) = setup(SimulatorParams {
            max_packet_size: 4,
            packet_delay_ms: 10,
            packet_drop_interval: 1,
            ..Default::default()
        });
        let (buf, _) = recv(&stage, &mut regions, 0, b"toobig");
        assert_eq!(b"toobig"[..], buf[..]);
        assert_eq!(0, stats(&regions).packet_count);
    }

    #[test]
    fn simulates_on_send() {
        let stage = SimulatorOnSend::new(SimulatorParams {
            packet_delay_ms: 10,
            ..Default::default()
        })
        .unwrap();
        let mut regions = ConnectionRegions::new(stage.capacity());
        stage.initialize_connection(&mut regions).unwrap();

        let mut header = BytesMut::new();
        let (buf, flags) = stage
            .send(
                SendContext::new(&mut regions, &mut header, 0),
                OutboundBuffer {
                    first: Bytes::from_static(b"head"),
                    second: Bytes::from_static(b"tail"),
                },
            )
            .unwrap();
        assert!(buf.is_empty());
        assert!(flags.needs_update);

        let (buf, _) = stage
            .send(
                SendContext::new(&mut regions, &mut header, 10),
                OutboundBuffer::default(),
            )
            .unwrap();
        assert_eq!(b"headtail"[..], buf.to_bytes()[..]);

        let (buf, _) = stage
            .recv(RecvContext::new(&mut regions, 10), Bytes::from_static(b"in"))
            .unwrap();
        assert_eq!(b"in"[..], buf[..]);
    }
}
