use {
    super::SimulatorParams,
    crate::region::{Region, RegionError, time_from_raw, time_into_raw},
    core::convert::Infallible,
    octs::{BufTooShortOr, Bytes, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// Simulator state, stored at the front of the shared region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SimulatorContext {
    pub max_packet_count: u32,
    pub max_packet_size: u32,
    pub packet_delay_ms: u32,
    pub packet_drop_interval: u32,
    pub packet_drop_percentage: u32,
    pub random_state: u64,
    pub packet_count: u32,
    pub drop_count: u32,
    pub ready: u32,
    pub waiting: u32,
    pub next_packet_time: Option<i64>,
    pub stats_time: i64,
}

/// Bookkeeping for one delay slot.
///
/// A slot with no `release_at` is free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DelayedPacket {
    pub offset: u32,
    pub size: u32,
    pub release_at: Option<i64>,
}

pub(crate) fn to_usize(n: u32) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

impl SimulatorContext {
    pub const fn new(params: &SimulatorParams) -> Self {
        Self {
            max_packet_count: params.max_packet_count,
            max_packet_size: params.max_packet_size,
            packet_delay_ms: params.packet_delay_ms,
            packet_drop_interval: params.packet_drop_interval,
            packet_drop_percentage: params.packet_drop_percentage,
            random_state: params.random_seed,
            packet_count: 0,
            drop_count: 0,
            ready: 0,
            waiting: 0,
            next_packet_time: None,
            stats_time: 0,
        }
    }

    fn slot_range(&self) -> core::ops::Range<u32> {
        0..self.max_packet_count
    }

    fn record_offset(index: u32) -> usize {
        DelayedPacket::ENCODE_LEN.saturating_mul(to_usize(index))
    }

    fn payload_offset(&self, index: u32) -> usize {
        Self::record_offset(self.max_packet_count)
            .saturating_add(to_usize(self.max_packet_size).saturating_mul(to_usize(index)))
    }

    /// Marks every delay slot in `process` as free.
    pub fn initialize_slots(&self, process: &mut Region) -> Result<(), RegionError> {
        for index in self.slot_range() {
            let record = DelayedPacket {
                offset: u32::try_from(self.payload_offset(index)).unwrap_or(u32::MAX),
                size: 0,
                release_at: None,
            };
            process.write(Self::record_offset(index), &record)?;
        }
        Ok(())
    }

    /// Copies `data` into the first free slot, to be released at
    /// `release_at`.
    ///
    /// Returns `false` if every slot is taken.
    pub fn delay(
        &self,
        process: &mut Region,
        data: &[u8],
        release_at: i64,
    ) -> Result<bool, RegionError> {
        for index in self.slot_range() {
            let record = process.read::<DelayedPacket>(Self::record_offset(index))?;
            if record.release_at.is_some() {
                continue;
            }

            process
                .slice_mut(to_usize(record.offset), data.len())?
                .copy_from_slice(data);
            process.write(
                Self::record_offset(index),
                &DelayedPacket {
                    size: u32::try_from(data.len()).unwrap_or(u32::MAX),
                    release_at: Some(release_at),
                    ..record
                },
            )?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Takes the oldest packet which is due at `now` out of its slot, and
    /// refreshes the queue statistics.
    pub fn release(
        &mut self,
        process: &mut Region,
        now: i64,
    ) -> Result<Option<Bytes>, RegionError> {
        let mut oldest = None::<(u32, DelayedPacket, i64)>;
        let mut ready = 0u32;
        let mut waiting = 0u32;
        let mut next_packet_time = None::<i64>;

        for index in self.slot_range() {
            let record = process.read::<DelayedPacket>(Self::record_offset(index))?;
            let Some(release_at) = record.release_at else {
                continue;
            };

            if release_at <= now {
                ready += 1;
                if oldest.is_none_or(|(_, _, oldest_at)| release_at < oldest_at) {
                    oldest = Some((index, record, release_at));
                }
            } else {
                waiting += 1;
                next_packet_time = Some(next_packet_time.map_or(release_at, |t| t.min(release_at)));
            }
        }

        let released = match oldest {
            Some((index, record, _)) => {
                let data = process.slice(to_usize(record.offset), to_usize(record.size))?;
                let data = Bytes::copy_from_slice(data);
                process.write(
                    Self::record_offset(index),
                    &DelayedPacket {
                        size: 0,
                        release_at: None,
                        ..record
                    },
                )?;
                ready -= 1;
                Some(data)
            }
            None => None,
        };

        self.ready = ready;
        self.waiting = waiting;
        self.next_packet_time = next_packet_time;
        self.stats_time = now;
        Ok(released)
    }
}

impl FixedEncodeLen for SimulatorContext {
    const ENCODE_LEN: usize =
        u32::ENCODE_LEN * 5 + u64::ENCODE_LEN + u32::ENCODE_LEN * 4 + i64::ENCODE_LEN * 2;
}

impl Encode for SimulatorContext {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.max_packet_count)?;
        dst.write(&self.max_packet_size)?;
        dst.write(&self.packet_delay_ms)?;
        dst.write(&self.packet_drop_interval)?;
        dst.write(&self.packet_drop_percentage)?;
        dst.write(&self.random_state)?;
        dst.write(&self.packet_count)?;
        dst.write(&self.drop_count)?;
        dst.write(&self.ready)?;
        dst.write(&self.waiting)?;
        dst.write(&time_into_raw(self.next_packet_time))?;
        dst.write(&self.stats_time)?;
        Ok(())
    }
}

impl Decode for SimulatorContext {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            max_packet_count: src.read()?,
            max_packet_size: src.read()?,
            packet_delay_ms: src.read()?,
            packet_drop_interval: src.read()?,
            packet_drop_percentage: src.read()?,
            random_state: src.read()?,
            packet_count: src.read()?,
            drop_count: src.read()?,
            ready: src.read()?,
            waiting: src.read()?,
            next_packet_time: time_from_raw(src.read()?),
            stats_time: src.read()?,
        })
    }
}

impl FixedEncodeLen for DelayedPacket {
    const ENCODE_LEN: usize = u32::ENCODE_LEN * 2 + i64::ENCODE_LEN;
}

impl Encode for DelayedPacket {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.offset)?;
        dst.write(&self.size)?;
        dst.write(&time_into_raw(self.release_at))?;
        Ok(())
    }
}

impl Decode for DelayedPacket {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            offset: src.read()?,
            size: src.read()?,
            release_at: time_from_raw(src.read()?),
        })
    }
}
