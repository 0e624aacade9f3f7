//! Fixed-size byte regions which hold all per-connection stage state.
//!
//! Stages never own any per-connection memory themselves. Instead, before a
//! connection is set up, each stage declares how many bytes it needs through
//! its [`Capacity`], and the driver allocates a [`ConnectionRegions`] of
//! exactly that size. The stage then lays out its own typed structures inside
//! these regions, using [`Region::read`] and [`Region::write`] to access them
//! at fixed offsets.
//!
//! A region is never resized after it is created.

use {
    core::fmt,
    derive_more::{Display, Error},
    octs::{Decode, Encode, FixedEncodeLen, Read, Write},
};

/// Raw value stored in a byte region in place of a timestamp when there is
/// no timestamp present.
pub const NULL_TIME: i64 = -1;

/// Number of bytes a stage needs in each of its per-connection regions.
///
/// All values are pure functions of a stage's configuration, so querying them
/// twice for the same configuration always gives the same result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capacity {
    /// Bytes the stage may write into the per-packet header scratch area.
    pub header: usize,
    /// Bytes of the send-process region.
    pub send: usize,
    /// Bytes of the receive-process region.
    pub recv: usize,
    /// Bytes of the region shared between the send and receive paths.
    pub shared: usize,
}

/// Fixed-size, bounds-checked byte buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Region(Box<[u8]>);

/// Attempted to access a [`Region`] outside of its bounds, or a region was
/// smaller than a stage declared it needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum RegionError {
    /// Attempted to read or write bytes outside of the region.
    #[display("out of bounds - accessed {len} bytes at {offset} in region of {capacity} bytes")]
    OutOfBounds {
        /// Offset of the access.
        offset: usize,
        /// Number of bytes accessed.
        len: usize,
        /// Total length of the region.
        capacity: usize,
    },
    /// Region passed in for connection setup was smaller than the stage's
    /// declared [`Capacity`].
    #[display("insufficient memory - {got} / {needed} bytes")]
    InsufficientMemory {
        /// Number of bytes the stage declared it needs.
        needed: usize,
        /// Number of bytes actually provided.
        got: usize,
    },
}

impl Region {
    /// Allocates a zeroed region of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self(vec![0; len].into_boxed_slice())
    }

    /// Gets the length of this region in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Gets if this region has a length of 0.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an error if this region is shorter than `needed` bytes.
    ///
    /// # Errors
    ///
    /// Errors if the region is too small.
    pub fn ensure_len(&self, needed: usize) -> Result<(), RegionError> {
        if self.len() < needed {
            Err(RegionError::InsufficientMemory {
                needed,
                got: self.len(),
            })
        } else {
            Ok(())
        }
    }

    /// Gets an immutable view of `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Errors if the range is not fully inside this region.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8], RegionError> {
        let capacity = self.len();
        offset
            .checked_add(len)
            .and_then(|end| self.0.get(offset..end))
            .ok_or(RegionError::OutOfBounds {
                offset,
                len,
                capacity,
            })
    }

    /// Gets a mutable view of `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Errors if the range is not fully inside this region.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], RegionError> {
        let capacity = self.len();
        offset
            .checked_add(len)
            .and_then(|end| self.0.get_mut(offset..end))
            .ok_or(RegionError::OutOfBounds {
                offset,
                len,
                capacity,
            })
    }

    /// Decodes a fixed-length value stored at `offset`.
    ///
    /// # Errors
    ///
    /// Errors if the value would extend past the end of this region.
    ///
    /// # Example
    ///
    /// ```
    /// # use aeronet_pipeline::region::Region;
    /// let mut region = Region::new(8);
    /// region.write(2, &0x1234u16).unwrap();
    /// assert_eq!(0x1234u16, region.read::<u16>(2).unwrap());
    /// assert!(region.read::<u64>(2).is_err());
    /// ```
    pub fn read<T: Decode + FixedEncodeLen>(&self, offset: usize) -> Result<T, RegionError> {
        let mut src = self.slice(offset, T::ENCODE_LEN)?;
        src.read::<T>().map_err(|_| RegionError::OutOfBounds {
            offset,
            len: T::ENCODE_LEN,
            capacity: self.len(),
        })
    }

    /// Encodes a fixed-length value at `offset`.
    ///
    /// # Errors
    ///
    /// Errors if the value would extend past the end of this region.
    pub fn write<T: Encode + FixedEncodeLen>(
        &mut self,
        offset: usize,
        value: &T,
    ) -> Result<(), RegionError> {
        let capacity = self.len();
        let mut dst = self.slice_mut(offset, T::ENCODE_LEN)?;
        dst.write(value).map_err(|_| RegionError::OutOfBounds {
            offset,
            len: T::ENCODE_LEN,
            capacity,
        })
    }

    /// Fills the whole region with zeroes.
    pub fn clear(&mut self) {
        self.0.fill(0);
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Region").field("len", &self.len()).finish()
    }
}

/// Converts an optional timestamp into its stored representation.
#[must_use]
pub fn time_into_raw(time: Option<i64>) -> i64 {
    time.unwrap_or(NULL_TIME)
}

/// Converts a stored timestamp back into an optional timestamp.
#[must_use]
pub const fn time_from_raw(raw: i64) -> Option<i64> {
    if raw < 0 { None } else { Some(raw) }
}

/// The three regions one stage owns for one connection.
///
/// The send path of a stage only touches [`ConnectionRegions::send`] and
/// [`ConnectionRegions::shared`], and the receive path only touches
/// [`ConnectionRegions::recv`] and [`ConnectionRegions::shared`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRegions {
    /// Send-process region.
    pub send: Region,
    /// Receive-process region.
    pub recv: Region,
    /// Region shared between the send and receive paths.
    pub shared: Region,
}

impl ConnectionRegions {
    /// Allocates zeroed regions of exactly the sizes given by `capacity`.
    #[must_use]
    pub fn new(capacity: Capacity) -> Self {
        Self {
            send: Region::new(capacity.send),
            recv: Region::new(capacity.recv),
            shared: Region::new(capacity.shared),
        }
    }

    /// Returns an error if any region is smaller than declared in `capacity`.
    ///
    /// # Errors
    ///
    /// Errors if any region is too small.
    pub fn ensure_capacity(&self, capacity: Capacity) -> Result<(), RegionError> {
        self.send.ensure_len(capacity.send)?;
        self.recv.ensure_len(capacity.recv)?;
        self.shared.ensure_len(capacity.shared)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    #[test]
    fn read_write_at_offset() {
        let mut region = Region::new(16);
        region.write(0, &7u32).unwrap();
        region.write(4, &-1i64).unwrap();
        region.write(12, &u32::MAX).unwrap();

        assert_eq!(7u32, region.read(0).unwrap());
        assert_eq!(-1i64, region.read(4).unwrap());
        assert_eq!(u32::MAX, region.read(12).unwrap());
    }

    #[test]
    fn out_of_bounds() {
        let mut region = Region::new(4);
        assert_matches!(
            region.write(1, &0u32),
            Err(RegionError::OutOfBounds {
                offset: 1,
                len: 4,
                capacity: 4
            })
        );
        assert_matches!(
            region.read::<u16>(usize::MAX),
            Err(RegionError::OutOfBounds { .. })
        );
        assert_matches!(region.slice(5, 0), Err(RegionError::OutOfBounds { .. }));
        assert_eq!(0, region.slice(4, 0).unwrap().len());
    }

    #[test]
    fn capacity_check() {
        let capacity = Capacity {
            header: 0,
            send: 4,
            recv: 8,
            shared: 2,
        };
        let regions = ConnectionRegions::new(capacity);
        regions.ensure_capacity(capacity).unwrap();

        let larger = Capacity {
            recv: 9,
            ..capacity
        };
        assert_matches!(
            regions.ensure_capacity(larger),
            Err(RegionError::InsufficientMemory { needed: 9, got: 8 })
        );
    }

    #[test]
    fn raw_time() {
        assert_eq!(NULL_TIME, time_into_raw(None));
        assert_eq!(None, time_from_raw(NULL_TIME));
        assert_eq!(Some(0), time_from_raw(time_into_raw(Some(0))));
    }
}
