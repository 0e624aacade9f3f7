//! See [`Seq`].

use {
    core::{
        cmp::Ordering,
        convert::Infallible,
        fmt,
        ops::{Add, AddAssign, Sub, SubAssign},
    },
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// Sequence number uniquely identifying a packet sent in one direction of a
/// connection.
///
/// This is a 16-bit counter which wraps around after [`u16::MAX`], so all
/// comparison and distance operations on it take wraparound into account.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Seq(pub u16);

/// Raw value stored in a byte region in place of a sequence number when there
/// is no sequence number present.
pub const NULL_ENTRY: i32 = -1;

impl Seq {
    /// Sequence number with value 1.
    pub const ONE: Self = Self(1);

    /// Gets the sequence number directly after this one.
    ///
    /// ```
    /// # use aeronet_pipeline::seq::Seq;
    /// assert_eq!(Seq(1), Seq(0).next());
    /// assert_eq!(Seq(0), Seq(u16::MAX).next());
    /// ```
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Gets a signed number for the value of sequences "elapsed" between `rhs`
    /// and `self`.
    ///
    /// This is effectively `rhs - self`, but taking into account wraparound and
    /// therefore returning a signed value. This will always return the smallest
    /// path around this "circle".
    ///
    /// ```text
    ///     65534  65535    0      1      2
    /// ... --|------|------|------|------|-- ...
    ///       ^             ^      ^      ^
    ///       |             +------+------+ 0.dist_to(2) = 2
    ///       |                    |        2.dist_to(0) = -2
    ///       +--------------------+ 65534.dist_to(1) = 3
    ///                              1.dist_to(65534) = -3
    /// ```
    ///
    /// # Example
    ///
    /// ```
    /// # use aeronet_pipeline::seq::Seq;
    /// assert_eq!(Seq(0).dist_to(Seq(0)), 0);
    /// assert_eq!(Seq(0).dist_to(Seq(5)), 5);
    /// assert_eq!(Seq(2).dist_to(Seq(0)), -2);
    ///
    /// assert_eq!(Seq(u16::MAX).dist_to(Seq(0)), 1);
    /// assert_eq!(Seq(0).dist_to(Seq(u16::MAX)), -1);
    /// assert_eq!(Seq(u16::MAX - 1).dist_to(Seq(1)), 3);
    /// ```
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i16 {
        #[expect(clippy::cast_possible_wrap, reason = "we want wrap behavior")]
        (rhs.0.wrapping_sub(self.0) as i16)
    }

    /// Gets the absolute number of sequences between `self` and `rhs`, taking
    /// the shortest path around the wraparound point.
    ///
    /// ```
    /// # use aeronet_pipeline::seq::Seq;
    /// assert_eq!(Seq(3).abs_dist(Seq(1)), 2);
    /// assert_eq!(Seq(1).abs_dist(Seq(3)), 2);
    /// assert_eq!(Seq(u16::MAX).abs_dist(Seq(0)), 1);
    /// ```
    #[must_use]
    pub const fn abs_dist(self, rhs: Self) -> u16 {
        self.dist_to(rhs).unsigned_abs()
    }

    /// Gets if this sequence is too old to fit into a window of `window`
    /// sequences which ends just before `expected`.
    ///
    /// A packet with this sequence can no longer be represented in a receive
    /// window whose next expected sequence is `expected`.
    ///
    /// ```
    /// # use aeronet_pipeline::seq::Seq;
    /// // window covers 8..=39
    /// assert!(!Seq(8).is_stale(Seq(40), 32));
    /// assert!(Seq(7).is_stale(Seq(40), 32));
    ///
    /// // window covers 65532..=65535 and 0..=27
    /// assert!(!Seq(u16::MAX - 3).is_stale(Seq(28), 32));
    /// assert!(Seq(u16::MAX - 4).is_stale(Seq(28), 32));
    /// ```
    #[must_use]
    pub fn is_stale(self, expected: Self, window: u16) -> bool {
        self < expected - Self(window)
    }
}

/// Converts an optional sequence number into its stored representation.
#[must_use]
pub fn seq_into_raw(seq: Option<Seq>) -> i32 {
    seq.map_or(NULL_ENTRY, |seq| i32::from(seq.0))
}

/// Converts a stored sequence number back into an optional sequence number.
///
/// Any value which is not a valid `u16` is treated as no sequence.
#[must_use]
pub fn seq_from_raw(raw: i32) -> Option<Seq> {
    u16::try_from(raw).ok().map(Seq)
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Seq").field(&self.0).finish()
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Ord for Seq {
    /// Logically compares `self` to `other` in a way that respects wrap-around
    /// of sequence numbers, treating e.g. `0 cmp 1` as [`Less`] (as expected),
    /// but `0 cmp 65535` as [`Greater`].
    ///
    /// If the two values compared have a real difference equal to or larger
    /// than `u16::MAX / 2`, no guarantees are upheld.
    ///
    /// [`Greater`]: Ordering::Greater
    /// [`Less`]: Ordering::Less
    fn cmp(&self, other: &Self) -> Ordering {
        let s1 = self.0;
        let s2 = other.0;

        #[expect(clippy::cast_possible_wrap, reason = "we want wrap behavior")]
        (s1 as i16).wrapping_sub(s2 as i16).cmp(&0)
    }
}

impl PartialOrd for Seq {
    /// See [`Seq::cmp`].
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for Seq {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Seq {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Seq {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Seq {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl FixedEncodeLen for Seq {
    const ENCODE_LEN: usize = u16::ENCODE_LEN;
}

impl Encode for Seq {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for Seq {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}
