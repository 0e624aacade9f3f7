//! See [`RttInfo`].

use {
    core::convert::Infallible,
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// Default lower bound on how long we wait before resending a packet, in
/// milliseconds.
///
/// This is 4 ticks at 60Hz.
pub const DEFAULT_MINIMUM_RESEND_TIME: u32 = 64;

/// Upper bound on how long we wait before resending a packet, in
/// milliseconds.
pub const MAXIMUM_RESEND_TIME: u32 = 200;

/// Round-trip time estimation for a connection, in milliseconds.
///
/// This is a TCP-style exponential moving average: each new sample moves the
/// smoothed RTT 1/8 of the way towards it, and the smoothed variance 1/4 of
/// the way towards the sample's deviation.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RttInfo {
    /// Most recent RTT sample.
    pub last_rtt: i32,
    /// Smoothed RTT estimate.
    pub smoothed_rtt: f32,
    /// Smoothed deviation of RTT samples.
    pub smoothed_variance: f32,
    /// Resend timeout derived from the estimate, before clamping.
    pub resend_timeout: i32,
}

impl Default for RttInfo {
    fn default() -> Self {
        Self {
            last_rtt: 50,
            smoothed_rtt: 50.0,
            smoothed_variance: 5.0,
            resend_timeout: 50,
        }
    }
}

impl RttInfo {
    /// Adds an RTT sample to this estimation.
    ///
    /// `rtt` is floored to 1.
    ///
    /// # Example
    ///
    /// ```
    /// # use aeronet_pipeline::reliable::RttInfo;
    /// let mut rtt = RttInfo::default();
    /// rtt.update(100);
    /// assert_eq!(100, rtt.last_rtt);
    /// assert!(rtt.smoothed_rtt > 50.0);
    /// assert!(rtt.resend_timeout > 50);
    /// ```
    #[expect(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        reason = "RTT values are small, in milliseconds"
    )]
    pub fn update(&mut self, rtt: i64) {
        let rtt = i32::try_from(rtt.max(1)).unwrap_or(i32::MAX);
        self.last_rtt = rtt;
        let delta = rtt as f32 - self.smoothed_rtt;
        self.smoothed_rtt += delta / 8.0;
        self.smoothed_variance += (delta.abs() - self.smoothed_variance) / 4.0;
        self.resend_timeout = (self.smoothed_rtt + 4.0 * self.smoothed_variance) as i32;
    }

    /// Gets how long to wait before resending an unacknowledged packet.
    ///
    /// This is [`RttInfo::resend_timeout`] clamped between `minimum` and
    /// [`MAXIMUM_RESEND_TIME`]. `minimum` is expected to be no larger than
    /// the maximum; if it is, the maximum is used.
    ///
    /// # Example
    ///
    /// ```
    /// # use aeronet_pipeline::reliable::RttInfo;
    /// let rtt = RttInfo::default();
    /// assert_eq!(64, rtt.resend_time(64));
    /// assert_eq!(50, rtt.resend_time(10));
    ///
    /// let rtt = RttInfo { resend_timeout: 5000, ..rtt };
    /// assert_eq!(200, rtt.resend_time(64));
    /// ```
    #[must_use]
    pub fn resend_time(&self, minimum: u32) -> i64 {
        let max = i64::from(MAXIMUM_RESEND_TIME);
        let min = i64::from(minimum).min(max);
        i64::from(self.resend_timeout).clamp(min, max)
    }
}

impl FixedEncodeLen for RttInfo {
    const ENCODE_LEN: usize = i32::ENCODE_LEN * 2 + u32::ENCODE_LEN * 2;
}

impl Encode for RttInfo {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.last_rtt)?;
        dst.write(&self.smoothed_rtt.to_bits())?;
        dst.write(&self.smoothed_variance.to_bits())?;
        dst.write(&self.resend_timeout)?;
        Ok(())
    }
}

impl Decode for RttInfo {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            last_rtt: src.read()?,
            smoothed_rtt: f32::from_bits(src.read()?),
            smoothed_variance: f32::from_bits(src.read()?),
            resend_timeout: src.read()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_on_stable_rtt() {
        let mut rtt = RttInfo::default();
        for _ in 0..200 {
            rtt.update(20);
        }
        assert_eq!(20, rtt.last_rtt);
        assert!((rtt.smoothed_rtt - 20.0).abs() < 0.5);
        assert!(rtt.smoothed_variance < 0.5);
        assert!((20..=22).contains(&rtt.resend_timeout));
    }

    #[test]
    fn sample_floored_to_one() {
        let mut rtt = RttInfo::default();
        rtt.update(-30);
        assert_eq!(1, rtt.last_rtt);
    }

    #[test]
    fn single_sample() {
        let mut rtt = RttInfo::default();
        rtt.update(90);
        // delta = 40
        assert_eq!(90, rtt.last_rtt);
        assert!((rtt.smoothed_rtt - 55.0).abs() < f32::EPSILON);
        assert!((rtt.smoothed_variance - 13.75).abs() < f32::EPSILON);
        assert_eq!(110, rtt.resend_timeout);
    }

    #[test]
    fn resend_time_clamped() {
        let rtt = RttInfo {
            resend_timeout: 150,
            ..Default::default()
        };
        assert_eq!(150, rtt.resend_time(64));
        assert_eq!(180, rtt.resend_time(180));
        assert_eq!(200, rtt.resend_time(500));
    }
}
