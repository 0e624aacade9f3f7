//! See [`UnreliableSequenced`].

use {
    crate::{
        region::{Capacity, ConnectionRegions},
        seq::{NULL_ENTRY, Seq, seq_from_raw, seq_into_raw},
        stage::{OutboundBuffer, RecvContext, RecvFlags, SendContext, SendFlags, Stage, StageError},
    },
    log::trace,
    octs::{Bytes, FixedEncodeLen, Read, Write},
};

/// Stage which drops any packet older than the newest one received so far.
///
/// Every outgoing packet is prefixed with a [`Seq`] header. On the receiving
/// side, a packet is only delivered if its sequence is strictly newer than
/// every sequence delivered before it. There are no acknowledgements or
/// resends, so packets may still be lost.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnreliableSequenced;

impl Stage for UnreliableSequenced {
    fn capacity(&self) -> Capacity {
        Capacity {
            header: Seq::ENCODE_LEN,
            send: i32::ENCODE_LEN,
            recv: i32::ENCODE_LEN,
            shared: 0,
        }
    }

    fn initialize_connection(&self, regions: &mut ConnectionRegions) -> Result<(), StageError> {
        regions.ensure_capacity(self.capacity())?;
        regions.send.write(0, &seq_into_raw(Some(Seq(0))))?;
        regions.recv.write(0, &NULL_ENTRY)?;
        Ok(())
    }

    fn send(
        &self,
        ctx: SendContext<'_>,
        buf: OutboundBuffer,
    ) -> Result<(OutboundBuffer, SendFlags), StageError> {
        if buf.is_empty() {
            return Ok((buf, SendFlags::default()));
        }

        let seq = seq_from_raw(ctx.process.read(0)?).unwrap_or_default();
        ctx.header.write(&seq)?;
        ctx.process.write(0, &seq_into_raw(Some(seq.next())))?;
        Ok((buf, SendFlags::default()))
    }

    fn recv(&self, ctx: RecvContext<'_>, buf: Bytes) -> Result<(Bytes, RecvFlags), StageError> {
        if buf.is_empty() {
            return Ok((buf, RecvFlags::default()));
        }

        let mut payload = buf;
        let Ok(seq) = payload.read::<Seq>() else {
            trace!("Discarding packet too short for a sequence");
            return Ok((Bytes::new(), RecvFlags::default()));
        };

        let last = seq_from_raw(ctx.process.read(0)?);
        if let Some(last) = last.filter(|&last| seq <= last) {
            trace!("Discarding {seq}, not newer than {last}");
            return Ok((Bytes::new(), RecvFlags::default()));
        }

        ctx.process.write(0, &seq_into_raw(Some(seq)))?;
        Ok((payload, RecvFlags::default()))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, octs::BytesMut};

    fn setup() -> ConnectionRegions {
        let mut regions = ConnectionRegions::new(UnreliableSequenced.capacity());
        UnreliableSequenced
            .initialize_connection(&mut regions)
            .unwrap();
        regions
    }

    fn send(regions: &mut ConnectionRegions, payload: &'static [u8]) -> Bytes {
        let mut header = BytesMut::new();
        let (buf, _) = UnreliableSequenced
            .send(
                SendContext::new(regions, &mut header, 0),
                OutboundBuffer::new(Bytes::from_static(payload)),
            )
            .unwrap();
        buf.with_header(header.freeze()).to_bytes()
    }

    fn recv(regions: &mut ConnectionRegions, wire: Bytes) -> Bytes {
        UnreliableSequenced
            .recv(RecvContext::new(regions, 0), wire)
            .unwrap()
            .0
    }

    #[test]
    fn stamps_increasing_sequence() {
        let mut regions = setup();
        assert_eq!([0, 0, b'a'][..], send(&mut regions, b"a")[..]);
        assert_eq!([0, 1, b'b'][..], send(&mut regions, b"b")[..]);
    }

    #[test]
    fn empty_send_has_no_header() {
        let mut regions = setup();
        assert!(send(&mut regions, b"").is_empty());
        assert_eq!([0, 0, b'a'][..], send(&mut regions, b"a")[..]);
    }

    #[test]
    fn drops_older_and_duplicate() {
        let mut tx = setup();
        let mut rx = setup();
        let w0 = send(&mut tx, b"0");
        let w1 = send(&mut tx, b"1");
        let w2 = send(&mut tx, b"2");

        assert_eq!(b"0"[..], recv(&mut rx, w0)[..]);
        assert_eq!(b"2"[..], recv(&mut rx, w2.clone())[..]);
        assert!(recv(&mut rx, w1).is_empty());
        assert!(recv(&mut rx, w2).is_empty());
    }

    #[test]
    fn truncated_dropped() {
        let mut rx = setup();
        assert!(recv(&mut rx, Bytes::from_static(&[1])).is_empty());
        assert_eq!(NULL_ENTRY, rx.recv.read::<i32>(0).unwrap());
    }

    #[test]
    fn newer_across_wraparound() {
        let mut rx = setup();
        assert_eq!(
            b"x"[..],
            recv(&mut rx, Bytes::from_static(&[0xff, 0xff, b'x']))[..]
        );
        assert_eq!(b"y"[..], recv(&mut rx, Bytes::from_static(&[0, 0, b'y']))[..]);
    }
}
