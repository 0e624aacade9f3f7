use {
    super::{
        ReliableState,
        context::{ErrorCode, PacketTimers},
        packet::{MTU, PacketHeader, PacketType},
    },
    crate::{
        region::RegionError,
        seq::Seq,
        stage::{RecvFlags, StageError},
    },
    log::trace,
    octs::{Bytes, Read},
};

impl ReliableState<'_> {
    pub fn recv(&mut self, buf: Bytes) -> Result<(Bytes, RecvFlags), StageError> {
        let mut flags = RecvFlags {
            needs_send_update: true,
            ..Default::default()
        };
        self.shared.error_code = None;

        if buf.is_empty() {
            let payload = match self.ctx.resume {
                Some(start) => self.resume_receive(start, &mut flags)?,
                None => Bytes::new(),
            };
            return Ok((payload, flags));
        }

        let payload = self.recv_packet(buf, &mut flags)?;
        flags.needs_resume |= self.ctx.resume.is_some();
        Ok((payload, flags))
    }

    fn recv_packet(&mut self, buf: Bytes, flags: &mut RecvFlags) -> Result<Bytes, StageError> {
        if buf.len() > MTU {
            trace!("Discarding packet of {} bytes, larger than MTU", buf.len());
            return Ok(Bytes::new());
        }

        let mut payload = buf;
        let Ok(header) = payload.read::<PacketHeader>() else {
            trace!("Discarding packet too short for a header");
            return Ok(Bytes::new());
        };

        match header.packet_type {
            PacketType::ACK => {
                self.read_ack_packet(&header)?;
                return Ok(Bytes::new());
            }
            PacketType::PAYLOAD => {}
            other => {
                trace!("Discarding packet of unknown type {other:?}");
                return Ok(Bytes::new());
            }
        }

        if !self.read(&header)? {
            return Ok(Bytes::new());
        }

        let seq = header.sequence;
        let expected = self.ctx.delivered.map_or(Seq(0), Seq::next);
        if seq == expected {
            self.ctx.delivered = Some(seq);
            if self.has_received_after(seq) {
                self.ctx.resume = Some(seq.next());
                flags.needs_resume = true;
            }
            return Ok(payload);
        }
        if seq < expected {
            trace!("Discarding {seq}, already delivered up to {expected}");
            return Ok(Bytes::new());
        }

        trace!("Buffering {seq} until {expected} arrives");
        self.ctx.set_packet(self.process, seq, &payload, None)?;
        Ok(self.resume_receive(expected, flags)?)
    }

    fn has_received_after(&self, seq: Seq) -> bool {
        self.shared
            .received
            .sequence
            .is_some_and(|latest| latest > seq)
    }

    /// Delivers the buffered packet `start`, if it has arrived.
    fn resume_receive(&mut self, start: Seq, flags: &mut RecvFlags) -> Result<Bytes, RegionError> {
        self.ctx.resume = None;
        let Some(info) = self.ctx.occupied_info(self.process, start)? else {
            return Ok(Bytes::new());
        };
        let payload = self.ctx.packet(self.process, start, info.size)?;
        self.ctx.release(self.process, start)?;
        self.ctx.delivered = Some(start);

        if self.has_received_after(start) {
            self.ctx.resume = Some(start.next());
            flags.needs_resume = true;
        }
        Ok(payload)
    }

    /// Updates the receive window with a payload packet.
    ///
    /// Returns `false` if the packet must be discarded.
    fn read(&mut self, header: &PacketHeader) -> Result<bool, RegionError> {
        let stats = &mut self.shared.stats;
        stats.packets_received = stats.packets_received.saturating_add(1);

        let seq = header.sequence;
        let window = self.shared.window_size;
        let received = &mut self.shared.received;
        match received.sequence {
            None => {
                received.sequence = Some(seq);
                received.ack_mask = initial_mask(seq, window);
            }
            Some(latest) if seq.is_stale(latest.next(), window) => {
                trace!("Discarding {seq}, stale compared to {latest}");
                stats.packets_stale = stats.packets_stale.saturating_add(1);
                self.shared.error_code = Some(ErrorCode::StalePacket);
                return Ok(false);
            }
            Some(latest) if seq > latest => {
                let dist = u32::from(latest.abs_dist(seq));
                let window = u32::from(window);
                stats.packets_dropped = stats
                    .packets_dropped
                    .saturating_add(dropped_on_shift(received.ack_mask, dist, window));
                received.ack_mask = (shl(received.ack_mask, dist) | 1) & window_mask(window);
                received.sequence = Some(seq);
            }
            Some(latest) => {
                let flag = shl(1, u32::from(latest.abs_dist(seq)));
                if received.ack_mask & flag != 0 {
                    trace!("Discarding {seq}, already received");
                    stats.packets_duplicated = stats.packets_duplicated.saturating_add(1);
                    self.shared.error_code = Some(ErrorCode::DuplicatedPacket);
                    // peer lost our ack, so send another one
                    received.acked = None;
                    return Ok(false);
                }
                stats.packets_out_of_order = stats.packets_out_of_order.saturating_add(1);
                received.ack_mask |= flag;
            }
        }

        self.shared.set_remote_timer(
            self.shared_region,
            seq,
            &PacketTimers {
                sequence: Some(seq),
                processing_time: 0,
                sent_time: None,
                receive_time: Some(self.now),
            },
        )?;
        self.read_ack_packet(header)?;
        Ok(true)
    }

    /// Folds the acknowledgement state the peer sent us into our send state.
    fn read_ack_packet(&mut self, header: &PacketHeader) -> Result<(), RegionError> {
        if header.ack_mask == 0 {
            return Ok(());
        }

        let acked = header.acked_sequence;
        self.store_receive_timestamp(acked, header.processing_time)?;

        let sent = &mut self.shared.sent;
        match sent.acked {
            Some(current) if acked == current => {
                sent.ack_mask |= header.ack_mask;
            }
            Some(current) if acked < current => {}
            _ => {
                sent.acked = Some(acked);
                sent.ack_mask = header.ack_mask;
            }
        }
        Ok(())
    }

    /// Records when our packet `seq` was first acknowledged, and takes an RTT
    /// sample from it.
    fn store_receive_timestamp(
        &mut self,
        seq: Seq,
        processing_time: u16,
    ) -> Result<(), RegionError> {
        let mut timers = self.shared.local_timer(self.shared_region, seq)?;
        if timers.sequence != Some(seq) || timers.receive_time.is_some() {
            return Ok(());
        }

        timers.receive_time = Some(self.now);
        timers.processing_time = processing_time;
        self.shared.set_local_timer(self.shared_region, seq, &timers)?;
        if let Some(sent_time) = timers.sent_time {
            self.shared
                .rtt
                .update(self.now - sent_time - i64::from(processing_time));
        }
        Ok(())
    }
}

fn shl(n: u32, by: u32) -> u32 {
    n.checked_shl(by).unwrap_or_default()
}

fn window_mask(window: u32) -> u32 {
    shl(1, window).wrapping_sub(1)
}

/// Ack mask for the first packet received on a connection.
///
/// Sequences before the start of the stream never existed, so they are marked
/// as received rather than left to be counted as dropped.
fn initial_mask(seq: Seq, window: u16) -> u32 {
    (u32::from(seq.0) + 1..u32::from(window)).fold(1, |mask, bit| mask | shl(1, bit))
}

/// Counts the unreceived packets which fall out of a window of `window` bits
/// when it advances by `dist`.
fn dropped_on_shift(mask: u32, dist: u32, window: u32) -> u32 {
    let leaving = (window.saturating_sub(dist)..window)
        .filter(|&bit| mask & shl(1, bit) == 0)
        .count();
    u32::try_from(leaving)
        .unwrap_or(u32::MAX)
        .saturating_add(dist.saturating_sub(window))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_of_full_window() {
        assert_eq!(u32::MAX, window_mask(32));
        assert_eq!(0b1111, window_mask(4));
    }

    #[test]
    fn initial_mask_covers_before_stream_start() {
        assert_eq!(0b1111, initial_mask(Seq(0), 4));
        // 0 and 1 not received yet
        assert_eq!(0b1001, initial_mask(Seq(2), 4));
        assert_eq!(0b0001, initial_mask(Seq(3), 4));
        assert_eq!(0b0001, initial_mask(Seq(100), 4));
    }

    #[test]
    fn drops_counted_on_shift() {
        // all received
        assert_eq!(0, dropped_on_shift(0b1111, 1, 4));
        // bit 3 leaves unreceived
        assert_eq!(1, dropped_on_shift(0b0111, 1, 4));
        // bits 2 and 3 leave, only 3 was received
        assert_eq!(1, dropped_on_shift(0b1011, 2, 4));
        // whole window leaves, plus 2 which were never in it
        assert_eq!(2 + 2, dropped_on_shift(0b0101, 6, 4));
    }
}
