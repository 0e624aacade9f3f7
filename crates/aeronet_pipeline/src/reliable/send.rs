use {
    super::{
        ReliableState,
        context::{ErrorCode, PacketInformation, PacketTimers},
        packet::{MAX_PAYLOAD_LEN, PacketHeader, PacketType},
    },
    crate::{
        region::{RegionError, time_into_raw},
        seq::Seq,
        stage::{OutboundBuffer, SendFlags, StageError},
    },
    log::trace,
    octs::{Bytes, BytesMut, FixedEncodeLen, Write},
};

/// Payload of an ack-only packet.
///
/// Ack packets still carry one byte so that the driver never mistakes them for
/// "nothing to send".
const ACK_PAYLOAD: &[u8] = &[0];

impl ReliableState<'_> {
    pub fn send(
        &mut self,
        header: &mut BytesMut,
        buf: OutboundBuffer,
    ) -> Result<(OutboundBuffer, SendFlags), StageError> {
        let mut flags = SendFlags {
            needs_resume: false,
            needs_update: true,
        };

        let result = self.send_inner(header, buf, &mut flags);
        self.ctx.previous_timestamp = Some(self.now);
        result.map(|buf| (buf, flags))
    }

    fn send_inner(
        &mut self,
        header: &mut BytesMut,
        buf: OutboundBuffer,
        flags: &mut SendFlags,
    ) -> Result<OutboundBuffer, StageError> {
        self.release_or_resume_packets()?;
        if !buf.is_empty() {
            self.send_payload(header, buf, flags)
        } else if let Some(seq) = self.ctx.resume {
            self.resend(header, seq, flags)
        } else if self.should_send_ack() {
            self.send_ack(header)
        } else {
            Ok(OutboundBuffer::default())
        }
    }

    /// Frees every send slot the peer has acknowledged, and picks the oldest
    /// timed-out packet as the next one to resend.
    fn release_or_resume_packets(&mut self) -> Result<(), RegionError> {
        for index in 0..self.ctx.capacity {
            let info = self.ctx.info(self.process, Seq(index))?;
            if let Some(seq) = info.sequence {
                if self.is_acked(seq) {
                    trace!("Packet {seq} acknowledged");
                    self.ctx.release(self.process, seq)?;
                }
            }
        }
        self.ctx.resume = self.oldest_timed_out()?;
        Ok(())
    }

    fn oldest_timed_out(&self) -> Result<Option<Seq>, RegionError> {
        let resend_time = self.shared.resend_time();
        let mut oldest = None::<Seq>;
        for index in 0..self.ctx.capacity {
            let info = self.ctx.info(self.process, Seq(index))?;
            let Some(seq) = info.sequence else {
                continue;
            };
            let timed_out = info
                .send_time
                .is_some_and(|send_time| self.now > send_time + resend_time);
            if timed_out && oldest.is_none_or(|oldest| seq < oldest) {
                oldest = Some(seq);
            }
        }
        Ok(oldest)
    }

    fn is_acked(&self, seq: Seq) -> bool {
        let Some(acked) = self.shared.sent.acked else {
            return false;
        };
        let Ok(bit) = u32::try_from(seq.dist_to(acked)) else {
            return false;
        };
        bit < u32::from(self.shared.window_size)
            && 1u32
                .checked_shl(bit)
                .is_some_and(|flag| self.shared.sent.ack_mask & flag != 0)
    }

    fn send_payload(
        &mut self,
        header: &mut BytesMut,
        buf: OutboundBuffer,
        flags: &mut SendFlags,
    ) -> Result<OutboundBuffer, StageError> {
        if buf.len() > MAX_PAYLOAD_LEN {
            return Err(StageError::PayloadTooLarge {
                len: buf.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let seq = self.shared.sent.sequence.unwrap_or_default();
        if !self.ctx.try_acquire(self.process, seq)? {
            trace!("Send window full, cannot send {seq}");
            self.shared.error_code = Some(ErrorCode::OutgoingQueueIsFull);
            return Err(StageError::OutgoingQueueIsFull);
        }
        self.shared.stats.packets_sent = self.shared.stats.packets_sent.saturating_add(1);

        let packet = self.stamp_header(PacketType::PAYLOAD, seq)?;
        self.shared.sent.sequence = Some(seq.next());
        let start = header.len();
        header.write(&packet)?;
        self.ctx.set_packet_segments(
            self.process,
            seq,
            &[&header[start..], &buf.first[..], &buf.second[..]],
            Some(self.now),
        )?;
        self.shared.set_local_timer(
            self.shared_region,
            seq,
            &PacketTimers {
                sequence: Some(seq),
                processing_time: 0,
                sent_time: Some(self.now),
                receive_time: None,
            },
        )?;

        self.ctx.last_sent_time = Some(self.now);
        flags.needs_resume = self.ctx.resume.is_some();
        Ok(buf)
    }

    fn resend(
        &mut self,
        header: &mut BytesMut,
        seq: Seq,
        flags: &mut SendFlags,
    ) -> Result<OutboundBuffer, StageError> {
        let Some(info) = self.ctx.occupied_info(self.process, seq)? else {
            self.ctx.resume = None;
            return Ok(OutboundBuffer::default());
        };
        let stored = self.ctx.packet(self.process, seq, info.size)?;
        let payload = stored.slice(PacketHeader::ENCODE_LEN.min(stored.len())..);
        self.ctx.set_info(
            self.process,
            seq,
            &PacketInformation {
                send_time: Some(self.now),
                ..info
            },
        )?;

        let packet = self.stamp_header(PacketType::PAYLOAD, seq)?;
        header.write(&packet)?;
        trace!("Resending {seq}");
        self.shared.stats.packets_resent = self.shared.stats.packets_resent.saturating_add(1);
        self.ctx.last_sent_time = Some(self.now);

        self.ctx.resume = self.oldest_timed_out()?;
        flags.needs_resume = self.ctx.resume.is_some();
        Ok(OutboundBuffer::new(payload))
    }

    /// Gets if a whole tick passed without us sending anything, while there is
    /// a received packet we have not acknowledged yet.
    fn should_send_ack(&self) -> bool {
        let idle =
            time_into_raw(self.ctx.last_sent_time) < time_into_raw(self.ctx.previous_timestamp);
        let unacked = match (self.shared.received.sequence, self.shared.received.acked) {
            (Some(_), None) => true,
            (Some(latest), Some(acked)) => latest > acked,
            (None, _) => false,
        };
        idle && unacked
    }

    fn send_ack(&mut self, header: &mut BytesMut) -> Result<OutboundBuffer, StageError> {
        let seq = self.shared.sent.sequence.unwrap_or_default();
        let packet = self.stamp_header(PacketType::ACK, seq)?;
        header.write(&packet)?;
        trace!("Sending ack for {}", packet.acked_sequence);
        self.ctx.last_sent_time = Some(self.now);
        Ok(OutboundBuffer::new(Bytes::from_static(ACK_PAYLOAD)))
    }

    /// Builds a header carrying our latest receive state, and marks that state
    /// as acknowledged.
    fn stamp_header(
        &mut self,
        packet_type: PacketType,
        sequence: Seq,
    ) -> Result<PacketHeader, RegionError> {
        let (acked_sequence, ack_mask, processing_time) = match self.shared.received.sequence {
            Some(latest) => (
                latest,
                self.shared.received.ack_mask,
                self.processing_time(latest)?,
            ),
            None => (Seq(u16::MAX), 0, 0),
        };
        self.shared.received.acked = self.shared.received.sequence;
        Ok(PacketHeader {
            packet_type,
            processing_time,
            sequence,
            acked_sequence,
            ack_mask,
        })
    }

    /// Gets how long we have been holding on to the remote packet `seq` since
    /// receiving it.
    fn processing_time(&self, seq: Seq) -> Result<u16, RegionError> {
        let timers = self.shared.remote_timer(self.shared_region, seq)?;
        Ok(match timers.receive_time {
            Some(receive_time) if timers.sequence == Some(seq) => {
                u16::try_from((self.now - receive_time).clamp(0, i64::from(u16::MAX)))
                    .unwrap_or(u16::MAX)
            }
            _ => 0,
        })
    }
}
