//! See [`NullStage`].

use {
    crate::{
        region::{Capacity, ConnectionRegions},
        stage::{OutboundBuffer, RecvContext, RecvFlags, SendContext, SendFlags, Stage, StageError},
    },
    octs::Bytes,
};

/// Stage which passes data through unchanged in both directions.
///
/// This needs no memory for any connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStage;

impl Stage for NullStage {
    fn capacity(&self) -> Capacity {
        Capacity::default()
    }

    fn initialize_connection(&self, _: &mut ConnectionRegions) -> Result<(), StageError> {
        Ok(())
    }

    fn send(
        &self,
        _: SendContext<'_>,
        buf: OutboundBuffer,
    ) -> Result<(OutboundBuffer, SendFlags), StageError> {
        Ok((buf, SendFlags::default()))
    }

    fn recv(&self, _: RecvContext<'_>, buf: Bytes) -> Result<(Bytes, RecvFlags), StageError> {
        Ok((buf, RecvFlags::default()))
    }
}
