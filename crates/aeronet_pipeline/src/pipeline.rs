//! Driver which runs packets through chains of stages for many connections.
//!
//! A [`PipelineProcessor`] holds a set of pipelines, each an ordered list of
//! stages taken from a [`StageCollection`], and the [`ConnectionRegions`] of
//! every stage of every pipeline for every connection.
//!
//! # Wire format
//!
//! ```text
//! [pipeline id: u8][last stage header]...[first stage header][payload]
//! ```
//!
//! On send, stages run first to last, and each one's header is prepended to
//! the output of the stages before it. On receive, stages run last to first,
//! so each one strips its own header.
//!
//! # Resume and update
//!
//! Stages ask to be invoked again through their returned flags. A *resume* is
//! served immediately within the same [`PipelineProcessor::send`] or
//! [`PipelineProcessor::recv`] call, and may produce extra output. An *update*
//! is queued and served on the next [`PipelineProcessor::update`] call.
//!
//! # Held packets
//!
//! A stage may hand the next stage a packet which is not the one passed into
//! [`PipelineProcessor::send`], e.g. a simulator releasing a delayed packet.
//! If the next stage rejects it with [`StageError::OutgoingQueueIsFull`], the
//! packet is held for that connection and pipeline, and retried in order on
//! every [`PipelineProcessor::update`] until the stage accepts it.

use {
    crate::{
        collection::{StageCollection, StageId, StageKind},
        region::ConnectionRegions,
        stage::{OutboundBuffer, RecvContext, SendContext, StageError},
    },
    derive_more::{Display, Error},
    log::{debug, warn},
    octs::{Bytes, BytesMut},
    std::collections::{HashMap, VecDeque},
};

/// Identifier of a pipeline inside a [`PipelineProcessor`].
///
/// Ids start at 1, and are sent as the first byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineId(pub u8);

/// Identifier of a connection, assigned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionId(pub u32);

/// Output of [`PipelineProcessor::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Updates {
    /// Datagrams to send to a peer.
    pub sent: Vec<(ConnectionId, Bytes)>,
    /// Payloads delivered to the app.
    pub received: Vec<(ConnectionId, Bytes)>,
    /// Updates which failed.
    ///
    /// A failed update is queued again for the next call, and does not stop
    /// the updates of any other connection.
    pub errors: Vec<(ConnectionId, PipelineError)>,
}

/// Error returned by a [`PipelineProcessor`].
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum PipelineError {
    /// No pipeline exists with this id.
    #[display("unknown pipeline {id}")]
    UnknownPipeline {
        /// Requested pipeline id.
        id: u8,
    },
    /// Connection was never connected, or already disconnected.
    #[display("unknown connection {conn}")]
    UnknownConnection {
        /// Requested connection.
        conn: ConnectionId,
    },
    /// Received a datagram with no pipeline id byte.
    #[display("empty datagram")]
    EmptyDatagram,
    /// Attempted to create more pipelines than fit into a pipeline id.
    #[display("too many pipelines - maximum is {}", u8::MAX)]
    TooManyPipelines,
    /// Stage collection does not provide a stage of this kind.
    #[display("stage collection has no stage of kind {kind:?}")]
    UnknownStage {
        /// Requested stage kind.
        kind: StageKind,
    },
    /// A stage failed.
    #[display("stage error")]
    Stage(StageError),
}

impl From<StageError> for PipelineError {
    fn from(value: StageError) -> Self {
        Self::Stage(value)
    }
}

#[derive(Debug, Clone)]
struct Pipeline {
    stages: Vec<StageId>,
    header_capacity: usize,
}

/// State of one pipeline for one connection.
#[derive(Debug)]
struct PipelineState {
    regions: Vec<ConnectionRegions>,
    /// Packets waiting to enter the stage at the given index.
    held: VecDeque<(usize, OutboundBuffer)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpdateRequest {
    conn: ConnectionId,
    pipeline: usize,
    stage: usize,
}

/// Runs packets through pipelines of stages from a [`StageCollection`].
///
/// See the [module-level documentation](self).
#[derive(Debug)]
pub struct PipelineProcessor<C> {
    stages: C,
    pipelines: Vec<Pipeline>,
    connections: HashMap<ConnectionId, Vec<PipelineState>>,
    timestamp: i64,
    send_updates: Vec<UpdateRequest>,
    recv_updates: Vec<UpdateRequest>,
}

fn push_unique(queue: &mut Vec<UpdateRequest>, req: UpdateRequest) {
    if !queue.contains(&req) {
        queue.push(req);
    }
}

fn pipeline_id(index: usize) -> u8 {
    u8::try_from(index + 1).unwrap_or(u8::MAX)
}

impl<C: StageCollection> PipelineProcessor<C> {
    /// Creates a processor with no pipelines or connections.
    pub fn new(stages: C) -> Self {
        Self {
            stages,
            pipelines: Vec::new(),
            connections: HashMap::new(),
            timestamp: 0,
            send_updates: Vec::new(),
            recv_updates: Vec::new(),
        }
    }

    /// Gets the stage collection this processor runs.
    pub const fn stages(&self) -> &C {
        &self.stages
    }

    /// Gets the timestamp passed to stages, in milliseconds.
    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Sets the timestamp passed to stages, in milliseconds.
    ///
    /// This should be a monotonic clock.
    pub const fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }

    /// Creates a pipeline from stages of the given kinds, in send order.
    ///
    /// Every already connected connection gets regions for the new pipeline.
    ///
    /// # Errors
    ///
    /// Errors if the stage collection does not provide one of `kinds`, there
    /// are already [`u8::MAX`] pipelines, or setting up a connection fails.
    pub fn create_pipeline(&mut self, kinds: &[StageKind]) -> Result<PipelineId, PipelineError> {
        let id = u8::try_from(self.pipelines.len() + 1)
            .map_err(|_| PipelineError::TooManyPipelines)?;

        let stages = kinds
            .iter()
            .map(|&kind| {
                self.stages
                    .stage_id(kind)
                    .ok_or(PipelineError::UnknownStage { kind })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut header_capacity = 0;
        for &stage in &stages {
            header_capacity += self.stages.capacity(stage)?.header;
        }
        let pipeline = Pipeline {
            stages,
            header_capacity,
        };

        for state in self.connections.values_mut() {
            state.push(allocate(&self.stages, &pipeline)?);
        }
        self.pipelines.push(pipeline);
        debug!("Created pipeline {id} with stages {kinds:?}");
        Ok(PipelineId(id))
    }

    /// Sets up state for a new connection in every pipeline.
    ///
    /// If `conn` is already connected, its state is reset.
    ///
    /// # Errors
    ///
    /// Errors if a stage fails to set up its regions.
    pub fn connect(&mut self, conn: ConnectionId) -> Result<(), PipelineError> {
        let state = self
            .pipelines
            .iter()
            .map(|pipeline| allocate(&self.stages, pipeline))
            .collect::<Result<Vec<_>, _>>()?;
        self.purge_updates(conn);
        self.connections.insert(conn, state);
        debug!("Connected {conn}");
        Ok(())
    }

    /// Drops all state for a connection, including any queued updates and
    /// held packets.
    ///
    /// Returns `false` if the connection did not exist.
    pub fn disconnect(&mut self, conn: ConnectionId) -> bool {
        self.purge_updates(conn);
        let existed = self.connections.remove(&conn).is_some();
        if existed {
            debug!("Disconnected {conn}");
        }
        existed
    }

    fn purge_updates(&mut self, conn: ConnectionId) {
        self.send_updates.retain(|req| req.conn != conn);
        self.recv_updates.retain(|req| req.conn != conn);
    }

    /// Gets if `conn` is connected.
    #[must_use]
    pub fn is_connected(&self, conn: ConnectionId) -> bool {
        self.connections.contains_key(&conn)
    }

    /// Gets how many packets are held for a connection in a pipeline, waiting
    /// for a stage to accept them.
    #[must_use]
    pub fn held_count(&self, conn: ConnectionId, pipeline: PipelineId) -> usize {
        self.pipeline_index(pipeline)
            .ok()
            .and_then(|index| self.connections.get(&conn)?.get(index))
            .map_or(0, |state| state.held.len())
    }

    fn pipeline_index(&self, pipeline: PipelineId) -> Result<usize, PipelineError> {
        let index = usize::from(pipeline.0)
            .checked_sub(1)
            .filter(|&index| index < self.pipelines.len());
        index.ok_or(PipelineError::UnknownPipeline { id: pipeline.0 })
    }

    /// Runs `payload` through the send chain of a pipeline.
    ///
    /// Returns the datagrams to send to the peer. This may be empty if a stage
    /// held the payload back, or more than one if a stage asked to be
    /// resumed.
    ///
    /// # Errors
    ///
    /// Errors if the connection or pipeline does not exist, or a stage fails.
    /// If a stage rejects `payload` itself with
    /// [`StageError::OutgoingQueueIsFull`], it was not sent, and may be sent
    /// again later.
    pub fn send(
        &mut self,
        conn: ConnectionId,
        pipeline: PipelineId,
        payload: Bytes,
    ) -> Result<Vec<Bytes>, PipelineError> {
        let pipeline = self.pipeline_index(pipeline)?;
        let mut datagrams = Vec::new();
        let buf = OutboundBuffer::new(payload);
        self.run_send(conn, pipeline, 0, buf, true, &mut datagrams)?;
        Ok(datagrams)
    }

    /// Runs a datagram received from the peer through the receive chain of
    /// the pipeline named by its first byte.
    ///
    /// Returns the payloads to deliver to the app.
    ///
    /// # Errors
    ///
    /// Errors if the datagram is empty, the connection or pipeline does not
    /// exist, or a stage fails.
    pub fn recv(
        &mut self,
        conn: ConnectionId,
        datagram: Bytes,
    ) -> Result<Vec<Bytes>, PipelineError> {
        let Some(&id) = datagram.first() else {
            return Err(PipelineError::EmptyDatagram);
        };
        let pipeline = self.pipeline_index(PipelineId(id))?;
        let len = self.pipelines[pipeline].stages.len();
        let mut payloads = Vec::new();
        self.run_recv(conn, pipeline, len, datagram.slice(1..), &mut payloads)?;
        Ok(payloads)
    }

    /// Serves every update requested since the last call, and retries held
    /// packets.
    ///
    /// Receive updates run first, then held packets, then send updates.
    /// Updates requested while this runs are served on the next call.
    ///
    /// A failing update does not stop the others. It is reported in
    /// [`Updates::errors`] and queued again.
    pub fn update(&mut self) -> Updates {
        let recv_updates = core::mem::take(&mut self.recv_updates);
        let send_updates = core::mem::take(&mut self.send_updates);
        let mut updates = Updates::default();

        for req in recv_updates {
            if !self.is_connected(req.conn) {
                continue;
            }
            let mut payloads = Vec::new();
            let result = self.run_recv(
                req.conn,
                req.pipeline,
                req.stage + 1,
                Bytes::new(),
                &mut payloads,
            );
            updates
                .received
                .extend(payloads.into_iter().map(|payload| (req.conn, payload)));
            if let Err(err) = result {
                warn!(
                    "Receive update of stage {} in pipeline {} failed for {}: {err}",
                    req.stage,
                    pipeline_id(req.pipeline),
                    req.conn
                );
                push_unique(&mut self.recv_updates, req);
                updates.errors.push((req.conn, err));
            }
        }

        self.retry_held(&mut updates);

        for req in send_updates {
            if !self.is_connected(req.conn) {
                continue;
            }
            let mut datagrams = Vec::new();
            let buf = OutboundBuffer::default();
            let result = self.run_send(
                req.conn,
                req.pipeline,
                req.stage,
                buf,
                false,
                &mut datagrams,
            );
            updates
                .sent
                .extend(datagrams.into_iter().map(|datagram| (req.conn, datagram)));
            if let Err(err) = result {
                warn!(
                    "Send update of stage {} in pipeline {} failed for {}: {err}",
                    req.stage,
                    pipeline_id(req.pipeline),
                    req.conn
                );
                push_unique(&mut self.send_updates, req);
                updates.errors.push((req.conn, err));
            }
        }

        updates
    }

    fn retry_held(&mut self, updates: &mut Updates) {
        let held = self
            .connections
            .iter()
            .flat_map(|(&conn, state)| {
                state
                    .iter()
                    .enumerate()
                    .filter(|(_, state)| !state.held.is_empty())
                    .map(move |(pipeline, _)| (conn, pipeline))
            })
            .collect::<Vec<_>>();

        for (conn, pipeline) in held {
            while let Some((stage, buf)) = self
                .connections
                .get_mut(&conn)
                .and_then(|state| state.get_mut(pipeline))
                .and_then(|state| state.held.pop_front())
            {
                let mut datagrams = Vec::new();
                let result =
                    self.run_send(conn, pipeline, stage, buf.clone(), false, &mut datagrams);
                updates
                    .sent
                    .extend(datagrams.into_iter().map(|datagram| (conn, datagram)));
                let Err(err) = result else {
                    continue;
                };

                if let Some(state) = self
                    .connections
                    .get_mut(&conn)
                    .and_then(|state| state.get_mut(pipeline))
                {
                    state.held.push_front((stage, buf));
                }
                if err != PipelineError::Stage(StageError::OutgoingQueueIsFull) {
                    warn!(
                        "Retrying held packet in pipeline {} failed for {conn}: {err}",
                        pipeline_id(pipeline)
                    );
                    updates.errors.push((conn, err));
                }
                break;
            }
        }
    }

    fn run_send(
        &mut self,
        conn: ConnectionId,
        pipeline: usize,
        start: usize,
        buf: OutboundBuffer,
        from_caller: bool,
        datagrams: &mut Vec<Bytes>,
    ) -> Result<(), PipelineError> {
        let mut resume = Vec::new();
        let mut next = Some((start, buf, from_caller));
        while let Some((start, buf, from_caller)) = next
            .take()
            .or_else(|| resume.pop().map(|stage| (stage, OutboundBuffer::default(), false)))
        {
            let datagram = self.send_chain(conn, pipeline, start, buf, from_caller, &mut resume)?;
            datagrams.extend(datagram);
        }
        Ok(())
    }

    /// Runs the send paths of stages `start` onwards.
    ///
    /// `from_caller` is set while the buffer is still the caller's own
    /// payload. A full stage rejects such a buffer back to the caller, and
    /// holds any other buffer.
    fn send_chain(
        &mut self,
        conn: ConnectionId,
        pipeline: usize,
        start: usize,
        mut buf: OutboundBuffer,
        mut from_caller: bool,
        resume: &mut Vec<usize>,
    ) -> Result<Option<Bytes>, PipelineError> {
        let Self {
            stages,
            pipelines,
            connections,
            timestamp,
            send_updates,
            ..
        } = self;
        let (def, state) = connection_pipeline(pipelines, connections, conn, pipeline)?;

        for (index, &id) in def.stages.iter().enumerate().skip(start) {
            let after_start = index > start;
            if after_start && state.held.iter().any(|&(stage, _)| stage == index) {
                if from_caller {
                    return Err(StageError::OutgoingQueueIsFull.into());
                }
                state.held.push_back((index, buf));
                return Ok(None);
            }

            let Some(regions) = state.regions.get_mut(index) else {
                break;
            };
            let mut header = BytesMut::with_capacity(def.header_capacity);
            let input = buf.clone();
            let ctx = SendContext::new(regions, &mut header, *timestamp);
            let (out, flags) = match stages.send(id, ctx, buf) {
                Ok(ok) => ok,
                Err(StageError::OutgoingQueueIsFull) if after_start && !from_caller => {
                    debug!(
                        "Stage {index} of pipeline {} is full, holding packet for {conn}",
                        pipeline_id(pipeline)
                    );
                    state.held.push_back((index, input));
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            };

            if flags.needs_resume {
                resume.push(index);
            }
            if flags.needs_update {
                let req = UpdateRequest {
                    conn,
                    pipeline,
                    stage: index,
                };
                push_unique(send_updates, req);
            }
            if out.is_empty() && header.is_empty() {
                return Ok(None);
            }
            from_caller = from_caller && out == input;
            buf = out.with_header(header.freeze());
        }

        let id = Bytes::copy_from_slice(&[pipeline_id(pipeline)]);
        Ok(Some(buf.with_header(id).to_bytes()))
    }

    fn run_recv(
        &mut self,
        conn: ConnectionId,
        pipeline: usize,
        top: usize,
        buf: Bytes,
        payloads: &mut Vec<Bytes>,
    ) -> Result<(), PipelineError> {
        let mut resume = Vec::new();
        let mut next = Some((top, buf));
        while let Some((top, buf)) = next
            .take()
            .or_else(|| resume.pop().map(|stage| (stage + 1, Bytes::new())))
        {
            let payload = self.recv_chain(conn, pipeline, top, buf, &mut resume)?;
            payloads.extend(payload);
        }
        Ok(())
    }

    /// Runs the receive paths of stages `top - 1` down to 0.
    fn recv_chain(
        &mut self,
        conn: ConnectionId,
        pipeline: usize,
        top: usize,
        mut buf: Bytes,
        resume: &mut Vec<usize>,
    ) -> Result<Option<Bytes>, PipelineError> {
        let Self {
            stages,
            pipelines,
            connections,
            timestamp,
            send_updates,
            recv_updates,
        } = self;
        let (def, state) = connection_pipeline(pipelines, connections, conn, pipeline)?;

        let chain = def.stages.iter().zip(&mut state.regions).enumerate();
        for (index, (&id, regions)) in chain.take(top).rev() {
            let (out, flags) = stages.recv(id, RecvContext::new(regions, *timestamp), buf)?;
            let req = UpdateRequest {
                conn,
                pipeline,
                stage: index,
            };
            if flags.needs_resume {
                resume.push(index);
            }
            if flags.needs_update {
                push_unique(recv_updates, req);
            }
            if flags.needs_send_update {
                push_unique(send_updates, req);
            }
            if out.is_empty() {
                return Ok(None);
            }
            buf = out;
        }

        Ok((!buf.is_empty()).then_some(buf))
    }

    /// Gets the regions of the `stage`th stage of a pipeline for a connection.
    #[must_use]
    pub fn regions(
        &self,
        conn: ConnectionId,
        pipeline: PipelineId,
        stage: usize,
    ) -> Option<&ConnectionRegions> {
        let pipeline = self.pipeline_index(pipeline).ok()?;
        self.connections
            .get(&conn)?
            .get(pipeline)?
            .regions
            .get(stage)
    }

    /// Gets the regions of the `stage`th stage of a pipeline for a connection
    /// mutably.
    pub fn regions_mut(
        &mut self,
        conn: ConnectionId,
        pipeline: PipelineId,
        stage: usize,
    ) -> Option<&mut ConnectionRegions> {
        let pipeline = self.pipeline_index(pipeline).ok()?;
        self.connections
            .get_mut(&conn)?
            .get_mut(pipeline)?
            .regions
            .get_mut(stage)
    }

    /// Gets the regions of the first stage of the given kind in a pipeline for
    /// a connection.
    ///
    /// This can be used to read stage statistics, e.g. with
    /// [`reliable::statistics`](crate::reliable::statistics).
    pub fn find_stage_mut(
        &mut self,
        conn: ConnectionId,
        pipeline: PipelineId,
        kind: StageKind,
    ) -> Option<&mut ConnectionRegions> {
        let id = self.stages.stage_id(kind)?;
        let index = self.pipeline_index(pipeline).ok()?;
        let stage = self.pipelines[index]
            .stages
            .iter()
            .position(|&stage| stage == id)?;
        self.regions_mut(conn, pipeline, stage)
    }
}

fn allocate<C: StageCollection>(
    stages: &C,
    pipeline: &Pipeline,
) -> Result<PipelineState, StageError> {
    let regions = pipeline
        .stages
        .iter()
        .map(|&id| {
            let mut regions = ConnectionRegions::new(stages.capacity(id)?);
            stages.initialize_connection(id, &mut regions)?;
            Ok(regions)
        })
        .collect::<Result<Vec<_>, StageError>>()?;
    Ok(PipelineState {
        regions,
        held: VecDeque::new(),
    })
}

fn connection_pipeline<'a>(
    pipelines: &'a [Pipeline],
    connections: &'a mut HashMap<ConnectionId, Vec<PipelineState>>,
    conn: ConnectionId,
    pipeline: usize,
) -> Result<(&'a Pipeline, &'a mut PipelineState), PipelineError> {
    let id = pipeline_id(pipeline);
    let def = pipelines
        .get(pipeline)
        .ok_or(PipelineError::UnknownPipeline { id })?;
    let state = connections
        .get_mut(&conn)
        .ok_or(PipelineError::UnknownConnection { conn })?
        .get_mut(pipeline)
        .ok_or(PipelineError::UnknownPipeline { id })?;
    Ok((def, state))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            collection::{DefaultStageCollection, NullStageCollection, StageParams},
            region::{Capacity, RegionError},
            reliable::ReliableParams,
        },
        assert_matches::assert_matches,
    };

    const CONN: ConnectionId = ConnectionId(0);

    #[test]
    fn pipeline_ids_start_at_one() {
        let mut proc = PipelineProcessor::new(DefaultStageCollection::default());
        assert_eq!(PipelineId(1), proc.create_pipeline(&[]).unwrap());
        assert_eq!(
            PipelineId(2),
            proc.create_pipeline(&[StageKind::UnreliableSequenced])
                .unwrap()
        );
    }

    #[test]
    fn too_many_pipelines() {
        let mut proc = PipelineProcessor::new(NullStageCollection);
        for _ in 0..u8::MAX {
            proc.create_pipeline(&[]).unwrap();
        }
        assert_matches!(
            proc.create_pipeline(&[]),
            Err(PipelineError::TooManyPipelines)
        );
    }

    #[test]
    fn null_collection_has_no_stages() {
        let mut proc = PipelineProcessor::new(NullStageCollection);
        assert_matches!(
            proc.create_pipeline(&[StageKind::Null]),
            Err(PipelineError::UnknownStage {
                kind: StageKind::Null
            })
        );

        let pipeline = proc.create_pipeline(&[]).unwrap();
        proc.connect(CONN).unwrap();
        let datagrams = proc
            .send(CONN, pipeline, Bytes::from_static(b"data"))
            .unwrap();
        assert_eq!(vec![Bytes::from_static(b"\x01data")], datagrams);
        assert_eq!(
            vec![Bytes::from_static(b"data")],
            proc.recv(CONN, datagrams[0].clone()).unwrap()
        );
    }

    #[test]
    fn bad_input() {
        let mut proc = PipelineProcessor::new(DefaultStageCollection::default());
        let pipeline = proc.create_pipeline(&[StageKind::Null]).unwrap();

        assert_matches!(
            proc.send(CONN, pipeline, Bytes::from_static(b"x")),
            Err(PipelineError::UnknownConnection { conn: CONN })
        );
        proc.connect(CONN).unwrap();
        assert_matches!(
            proc.send(CONN, PipelineId(0), Bytes::from_static(b"x")),
            Err(PipelineError::UnknownPipeline { id: 0 })
        );
        assert_matches!(
            proc.recv(CONN, Bytes::new()),
            Err(PipelineError::EmptyDatagram)
        );
        assert_matches!(
            proc.recv(CONN, Bytes::from_static(&[9, 0])),
            Err(PipelineError::UnknownPipeline { id: 9 })
        );
    }

    #[test]
    fn headers_stacked_outermost_last_stage() {
        let mut proc = PipelineProcessor::new(DefaultStageCollection::default());
        let pipeline = proc
            .create_pipeline(&[StageKind::UnreliableSequenced, StageKind::Null])
            .unwrap();
        proc.connect(CONN).unwrap();
        let datagrams = proc
            .send(CONN, pipeline, Bytes::from_static(b"ab"))
            .unwrap();
        assert_eq!(vec![Bytes::from_static(&[1, 0, 0, b'a', b'b'])], datagrams);
    }

    #[test]
    fn new_pipeline_reaches_existing_connections() {
        let mut proc = PipelineProcessor::new(DefaultStageCollection::default());
        proc.connect(CONN).unwrap();
        let pipeline = proc
            .create_pipeline(&[StageKind::ReliableSequenced])
            .unwrap();
        assert!(proc.regions(CONN, pipeline, 0).is_some());
        assert!(proc.regions(CONN, pipeline, 1).is_none());
        proc.send(CONN, pipeline, Bytes::from_static(b"x"))
            .unwrap();
    }

    #[test]
    fn disconnect_purges_updates() {
        let mut proc = PipelineProcessor::new(DefaultStageCollection::default());
        let pipeline = proc
            .create_pipeline(&[StageKind::ReliableSequenced])
            .unwrap();
        proc.connect(CONN).unwrap();
        proc.send(CONN, pipeline, Bytes::from_static(b"x"))
            .unwrap();
        assert!(!proc.send_updates.is_empty());

        assert!(proc.disconnect(CONN));
        assert!(proc.send_updates.is_empty());
        assert!(!proc.disconnect(CONN));
        assert_eq!(Updates::default(), proc.update());
    }

    #[test]
    fn updates_deduplicated() {
        let mut proc = PipelineProcessor::new(DefaultStageCollection::default());
        let pipeline = proc
            .create_pipeline(&[StageKind::ReliableSequenced])
            .unwrap();
        proc.connect(CONN).unwrap();
        for _ in 0..3 {
            proc.send(CONN, pipeline, Bytes::from_static(b"x"))
                .unwrap();
        }
        assert_eq!(1, proc.send_updates.len());
    }

    fn single_slot_window() -> DefaultStageCollection {
        DefaultStageCollection::new([StageParams::Reliable(ReliableParams {
            window_size: 1,
            ..Default::default()
        })])
        .unwrap()
    }

    #[test]
    fn full_window_rejects_caller_payload() {
        let mut proc = PipelineProcessor::new(single_slot_window());
        let pipeline = proc
            .create_pipeline(&[StageKind::Null, StageKind::ReliableSequenced])
            .unwrap();
        proc.connect(CONN).unwrap();

        proc.send(CONN, pipeline, Bytes::from_static(b"0"))
            .unwrap();
        assert_matches!(
            proc.send(CONN, pipeline, Bytes::from_static(b"1")),
            Err(PipelineError::Stage(StageError::OutgoingQueueIsFull))
        );
        assert_eq!(0, proc.held_count(CONN, pipeline));
    }

    #[test]
    fn failed_update_requeued_without_blocking_others() {
        const OTHER: ConnectionId = ConnectionId(1);

        let mut proc = PipelineProcessor::new(DefaultStageCollection::default());
        let pipeline = proc
            .create_pipeline(&[StageKind::ReliableSequenced])
            .unwrap();
        proc.connect(CONN).unwrap();
        proc.connect(OTHER).unwrap();
        proc.send(CONN, pipeline, Bytes::from_static(b"x"))
            .unwrap();
        proc.send(OTHER, pipeline, Bytes::from_static(b"y"))
            .unwrap();

        // corrupt the first connection's state
        *proc.regions_mut(CONN, pipeline, 0).unwrap() =
            ConnectionRegions::new(Capacity::default());
        // due for a resend
        proc.set_timestamp(100);

        let updates = proc.update();
        assert_matches!(
            updates.errors.as_slice(),
            [(
                CONN,
                PipelineError::Stage(StageError::Region(RegionError::OutOfBounds { .. }))
            )]
        );
        assert_eq!(1, updates.sent.len());
        assert_eq!(OTHER, updates.sent[0].0);
        assert!(proc.send_updates.iter().any(|req| req.conn == CONN));
        assert!(proc.send_updates.iter().any(|req| req.conn == OTHER));
    }
}
