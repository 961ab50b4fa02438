use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use rayon::ThreadPool;

use super::{
    app::MessageVolume,
    channel::{estimate_channel_capacity, MessageChannel, Routed},
};
use crate::{
    comm::MessageExchange,
    core::{errors::GraphError, fragment::Fragment, vertex::Vertex, MsgPayload, Payload},
};

/// Routes and buffers cross-fragment messages and drives the distributed
/// termination protocol for one worker.
///
/// Round protocol: `start()` once, then per superstep `start_a_round()`,
/// sends/`parallel_process` during evaluation, `finish_a_round()` at the
/// boundary. `finish_a_round` drains every channel into one outbox per rank,
/// exchanges them (they become the peers' inboxes for the *next* round) and
/// combines each rank's local continue flag ("sent anything or forced")
/// with a group-wide logical OR. The engine terminates only when that OR
/// resolves false for a whole round.
pub trait MessageManager<M: MsgPayload> {
    /// Brackets the whole multi-round session together with [`finalize`].
    ///
    /// [`finalize`]: MessageManager::finalize
    fn start(&mut self);

    fn finalize(&mut self);

    /// Sizes channel buffers from an application's volume hint.
    fn reserve(&mut self, volume: MessageVolume, threads: usize);

    /// Allocates `n` per-thread channels for the upcoming rounds. Must run
    /// before any parallel send.
    fn init_channels(&mut self, n: usize);

    fn channels(&mut self) -> &mut [MessageChannel<M>];

    /// Serial convenience for [`MessageChannel::send_through_out_edges`] on
    /// channel `channel_id`.
    fn send_through_out_edges<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        v: Vertex,
        msg: M,
        channel_id: usize,
    );

    /// Serial convenience for [`MessageChannel::sync_state_on_outer_vertex`]
    /// on channel `channel_id`.
    fn sync_state_on_outer_vertex<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        u: Vertex,
        msg: M,
        channel_id: usize,
    );

    /// Drains everything received for this rank and invokes
    /// `op(thread_id, destination vertex, payload)` exactly once per message,
    /// in unspecified order. Reduction of same-destination messages is the
    /// callback's responsibility. Before the first `finish_a_round` the
    /// message set is empty, not an error.
    fn parallel_process<V: Payload + Default, E: Payload, F>(
        &mut self,
        threads: usize,
        frag: &Fragment<V, E>,
        op: F,
    ) -> Result<(), GraphError>
    where
        F: Fn(usize, Vertex, &M) + Send + Sync;

    /// Requires at least one more round, group-wide.
    fn force_continue(&self);

    fn start_a_round(&mut self);

    fn finish_a_round(&mut self);

    /// True once the group agreed to stop: a round completed in which no rank
    /// forced continuation and no rank had outbound messages.
    fn to_terminate(&self) -> bool;
}

/// Which [`MessageManager`] implementation a worker constructs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerKind {
    /// Per-thread channels, parallel message dispatch.
    Parallel,
    /// [`Parallel`] plus reusable round buffers sized from the application's
    /// volume hint; steady-state rounds allocate nothing.
    ///
    /// [`Parallel`]: ManagerKind::Parallel
    Pooled,
    /// One channel, sequential dispatch; for small fragments and debugging.
    Serial,
}

// State every manager variant shares: the staged/current inboxes, the local
// continue flag and the group decision.
struct RoundState<M, C> {
    comm: C,
    fnum: usize,
    inbox: Vec<Routed<M>>,
    staged: Vec<Routed<M>>,
    force_continue: AtomicBool,
    terminate: bool,
    in_round: bool,
    round: usize,
    sent_total: usize,
}

impl<M: MsgPayload, C: MessageExchange<Routed<M>>> RoundState<M, C> {
    fn new(comm: C) -> Self {
        let fnum = comm.world_size();
        Self {
            comm,
            fnum,
            inbox: Vec::new(),
            staged: Vec::new(),
            force_continue: AtomicBool::new(false),
            terminate: false,
            in_round: false,
            round: 0,
            sent_total: 0,
        }
    }

    fn start(&mut self) {
        self.inbox.clear();
        self.staged.clear();
        self.force_continue.store(false, Ordering::Relaxed);
        self.terminate = false;
        self.in_round = false;
        self.round = 0;
        self.sent_total = 0;
    }

    fn start_a_round(&mut self) {
        debug_assert!(!self.in_round, "start_a_round inside an open round");
        self.in_round = true;
        self.round += 1;
        self.force_continue.store(false, Ordering::Relaxed);
        // messages exchanged at the previous boundary become visible now
        self.inbox = std::mem::take(&mut self.staged);
    }

    fn empty_outbox(&self) -> Vec<Vec<Routed<M>>> {
        (0..self.fnum).map(|_| Vec::new()).collect()
    }

    fn finish_a_round(
        &mut self,
        channels: &mut [MessageChannel<M>],
        mut outbox: Vec<Vec<Routed<M>>>,
    ) {
        debug_assert!(self.in_round, "finish_a_round outside a round");
        debug_assert_eq!(outbox.len(), self.fnum);
        for channel in channels.iter_mut() {
            channel.drain_into(&mut outbox);
        }
        let sent: usize = outbox.iter().map(Vec::len).sum();
        self.sent_total += sent;
        let local_continue = sent > 0 || self.force_continue.load(Ordering::Relaxed);
        self.staged = self.comm.exchange(outbox);
        self.terminate = !self.comm.or_all(local_continue);
        self.in_round = false;
        tracing::debug!(
            round = self.round,
            sent,
            received = self.staged.len(),
            terminate = self.terminate,
            "finished round"
        );
    }

    fn finalize(&mut self) {
        tracing::debug!(
            rounds = self.round,
            sent_total = self.sent_total,
            "message session closed"
        );
    }
}

/// The default manager: per-thread channels written lock-free during parallel
/// evaluation, parallel dispatch of received messages on the worker's pool.
pub struct ParallelMessageManager<M, C> {
    state: RoundState<M, C>,
    channels: Vec<MessageChannel<M>>,
    capacity: usize,
    pool: Arc<ThreadPool>,
}

impl<M: MsgPayload, C: MessageExchange<Routed<M>>> ParallelMessageManager<M, C> {
    pub fn new(comm: C, pool: Arc<ThreadPool>) -> Self {
        Self {
            state: RoundState::new(comm),
            channels: Vec::new(),
            capacity: 0,
            pool,
        }
    }
}

impl<M: MsgPayload, C: MessageExchange<Routed<M>>> MessageManager<M>
    for ParallelMessageManager<M, C>
{
    fn start(&mut self) {
        self.state.start();
        self.channels.clear();
    }

    fn finalize(&mut self) {
        self.state.finalize();
    }

    fn reserve(&mut self, volume: MessageVolume, threads: usize) {
        self.capacity = estimate_channel_capacity(volume.send, self.state.fnum, threads);
    }

    fn init_channels(&mut self, n: usize) {
        self.channels = (0..n.max(1))
            .map(|_| MessageChannel::with_capacity(self.state.fnum, self.capacity))
            .collect();
    }

    fn channels(&mut self) -> &mut [MessageChannel<M>] {
        &mut self.channels
    }

    fn send_through_out_edges<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        v: Vertex,
        msg: M,
        channel_id: usize,
    ) {
        debug_assert!(self.state.in_round);
        self.channels[channel_id].send_through_out_edges(frag, v, msg);
    }

    fn sync_state_on_outer_vertex<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        u: Vertex,
        msg: M,
        channel_id: usize,
    ) {
        debug_assert!(self.state.in_round);
        self.channels[channel_id].sync_state_on_outer_vertex(frag, u, msg);
    }

    fn parallel_process<V: Payload + Default, E: Payload, F>(
        &mut self,
        threads: usize,
        frag: &Fragment<V, E>,
        op: F,
    ) -> Result<(), GraphError>
    where
        F: Fn(usize, Vertex, &M) + Send + Sync,
    {
        debug_assert!(self.state.in_round);
        let received = std::mem::take(&mut self.state.inbox);
        if received.is_empty() {
            return Ok(());
        }
        let failed: Mutex<Option<GraphError>> = Mutex::new(None);
        let chunk = received.len().div_ceil(threads.max(1));
        self.pool.scope(|s| {
            for (tid, part) in received.chunks(chunk).enumerate() {
                let op = &op;
                let failed = &failed;
                s.spawn(move |_| {
                    for (gid, msg) in part {
                        match frag.vertex(*gid) {
                            Ok(v) => op(tid, v, msg),
                            Err(e) => {
                                *failed.lock() = Some(e);
                                return;
                            }
                        }
                    }
                });
            }
        });
        match failed.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn force_continue(&self) {
        self.state.force_continue.store(true, Ordering::Relaxed);
    }

    fn start_a_round(&mut self) {
        self.state.start_a_round();
    }

    fn finish_a_round(&mut self) {
        let Self {
            state, channels, ..
        } = self;
        let outbox = state.empty_outbox();
        state.finish_a_round(channels, outbox);
    }

    fn to_terminate(&self) -> bool {
        self.state.terminate
    }
}

// A stock of reusable message vectors. Round boundaries draw their per-rank
// outboxes here and spent inboxes flow back, so the same allocations cycle
// through exchange after exchange.
struct MessageBufferPool<M> {
    buffers: Vec<Vec<Routed<M>>>,
    capacity: usize,
}

impl<M> MessageBufferPool<M> {
    fn new() -> Self {
        Self {
            buffers: Vec::new(),
            capacity: 0,
        }
    }

    fn reserve(&mut self, capacity: usize, count: usize) {
        self.capacity = self.capacity.max(capacity);
        while self.buffers.len() < count {
            self.buffers.push(Vec::with_capacity(self.capacity));
        }
    }

    fn take(&mut self) -> Vec<Routed<M>> {
        self.buffers
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.capacity))
    }

    fn put(&mut self, mut buffer: Vec<Routed<M>>) {
        buffer.clear();
        self.buffers.push(buffer);
    }
}

/// [`ParallelMessageManager`] with pooled round buffers. `reserve` seeds the
/// pool from the application's volume hint (outbound per-rank lanes from
/// `send`, the expected inbox from `recv`); after that, each round's outboxes
/// come out of the pool and the processed inbox goes back in.
pub struct PooledMessageManager<M, C> {
    state: RoundState<M, C>,
    channels: Vec<MessageChannel<M>>,
    capacity: usize,
    pool: Arc<ThreadPool>,
    buffers: MessageBufferPool<M>,
}

impl<M: MsgPayload, C: MessageExchange<Routed<M>>> PooledMessageManager<M, C> {
    pub fn new(comm: C, pool: Arc<ThreadPool>) -> Self {
        Self {
            state: RoundState::new(comm),
            channels: Vec::new(),
            capacity: 0,
            pool,
            buffers: MessageBufferPool::new(),
        }
    }
}

impl<M: MsgPayload, C: MessageExchange<Routed<M>>> MessageManager<M>
    for PooledMessageManager<M, C>
{
    fn start(&mut self) {
        self.state.start();
        self.channels.clear();
    }

    fn finalize(&mut self) {
        self.state.finalize();
    }

    fn reserve(&mut self, volume: MessageVolume, threads: usize) {
        self.capacity = estimate_channel_capacity(volume.send, self.state.fnum, threads);
        self.buffers.reserve(self.capacity.max(volume.recv), self.state.fnum + 1);
    }

    fn init_channels(&mut self, n: usize) {
        self.channels = (0..n.max(1))
            .map(|_| MessageChannel::with_capacity(self.state.fnum, self.capacity))
            .collect();
    }

    fn channels(&mut self) -> &mut [MessageChannel<M>] {
        &mut self.channels
    }

    fn send_through_out_edges<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        v: Vertex,
        msg: M,
        channel_id: usize,
    ) {
        debug_assert!(self.state.in_round);
        self.channels[channel_id].send_through_out_edges(frag, v, msg);
    }

    fn sync_state_on_outer_vertex<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        u: Vertex,
        msg: M,
        channel_id: usize,
    ) {
        debug_assert!(self.state.in_round);
        self.channels[channel_id].sync_state_on_outer_vertex(frag, u, msg);
    }

    fn parallel_process<V: Payload + Default, E: Payload, F>(
        &mut self,
        threads: usize,
        frag: &Fragment<V, E>,
        op: F,
    ) -> Result<(), GraphError>
    where
        F: Fn(usize, Vertex, &M) + Send + Sync,
    {
        debug_assert!(self.state.in_round);
        let received = std::mem::take(&mut self.state.inbox);
        if received.is_empty() {
            return Ok(());
        }
        let failed: Mutex<Option<GraphError>> = Mutex::new(None);
        let chunk = received.len().div_ceil(threads.max(1));
        self.pool.scope(|s| {
            for (tid, part) in received.chunks(chunk).enumerate() {
                let op = &op;
                let failed = &failed;
                s.spawn(move |_| {
                    for (gid, msg) in part {
                        match frag.vertex(*gid) {
                            Ok(v) => op(tid, v, msg),
                            Err(e) => {
                                *failed.lock() = Some(e);
                                return;
                            }
                        }
                    }
                });
            }
        });
        self.buffers.put(received);
        match failed.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn force_continue(&self) {
        self.state.force_continue.store(true, Ordering::Relaxed);
    }

    fn start_a_round(&mut self) {
        self.state.start_a_round();
    }

    fn finish_a_round(&mut self) {
        let Self {
            state,
            channels,
            buffers,
            ..
        } = self;
        let outbox = (0..state.fnum).map(|_| buffers.take()).collect();
        state.finish_a_round(channels, outbox);
    }

    fn to_terminate(&self) -> bool {
        self.state.terminate
    }
}

/// A deliberately simple manager: one channel, sequential dispatch. Useful
/// for tiny fragments, deterministic debugging and as a reference for the
/// round protocol.
pub struct SerialMessageManager<M, C> {
    state: RoundState<M, C>,
    channel: Vec<MessageChannel<M>>,
}

impl<M: MsgPayload, C: MessageExchange<Routed<M>>> SerialMessageManager<M, C> {
    pub fn new(comm: C) -> Self {
        let fnum = comm.world_size();
        Self {
            state: RoundState::new(comm),
            channel: vec![MessageChannel::new(fnum)],
        }
    }
}

impl<M: MsgPayload, C: MessageExchange<Routed<M>>> MessageManager<M>
    for SerialMessageManager<M, C>
{
    fn start(&mut self) {
        self.state.start();
    }

    fn finalize(&mut self) {
        self.state.finalize();
    }

    fn reserve(&mut self, _volume: MessageVolume, _threads: usize) {}

    fn init_channels(&mut self, _n: usize) {
        // evaluation is sequential here, one channel serves every caller
    }

    fn channels(&mut self) -> &mut [MessageChannel<M>] {
        &mut self.channel
    }

    fn send_through_out_edges<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        v: Vertex,
        msg: M,
        _channel_id: usize,
    ) {
        self.channel[0].send_through_out_edges(frag, v, msg);
    }

    fn sync_state_on_outer_vertex<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        u: Vertex,
        msg: M,
        _channel_id: usize,
    ) {
        self.channel[0].sync_state_on_outer_vertex(frag, u, msg);
    }

    fn parallel_process<V: Payload + Default, E: Payload, F>(
        &mut self,
        _threads: usize,
        frag: &Fragment<V, E>,
        op: F,
    ) -> Result<(), GraphError>
    where
        F: Fn(usize, Vertex, &M) + Send + Sync,
    {
        debug_assert!(self.state.in_round);
        for (gid, msg) in std::mem::take(&mut self.state.inbox) {
            op(0, frag.vertex(gid)?, &msg);
        }
        Ok(())
    }

    fn force_continue(&self) {
        self.state.force_continue.store(true, Ordering::Relaxed);
    }

    fn start_a_round(&mut self) {
        self.state.start_a_round();
    }

    fn finish_a_round(&mut self) {
        let Self { state, channel } = self;
        let outbox = state.empty_outbox();
        state.finish_a_round(channel, outbox);
    }

    fn to_terminate(&self) -> bool {
        self.state.terminate
    }
}

/// Runtime-selected manager variant; lets a worker be configured with a
/// [`ManagerKind`] while its round logic stays generic over the trait.
pub enum AnyMessageManager<M, C> {
    Parallel(ParallelMessageManager<M, C>),
    Pooled(PooledMessageManager<M, C>),
    Serial(SerialMessageManager<M, C>),
}

impl<M: MsgPayload, C: MessageExchange<Routed<M>>> AnyMessageManager<M, C> {
    pub fn from_kind(kind: ManagerKind, comm: C, pool: Arc<ThreadPool>) -> Self {
        match kind {
            ManagerKind::Parallel => Self::Parallel(ParallelMessageManager::new(comm, pool)),
            ManagerKind::Pooled => Self::Pooled(PooledMessageManager::new(comm, pool)),
            ManagerKind::Serial => Self::Serial(SerialMessageManager::new(comm)),
        }
    }
}

macro_rules! delegate {
    ($self:ident, $mgr:ident => $body:expr) => {
        match $self {
            AnyMessageManager::Parallel($mgr) => $body,
            AnyMessageManager::Pooled($mgr) => $body,
            AnyMessageManager::Serial($mgr) => $body,
        }
    };
}

impl<M: MsgPayload, C: MessageExchange<Routed<M>>> MessageManager<M> for AnyMessageManager<M, C> {
    fn start(&mut self) {
        delegate!(self, m => m.start())
    }

    fn finalize(&mut self) {
        delegate!(self, m => m.finalize())
    }

    fn reserve(&mut self, volume: MessageVolume, threads: usize) {
        delegate!(self, m => m.reserve(volume, threads))
    }

    fn init_channels(&mut self, n: usize) {
        delegate!(self, m => m.init_channels(n))
    }

    fn channels(&mut self) -> &mut [MessageChannel<M>] {
        delegate!(self, m => m.channels())
    }

    fn send_through_out_edges<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        v: Vertex,
        msg: M,
        channel_id: usize,
    ) {
        delegate!(self, m => m.send_through_out_edges(frag, v, msg, channel_id))
    }

    fn sync_state_on_outer_vertex<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        u: Vertex,
        msg: M,
        channel_id: usize,
    ) {
        delegate!(self, m => m.sync_state_on_outer_vertex(frag, u, msg, channel_id))
    }

    fn parallel_process<V: Payload + Default, E: Payload, F>(
        &mut self,
        threads: usize,
        frag: &Fragment<V, E>,
        op: F,
    ) -> Result<(), GraphError>
    where
        F: Fn(usize, Vertex, &M) + Send + Sync,
    {
        delegate!(self, m => m.parallel_process(threads, frag, op))
    }

    fn force_continue(&self) {
        delegate!(self, m => m.force_continue())
    }

    fn start_a_round(&mut self) {
        delegate!(self, m => m.start_a_round())
    }

    fn finish_a_round(&mut self) {
        delegate!(self, m => m.finish_a_round())
    }

    fn to_terminate(&self) -> bool {
        delegate!(self, m => m.to_terminate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        comm::local::LocalProcessGroup,
        core::{
            fragment::{MessageStrategy, PrepareConf},
            Empty,
        },
        engine::custom_pool,
    };
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn solo_fragment() -> Fragment<Empty, Empty> {
        let mut b = Fragment::builder(0, 1);
        b.add_vertex(0, Empty).add_vertex(1, Empty);
        b.add_edge(0, 1, Empty);
        let mut frag = b.build().unwrap();
        frag.prepare(PrepareConf {
            message_strategy: MessageStrategy::AlongOutgoingEdgeToOuterVertex,
        })
        .unwrap();
        frag
    }

    #[test]
    fn quiet_round_terminates_a_solo_group() {
        let comm = LocalProcessGroup::single::<Routed<u64>>();
        let mut mgr: ParallelMessageManager<u64, _> =
            ParallelMessageManager::new(comm, custom_pool(2));
        mgr.start();
        mgr.init_channels(2);
        mgr.start_a_round();
        mgr.finish_a_round();
        assert!(mgr.to_terminate());
    }

    #[test]
    fn force_continue_defers_termination_by_one_round() {
        let comm = LocalProcessGroup::single::<Routed<u64>>();
        let mut mgr: SerialMessageManager<u64, _> = SerialMessageManager::new(comm);
        mgr.start();
        mgr.start_a_round();
        mgr.force_continue();
        mgr.finish_a_round();
        assert!(!mgr.to_terminate());
        mgr.start_a_round();
        mgr.finish_a_round();
        assert!(mgr.to_terminate());
    }

    #[test]
    fn process_before_any_exchange_sees_no_messages() {
        let comm = LocalProcessGroup::single::<Routed<u64>>();
        let mut mgr: SerialMessageManager<u64, _> = SerialMessageManager::new(comm);
        let frag = solo_fragment();
        mgr.start();
        mgr.start_a_round();
        let seen = AtomicUsize::new(0);
        mgr.parallel_process(1, &frag, |_tid, _v, _msg: &u64| {
            seen.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn buffer_pool_hands_recycled_capacity_back() {
        let mut pool: MessageBufferPool<u64> = MessageBufferPool::new();
        pool.reserve(8, 1);
        let seeded = pool.take();
        assert!(seeded.capacity() >= 8);
        let mut spent: Vec<Routed<u64>> = Vec::with_capacity(32);
        spent.push((0, 1));
        pool.put(spent);
        let recycled = pool.take();
        assert!(recycled.is_empty());
        assert!(recycled.capacity() >= 32);
    }

    #[test]
    fn pooled_manager_runs_the_round_protocol() {
        let comm = LocalProcessGroup::single::<Routed<u64>>();
        let mut mgr: PooledMessageManager<u64, _> =
            PooledMessageManager::new(comm, custom_pool(2));
        mgr.reserve(MessageVolume { send: 4, recv: 4 }, 2);
        mgr.start();
        mgr.init_channels(2);
        mgr.start_a_round();
        mgr.force_continue();
        mgr.finish_a_round();
        assert!(!mgr.to_terminate());
        mgr.start_a_round();
        mgr.finish_a_round();
        assert!(mgr.to_terminate());
    }

    #[test]
    fn message_to_an_unknown_vertex_surfaces_as_an_error() {
        let comm = LocalProcessGroup::single::<Routed<u64>>();
        let mut mgr: SerialMessageManager<u64, _> = SerialMessageManager::new(comm);
        let frag = solo_fragment();
        mgr.start();
        mgr.start_a_round();
        mgr.finish_a_round();
        // forge an exchange round carrying a gid this fragment never saw
        mgr.state.staged = vec![(99, 7u64)];
        mgr.start_a_round();
        let err = mgr
            .parallel_process(1, &frag, |_tid, _v, _msg: &u64| {})
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownVertex(99)));
    }
}
