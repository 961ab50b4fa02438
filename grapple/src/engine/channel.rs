use crate::core::{fragment::Fragment, vertex::Vertex, Payload};

/// Messages a channel hands to the exchange: `(destination gid, payload)`.
pub type Routed<M> = (u64, M);

pub(crate) const DEFAULT_BATCH_SIZE: usize = 4096;

/// Derives a per-destination buffer capacity from an application's send-volume
/// hint. Underestimation only costs a reallocation, never data.
pub(crate) fn estimate_channel_capacity(send_hint: usize, fnum: usize, threads: usize) -> usize {
    if send_hint == 0 {
        return 0;
    }
    send_hint
        .div_ceil(fnum.max(1) * threads.max(1))
        .min(DEFAULT_BATCH_SIZE)
}

/// A per-thread outgoing message buffer, partitioned by destination rank.
///
/// During a round a channel is owned exclusively by one evaluation task (see
/// [`TaskCtx`]), so sends never contend. At the round boundary the manager
/// drains every channel into one outbox per destination rank; the relative
/// order of messages from different channels is unspecified.
///
/// [`TaskCtx`]: crate::engine::parallel::TaskCtx
#[derive(Debug)]
pub struct MessageChannel<M> {
    buffers: Vec<Vec<Routed<M>>>,
}

impl<M: Clone> MessageChannel<M> {
    pub(crate) fn new(fnum: usize) -> Self {
        Self::with_capacity(fnum, 0)
    }

    pub(crate) fn with_capacity(fnum: usize, per_dest: usize) -> Self {
        Self {
            buffers: (0..fnum).map(|_| Vec::with_capacity(per_dest)).collect(),
        }
    }

    /// Enqueues `msg` to the owner of every outer out-neighbour of `v`, one
    /// copy per crossing edge. A vertex without outer-bound edges is a no-op.
    pub fn send_through_out_edges<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        v: Vertex,
        msg: M,
    ) {
        for &(owner, gid) in frag.outer_routes(v) {
            self.buffers[owner].push((gid, msg.clone()));
        }
    }

    /// Enqueues `msg` to the owner of every outer in-neighbour of `v`.
    /// Requires incoming adjacency to be loaded.
    pub fn send_through_in_edges<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        v: Vertex,
        msg: M,
    ) {
        let Ok(edges) = frag.incoming_edges(v) else {
            debug_assert!(false, "send_through_in_edges without incoming adjacency");
            return;
        };
        for e in edges {
            if frag.is_outer_vertex(e.neighbor) {
                self.buffers[frag.owner(e.neighbor)]
                    .push((frag.vertex_id(e.neighbor), msg.clone()));
            }
        }
    }

    /// Enqueues `msg` along both directions.
    pub fn send_through_edges<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        v: Vertex,
        msg: M,
    ) {
        self.send_through_out_edges(frag, v, msg.clone());
        self.send_through_in_edges(frag, v, msg);
    }

    /// Enqueues `msg` to the owner of one explicit mirror `u`.
    pub fn sync_state_on_outer_vertex<V: Payload + Default, E: Payload>(
        &mut self,
        frag: &Fragment<V, E>,
        u: Vertex,
        msg: M,
    ) {
        debug_assert!(frag.is_outer_vertex(u), "sync target must be a mirror");
        self.buffers[frag.owner(u)].push((frag.vertex_id(u), msg));
    }

    /// Number of buffered messages across all destinations.
    pub fn message_count(&self) -> usize {
        self.buffers.iter().map(Vec::len).sum()
    }

    pub(crate) fn drain_into(&mut self, outbox: &mut [Vec<Routed<M>>]) {
        debug_assert_eq!(outbox.len(), self.buffers.len());
        for (rank, buf) in self.buffers.iter_mut().enumerate() {
            outbox[rank].append(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        fragment::{LoadStrategy, MessageStrategy, PrepareConf},
        Empty,
    };
    use pretty_assertions::assert_eq;

    fn prepared_fragment() -> Fragment<Empty, Empty> {
        let mut b = Fragment::builder(0, 2)
            .partitioner(|gid: u64| -> usize { usize::from(gid > 2) });
        b.add_vertex(1, Empty).add_vertex(2, Empty);
        b.add_edge(1, 2, Empty).add_edge(2, 3, Empty).add_edge(2, 4, Empty);
        let mut frag = b.build().unwrap();
        frag.prepare(PrepareConf {
            message_strategy: MessageStrategy::AlongOutgoingEdgeToOuterVertex,
        })
        .unwrap();
        frag
    }

    #[test]
    fn fan_out_targets_only_mirrors() {
        let frag = prepared_fragment();
        let mut channel = MessageChannel::new(2);
        let v2 = frag.vertex(2).unwrap();
        channel.send_through_out_edges(&frag, v2, 7u64);
        // 2 -> 2 stays local, 2 -> 3 and 2 -> 4 cross to rank 1
        assert_eq!(channel.message_count(), 2);
        let mut outbox = vec![Vec::new(), Vec::new()];
        channel.drain_into(&mut outbox);
        assert_eq!(outbox[0], vec![]);
        let mut to_one = outbox[1].clone();
        to_one.sort_unstable();
        assert_eq!(to_one, vec![(3, 7), (4, 7)]);
    }

    #[test]
    fn send_without_crossing_edges_is_a_no_op() {
        let frag = prepared_fragment();
        let mut channel = MessageChannel::new(2);
        let v1 = frag.vertex(1).unwrap();
        channel.send_through_out_edges(&frag, v1, 7u64);
        assert_eq!(channel.message_count(), 0);
    }

    fn bidirectional_fragment() -> Fragment<Empty, Empty> {
        let mut b = Fragment::builder(0, 2)
            .load_strategy(LoadStrategy::BothOutIn)
            .partitioner(|gid: u64| -> usize { usize::from(gid > 2) });
        b.add_vertex(1, Empty).add_vertex(2, Empty);
        b.add_edge(1, 2, Empty).add_edge(3, 2, Empty).add_edge(2, 4, Empty);
        let mut frag = b.build().unwrap();
        frag.prepare(PrepareConf {
            message_strategy: MessageStrategy::AlongEdgeToOuterVertex,
        })
        .unwrap();
        frag
    }

    #[test]
    fn in_edge_fan_out_reaches_the_upstream_owner() {
        let frag = bidirectional_fragment();
        let mut channel = MessageChannel::new(2);
        let v2 = frag.vertex(2).unwrap();
        channel.send_through_in_edges(&frag, v2, 5u64);
        // 1 -> 2 stays local, only 3 -> 2 crosses
        let mut outbox = vec![Vec::new(), Vec::new()];
        channel.drain_into(&mut outbox);
        assert_eq!(outbox[0], vec![]);
        assert_eq!(outbox[1], vec![(3, 5)]);
    }

    #[test]
    fn in_edge_send_without_outer_upstreams_is_a_no_op() {
        let frag = bidirectional_fragment();
        let mut channel = MessageChannel::new(2);
        let v1 = frag.vertex(1).unwrap();
        channel.send_through_in_edges(&frag, v1, 5u64);
        assert_eq!(channel.message_count(), 0);
    }

    #[test]
    fn both_direction_send_covers_upstream_and_downstream_mirrors() {
        let frag = bidirectional_fragment();
        let mut channel = MessageChannel::new(2);
        let v2 = frag.vertex(2).unwrap();
        channel.send_through_edges(&frag, v2, 9u64);
        let mut outbox = vec![Vec::new(), Vec::new()];
        channel.drain_into(&mut outbox);
        assert_eq!(outbox[0], vec![]);
        let mut to_one = outbox[1].clone();
        to_one.sort_unstable();
        assert_eq!(to_one, vec![(3, 9), (4, 9)]);
    }

    #[test]
    fn sync_addresses_one_mirror() {
        let frag = prepared_fragment();
        let mut channel = MessageChannel::new(2);
        let v3 = frag.vertex(3).unwrap();
        channel.sync_state_on_outer_vertex(&frag, v3, 9u64);
        let mut outbox = vec![Vec::new(), Vec::new()];
        channel.drain_into(&mut outbox);
        assert_eq!(outbox[1], vec![(3, 9)]);
    }

    #[test]
    fn capacity_estimate_is_bounded() {
        assert_eq!(estimate_channel_capacity(0, 2, 4), 0);
        assert_eq!(estimate_channel_capacity(80, 2, 4), 10);
        assert_eq!(
            estimate_channel_capacity(usize::MAX / 2, 2, 4),
            DEFAULT_BATCH_SIZE
        );
    }
}
