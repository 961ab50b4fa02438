use std::sync::Arc;

use rayon::ThreadPool;

use super::{channel::MessageChannel, custom_pool, POOL};
use crate::core::vertex::{Vertex, VertexRange};

/// Fans per-vertex evaluation across a fixed thread pool.
///
/// Vertices are split into contiguous chunks, one chunk per task, so the
/// thread id handed to the closure is stable for the duration of the call and
/// iteration within a chunk follows the input order. The call blocks until
/// every vertex has been processed; a panic inside the closure aborts the
/// whole round.
pub struct ParallelEngine {
    pool: Arc<ThreadPool>,
    threads: usize,
}

impl ParallelEngine {
    /// `threads: None` shares the global pool.
    pub fn new(threads: Option<usize>) -> Self {
        let pool = threads.map(custom_pool).unwrap_or_else(|| POOL.clone());
        let threads = pool.current_num_threads();
        Self { pool, threads }
    }

    pub fn thread_num(&self) -> usize {
        self.threads
    }

    pub(crate) fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Invokes `f(thread_id, vertex)` for every vertex in the range.
    pub fn for_each<F>(&self, vertices: VertexRange, f: F)
    where
        F: Fn(usize, Vertex) + Send + Sync,
    {
        self.pool.scope(|s| {
            for (tid, chunk) in vertices.chunks(self.threads).into_iter().enumerate() {
                let f = &f;
                s.spawn(move |_| {
                    for v in chunk {
                        f(tid, v);
                    }
                });
            }
        });
    }

    /// Like [`for_each`], but each task additionally owns exactly one message
    /// channel through its [`TaskCtx`]. The number of chunks equals
    /// `channels.len()`, which callers set up via
    /// [`MessageManager::init_channels`].
    ///
    /// [`for_each`]: ParallelEngine::for_each
    /// [`MessageManager::init_channels`]: crate::engine::messages::MessageManager::init_channels
    pub fn for_each_with_channels<M, F>(
        &self,
        vertices: VertexRange,
        channels: &mut [MessageChannel<M>],
        f: F,
    ) where
        M: Send,
        F: Fn(&mut TaskCtx<'_, M>, Vertex) + Send + Sync,
    {
        debug_assert!(!channels.is_empty(), "init_channels must run first");
        let chunks = vertices.chunks(channels.len());
        self.pool.scope(|s| {
            for (tid, (chunk, channel)) in chunks.into_iter().zip(channels.iter_mut()).enumerate()
            {
                let f = &f;
                s.spawn(move |_| {
                    let mut ctx = TaskCtx {
                        thread_id: tid,
                        channel,
                    };
                    for v in chunk {
                        f(&mut ctx, v);
                    }
                });
            }
        });
    }
}

/// The per-task evaluation context: a stable thread id plus the one message
/// channel this task may write to.
pub struct TaskCtx<'a, M> {
    thread_id: usize,
    channel: &'a mut MessageChannel<M>,
}

impl<'a, M: Clone> TaskCtx<'a, M> {
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    pub fn channel(&mut self) -> &mut MessageChannel<M> {
        self.channel
    }

    /// See [`MessageChannel::send_through_out_edges`].
    pub fn send_through_out_edges<V, E>(
        &mut self,
        frag: &crate::core::fragment::Fragment<V, E>,
        v: Vertex,
        msg: M,
    ) where
        V: crate::core::Payload + Default,
        E: crate::core::Payload,
    {
        self.channel.send_through_out_edges(frag, v, msg);
    }

    /// See [`MessageChannel::sync_state_on_outer_vertex`].
    pub fn sync_state_on_outer_vertex<V, E>(
        &mut self,
        frag: &crate::core::fragment::Fragment<V, E>,
        u: Vertex,
        msg: M,
    ) where
        V: crate::core::Payload + Default,
        E: crate::core::Payload,
    {
        self.channel.sync_state_on_outer_vertex(frag, u, msg);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn every_vertex_is_processed_exactly_once() {
        let engine = ParallelEngine::new(Some(4));
        let hits: Vec<AtomicUsize> = (0..100).map(|_| AtomicUsize::new(0)).collect();
        engine.for_each(VertexRange::new(0, 100), |_tid, v| {
            hits[v.index()].fetch_add(1, Ordering::Relaxed);
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn thread_ids_stay_within_the_pool() {
        let engine = ParallelEngine::new(Some(3));
        let max_tid = AtomicUsize::new(0);
        engine.for_each(VertexRange::new(0, 64), |tid, _v| {
            max_tid.fetch_max(tid, Ordering::Relaxed);
        });
        assert!(max_tid.load(Ordering::Relaxed) < 3);
    }

    #[test]
    fn channel_writes_stay_in_the_owning_chunk() {
        // 8 vertices, 4 channels: contiguous chunks of 2, each task records
        // its own vertices in its own channel only
        let engine = ParallelEngine::new(Some(4));
        let mut channels: Vec<MessageChannel<u64>> =
            (0..4).map(|_| MessageChannel::new(1)).collect();
        let recorded: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();
        engine.for_each_with_channels(
            VertexRange::new(0, 8),
            &mut channels,
            |ctx, v| {
                assert_eq!(v.index() / 2, ctx.thread_id());
                recorded[ctx.thread_id()].fetch_add(1, Ordering::Relaxed);
            },
        );
        assert!(recorded.iter().all(|r| r.load(Ordering::Relaxed) == 2));
    }
}
