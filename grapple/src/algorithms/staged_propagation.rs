//! Staged value forwarding over typed vertices.
//!
//! A query names a pipeline of vertex classes, e.g. `[0, 1, 2]`. Vertices of
//! the first class start with a seed value; round by round the value moves
//! one hop down the pipeline, only ever from a vertex of the current class to
//! out-neighbours of the next. Intermediate hops pass the value through
//! unchanged (concurrent writers race, last write wins); the final hop
//! multiplies it by the edge weight and accumulates into the target. The
//! round count is the pipeline length, so wide graphs finish in a handful of
//! supersteps.
//!
//! Cross-fragment hops rely on mirror vertex data: a mirror created without
//! an explicit class defaults to `0` and the class gate will not see it, so
//! loaders must register mirrors with [`FragmentBuilder::mirror`].
//!
//! [`FragmentBuilder::mirror`]: crate::core::fragment::FragmentBuilder::mirror

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::{
    core::{
        errors::GraphError,
        fragment::{Fragment, LoadStrategy, MessageStrategy},
        vertex::VertexArray,
    },
    engine::{
        app::App, context::FragmentContext, messages::MessageManager, parallel::ParallelEngine,
    },
};

/// Arguments of one staged run.
#[derive(Clone, Debug)]
pub struct StagedQuery {
    /// Vertex classes the value visits, in order. Must name at least two.
    pub stages: Vec<i32>,
    /// Value planted on every vertex of the first class.
    pub seed: i64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StagedPropagation;

pub struct StagedContext {
    values: VertexArray<AtomicI64>,
    active: VertexArray<AtomicBool>,
    stages: Vec<i32>,
    seed: i64,
    step: usize,
}

impl StagedContext {
    pub fn value(&self, v: crate::core::vertex::Vertex) -> i64 {
        self.values[v].load(Ordering::Relaxed)
    }

    fn reset(&mut self, frag: &Fragment<i32, i64>) {
        self.values = VertexArray::from_fn(frag.total_vertex_count(), |_| AtomicI64::new(0));
        self.active = VertexArray::from_fn(frag.total_vertex_count(), |_| AtomicBool::new(false));
    }
}

impl FragmentContext<i32, i64> for StagedContext {
    type Args = StagedQuery;

    fn create(frag: &Fragment<i32, i64>) -> Self {
        let mut ctx = Self {
            values: VertexArray::from_fn(0, |_| AtomicI64::new(0)),
            active: VertexArray::from_fn(0, |_| AtomicBool::new(false)),
            stages: Vec::new(),
            seed: 0,
            step: 0,
        };
        ctx.reset(frag);
        ctx
    }

    fn init(&mut self, frag: &Fragment<i32, i64>, args: StagedQuery) {
        self.reset(frag);
        self.stages = args.stages;
        self.seed = args.seed;
        self.step = 0;
    }

    fn output(&self, frag: &Fragment<i32, i64>, w: &mut dyn std::io::Write) -> std::io::Result<()> {
        let last = self.stages.last().copied().unwrap_or_default();
        for v in frag.inner_vertices() {
            if *frag.vertex_data(v) == last {
                writeln!(w, "{} {}", frag.vertex_id(v), self.value(v))?;
            }
        }
        Ok(())
    }
}

impl StagedPropagation {
    // Pushes one hop: step `s` moves values from class `stages[s - 1]` to
    // class `stages[s]`. Inner targets are written directly; a hop onto a
    // mirror hands the contribution to the owning rank instead.
    fn push_hop<MM: MessageManager<i64>>(
        frag: &Fragment<i32, i64>,
        ctx: &StagedContext,
        messages: &mut MM,
        engine: &ParallelEngine,
    ) {
        let from = ctx.stages[ctx.step - 1];
        let to = ctx.stages[ctx.step];
        let final_hop = ctx.step + 1 == ctx.stages.len();
        let values = &ctx.values;
        let active = &ctx.active;
        engine.for_each_with_channels(frag.inner_vertices(), messages.channels(), |task, v| {
            if *frag.vertex_data(v) != from || !active[v].load(Ordering::Relaxed) {
                return;
            }
            let value = values[v].load(Ordering::Relaxed);
            for e in frag.outgoing_edges(v) {
                let u = e.neighbor;
                if *frag.vertex_data(u) != to {
                    continue;
                }
                let contribution = if final_hop { value * e.data } else { value };
                if frag.is_inner_vertex(u) {
                    if final_hop {
                        values[u].fetch_add(contribution, Ordering::Relaxed);
                    } else {
                        values[u].store(contribution, Ordering::Relaxed);
                        active[u].store(true, Ordering::Relaxed);
                    }
                } else {
                    task.sync_state_on_outer_vertex(frag, u, contribution);
                }
            }
        });
    }
}

impl App for StagedPropagation {
    type VData = i32;
    type EData = i64;
    type Msg = i64;
    type Ctx = StagedContext;

    const MESSAGE_STRATEGY: MessageStrategy = MessageStrategy::SyncOnOuterVertex;
    const LOAD_STRATEGY: LoadStrategy = LoadStrategy::OnlyOut;

    fn p_eval<MM: MessageManager<i64>>(
        &self,
        frag: &Fragment<i32, i64>,
        ctx: &mut StagedContext,
        messages: &mut MM,
        engine: &ParallelEngine,
    ) -> Result<(), GraphError> {
        messages.init_channels(engine.thread_num());
        ctx.step = 1;
        if ctx.stages.len() < 2 {
            tracing::warn!(stages = ctx.stages.len(), "pipeline too short to move");
            return Ok(());
        }
        let first = ctx.stages[0];
        for v in frag.inner_vertices() {
            if *frag.vertex_data(v) == first {
                ctx.values[v].store(ctx.seed, Ordering::Relaxed);
                ctx.active[v].store(true, Ordering::Relaxed);
            }
        }
        Self::push_hop(frag, ctx, messages, engine);
        messages.force_continue();
        Ok(())
    }

    fn inc_eval<MM: MessageManager<i64>>(
        &self,
        frag: &Fragment<i32, i64>,
        ctx: &mut StagedContext,
        messages: &mut MM,
        engine: &ParallelEngine,
    ) -> Result<(), GraphError> {
        ctx.step += 1;
        if ctx.step > ctx.stages.len() {
            return Ok(());
        }
        let expected = ctx.stages[ctx.step - 1];
        let final_hop = ctx.step == ctx.stages.len();
        let values = &ctx.values;
        let active = &ctx.active;
        messages.parallel_process(engine.thread_num(), frag, |_tid, v, msg: &i64| {
            if *frag.vertex_data(v) != expected {
                tracing::warn!(gid = frag.vertex_id(v), "contribution for the wrong stage");
                return;
            }
            if final_hop {
                values[v].fetch_add(*msg, Ordering::Relaxed);
            } else {
                values[v].store(*msg, Ordering::Relaxed);
                active[v].store(true, Ordering::Relaxed);
            }
        })?;
        if ctx.step < ctx.stages.len() {
            Self::push_hop(frag, ctx, messages, engine);
            messages.force_continue();
        }
        Ok(())
    }
}
