//! Community detection by synchronous label propagation (CDLP).
//!
//! Every vertex starts in its own community, labelled with its global id. In
//! each round a vertex adopts the label most frequent among its neighbours,
//! breaking ties towards the smaller label, until the round limit is reached.
//! Labels of the previous round are read everywhere: fragment-local copies
//! are swapped at the round boundary and mirror copies are refreshed by a
//! message from the owning rank, so a distributed run converges exactly like
//! a single-rank one.
//!
//! Graphs are treated as undirected; load each edge in both directions.

use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    core::{
        errors::GraphError,
        fragment::{Fragment, LoadStrategy, MessageStrategy},
        vertex::VertexArray,
        Empty,
    },
    engine::{
        app::{App, MessageVolume},
        context::FragmentContext,
        messages::MessageManager,
        parallel::ParallelEngine,
    },
};

/// Picks a vertex's next label from its neighbourhood.
pub trait LabelReducer: Send + Sync + 'static {
    /// `labels` holds one entry per visible neighbour; empty when the vertex
    /// has none, in which case the current label should survive.
    fn reduce(&self, current: u64, labels: &[u64]) -> u64;
}

/// The standard CDLP rule: most frequent label, ties broken towards the
/// smallest.
#[derive(Clone, Copy, Debug, Default)]
pub struct MostFrequentMinLabel;

impl LabelReducer for MostFrequentMinLabel {
    fn reduce(&self, current: u64, labels: &[u64]) -> u64 {
        if labels.is_empty() {
            return current;
        }
        let mut counts: FxHashMap<u64, usize> = FxHashMap::default();
        for &label in labels {
            *counts.entry(label).or_insert(0) += 1;
        }
        let mut best = current;
        let mut best_count = 0;
        for (&label, &count) in &counts {
            if count > best_count || (count == best_count && label < best) {
                best = label;
                best_count = count;
            }
        }
        best
    }
}

/// Decides whose labels take part in propagation, from the per-vertex secret
/// flag.
pub trait VisibilityGate: Send + Sync + 'static {
    fn visible(&self, secret: bool) -> bool;
}

/// Every vertex propagates its label.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllVertices;

impl VisibilityGate for AllVertices {
    fn visible(&self, _secret: bool) -> bool {
        true
    }
}

/// Labels of vertices flagged secret are hidden from their neighbours. The
/// flagged vertices still listen and keep adopting labels themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct PublicOnly;

impl VisibilityGate for PublicOnly {
    fn visible(&self, secret: bool) -> bool {
        !secret
    }
}

/// A label adopted by `source`, broadcast so other ranks refresh their
/// read-only copy of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelUpdate {
    pub source: u64,
    pub label: u64,
}

pub struct Cdlp<R = MostFrequentMinLabel, G = AllVertices> {
    reducer: R,
    gate: G,
}

impl Cdlp {
    pub fn new() -> Self {
        Self::with(MostFrequentMinLabel, AllVertices)
    }
}

impl Default for Cdlp {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: LabelReducer, G: VisibilityGate> Cdlp<R, G> {
    pub fn with(reducer: R, gate: G) -> Self {
        Self { reducer, gate }
    }

    // One propagation pass: gather visible neighbour labels, reduce, and on a
    // change send the new label towards each cross-fragment neighbour so the
    // mirrors of this vertex get refreshed. New labels are applied after the
    // pass; within a round everyone reads the previous round's values.
    fn propagate<MM: MessageManager<LabelUpdate>>(
        &self,
        frag: &Fragment<Empty, Empty>,
        ctx: &CdlpContext,
        messages: &mut MM,
        engine: &ParallelEngine,
    ) {
        let inner = frag.inner_vertices();
        let new_labels: Vec<AtomicU64> = (0..inner.len()).map(|_| AtomicU64::new(0)).collect();
        let labels = &ctx.labels;
        engine.for_each_with_channels(inner, messages.channels(), |task, v| {
            let mut seen = Vec::new();
            for e in frag.outgoing_edges(v) {
                if self.gate.visible(frag.secret(e.neighbor)) {
                    seen.push(labels[e.neighbor].load(Ordering::Relaxed));
                }
            }
            let current = labels[v].load(Ordering::Relaxed);
            let next = self.reducer.reduce(current, &seen);
            new_labels[v.index()].store(next, Ordering::Relaxed);
            if next != current {
                task.send_through_out_edges(
                    frag,
                    v,
                    LabelUpdate {
                        source: frag.vertex_id(v),
                        label: next,
                    },
                );
            }
        });
        for v in inner {
            ctx.labels[v].store(new_labels[v.index()].load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }
}

pub struct CdlpContext {
    labels: VertexArray<AtomicU64>,
    step: usize,
    max_round: usize,
}

impl CdlpContext {
    pub fn label(&self, v: crate::core::vertex::Vertex) -> u64 {
        self.labels[v].load(Ordering::Relaxed)
    }
}

impl FragmentContext<Empty, Empty> for CdlpContext {
    type Args = usize;

    fn create(frag: &Fragment<Empty, Empty>) -> Self {
        Self {
            labels: VertexArray::from_fn(frag.total_vertex_count(), |_| AtomicU64::new(0)),
            step: 0,
            max_round: 0,
        }
    }

    fn init(&mut self, frag: &Fragment<Empty, Empty>, max_round: usize) {
        self.labels = VertexArray::from_fn(frag.total_vertex_count(), |_| AtomicU64::new(0));
        self.step = 0;
        self.max_round = max_round;
    }

    fn output(
        &self,
        frag: &Fragment<Empty, Empty>,
        w: &mut dyn std::io::Write,
    ) -> std::io::Result<()> {
        for v in frag.inner_vertices() {
            writeln!(w, "{} {}", frag.vertex_id(v), self.label(v))?;
        }
        Ok(())
    }
}

impl<R: LabelReducer, G: VisibilityGate> App for Cdlp<R, G> {
    type VData = Empty;
    type EData = Empty;
    type Msg = LabelUpdate;
    type Ctx = CdlpContext;

    const MESSAGE_STRATEGY: MessageStrategy = MessageStrategy::AlongOutgoingEdgeToOuterVertex;
    const LOAD_STRATEGY: LoadStrategy = LoadStrategy::OnlyOut;

    // every inner vertex changes its label at most once per round
    fn estimate_message_volume(&self, frag: &Fragment<Empty, Empty>) -> MessageVolume {
        MessageVolume {
            send: frag.inner_vertex_count(),
            recv: frag.outer_vertex_count(),
        }
    }

    fn p_eval<MM: MessageManager<LabelUpdate>>(
        &self,
        frag: &Fragment<Empty, Empty>,
        ctx: &mut CdlpContext,
        messages: &mut MM,
        engine: &ParallelEngine,
    ) -> Result<(), GraphError> {
        messages.init_channels(engine.thread_num());
        ctx.step = 1;
        for v in frag.inner_vertices().chain(frag.outer_vertices()) {
            ctx.labels[v].store(frag.vertex_id(v), Ordering::Relaxed);
        }
        if ctx.step > ctx.max_round {
            return Ok(());
        }
        messages.force_continue();
        self.propagate(frag, ctx, messages, engine);
        Ok(())
    }

    fn inc_eval<MM: MessageManager<LabelUpdate>>(
        &self,
        frag: &Fragment<Empty, Empty>,
        ctx: &mut CdlpContext,
        messages: &mut MM,
        engine: &ParallelEngine,
    ) -> Result<(), GraphError> {
        ctx.step += 1;
        let labels = &ctx.labels;
        messages.parallel_process(engine.thread_num(), frag, |_tid, _v, msg: &LabelUpdate| {
            match frag.local_vertex(msg.source) {
                Ok(lv) => labels[lv.vertex].store(msg.label, Ordering::Relaxed),
                Err(_) => {
                    tracing::warn!(source = msg.source, "label update without a local copy")
                }
            }
        })?;
        if ctx.step > ctx.max_round {
            return Ok(());
        }
        messages.force_continue();
        self.propagate(frag, ctx, messages, engine);
        Ok(())
    }
}
