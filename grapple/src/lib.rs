//! grapple is a partitioned graph-computation engine following the
//! bulk-synchronous parallel (BSP) model.
//!
//! A graph is split into [`Fragment`]s, one per process rank. Every fragment
//! owns a set of *inner* vertices and keeps read-only mirrors (*outer*
//! vertices) of neighbours owned by other ranks. Computation proceeds in
//! synchronized rounds: each rank evaluates an [`App`] over its fragment,
//! messages produced along cross-fragment edges are exchanged at the round
//! boundary, and the whole group jointly decides when to stop.
//!
//! The crate is organised in four layers:
//!
//! - [`core`]: the vertex/fragment data model and global↔local id mapping.
//! - [`comm`]: the collective substrate (barrier, logical-OR reduction and
//!   all-to-all exchange). [`comm::local::LocalProcessGroup`] runs a group of
//!   ranks as threads of one process.
//! - [`engine`]: the superstep machinery: [`Worker`], message managers,
//!   per-thread channels and the rayon-backed parallel engine.
//! - [`algorithms`]: example applications exercising the extension points.
//!
//! [`Fragment`]: crate::core::fragment::Fragment
//! [`App`]: crate::engine::app::App
//! [`Worker`]: crate::engine::worker::Worker

pub mod algorithms;
pub mod comm;
pub mod core;
pub mod engine;

pub mod prelude {
    pub use crate::{
        comm::{
            local::{LocalComm, LocalProcessGroup},
            Collectives, MessageExchange,
        },
        core::{
            edge::AdjEdge,
            errors::GraphError,
            fragment::{
                Fragment, FragmentBuilder, LoadStrategy, MessageStrategy, Mutation, Partitioner,
                PrepareConf,
            },
            vertex::{LocalVertex, Vertex, VertexArray, VertexKind, VertexRange},
            Empty, MsgPayload, Payload,
        },
        engine::{
            app::{App, MessageVolume},
            channel::MessageChannel,
            context::FragmentContext,
            messages::{AnyMessageManager, ManagerKind, MessageManager},
            parallel::{ParallelEngine, TaskCtx},
            worker::{ParallelWorker, Worker},
            EngineSpec,
        },
    };
}
