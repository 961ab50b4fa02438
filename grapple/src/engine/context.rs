use std::io;

use crate::core::{
    fragment::{Fragment, Mutation},
    Payload,
};

/// Per-fragment mutable state an application threads through its supersteps.
///
/// A context is created once per worker, re-initialised at the start of every
/// query with that query's arguments, and asked for its results after the
/// group terminates. Applications that rewrite the graph between rounds hand
/// their pending changes back through [`take_mutation`].
///
/// [`take_mutation`]: FragmentContext::take_mutation
pub trait FragmentContext<V: Payload + Default, E: Payload>: Send + 'static {
    /// Query arguments, e.g. a round limit or a source vertex.
    type Args;

    fn create(frag: &Fragment<V, E>) -> Self;

    fn init(&mut self, frag: &Fragment<V, E>, args: Self::Args);

    /// Writes this fragment's share of the result, one record per inner
    /// vertex by convention.
    fn output(&self, frag: &Fragment<V, E>, w: &mut dyn io::Write) -> io::Result<()>;

    /// Drains graph changes requested during the round just evaluated. The
    /// worker applies them at the round boundary, before messages flow.
    fn take_mutation(&mut self) -> Option<Mutation<V, E>> {
        None
    }
}
