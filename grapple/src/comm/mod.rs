//! The process-group collective substrate.
//!
//! The engine depends on exactly four primitives: rank identity, a group
//! barrier, a group-wide logical-OR reduction (termination agreement) and an
//! all-to-all exchange keyed by destination rank. Anything richer (fault
//! tolerance, reordering protection beyond FIFO per pair) is out of scope.

pub mod local;

/// Rank identity and the two synchronization collectives.
///
/// Every rank of the group must invoke the collectives in the same order the
/// same number of times; the engine's round protocol guarantees this.
pub trait Collectives: Send + Sync + 'static {
    /// This process's rank, equal to the fid of the fragment it runs.
    fn rank(&self) -> usize;

    /// Number of ranks (and fragments) in the group.
    fn world_size(&self) -> usize;

    /// Blocks until every rank has reached the barrier.
    fn barrier(&self);

    /// Group-wide logical OR of `local`; all ranks observe the same result.
    fn or_all(&self, local: bool) -> bool;
}

/// All-to-all message exchange keyed by destination rank.
pub trait MessageExchange<M: Send>: Collectives {
    /// Delivers `outgoing[r]` to rank `r` and returns everything the other
    /// ranks addressed to this one, in unspecified order. Collective: blocks
    /// until the whole group has exchanged.
    fn exchange(&self, outgoing: Vec<Vec<M>>) -> Vec<M>;
}
