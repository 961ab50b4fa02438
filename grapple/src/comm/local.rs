use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Barrier,
};

use parking_lot::Mutex;

use super::{Collectives, MessageExchange};

/// An in-process group: every "rank" is a thread of the current process.
///
/// This is the reference implementation of the collective substrate, used for
/// single-machine runs and for exercising the full multi-fragment protocol in
/// tests. A message-passing runtime (e.g. MPI) can replace it behind the same
/// traits.
pub struct LocalProcessGroup;

impl LocalProcessGroup {
    /// Creates `world` connected handles, one per rank, in rank order.
    pub fn create<M: Send + 'static>(world: usize) -> Vec<LocalComm<M>> {
        assert!(world > 0, "a process group needs at least one rank");
        let shared = Arc::new(Shared {
            barrier: Barrier::new(world),
            flags: (0..world).map(|_| AtomicBool::new(false)).collect(),
            mailboxes: (0..world).map(|_| Mutex::new(Vec::new())).collect(),
        });
        (0..world)
            .map(|rank| LocalComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// A group of one, for single-fragment runs.
    pub fn single<M: Send + 'static>() -> LocalComm<M> {
        Self::create(1).pop().expect("world size is 1")
    }
}

struct Shared<M> {
    barrier: Barrier,
    flags: Vec<AtomicBool>,
    mailboxes: Vec<Mutex<Vec<M>>>,
}

/// One rank's handle onto a [`LocalProcessGroup`].
pub struct LocalComm<M> {
    rank: usize,
    shared: Arc<Shared<M>>,
}

impl<M> Clone for LocalComm<M> {
    fn clone(&self) -> Self {
        Self {
            rank: self.rank,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Send + 'static> Collectives for LocalComm<M> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.flags.len()
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn or_all(&self, local: bool) -> bool {
        self.shared.flags[self.rank].store(local, Ordering::Relaxed);
        self.shared.barrier.wait();
        let any = self.shared.flags.iter().any(|f| f.load(Ordering::Relaxed));
        // nobody may overwrite a flag before every rank has read the result
        self.shared.barrier.wait();
        any
    }
}

impl<M: Send + 'static> MessageExchange<M> for LocalComm<M> {
    fn exchange(&self, outgoing: Vec<Vec<M>>) -> Vec<M> {
        debug_assert_eq!(outgoing.len(), self.world_size());
        for (rank, msgs) in outgoing.into_iter().enumerate() {
            if !msgs.is_empty() {
                self.shared.mailboxes[rank].lock().extend(msgs);
            }
        }
        self.shared.barrier.wait();
        let received = std::mem::take(&mut *self.shared.mailboxes[self.rank].lock());
        self.shared.barrier.wait();
        received
    }
}
