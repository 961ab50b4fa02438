use std::{io, sync::Arc};

use crate::{
    comm::{Collectives, MessageExchange},
    core::{
        errors::GraphError,
        fragment::{Fragment, LoadStrategy, PrepareConf},
    },
    engine::{
        app::App,
        channel::Routed,
        context::FragmentContext,
        messages::{AnyMessageManager, MessageManager},
        parallel::ParallelEngine,
        EngineSpec,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    Created,
    Initialized,
    Running,
    Terminated,
}

impl WorkerState {
    fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Created => "created",
            WorkerState::Initialized => "initialized",
            WorkerState::Running => "running",
            WorkerState::Terminated => "terminated",
        }
    }
}

/// One rank of a distributed computation: a fragment, the application's
/// context for it, a message manager and a slice of the thread pool.
///
/// Workers advance in lockstep. `init` prepares the fragment for the
/// application's message strategy, `query` runs the superstep loop until the
/// group agrees to stop, `output` writes this fragment's share of the result.
pub struct Worker<A: App, MM, C> {
    app: Arc<A>,
    fragment: Fragment<A::VData, A::EData>,
    context: Option<A::Ctx>,
    messages: MM,
    comm: C,
    engine: ParallelEngine,
    state: WorkerState,
}

/// The stock worker wiring: manager variant picked at runtime from
/// [`EngineSpec`].
pub type ParallelWorker<A, C> = Worker<A, AnyMessageManager<<A as App>::Msg, C>, C>;

impl<A, C> ParallelWorker<A, C>
where
    A: App,
    C: MessageExchange<Routed<A::Msg>> + Clone,
{
    pub fn new(app: A, fragment: Fragment<A::VData, A::EData>, comm: C, spec: EngineSpec) -> Self {
        let engine = ParallelEngine::new(spec.threads);
        let messages = AnyMessageManager::from_kind(spec.manager, comm.clone(), engine.pool().clone());
        Self {
            app: Arc::new(app),
            fragment,
            context: None,
            messages,
            comm,
            engine,
            state: WorkerState::Created,
        }
    }
}

impl<A, MM, C> Worker<A, MM, C>
where
    A: App,
    MM: MessageManager<A::Msg>,
    C: Collectives,
{
    /// Prepares the fragment for the application and creates its context.
    /// Every rank must call this before any rank calls [`query`].
    ///
    /// [`query`]: Worker::query
    pub fn init(&mut self) -> Result<(), GraphError> {
        if self.state != WorkerState::Created {
            return Err(GraphError::InvalidWorkerState {
                expected: WorkerState::Created.as_str(),
                actual: self.state.as_str(),
            });
        }
        if A::LOAD_STRATEGY == LoadStrategy::BothOutIn
            && self.fragment.load_strategy() == LoadStrategy::OnlyOut
        {
            return Err(GraphError::LoadMismatch {
                required: A::LOAD_STRATEGY,
                loaded: self.fragment.load_strategy(),
            });
        }
        self.fragment.prepare(PrepareConf {
            message_strategy: A::MESSAGE_STRATEGY,
        })?;
        self.comm.barrier();
        self.context = Some(A::Ctx::create(&self.fragment));
        let volume = self.app.estimate_message_volume(&self.fragment);
        self.messages.reserve(volume, self.engine.thread_num());
        self.state = WorkerState::Initialized;
        Ok(())
    }

    /// Runs one query to completion: `p_eval` in the first round, `inc_eval`
    /// in every later one, with pending graph mutations applied and messages
    /// exchanged at each round boundary. Returns once the whole group
    /// terminated. A terminated worker may be queried again.
    pub fn query(&mut self, args: <A::Ctx as FragmentContext<A::VData, A::EData>>::Args) -> Result<(), GraphError> {
        if !matches!(
            self.state,
            WorkerState::Initialized | WorkerState::Terminated
        ) {
            return Err(GraphError::InvalidWorkerState {
                expected: WorkerState::Initialized.as_str(),
                actual: self.state.as_str(),
            });
        }
        let span = tracing::info_span!("query", fid = self.fragment.fid());
        let _enter = span.enter();
        self.state = WorkerState::Running;

        let Self {
            app,
            fragment,
            context,
            messages,
            engine,
            comm,
            ..
        } = self;
        let ctx = match context.as_mut() {
            Some(ctx) => ctx,
            None => {
                return Err(GraphError::InvalidWorkerState {
                    expected: WorkerState::Initialized.as_str(),
                    actual: WorkerState::Created.as_str(),
                })
            }
        };

        ctx.init(fragment, args);
        Self::apply_pending(ctx, fragment)?;
        messages.start();

        messages.start_a_round();
        app.p_eval(fragment, ctx, messages, engine)?;
        Self::apply_pending(ctx, fragment)?;
        messages.finish_a_round();

        let mut rounds = 1;
        while !messages.to_terminate() {
            rounds += 1;
            messages.start_a_round();
            app.inc_eval(fragment, ctx, messages, engine)?;
            Self::apply_pending(ctx, fragment)?;
            messages.finish_a_round();
        }

        comm.barrier();
        messages.finalize();
        self.state = WorkerState::Terminated;
        tracing::info!(rounds, "query terminated");
        Ok(())
    }

    /// Writes this fragment's result records. Only valid after a query
    /// terminated.
    pub fn output(&self, w: &mut dyn io::Write) -> Result<(), GraphError> {
        if self.state != WorkerState::Terminated {
            return Err(GraphError::InvalidWorkerState {
                expected: WorkerState::Terminated.as_str(),
                actual: self.state.as_str(),
            });
        }
        match self.context.as_ref() {
            Some(ctx) => ctx.output(&self.fragment, w).map_err(GraphError::from),
            None => Ok(()),
        }
    }

    pub fn fragment(&self) -> &Fragment<A::VData, A::EData> {
        &self.fragment
    }

    pub fn context(&self) -> Option<&A::Ctx> {
        self.context.as_ref()
    }

    fn apply_pending(
        ctx: &mut A::Ctx,
        fragment: &mut Fragment<A::VData, A::EData>,
    ) -> Result<(), GraphError> {
        if let Some(mutation) = ctx.take_mutation() {
            if !mutation.is_empty() {
                fragment.apply_mutation(mutation)?;
                fragment.prepare(PrepareConf {
                    message_strategy: A::MESSAGE_STRATEGY,
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        comm::local::{LocalComm, LocalProcessGroup},
        core::{
            fragment::{MessageStrategy, Mutation},
            Empty,
        },
        engine::messages::ManagerKind,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    type Comm = LocalComm<Routed<u64>>;

    fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("grapple=debug")
            .try_init();
    }

    fn spec() -> EngineSpec {
        EngineSpec::default().with_threads(2)
    }

    // Every inner vertex broadcasts gid * 10 along its out edges in the
    // first round; later rounds only record what arrived.
    struct Broadcast;

    #[derive(Default)]
    struct BroadcastCtx {
        received: Mutex<Vec<(u64, u64)>>,
        inc_rounds: usize,
    }

    impl FragmentContext<Empty, Empty> for BroadcastCtx {
        type Args = ();

        fn create(_frag: &Fragment<Empty, Empty>) -> Self {
            Self::default()
        }

        fn init(&mut self, _frag: &Fragment<Empty, Empty>, _args: ()) {
            self.received.lock().clear();
            self.inc_rounds = 0;
        }

        fn output(&self, _frag: &Fragment<Empty, Empty>, w: &mut dyn io::Write) -> io::Result<()> {
            for (gid, msg) in self.received.lock().iter() {
                writeln!(w, "{gid} {msg}")?;
            }
            Ok(())
        }
    }

    impl App for Broadcast {
        type VData = Empty;
        type EData = Empty;
        type Msg = u64;
        type Ctx = BroadcastCtx;

        const MESSAGE_STRATEGY: MessageStrategy = MessageStrategy::AlongOutgoingEdgeToOuterVertex;
        const LOAD_STRATEGY: LoadStrategy = LoadStrategy::OnlyOut;

        fn p_eval<MM: MessageManager<u64>>(
            &self,
            frag: &Fragment<Empty, Empty>,
            _ctx: &mut BroadcastCtx,
            messages: &mut MM,
            engine: &ParallelEngine,
        ) -> Result<(), GraphError> {
            messages.init_channels(engine.thread_num());
            for v in frag.inner_vertices() {
                let gid = frag.vertex_id(v);
                messages.send_through_out_edges(frag, v, gid * 10, 0);
            }
            Ok(())
        }

        fn inc_eval<MM: MessageManager<u64>>(
            &self,
            frag: &Fragment<Empty, Empty>,
            ctx: &mut BroadcastCtx,
            messages: &mut MM,
            engine: &ParallelEngine,
        ) -> Result<(), GraphError> {
            ctx.inc_rounds += 1;
            let received = &ctx.received;
            messages.parallel_process(engine.thread_num(), frag, |_tid, v, msg: &u64| {
                received.lock().push((frag.vertex_id(v), *msg));
            })?;
            Ok(())
        }
    }

    fn two_rank_fragments() -> (Fragment<Empty, Empty>, Fragment<Empty, Empty>) {
        let part = |gid: u64| -> usize {
            if gid <= 2 {
                0
            } else {
                1
            }
        };
        let mut a = Fragment::builder(0, 2).partitioner(part);
        a.add_vertex(1, Empty).add_vertex(2, Empty);
        a.add_edge(1, 2, Empty).add_edge(2, 3, Empty);
        let mut b = Fragment::builder(1, 2).partitioner(part);
        b.add_vertex(3, Empty).add_vertex(4, Empty);
        b.add_edge(3, 4, Empty);
        (a.build().unwrap(), b.build().unwrap())
    }

    #[test]
    fn message_crosses_fragments_and_group_terminates() {
        init_test_logging();
        let comms = LocalProcessGroup::create::<Routed<u64>>(2);
        let (frag_a, frag_b) = two_rank_fragments();
        let fragments = vec![frag_a, frag_b];

        let results: Vec<(Vec<(u64, u64)>, usize)> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .zip(fragments)
                .map(|(comm, frag)| {
                    s.spawn(move || {
                        let mut worker: ParallelWorker<Broadcast, Comm> =
                            ParallelWorker::new(Broadcast, frag, comm, spec());
                        worker.init().unwrap();
                        worker.query(()).unwrap();
                        let ctx = worker.context().unwrap();
                        let received = ctx.received.lock().clone();
                        (received, ctx.inc_rounds)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // rank 0's vertex 2 reaches its mirror of 3; the authoritative copy on
        // rank 1 sees the payload exactly once, one round after it was sent
        assert_eq!(results[0].0, vec![]);
        assert_eq!(results[1].0, vec![(3, 20)]);
        // the quiet second round is the one that terminates the group
        assert_eq!(results[0].1, 1);
        assert_eq!(results[1].1, 1);
    }

    #[test]
    fn pooled_manager_delivers_like_the_default() {
        init_test_logging();
        let comms = LocalProcessGroup::create::<Routed<u64>>(2);
        let (frag_a, frag_b) = two_rank_fragments();
        let fragments = vec![frag_a, frag_b];

        let results: Vec<Vec<(u64, u64)>> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .zip(fragments)
                .map(|(comm, frag)| {
                    s.spawn(move || {
                        let mut worker: ParallelWorker<Broadcast, Comm> = ParallelWorker::new(
                            Broadcast,
                            frag,
                            comm,
                            spec().manager(ManagerKind::Pooled),
                        );
                        worker.init().unwrap();
                        worker.query(()).unwrap();
                        let received = worker.context().unwrap().received.lock().clone();
                        received
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results[0], vec![]);
        assert_eq!(results[1], vec![(3, 20)]);
    }

    #[test]
    fn worker_enforces_state_transitions() {
        let comm = LocalProcessGroup::single::<Routed<u64>>();
        let mut a = Fragment::builder(0, 1);
        a.add_vertex(1, Empty);
        let frag = a.build().unwrap();
        let mut worker: ParallelWorker<Broadcast, Comm> =
            ParallelWorker::new(Broadcast, frag, comm, spec());

        assert!(matches!(
            worker.query(()),
            Err(GraphError::InvalidWorkerState { .. })
        ));
        let mut out: Vec<u8> = Vec::new();
        assert!(matches!(
            worker.output(&mut out),
            Err(GraphError::InvalidWorkerState { .. })
        ));
        worker.init().unwrap();
        assert!(matches!(
            worker.init(),
            Err(GraphError::InvalidWorkerState { .. })
        ));
        worker.query(()).unwrap();
        out.clear();
        worker.output(&mut out).unwrap();
        // terminated workers accept another query
        worker.query(()).unwrap();
    }

    // Forces a fixed number of rounds without sending a single message, then
    // goes quiet and lets the termination agreement fire.
    struct Rounded;

    #[derive(Default)]
    struct RoundedCtx {
        step: usize,
        max_round: usize,
        p_evals: usize,
        inc_evals: usize,
    }

    impl FragmentContext<Empty, Empty> for RoundedCtx {
        type Args = usize;

        fn create(_frag: &Fragment<Empty, Empty>) -> Self {
            Self::default()
        }

        fn init(&mut self, _frag: &Fragment<Empty, Empty>, max_round: usize) {
            *self = Self {
                max_round,
                ..Self::default()
            };
        }

        fn output(&self, _frag: &Fragment<Empty, Empty>, _w: &mut dyn io::Write) -> io::Result<()> {
            Ok(())
        }
    }

    impl App for Rounded {
        type VData = Empty;
        type EData = Empty;
        type Msg = u64;
        type Ctx = RoundedCtx;

        const MESSAGE_STRATEGY: MessageStrategy = MessageStrategy::AlongOutgoingEdgeToOuterVertex;
        const LOAD_STRATEGY: LoadStrategy = LoadStrategy::OnlyOut;

        fn p_eval<MM: MessageManager<u64>>(
            &self,
            _frag: &Fragment<Empty, Empty>,
            ctx: &mut RoundedCtx,
            messages: &mut MM,
            _engine: &ParallelEngine,
        ) -> Result<(), GraphError> {
            ctx.step += 1;
            ctx.p_evals += 1;
            if ctx.step <= ctx.max_round {
                messages.force_continue();
            }
            Ok(())
        }

        fn inc_eval<MM: MessageManager<u64>>(
            &self,
            _frag: &Fragment<Empty, Empty>,
            ctx: &mut RoundedCtx,
            messages: &mut MM,
            _engine: &ParallelEngine,
        ) -> Result<(), GraphError> {
            ctx.step += 1;
            ctx.inc_evals += 1;
            if ctx.step <= ctx.max_round {
                messages.force_continue();
            }
            Ok(())
        }
    }

    #[test]
    fn forced_rounds_end_with_one_quiet_round() {
        let comm = LocalProcessGroup::single::<Routed<u64>>();
        let mut a = Fragment::builder(0, 1);
        a.add_vertex(1, Empty);
        let frag = a.build().unwrap();
        let mut worker: ParallelWorker<Rounded, Comm> =
            ParallelWorker::new(Rounded, frag, comm, spec());
        worker.init().unwrap();
        worker.query(4).unwrap();

        let ctx = worker.context().unwrap();
        assert_eq!(ctx.p_evals, 1);
        // rounds 2..=4 are forced, round 5 is the quiet one that terminates
        assert_eq!(ctx.inc_evals, 4);
        assert_eq!(ctx.step, 5);
    }

    // Adds a vertex and an edge during the first round; the next round must
    // already evaluate the rebuilt fragment.
    struct Growing;

    #[derive(Default)]
    struct GrowingCtx {
        pending: Option<Mutation<Empty, Empty>>,
        inner_seen: usize,
    }

    impl FragmentContext<Empty, Empty> for GrowingCtx {
        type Args = ();

        fn create(_frag: &Fragment<Empty, Empty>) -> Self {
            Self::default()
        }

        fn init(&mut self, _frag: &Fragment<Empty, Empty>, _args: ()) {
            *self = Self::default();
        }

        fn output(&self, _frag: &Fragment<Empty, Empty>, _w: &mut dyn io::Write) -> io::Result<()> {
            Ok(())
        }

        fn take_mutation(&mut self) -> Option<Mutation<Empty, Empty>> {
            self.pending.take()
        }
    }

    impl App for Growing {
        type VData = Empty;
        type EData = Empty;
        type Msg = u64;
        type Ctx = GrowingCtx;

        const MESSAGE_STRATEGY: MessageStrategy = MessageStrategy::AlongOutgoingEdgeToOuterVertex;
        const LOAD_STRATEGY: LoadStrategy = LoadStrategy::OnlyOut;

        fn p_eval<MM: MessageManager<u64>>(
            &self,
            _frag: &Fragment<Empty, Empty>,
            ctx: &mut GrowingCtx,
            messages: &mut MM,
            _engine: &ParallelEngine,
        ) -> Result<(), GraphError> {
            let mut mutation = Mutation::default();
            mutation.add_vertices.push((5, Empty, false));
            mutation.add_edges.push((1, 5, Empty));
            ctx.pending = Some(mutation);
            messages.force_continue();
            Ok(())
        }

        fn inc_eval<MM: MessageManager<u64>>(
            &self,
            frag: &Fragment<Empty, Empty>,
            ctx: &mut GrowingCtx,
            _messages: &mut MM,
            _engine: &ParallelEngine,
        ) -> Result<(), GraphError> {
            ctx.inner_seen = frag.inner_vertex_count();
            Ok(())
        }
    }

    #[test]
    fn mutation_applies_between_rounds() {
        let comm = LocalProcessGroup::single::<Routed<u64>>();
        let mut a = Fragment::builder(0, 1);
        a.add_vertex(1, Empty).add_vertex(2, Empty);
        a.add_edge(1, 2, Empty);
        let frag = a.build().unwrap();
        let mut worker: ParallelWorker<Growing, Comm> =
            ParallelWorker::new(Growing, frag, comm, spec());
        worker.init().unwrap();
        worker.query(()).unwrap();

        assert_eq!(worker.fragment().inner_vertex_count(), 3);
        assert!(worker.fragment().is_prepared());
        assert_eq!(worker.context().unwrap().inner_seen, 3);
        assert_eq!(
            worker
                .fragment()
                .outgoing_edges(worker.fragment().vertex(1).unwrap())
                .len(),
            2
        );
    }
}
