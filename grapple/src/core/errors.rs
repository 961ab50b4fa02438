use crate::core::fragment::{LoadStrategy, MessageStrategy};

#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    #[error("unknown vertex {0}")]
    UnknownVertex(u64),

    #[error("duplicate vertex {0}")]
    DuplicateVertex(u64),

    #[error("edge {src} -> {dst} has no endpoint in this fragment")]
    DanglingEdge { src: u64, dst: u64 },

    #[error("message strategy {strategy:?} is not supported under load strategy {load:?}")]
    StrategyMismatch {
        strategy: MessageStrategy,
        load: LoadStrategy,
    },

    #[error("application requires load strategy {required:?} but the fragment was built with {loaded:?}")]
    LoadMismatch {
        required: LoadStrategy,
        loaded: LoadStrategy,
    },

    #[error("incoming adjacency is not loaded under load strategy {0:?}")]
    DirectionNotLoaded(LoadStrategy),

    #[error("worker is in state {actual} but {expected} was required")]
    InvalidWorkerState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
