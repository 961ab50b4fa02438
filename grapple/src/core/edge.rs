use crate::core::vertex::Vertex;

/// One adjacency entry of a fragment.
///
/// For outgoing adjacency `neighbor` is the edge target, for incoming
/// adjacency it is the edge source. The neighbor may be an inner vertex or an
/// outer mirror.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdjEdge<E> {
    pub neighbor: Vertex,
    pub data: E,
}
