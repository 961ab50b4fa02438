use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::core::{
    edge::AdjEdge,
    errors::GraphError,
    vertex::{LocalVertex, Vertex, VertexKind, VertexRange},
    Payload,
};

/// Which adjacency directions a fragment materializes at load time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStrategy {
    /// Only outgoing adjacency per inner vertex.
    OnlyOut,
    /// Outgoing and incoming adjacency per inner vertex.
    BothOutIn,
}

/// How an application routes its cross-fragment messages.
///
/// The worker validates the declared strategy against the fragment's
/// [`LoadStrategy`] when it prepares the fragment; a mismatch is fatal before
/// any round starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageStrategy {
    AlongOutgoingEdgeToOuterVertex,
    AlongIncomingEdgeToOuterVertex,
    AlongEdgeToOuterVertex,
    SyncOnOuterVertex,
}

/// Configuration a fragment is prepared with before running an application.
#[derive(Clone, Copy, Debug)]
pub struct PrepareConf {
    pub message_strategy: MessageStrategy,
}

/// Maps a global vertex id to the rank that owns it.
pub trait Partitioner: Send + Sync + 'static {
    fn owner(&self, gid: u64) -> usize;
}

impl<F: Fn(u64) -> usize + Send + Sync + 'static> Partitioner for F {
    fn owner(&self, gid: u64) -> usize {
        self(gid)
    }
}

/// Default partitioner: owner is `gid mod fnum`.
#[derive(Clone, Copy, Debug)]
pub struct HashPartitioner {
    fnum: usize,
}

impl HashPartitioner {
    pub fn new(fnum: usize) -> Self {
        Self { fnum }
    }
}

impl Partitioner for HashPartitioner {
    fn owner(&self, gid: u64) -> usize {
        (gid % self.fnum.max(1) as u64) as usize
    }
}

#[derive(Clone, Debug)]
struct InnerRecord<V> {
    gid: u64,
    data: V,
    secret: bool,
}

#[derive(Clone, Debug)]
struct OuterRecord<V> {
    gid: u64,
    owner: usize,
    data: V,
    secret: bool,
}

/// A structural delta applied to a fragment strictly between rounds.
///
/// Vertices whose global id is owned by another rank only affect the local
/// mirror attributes. Removing a vertex also removes its incident edges.
#[derive(Clone, Debug)]
pub struct Mutation<V, E> {
    pub add_vertices: Vec<(u64, V, bool)>,
    pub remove_vertices: Vec<u64>,
    pub add_edges: Vec<(u64, u64, E)>,
    pub remove_edges: Vec<(u64, u64)>,
}

impl<V, E> Default for Mutation<V, E> {
    fn default() -> Self {
        Self {
            add_vertices: Vec::new(),
            remove_vertices: Vec::new(),
            add_edges: Vec::new(),
            remove_edges: Vec::new(),
        }
    }
}

impl<V, E> Mutation<V, E> {
    pub fn is_empty(&self) -> bool {
        self.add_vertices.is_empty()
            && self.remove_vertices.is_empty()
            && self.add_edges.is_empty()
            && self.remove_edges.is_empty()
    }
}

/// One rank's partition of the graph.
///
/// A fragment owns its inner vertices and keeps read-only mirrors of the
/// neighbours owned elsewhere. Handles are dense: inner vertices come first,
/// mirrors after them. Structure is read-shared during a round and mutated
/// only between rounds, after which [`Fragment::prepare`] must run again.
#[derive(Clone, Debug)]
pub struct Fragment<V, E> {
    fid: usize,
    fnum: usize,
    load_strategy: LoadStrategy,
    partitioner: Arc<dyn Partitioner>,
    inner: Vec<InnerRecord<V>>,
    outer: Vec<OuterRecord<V>>,
    index: FxHashMap<u64, LocalVertex>,
    out_edges: Vec<Vec<AdjEdge<E>>>,
    in_edges: Option<Vec<Vec<AdjEdge<E>>>>,
    // per inner vertex, (owner rank, gid) of every outer out-neighbour;
    // rebuilt by prepare() and used as the routing table for the
    // along-outgoing-edges send strategy
    outer_routes: Vec<Vec<(usize, u64)>>,
    prepared_for: Option<MessageStrategy>,
}

impl std::fmt::Debug for dyn Partitioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Partitioner")
    }
}

impl<V: Payload + Default, E: Payload> Fragment<V, E> {
    pub fn builder(fid: usize, fnum: usize) -> FragmentBuilder<V, E> {
        FragmentBuilder::new(fid, fnum)
    }

    pub fn fid(&self) -> usize {
        self.fid
    }

    pub fn fnum(&self) -> usize {
        self.fnum
    }

    pub fn load_strategy(&self) -> LoadStrategy {
        self.load_strategy
    }

    pub fn inner_vertex_count(&self) -> usize {
        self.inner.len()
    }

    pub fn outer_vertex_count(&self) -> usize {
        self.outer.len()
    }

    pub fn total_vertex_count(&self) -> usize {
        self.inner.len() + self.outer.len()
    }

    /// Vertices owned by this fragment, in handle order.
    pub fn inner_vertices(&self) -> VertexRange {
        VertexRange::new(0, self.inner.len())
    }

    /// Mirrors of vertices owned by other ranks, in handle order.
    pub fn outer_vertices(&self) -> VertexRange {
        VertexRange::new(self.inner.len(), self.total_vertex_count())
    }

    pub fn is_inner_vertex(&self, v: Vertex) -> bool {
        v.0 < self.inner.len()
    }

    pub fn is_outer_vertex(&self, v: Vertex) -> bool {
        v.0 >= self.inner.len() && v.0 < self.total_vertex_count()
    }

    pub fn kind(&self, v: Vertex) -> VertexKind {
        if self.is_inner_vertex(v) {
            VertexKind::Inner
        } else {
            VertexKind::Outer
        }
    }

    /// Resolves a global id to its local handle.
    pub fn vertex(&self, gid: u64) -> Result<Vertex, GraphError> {
        self.local_vertex(gid).map(|lv| lv.vertex)
    }

    /// Resolves a global id to its local handle plus ownership kind.
    pub fn local_vertex(&self, gid: u64) -> Result<LocalVertex, GraphError> {
        self.index
            .get(&gid)
            .copied()
            .ok_or(GraphError::UnknownVertex(gid))
    }

    /// The global id of a local vertex.
    pub fn vertex_id(&self, v: Vertex) -> u64 {
        if self.is_inner_vertex(v) {
            self.inner[v.0].gid
        } else {
            self.outer[v.0 - self.inner.len()].gid
        }
    }

    /// The rank owning the authoritative copy of `v`.
    pub fn owner(&self, v: Vertex) -> usize {
        if self.is_inner_vertex(v) {
            self.fid
        } else {
            self.outer[v.0 - self.inner.len()].owner
        }
    }

    pub fn vertex_data(&self, v: Vertex) -> &V {
        if self.is_inner_vertex(v) {
            &self.inner[v.0].data
        } else {
            &self.outer[v.0 - self.inner.len()].data
        }
    }

    /// The per-vertex visibility attribute, set once at construction.
    ///
    /// The engine stores and exposes the flag; whether it excludes a vertex
    /// from anything is entirely up to algorithm code.
    pub fn secret(&self, v: Vertex) -> bool {
        if self.is_inner_vertex(v) {
            self.inner[v.0].secret
        } else {
            self.outer[v.0 - self.inner.len()].secret
        }
    }

    /// Outgoing adjacency of an inner vertex. Mirrors carry no adjacency and
    /// yield an empty slice.
    pub fn outgoing_edges(&self, v: Vertex) -> &[AdjEdge<E>] {
        if self.is_inner_vertex(v) {
            &self.out_edges[v.0]
        } else {
            &[]
        }
    }

    /// Incoming adjacency of an inner vertex; only available under
    /// [`LoadStrategy::BothOutIn`].
    pub fn incoming_edges(&self, v: Vertex) -> Result<&[AdjEdge<E>], GraphError> {
        let in_edges = self
            .in_edges
            .as_ref()
            .ok_or(GraphError::DirectionNotLoaded(self.load_strategy))?;
        if self.is_inner_vertex(v) {
            Ok(&in_edges[v.0])
        } else {
            Ok(&[])
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared_for.is_some()
    }

    /// Validates the message strategy against the load strategy and rebuilds
    /// the routing caches. Must run before the first round and after every
    /// structural mutation.
    pub fn prepare(&mut self, conf: PrepareConf) -> Result<(), GraphError> {
        match conf.message_strategy {
            MessageStrategy::AlongIncomingEdgeToOuterVertex
            | MessageStrategy::AlongEdgeToOuterVertex => {
                if self.load_strategy != LoadStrategy::BothOutIn {
                    return Err(GraphError::StrategyMismatch {
                        strategy: conf.message_strategy,
                        load: self.load_strategy,
                    });
                }
            }
            MessageStrategy::AlongOutgoingEdgeToOuterVertex | MessageStrategy::SyncOnOuterVertex => {
            }
        }
        self.outer_routes = self
            .out_edges
            .iter()
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| self.is_outer_vertex(e.neighbor))
                    .map(|e| (self.owner(e.neighbor), self.vertex_id(e.neighbor)))
                    .collect()
            })
            .collect();
        self.prepared_for = Some(conf.message_strategy);
        Ok(())
    }

    /// The cross-fragment fan-out targets of an inner vertex: one
    /// `(owner rank, destination gid)` per outgoing edge to a mirror.
    pub(crate) fn outer_routes(&self, v: Vertex) -> &[(usize, u64)] {
        debug_assert!(self.is_prepared(), "fragment used before prepare()");
        debug_assert!(self.is_inner_vertex(v));
        &self.outer_routes[v.0]
    }

    /// Applies a structural delta and rebuilds the fragment. Handles issued
    /// before the call are invalidated; the caller must re-[`prepare`] before
    /// the next round reads the structure.
    ///
    /// [`prepare`]: Fragment::prepare
    pub fn apply_mutation(&mut self, mutation: Mutation<V, E>) -> Result<(), GraphError> {
        let removed: FxHashMap<u64, ()> = mutation
            .remove_vertices
            .iter()
            .map(|gid| (*gid, ()))
            .collect();

        let mut vertices: Vec<(u64, V, bool)> = self
            .inner
            .iter()
            .filter(|r| !removed.contains_key(&r.gid))
            .map(|r| (r.gid, r.data.clone(), r.secret))
            .collect();
        let mut mirror_data: FxHashMap<u64, (V, bool)> = self
            .outer
            .iter()
            .filter(|r| !removed.contains_key(&r.gid))
            .map(|r| (r.gid, (r.data.clone(), r.secret)))
            .collect();
        for (gid, data, secret) in mutation.add_vertices {
            if self.partitioner.owner(gid) == self.fid {
                vertices.push((gid, data, secret));
            } else {
                mirror_data.insert(gid, (data, secret));
            }
        }

        let dropped_edge = |src: u64, dst: u64| {
            removed.contains_key(&src)
                || removed.contains_key(&dst)
                || mutation
                    .remove_edges
                    .iter()
                    .any(|(s, d)| *s == src && *d == dst)
        };
        let mut edges: Vec<(u64, u64, E)> = Vec::new();
        for (i, adj) in self.out_edges.iter().enumerate() {
            let src = self.inner[i].gid;
            for e in adj {
                let dst = self.vertex_id(e.neighbor);
                if !dropped_edge(src, dst) {
                    edges.push((src, dst, e.data.clone()));
                }
            }
        }
        if let Some(in_edges) = &self.in_edges {
            // in-edges from remote sources exist nowhere else locally
            for (i, adj) in in_edges.iter().enumerate() {
                let dst = self.inner[i].gid;
                for e in adj {
                    if self.is_outer_vertex(e.neighbor) {
                        let src = self.vertex_id(e.neighbor);
                        if !dropped_edge(src, dst) {
                            edges.push((src, dst, e.data.clone()));
                        }
                    }
                }
            }
        }
        for (src, dst, data) in mutation.add_edges {
            if !dropped_edge(src, dst) {
                edges.push((src, dst, data));
            }
        }

        *self = build_fragment(
            self.fid,
            self.fnum,
            self.load_strategy,
            Arc::clone(&self.partitioner),
            vertices,
            mirror_data,
            edges,
        )?;
        Ok(())
    }
}

/// Builds a [`Fragment`] from partition input.
///
/// Inner vertices are added explicitly; mirrors are discovered from edge
/// endpoints owned by other ranks (their payloads default unless provided via
/// [`FragmentBuilder::mirror`]).
pub struct FragmentBuilder<V, E> {
    fid: usize,
    fnum: usize,
    load_strategy: LoadStrategy,
    partitioner: Arc<dyn Partitioner>,
    vertices: Vec<(u64, V, bool)>,
    mirror_data: FxHashMap<u64, (V, bool)>,
    edges: Vec<(u64, u64, E)>,
}

impl<V: Payload + Default, E: Payload> FragmentBuilder<V, E> {
    pub fn new(fid: usize, fnum: usize) -> Self {
        Self {
            fid,
            fnum,
            load_strategy: LoadStrategy::OnlyOut,
            partitioner: Arc::new(HashPartitioner::new(fnum)),
            vertices: Vec::new(),
            mirror_data: FxHashMap::default(),
            edges: Vec::new(),
        }
    }

    pub fn load_strategy(mut self, load_strategy: LoadStrategy) -> Self {
        self.load_strategy = load_strategy;
        self
    }

    pub fn partitioner(mut self, partitioner: impl Partitioner) -> Self {
        self.partitioner = Arc::new(partitioner);
        self
    }

    pub fn add_vertex(&mut self, gid: u64, data: V) -> &mut Self {
        self.vertices.push((gid, data, false));
        self
    }

    pub fn add_vertex_with(&mut self, gid: u64, data: V, secret: bool) -> &mut Self {
        self.vertices.push((gid, data, secret));
        self
    }

    /// Supplies the attributes of a mirror; without this, mirrors carry
    /// `V::default()` and a cleared visibility flag.
    pub fn mirror(&mut self, gid: u64, data: V, secret: bool) -> &mut Self {
        self.mirror_data.insert(gid, (data, secret));
        self
    }

    pub fn add_edge(&mut self, src: u64, dst: u64, data: E) -> &mut Self {
        self.edges.push((src, dst, data));
        self
    }

    pub fn build(self) -> Result<Fragment<V, E>, GraphError> {
        build_fragment(
            self.fid,
            self.fnum,
            self.load_strategy,
            self.partitioner,
            self.vertices,
            self.mirror_data,
            self.edges,
        )
    }
}

fn build_fragment<V: Payload + Default, E: Payload>(
    fid: usize,
    fnum: usize,
    load_strategy: LoadStrategy,
    partitioner: Arc<dyn Partitioner>,
    vertices: Vec<(u64, V, bool)>,
    mut mirror_data: FxHashMap<u64, (V, bool)>,
    edges: Vec<(u64, u64, E)>,
) -> Result<Fragment<V, E>, GraphError> {
    let ivnum = vertices.len();
    let mut index: FxHashMap<u64, LocalVertex> = FxHashMap::default();
    let mut inner = Vec::with_capacity(ivnum);
    for (i, (gid, data, secret)) in vertices.into_iter().enumerate() {
        let prev = index.insert(
            gid,
            LocalVertex {
                vertex: Vertex(i),
                kind: VertexKind::Inner,
            },
        );
        if prev.is_some() {
            return Err(GraphError::DuplicateVertex(gid));
        }
        inner.push(InnerRecord { gid, data, secret });
    }

    let mut outer: Vec<OuterRecord<V>> = Vec::new();
    let mut out_edges: Vec<Vec<AdjEdge<E>>> = vec![Vec::new(); ivnum];
    let mut in_edges: Option<Vec<Vec<AdjEdge<E>>>> = match load_strategy {
        LoadStrategy::OnlyOut => None,
        LoadStrategy::BothOutIn => Some(vec![Vec::new(); ivnum]),
    };

    let mut resolve = |gid: u64, index: &mut FxHashMap<u64, LocalVertex>| -> Vertex {
        if let Some(lv) = index.get(&gid) {
            return lv.vertex;
        }
        let v = Vertex(ivnum + outer.len());
        let (data, secret) = mirror_data.remove(&gid).unwrap_or_default();
        outer.push(OuterRecord {
            gid,
            owner: partitioner.owner(gid),
            data,
            secret,
        });
        index.insert(
            gid,
            LocalVertex {
                vertex: v,
                kind: VertexKind::Outer,
            },
        );
        v
    };

    for (src, dst, data) in edges {
        let src_inner = matches!(
            index.get(&src),
            Some(LocalVertex {
                kind: VertexKind::Inner,
                ..
            })
        );
        let dst_inner = matches!(
            index.get(&dst),
            Some(LocalVertex {
                kind: VertexKind::Inner,
                ..
            })
        );
        if !src_inner && !dst_inner {
            return Err(GraphError::DanglingEdge { src, dst });
        }
        if src_inner {
            let s = index[&src].vertex;
            let d = resolve(dst, &mut index);
            out_edges[s.0].push(AdjEdge { neighbor: d, data: data.clone() });
        } else if load_strategy == LoadStrategy::OnlyOut {
            // under OnlyOut, adjacency of a remote source is not materialized
            continue;
        }
        if dst_inner {
            if let Some(in_edges) = in_edges.as_mut() {
                let d = index[&dst].vertex;
                let s = resolve(src, &mut index);
                in_edges[d.0].push(AdjEdge { neighbor: s, data });
            }
        }
    }

    Ok(Fragment {
        fid,
        fnum,
        load_strategy,
        partitioner,
        inner,
        outer,
        index,
        out_edges,
        in_edges,
        outer_routes: Vec::new(),
        prepared_for: None,
    })
}
