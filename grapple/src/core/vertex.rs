use std::ops::{Index, IndexMut};

/// Dense fragment-local vertex handle.
///
/// Inner vertices occupy indices `0..ivnum`, outer mirrors `ivnum..tvnum`.
/// Handles are only meaningful for the fragment that issued them and are
/// invalidated by structural mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vertex(pub(crate) usize);

impl Vertex {
    /// The dense local index of this vertex.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Whether a vertex is owned by the local fragment or mirrored from another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexKind {
    Inner,
    Outer,
}

/// A resolved local vertex: the handle plus its ownership kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalVertex {
    pub vertex: Vertex,
    pub kind: VertexKind,
}

/// A contiguous range of vertex handles, iterated in index order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexRange {
    cur: usize,
    end: usize,
}

impl VertexRange {
    pub(crate) fn new(begin: usize, end: usize) -> Self {
        debug_assert!(begin <= end);
        Self { cur: begin, end }
    }

    pub fn is_empty(&self) -> bool {
        self.cur == self.end
    }

    /// Splits the range into exactly `parts` contiguous sub-ranges.
    ///
    /// Trailing sub-ranges may be empty when the range is short. Within one
    /// sub-range, iteration order follows the parent range's order.
    pub fn chunks(self, parts: usize) -> Vec<VertexRange> {
        let parts = parts.max(1);
        let per = (self.end - self.cur).div_ceil(parts).max(1);
        (0..parts)
            .map(|i| {
                let begin = (self.cur + i * per).min(self.end);
                let end = (begin + per).min(self.end);
                VertexRange::new(begin, end)
            })
            .collect()
    }
}

impl Iterator for VertexRange {
    type Item = Vertex;

    fn next(&mut self) -> Option<Vertex> {
        if self.cur < self.end {
            let v = Vertex(self.cur);
            self.cur += 1;
            Some(v)
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.end - self.cur;
        (n, Some(n))
    }
}

impl ExactSizeIterator for VertexRange {}

/// A dense per-vertex value store indexed by [`Vertex`] handles.
///
/// Contexts keep their per-vertex algorithm state in these; the engine never
/// touches them.
#[derive(Clone, Debug)]
pub struct VertexArray<T> {
    data: Vec<T>,
}

impl<T> VertexArray<T> {
    /// Builds an array of `len` slots, one per vertex, filling each from `f`.
    pub fn from_fn(len: usize, f: impl FnMut(usize) -> T) -> Self {
        Self {
            data: (0..len).map(f).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }
}

impl<T: Clone> VertexArray<T> {
    pub fn new(len: usize, value: T) -> Self {
        Self {
            data: vec![value; len],
        }
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }
}

impl<T> Index<Vertex> for VertexArray<T> {
    type Output = T;

    fn index(&self, v: Vertex) -> &T {
        &self.data[v.0]
    }
}

impl<T> IndexMut<Vertex> for VertexArray<T> {
    fn index_mut(&mut self, v: Vertex) -> &mut T {
        &mut self.data[v.0]
    }
}
