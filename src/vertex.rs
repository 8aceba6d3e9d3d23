use rayon::prelude::*;

use crate::types::{Timestamp, VertexId};

/// in-memory descriptor of one on-disk vertex record plus its user state.
/// Descriptors are read-only after engine construction; `state` is owned by
/// the user program, which is invoked by at most one worker at a time for a
/// given vertex.
pub struct Vertex<S> {
    id: VertexId,
    ext_mem_off: u64,
    ext_mem_size: u32,
    /// application-defined per-vertex state; the engine never inspects it
    pub state: S,
}

impl<S> Vertex<S> {
    /// vertex id
    pub fn id(&self) -> VertexId {
        self.id
    }

    /// byte offset of the record in the graph file
    pub fn ext_mem_off(&self) -> u64 {
        self.ext_mem_off
    }

    /// byte length of the record
    pub fn ext_mem_size(&self) -> u32 {
        self.ext_mem_size
    }
}

/// owns every vertex descriptor, indexed by id
pub struct VertexArena<S> {
    vertices: Vec<Vertex<S>>,
}

impl<S> VertexArena<S> {
    /// build descriptors from `(offset, size)` index entries; ids are the
    /// entry positions
    pub fn from_entries(entries: &[(u64, u32)]) -> Self
    where
        S: Default,
    {
        Self {
            vertices: entries
                .iter()
                .enumerate()
                .map(|(id, &(ext_mem_off, ext_mem_size))| Vertex {
                    id: id as VertexId,
                    ext_mem_off,
                    ext_mem_size,
                    state: S::default(),
                })
                .collect(),
        }
    }

    /// descriptor of `id`; panics when `id` is outside the graph
    pub fn vertex(&self, id: VertexId) -> &Vertex<S> {
        &self.vertices[id as usize]
    }

    /// descriptor of `id`, `None` when outside the graph
    pub fn get(&self, id: VertexId) -> Option<&Vertex<S>> {
        self.vertices.get(id as usize)
    }

    /// number of vertices
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// whether the graph has no vertices
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// largest vertex id, `0` for an empty graph
    pub fn max_vertex_id(&self) -> VertexId {
        self.vertices.len().saturating_sub(1) as VertexId
    }

    /// iterate descriptors in id order
    pub fn iter(&self) -> impl Iterator<Item = &Vertex<S>> {
        self.vertices.iter()
    }
}

impl<S: Send + Sync> VertexArena<S> {
    /// parallel count of vertices matching `pred`
    pub fn par_count(&self, pred: impl Fn(&Vertex<S>) -> bool + Sync) -> usize {
        self.vertices.par_iter().filter(|v| pred(v)).count()
    }
}

/// which neighbor lists the driver is asked to fetch for user programs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeighborType {
    /// no neighbor fetch; `run` receives the vertex's own record
    None,
    /// in-edges
    In,
    /// out-edges
    Out,
    /// both directions
    Both,
}

/// edge direction selector on a decoded record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeDir {
    /// incoming edges
    In,
    /// outgoing edges
    Out,
}

/// half-open timestamp window `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimestampRange {
    /// first timestamp included
    pub start: Timestamp,
    /// first timestamp excluded
    pub end: Timestamp,
}

impl TimestampRange {
    /// whether `ts` falls inside the window
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// a neighbor fetch requested by a user program
#[derive(Clone, Copy, Debug)]
pub enum NeighborRequest {
    /// read the neighbor's whole record
    Full(VertexId),
    /// read only the slice of a time-series record covering a window
    TimeRange {
        /// neighbor id
        id: VertexId,
        /// requested window
        range: TimestampRange,
    },
}

/// one decoded vertex record handed to user callbacks
#[derive(Clone, Debug)]
pub struct PageVertex {
    id: VertexId,
    ins: Vec<VertexId>,
    outs: Vec<VertexId>,
    undirected: bool,
}

impl PageVertex {
    pub(crate) fn directed(id: VertexId, ins: Vec<VertexId>, outs: Vec<VertexId>) -> Self {
        Self {
            id,
            ins,
            outs,
            undirected: false,
        }
    }

    pub(crate) fn undirected(id: VertexId, neighbors: Vec<VertexId>) -> Self {
        Self {
            id,
            ins: Vec::new(),
            outs: neighbors,
            undirected: true,
        }
    }

    /// id of the decoded vertex
    pub fn id(&self) -> VertexId {
        self.id
    }

    /// neighbor ids on the requested side; an undirected record answers
    /// both sides with the same list
    pub fn neighbors(&self, dir: EdgeDir) -> &[VertexId] {
        if self.undirected {
            return &self.outs;
        }
        match dir {
            EdgeDir::In => &self.ins,
            EdgeDir::Out => &self.outs,
        }
    }

    /// number of edges on the requested side
    pub fn num_edges(&self, dir: EdgeDir) -> usize {
        self.neighbors(dir).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_indexes_by_id() {
        let arena: VertexArena<()> = VertexArena::from_entries(&[(0, 10), (10, 20), (30, 5)]);
        assert_eq!(arena.len(), 3);
        assert_eq!(arena.vertex(1).ext_mem_off(), 10);
        assert_eq!(arena.vertex(2).ext_mem_size(), 5);
        assert_eq!(arena.max_vertex_id(), 2);
        assert!(arena.get(3).is_none());
    }

    #[test]
    fn undirected_pages_answer_both_sides() {
        let page = PageVertex::undirected(3, vec![1, 2]);
        assert_eq!(page.neighbors(EdgeDir::In), &[1, 2]);
        assert_eq!(page.neighbors(EdgeDir::Out), &[1, 2]);
        let page = PageVertex::directed(3, vec![1], vec![2]);
        assert_eq!(page.neighbors(EdgeDir::In), &[1]);
        assert_eq!(page.num_edges(EdgeDir::Out), 1);
    }

    #[test]
    fn timestamp_range_is_half_open() {
        let range = TimestampRange { start: 3, end: 6 };
        assert!(!range.contains(2));
        assert!(range.contains(3));
        assert!(range.contains(5));
        assert!(!range.contains(6));
    }
}
