//! Test fixtures: an in-memory asynchronous I/O backend, graph builders
//! and reference vertex programs, shared by integration tests and benches.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool as StdAtomicBool, AtomicUsize as StdAtomicUsize, Ordering},
        Arc,
    },
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    encode_directed, encode_ts, encode_undirected, EdgeDir, EngineContext, EngineError,
    GraphHeader, GraphType, IoBackend, IoCompletion, IoFactory, IoRequest, IoStats, PageVertex,
    Timestamp, Vertex, VertexId, VertexIndex, VertexProgram,
};

/// install a global tracing subscriber writing hourly files
pub fn try_init_global_subscriber(
    directory: &str,
    file_name_prefix: &str,
    filter: tracing::Level,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    use anyhow::anyhow;
    use tracing_subscriber::fmt::format;
    let file_appender = tracing_appender::rolling::hourly(directory, file_name_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_max_level(filter)
        .event_format(format().pretty().with_source_location(true))
        .try_init()
        .map_or_else(|e| Err(anyhow!("{:?}", e)), |_| Ok(guard))
}

/// asynchronous-looking I/O over an in-memory file image. Submitted
/// requests ripen one `wait` round later and complete in ascending offset
/// order, so `pending()` and out-of-submission-order completion are
/// exercised the way a real backend would.
pub struct RamIo {
    file: Arc<Vec<u8>>,
    in_flight: VecDeque<IoRequest>,
    ready: Vec<IoRequest>,
    stats: IoStats,
}

impl RamIo {
    /// backend over `file`
    pub fn new(file: Arc<Vec<u8>>) -> Self {
        Self {
            file,
            in_flight: VecDeque::new(),
            ready: Vec::new(),
            stats: IoStats::default(),
        }
    }

    fn ripen(&mut self) {
        self.ready.extend(self.in_flight.drain(..));
        // a throughput-optimal device drains its queue by offset
        self.ready.sort_by_key(|r| std::cmp::Reverse(r.offset));
    }

    fn complete(&mut self, req: IoRequest) -> IoCompletion {
        let start = (req.offset as usize).min(self.file.len());
        let end = (req.offset as usize).saturating_add(req.len).min(self.file.len());
        let mut data = vec![0u8; req.len];
        data[..end - start].copy_from_slice(&self.file[start..end]);
        self.stats.reads += 1;
        self.stats.bytes_read += req.len as u64;
        IoCompletion {
            offset: req.offset,
            compute: req.compute,
            data,
        }
    }
}

impl IoBackend for RamIo {
    fn submit(&mut self, reqs: &mut Vec<IoRequest>) -> Result<(), EngineError> {
        self.in_flight.extend(reqs.drain(..));
        Ok(())
    }

    fn wait(
        &mut self,
        min_complete: usize,
        out: &mut Vec<IoCompletion>,
    ) -> Result<usize, EngineError> {
        let mut num = 0;
        loop {
            while let Some(req) = self.ready.pop() {
                let completion = self.complete(req);
                out.push(completion);
                num += 1;
            }
            if num >= min_complete || self.in_flight.is_empty() {
                break;
            }
            self.ripen();
        }
        // whatever is still in flight becomes observable next round
        self.ripen();
        Ok(num)
    }

    fn pending(&self) -> usize {
        self.in_flight.len() + self.ready.len()
    }

    fn file_size(&self) -> u64 {
        self.file.len() as u64
    }

    fn stats(&self) -> IoStats {
        self.stats
    }
}

/// hands each worker its own view of one RAM file image
pub struct RamIoFactory {
    file: Arc<Vec<u8>>,
}

impl RamIoFactory {
    /// factory over `bytes`
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            file: Arc::new(bytes),
        }
    }
}

impl IoFactory for RamIoFactory {
    fn open(&self, _worker: usize) -> Result<Box<dyn IoBackend>, EngineError> {
        Ok(Box::new(RamIo::new(Arc::clone(&self.file))))
    }
}

/// accumulates edges and serializes a graph image plus its index
pub struct GraphBuilder {
    graph_type: GraphType,
    out_edges: Vec<Vec<VertexId>>,
    in_edges: Vec<Vec<VertexId>>,
    ts_edges: Vec<Vec<(Timestamp, Vec<VertexId>)>>,
}

impl GraphBuilder {
    fn new(graph_type: GraphType, num_vertices: usize) -> Self {
        Self {
            graph_type,
            out_edges: vec![Vec::new(); num_vertices],
            in_edges: vec![Vec::new(); num_vertices],
            ts_edges: vec![Vec::new(); num_vertices],
        }
    }

    /// directed graph over `num_vertices` vertices
    pub fn directed(num_vertices: usize) -> Self {
        Self::new(GraphType::Directed, num_vertices)
    }

    /// undirected graph over `num_vertices` vertices
    pub fn undirected(num_vertices: usize) -> Self {
        Self::new(GraphType::Undirected, num_vertices)
    }

    /// time-series directed graph over `num_vertices` vertices
    pub fn time_series(num_vertices: usize) -> Self {
        Self::new(GraphType::TsDirected, num_vertices)
    }

    /// number of vertices
    pub fn num_vertices(&self) -> usize {
        self.out_edges.len()
    }

    /// add one edge; an undirected builder records both sides
    pub fn edge(&mut self, from: VertexId, to: VertexId) {
        self.out_edges[from as usize].push(to);
        match self.graph_type {
            GraphType::Undirected => self.out_edges[to as usize].push(from),
            _ => self.in_edges[to as usize].push(from),
        }
    }

    /// add one time-stamped edge; slots must be appended in timestamp order
    pub fn ts_edge(&mut self, from: VertexId, ts: Timestamp, to: VertexId) {
        let slots = &mut self.ts_edges[from as usize];
        match slots.last_mut() {
            Some((last, edges)) if *last == ts => edges.push(to),
            _ => slots.push((ts, vec![to])),
        }
    }

    /// neighbor list used by reference implementations
    pub fn out_neighbors(&self, v: VertexId) -> &[VertexId] {
        &self.out_edges[v as usize]
    }

    /// total stored edges (an undirected edge counts twice)
    pub fn num_edges(&self) -> usize {
        self.out_edges.iter().map(|e| e.len()).sum()
    }

    /// serialize to `(graph bytes, index bytes)`
    pub fn build(&self) -> (Vec<u8>, Vec<u8>) {
        let num_vertices = self.num_vertices();
        let max_num_timestamps = self
            .ts_edges
            .iter()
            .map(|s| s.len())
            .max()
            .unwrap_or(0) as u32;
        let header = GraphHeader {
            graph_type: self.graph_type,
            num_vertices: num_vertices as u64,
            max_num_timestamps,
        };
        let mut graph = header.encode();
        let mut entries = Vec::with_capacity(num_vertices);
        for v in 0..num_vertices {
            let record = match self.graph_type {
                GraphType::Directed => {
                    encode_directed(v as VertexId, &self.in_edges[v], &self.out_edges[v])
                }
                GraphType::Undirected => encode_undirected(v as VertexId, &self.out_edges[v]),
                GraphType::TsDirected => encode_ts(v as VertexId, &self.ts_edges[v]),
            };
            entries.push((graph.len() as u64, record.len() as u32));
            graph.extend_from_slice(&record);
        }
        (graph, VertexIndex::from_entries(entries).encode())
    }

    /// engine-ready fixtures; the index goes through the chunked loader
    pub fn build_fixture(&self) -> (RamIoFactory, VertexIndex) {
        let (graph, index_bytes) = self.build();
        let mut io = RamIo::new(Arc::new(index_bytes));
        let index = VertexIndex::load(&mut io).expect("index loads");
        (RamIoFactory::new(graph), index)
    }
}

/// uniformly random directed graph with roughly `avg_out_degree` out-edges
/// per vertex, reproducible by seed
pub fn random_directed(num_vertices: usize, avg_out_degree: usize, seed: u64) -> GraphBuilder {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut builder = GraphBuilder::directed(num_vertices);
    for v in 0..num_vertices {
        let degree = rng.gen_range(0..=avg_out_degree * 2);
        for _ in 0..degree {
            let to = rng.gen_range(0..num_vertices) as VertexId;
            if to != v as VertexId {
                builder.edge(v as VertexId, to);
            }
        }
    }
    builder
}

/// per-vertex BFS state
#[derive(Default)]
pub struct BfsState {
    visited: StdAtomicBool,
    // level + 1; 0 means never visited
    level: StdAtomicUsize,
}

impl BfsState {
    /// whether the vertex was reached
    pub fn visited(&self) -> bool {
        self.visited.load(Ordering::SeqCst)
    }

    /// level the vertex was visited at
    pub fn level(&self) -> Option<usize> {
        match self.level.load(Ordering::SeqCst) {
            0 => None,
            l => Some(l - 1),
        }
    }
}

/// breadth-first search: mark visited, activate the neighbors on one side
pub struct BfsProgram {
    dir: EdgeDir,
}

impl BfsProgram {
    /// BFS expanding along `dir` edges
    pub fn new(dir: EdgeDir) -> Self {
        Self { dir }
    }
}

impl VertexProgram for BfsProgram {
    type State = BfsState;

    fn pre_run(&self, _ctx: &mut EngineContext<'_, BfsState>, v: &Vertex<BfsState>) -> bool {
        !v.state.visited()
    }

    fn run(
        &self,
        ctx: &mut EngineContext<'_, BfsState>,
        v: &Vertex<BfsState>,
        page: &PageVertex,
    ) -> bool {
        if v.state.visited.swap(true, Ordering::SeqCst) {
            return true;
        }
        v.state.level.store(ctx.level() + 1, Ordering::SeqCst);
        ctx.activate(page.neighbors(self.dir))
            .expect("activation failed");
        true
    }
}

/// reference sequential BFS over the builder's adjacency
pub fn sequential_bfs(
    builder: &GraphBuilder,
    start: &[VertexId],
) -> Vec<Option<usize>> {
    let mut levels = vec![None; builder.num_vertices()];
    let mut frontier: Vec<VertexId> = start.to_vec();
    let mut level = 0;
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for &v in &frontier {
            if levels[v as usize].is_some() {
                continue;
            }
            levels[v as usize] = Some(level);
            next.extend_from_slice(builder.out_neighbors(v));
        }
        frontier = next;
        level += 1;
    }
    levels
}

/// per-vertex state of [`CountingProgram`]
#[derive(Default)]
pub struct CountState {
    sent: StdAtomicBool,
    received: StdAtomicUsize,
}

impl CountState {
    /// messages that arrived at this vertex
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

/// floods one `+1` payload to every out-neighbor once and counts arrivals
pub struct CountingProgram;

impl VertexProgram for CountingProgram {
    type State = CountState;

    fn pre_run(&self, _ctx: &mut EngineContext<'_, CountState>, v: &Vertex<CountState>) -> bool {
        !v.state.sent.load(Ordering::SeqCst)
    }

    fn run(
        &self,
        ctx: &mut EngineContext<'_, CountState>,
        v: &Vertex<CountState>,
        page: &PageVertex,
    ) -> bool {
        if v.state.sent.swap(true, Ordering::SeqCst) {
            return true;
        }
        ctx.multicast(&1u64.to_le_bytes(), page.neighbors(EdgeDir::Out))
            .expect("multicast failed");
        true
    }

    fn on_messages(
        &self,
        _ctx: &mut EngineContext<'_, CountState>,
        v: &Vertex<CountState>,
        msgs: &[&[u8]],
    ) {
        for payload in msgs {
            assert_eq!(*payload, 1u64.to_le_bytes().as_slice());
            v.state.received.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_sync;

    #[test]
    fn ram_io_completes_after_one_round() {
        let mut io = RamIo::new(Arc::new((0u8..200).collect()));
        let mut reqs = vec![
            IoRequest {
                offset: 100,
                len: 4,
                compute: None,
            },
            IoRequest {
                offset: 0,
                len: 4,
                compute: None,
            },
        ];
        io.submit(&mut reqs).unwrap();
        assert_eq!(io.pending(), 2);
        let mut out = Vec::new();
        // nothing has ripened yet; a zero wait only makes them observable
        assert_eq!(io.wait(0, &mut out).unwrap(), 0);
        assert_eq!(io.wait(0, &mut out).unwrap(), 2);
        assert_eq!(io.pending(), 0);
        // ascending offset order
        assert_eq!(out[0].offset, 0);
        assert_eq!(out[0].data, vec![0, 1, 2, 3]);
        assert_eq!(out[1].offset, 100);
    }

    #[test]
    fn ram_io_zero_fills_past_eof() {
        let mut io = RamIo::new(Arc::new(vec![7u8; 10]));
        let data = read_sync(&mut io, 8, 8).unwrap();
        assert_eq!(data, vec![7, 7, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn builder_fixture_loads_through_the_index_loader() {
        let mut builder = GraphBuilder::directed(3);
        builder.edge(0, 1);
        builder.edge(1, 2);
        let (_, index) = builder.build_fixture();
        assert_eq!(index.num_vertices(), 3);
        // records start after the header page
        assert_eq!(index.entry(0).unwrap().0, GraphHeader::SIZE as u64);
    }

    #[test]
    fn sequential_bfs_levels() {
        let mut builder = GraphBuilder::directed(4);
        builder.edge(0, 1);
        builder.edge(1, 2);
        let levels = sequential_bfs(&builder, &[0]);
        assert_eq!(levels, vec![Some(0), Some(1), Some(2), None]);
    }
}
