use std::{
    sync::{Arc, Barrier},
    thread::{self, JoinHandle},
};

use crossbeam::{channel::Sender, utils::CachePadded};
use smallvec::SmallVec;
use tracing::instrument;

use crate::{
    bitmap::AtomicBitmap,
    config::GraphConfig,
    error::EngineError,
    format::{DirectedDecoder, GraphHeader, GraphType, TsDecoder, UndirectedDecoder, VertexDecoder},
    frontier::{FrontierQueue, VertexScheduler},
    index::VertexIndex,
    io::{read_sync, IoFactory},
    message::{MessageBatch, MsgQueue, SenderSet},
    partition::VertexPartitioner,
    types::{AtomicBool, AtomicUsize, Level, Mutex, VertexId, WorkerId},
    vertex::{NeighborRequest, NeighborType, PageVertex, Vertex, VertexArena},
    worker, worker_error,
};

/// the callbacks the engine invokes on behalf of every vertex.
///
/// The engine guarantees that a program runs on a given vertex from at
/// most one worker at a time. A program must declare each activated
/// vertex complete (return `true` from `run` or `run_on_neighbors`)
/// exactly once per level.
pub trait VertexProgram: Send + Sync + 'static {
    /// per-vertex state stored in the arena; opaque to the engine
    type State: Default + Send + Sync + 'static;

    /// cheap local check. `true` asks the engine to fetch the vertex's
    /// record; `false` completes the vertex for this level on the spot.
    fn pre_run(&self, ctx: &mut EngineContext<'_, Self::State>, v: &Vertex<Self::State>) -> bool;

    /// called with the vertex's own decoded record (the first page that
    /// arrives for it); `true` completes the vertex for this level
    fn run(
        &self,
        ctx: &mut EngineContext<'_, Self::State>,
        v: &Vertex<Self::State>,
        page: &PageVertex,
    ) -> bool;

    /// called with decoded neighbor records (every page after the first)
    fn run_on_neighbors(
        &self,
        ctx: &mut EngineContext<'_, Self::State>,
        v: &Vertex<Self::State>,
        neighbors: &[PageVertex],
    ) -> bool {
        let _ = (ctx, v, neighbors);
        true
    }

    /// consume inbound payloads addressed to `v`; called from the
    /// message-processing path, also for vertices that are not activated
    fn on_messages(
        &self,
        ctx: &mut EngineContext<'_, Self::State>,
        v: &Vertex<Self::State>,
        msgs: &[&[u8]],
    ) {
        let _ = (ctx, v, msgs);
    }

    /// whether the program wants more neighbor records for `v`
    fn has_required_vertices(&self, v: &Vertex<Self::State>) -> bool {
        let _ = v;
        false
    }

    /// the next neighbor read the program wants for `v`; polled while
    /// `has_required_vertices` answers `true`
    fn next_required_vertex(&self, v: &Vertex<Self::State>) -> Option<NeighborRequest> {
        let _ = v;
        None
    }
}

/// per-worker state shared across threads: the frontier peers steal from,
/// the inbound batch queue peers send to, the next-level bitmap and the
/// level progress counters
pub(crate) struct WorkerShared {
    pub frontier: FrontierQueue,
    pub inbox: MsgQueue,
    pub next_activated: AtomicBitmap,
    pub num_activated: AtomicUsize,
    pub num_completed: AtomicUsize,
}

/// everything workers share; lifted engine state instead of process-wide
/// globals, passed to every callback through [`EngineContext`]
pub(crate) struct EngineShared<S> {
    pub config: GraphConfig,
    pub partitioner: VertexPartitioner,
    pub arena: VertexArena<S>,
    pub decoder: Arc<dyn VertexDecoder>,
    pub required_neighbors: NeighborType,
    pub trace_requests: bool,
    pub workers: Vec<CachePadded<WorkerShared>>,
    pub barrier1: Barrier,
    pub barrier2: Barrier,
    pub arrived: AtomicUsize,
    pub tot_activates: AtomicUsize,
    pub level: AtomicUsize,
    pub num_remaining: AtomicUsize,
    pub complete: AtomicBool,
    abort: AtomicBool,
    error: Mutex<Option<EngineError>>,
}

impl<S> EngineShared<S> {
    pub fn aborted(&self) -> bool {
        self.abort.load()
    }

    /// record the first fatal error and raise the abort flag; peers drain
    /// out through the barrier protocol within one level cycle
    pub fn record_error(&self, e: EngineError) {
        worker_error!("engine aborting: {}", e);
        {
            let mut guard = self.error.lock();
            if guard.is_none() {
                *guard = Some(e);
            }
        }
        self.abort.store(true);
    }

    pub fn take_error(&self) -> Option<EngineError> {
        self.error.lock().take()
    }

    /// account one vertex completion on `worker`
    pub fn complete_one(&self, worker: WorkerId) {
        self.workers[worker].num_completed.increment();
        self.num_remaining.decrement();
    }

    pub fn inbox_senders(&self) -> Vec<Sender<MessageBatch>> {
        self.workers.iter().map(|w| w.inbox.sender()).collect()
    }
}

/// handle passed to every user callback; routes activations and messages
/// through the issuing worker's senders and exposes read-only engine state
pub struct EngineContext<'a, S> {
    shared: &'a EngineShared<S>,
    worker: WorkerId,
    level: Level,
    senders: &'a mut SenderSet,
}

impl<'a, S> EngineContext<'a, S> {
    pub(crate) fn new(
        shared: &'a EngineShared<S>,
        worker: WorkerId,
        level: Level,
        senders: &'a mut SenderSet,
    ) -> Self {
        Self {
            shared,
            worker,
            level,
            senders,
        }
    }

    /// descriptor of `id`; panics when `id` is outside the graph
    pub fn vertex(&self, id: VertexId) -> &'a Vertex<S> {
        self.shared.arena.vertex(id)
    }

    /// number of vertices in the graph
    pub fn num_vertices(&self) -> usize {
        self.shared.arena.len()
    }

    /// largest vertex id
    pub fn max_vertex_id(&self) -> VertexId {
        self.shared.arena.max_vertex_id()
    }

    /// worker running the current callback
    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// level being executed
    pub fn level(&self) -> Level {
        self.level
    }

    /// neighbor lists the driver was asked to fetch
    pub fn required_neighbor_type(&self) -> NeighborType {
        self.shared.required_neighbors
    }

    /// activate vertices for the next level
    pub fn activate(&mut self, ids: &[VertexId]) -> Result<(), EngineError> {
        for &id in ids {
            let part = self.shared.partitioner.map(id);
            self.senders.activate_to(part).add(id)?;
        }
        Ok(())
    }

    /// send a payload to one vertex; delivered and processed within the
    /// current level
    pub fn send(&mut self, dest: VertexId, payload: &[u8]) -> Result<(), EngineError> {
        let part = self.shared.partitioner.map(dest);
        self.senders.simple(part).send(dest, false, payload)
    }

    /// send one payload to many vertices
    pub fn multicast(&mut self, payload: &[u8], dests: &[VertexId]) -> Result<(), EngineError> {
        let num_workers = self.shared.config.num_threads;
        let mut per_worker: Vec<SmallVec<[VertexId; 16]>> =
            vec![SmallVec::new(); num_workers];
        for &dest in dests {
            per_worker[self.shared.partitioner.map(dest)].push(dest);
        }
        for (part, list) in per_worker.iter().enumerate() {
            if !list.is_empty() {
                self.senders.multicast_to(part).multicast(false, payload, list)?;
            }
        }
        Ok(())
    }
}

struct Running<S> {
    shared: Arc<EngineShared<S>>,
    handles: Vec<JoinHandle<()>>,
}

/// the process-wide driver: verifies the graph header, selects the record
/// decoder, wires per-worker messaging and advances the bulk-synchronous
/// level loop until a level produces no activations
pub struct GraphEngine<P: VertexProgram> {
    config: GraphConfig,
    factory: Arc<dyn IoFactory>,
    header: GraphHeader,
    decoder: Arc<dyn VertexDecoder>,
    partitioner: VertexPartitioner,
    arena: Option<VertexArena<P::State>>,
    program: Arc<P>,
    scheduler: Option<Arc<VertexScheduler>>,
    required_neighbors: NeighborType,
    running: Option<Running<P::State>>,
}

impl<P: VertexProgram> GraphEngine<P> {
    /// open the graph through `factory`, verify its header and prepare
    /// `config.num_threads` partitions over the indexed vertices
    pub fn new(
        config: GraphConfig,
        factory: Arc<dyn IoFactory>,
        index: VertexIndex,
        program: P,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let mut io = factory.open(0)?;
        let head = read_sync(io.as_mut(), 0, GraphHeader::SIZE)?;
        let header = GraphHeader::decode(&head)?;
        if header.num_vertices as usize != index.num_vertices() {
            return Err(EngineError::Format(format!(
                "graph header covers {} vertices, index covers {}",
                header.num_vertices,
                index.num_vertices()
            )));
        }
        let decoder: Arc<dyn VertexDecoder> = match header.graph_type {
            GraphType::Directed => Arc::new(DirectedDecoder),
            GraphType::Undirected => Arc::new(UndirectedDecoder),
            GraphType::TsDirected => Arc::new(TsDecoder::new(header.max_num_timestamps)),
        };
        let partitioner = VertexPartitioner::new(config.num_threads);
        let arena = VertexArena::from_entries(index.entries());
        Ok(Self {
            config,
            factory,
            header,
            decoder,
            partitioner,
            arena: Some(arena),
            program: Arc::new(program),
            scheduler: None,
            required_neighbors: NeighborType::None,
            running: None,
        })
    }

    /// the verified graph header
    pub fn header(&self) -> &GraphHeader {
        &self.header
    }

    /// the user program
    pub fn program(&self) -> &P {
        &self.program
    }

    /// vertex descriptors; `None` while workers are running
    pub fn arena(&self) -> Option<&VertexArena<P::State>> {
        self.arena.as_ref()
    }

    /// replace the default ascending-id frontier order
    pub fn set_scheduler(&mut self, scheduler: Arc<VertexScheduler>) {
        self.scheduler = Some(scheduler);
    }

    /// choose which neighbor lists programs work on; see [`VertexProgram`]
    pub fn set_required_neighbor_type(&mut self, required: NeighborType) {
        self.required_neighbors = required;
    }

    /// partition `ids` into per-worker frontiers and launch the workers
    #[instrument(skip(self, ids))]
    pub fn start(&mut self, ids: &[VertexId]) -> Result<(), EngineError> {
        let arena = self
            .arena
            .as_ref()
            .ok_or_else(|| EngineError::Config("engine already started".into()))?;
        let mut per_worker: Vec<Vec<VertexId>> = vec![Vec::new(); self.config.num_threads];
        for &id in ids {
            if arena.get(id).is_none() {
                return Err(EngineError::Config(format!(
                    "start vertex {} is outside the graph",
                    id
                )));
            }
            per_worker[self.partitioner.map(id)].push(id);
        }
        self.launch(per_worker, ids.len())
    }

    /// activate every vertex for level 0
    pub fn start_all(&mut self) -> Result<(), EngineError> {
        let arena = self
            .arena
            .as_ref()
            .ok_or_else(|| EngineError::Config("engine already started".into()))?;
        let num_vertices = arena.len();
        let per_worker = (0..self.config.num_threads)
            .map(|part| self.partitioner.vertices_in_part(part, num_vertices))
            .collect();
        self.launch(per_worker, num_vertices)
    }

    fn launch(
        &mut self,
        per_worker: Vec<Vec<VertexId>>,
        total: usize,
    ) -> Result<(), EngineError> {
        if self.running.is_some() {
            return Err(EngineError::Config("engine already started".into()));
        }
        let arena = self
            .arena
            .take()
            .ok_or_else(|| EngineError::Config("engine already started".into()))?;
        let num_workers = self.config.num_threads;
        let part_bits = self.partitioner.partition_size(arena.max_vertex_id());
        let workers = (0..num_workers)
            .map(|_| {
                CachePadded::new(WorkerShared {
                    frontier: FrontierQueue::new(self.scheduler.clone()),
                    inbox: MsgQueue::new(self.config.msg_queue_cap),
                    next_activated: AtomicBitmap::new(part_bits),
                    num_activated: AtomicUsize::new("num_activated_in_level", 0),
                    num_completed: AtomicUsize::new("num_completed_in_level", 0),
                })
            })
            .collect();
        let shared = Arc::new(EngineShared {
            trace_requests: self.config.trace_file.is_some(),
            config: self.config.clone(),
            partitioner: self.partitioner.clone(),
            arena,
            decoder: Arc::clone(&self.decoder),
            required_neighbors: self.required_neighbors,
            workers,
            barrier1: Barrier::new(num_workers),
            barrier2: Barrier::new(num_workers),
            arrived: AtomicUsize::new("arrived_at_barrier", 0),
            tot_activates: AtomicUsize::new("tot_activates", 0),
            level: AtomicUsize::new("level", 0),
            num_remaining: AtomicUsize::new("num_remaining_vertices", total),
            complete: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            error: Mutex::new(None),
        });
        for (part, ids) in per_worker.into_iter().enumerate() {
            shared.workers[part].frontier.init(ids, false)?;
        }
        let mut handles = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let shared = Arc::clone(&shared);
            let program = Arc::clone(&self.program);
            let factory = Arc::clone(&self.factory);
            let node = id % self.config.num_nodes;
            let handle = thread::Builder::new()
                .name(format!("gale-worker-{}-node{}", id, node))
                .spawn(move || worker::worker_main::<P>(id, shared, program, factory))
                .map_err(EngineError::Io)?;
            handles.push(handle);
        }
        self.running = Some(Running { shared, handles });
        Ok(())
    }

    /// join the workers. Returns the number of executed levels; a fatal
    /// worker error surfaces here, and a user panic is propagated.
    #[instrument(skip(self))]
    pub fn wait_for_completion(&mut self) -> Result<usize, EngineError> {
        let Running { shared, handles } = self
            .running
            .take()
            .ok_or_else(|| EngineError::Config("engine not started".into()))?;
        for handle in handles {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
        let levels = shared.level.load();
        let error = shared.take_error();
        let shared = Arc::try_unwrap(shared)
            .map_err(|_| EngineError::Resource("worker state still referenced".into()))?;
        self.arena = Some(shared.arena);
        match error {
            Some(e) => Err(e),
            None => Ok(levels),
        }
    }
}
