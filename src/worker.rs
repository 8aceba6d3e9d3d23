use std::{cmp::min, sync::Arc};

use tracing::instrument;

use crate::{
    compute::{ComputeKey, ComputePool, TsPhase, UserCompute},
    engine::{EngineContext, EngineShared, VertexProgram},
    error::EngineError,
    io::{IoBackend, IoCompletion, IoFactory, IoRequest},
    io_sched::ThroughputScheduler,
    message::{MessageBatch, MessageRef, SenderSet},
    types::{round_page, roundup_page, VertexId, WorkerId, PAGE_SIZE},
    vertex::{NeighborRequest, PageVertex, TimestampRange},
    worker_debug, worker_info, worker_trace,
};

/// hard cap on vertices moved by one steal
const MAX_STOLEN: usize = 1024;
/// inbound batches drained per round
const MSG_BATCH: usize = 16;
/// a time-series record this small is read whole instead of partially
const SMALL_TS_RECORD_PAGES: u64 = 3;

/// thread entry: open the worker's I/O channel and run the level loop.
/// An open failure still participates in the barrier protocol so peers
/// drain out instead of parking forever.
pub(crate) fn worker_main<P: VertexProgram>(
    id: WorkerId,
    shared: Arc<EngineShared<P::State>>,
    program: Arc<P>,
    factory: Arc<dyn IoFactory>,
) {
    match factory.open(id) {
        Ok(io) => Worker::<P>::new(id, shared, program, io).run(),
        Err(e) => {
            shared.record_error(e);
            abort_drain(&shared);
        }
    }
}

/// meet the barriers with empty work until the aggregation observes the
/// abort flag and everyone agrees to exit
fn abort_drain<S>(shared: &EngineShared<S>) {
    loop {
        shared.barrier1.wait();
        if shared.arrived.increment() + 1 == shared.config.num_threads {
            shared.complete.store(true);
            shared.tot_activates.store(0);
            shared.arrived.store(0);
        }
        shared.barrier2.wait();
        if shared.complete.load() {
            break;
        }
    }
}

/// per-thread engine half: turns activated vertices into reads, dispatches
/// completions into user callbacks, drains inbound messages and steals
/// from peers when its own frontier runs dry
pub(crate) struct Worker<P: VertexProgram> {
    id: WorkerId,
    shared: Arc<EngineShared<P::State>>,
    program: Arc<P>,
    io: Box<dyn IoBackend>,
    sched: ThroughputScheduler,
    pool: ComputePool,
    senders: SenderSet,
    steal_from: WorkerId,
    // scratch reused across iterations
    ids_buf: Vec<VertexId>,
    req_buf: Vec<IoRequest>,
    key_buf: Vec<ComputeKey>,
    completion_buf: Vec<IoCompletion>,
    batch_buf: Vec<MessageBatch>,
}

impl<P: VertexProgram> Worker<P> {
    pub fn new(
        id: WorkerId,
        shared: Arc<EngineShared<P::State>>,
        program: Arc<P>,
        io: Box<dyn IoBackend>,
    ) -> Self {
        let senders = SenderSet::new(&shared.inbox_senders(), shared.config.msg_buf_bytes);
        let steal_from = (id + 1) % shared.config.num_threads;
        Self {
            id,
            shared,
            program,
            io,
            sched: ThroughputScheduler::new(),
            pool: ComputePool::new(),
            senders,
            steal_from,
            ids_buf: Vec::new(),
            req_buf: Vec::new(),
            key_buf: Vec::new(),
            completion_buf: Vec::new(),
            batch_buf: Vec::new(),
        }
    }

    pub fn run(&mut self) {
        if let Err(e) = self.run_levels() {
            self.shared.record_error(e);
            abort_drain(&self.shared);
        }
    }

    /// the bulk-synchronous main loop
    fn run_levels(&mut self) -> Result<(), EngineError> {
        let shared = Arc::clone(&self.shared);
        loop {
            let mut num_visited = 0;
            loop {
                let budget = shared
                    .config
                    .max_processing_vertices
                    .saturating_sub(self.io.pending());
                num_visited += self.process_activated(budget)?;
                self.process_msgs()?;
                self.issue_compute_requests()?;
                let pending = self.io.pending();
                self.poll_completions(min(pending / 10, 2))?;

                if shared.aborted() {
                    break;
                }
                let me = &shared.workers[self.id];
                let processing = me.num_activated.load() > me.num_completed.load();
                // even with local work done, peers may still hold vertices
                // this worker could steal
                if !processing && me.frontier.is_empty() && shared.num_remaining.load() == 0 {
                    break;
                }
            }
            debug_assert!(shared.aborted() || shared.workers[self.id].frontier.is_empty());
            worker_debug!(
                "worker {} visited {} vertices in level {}",
                self.id,
                num_visited,
                shared.level.load()
            );

            shared.workers[self.id].num_activated.store(0);
            shared.workers[self.id].num_completed.store(0);
            self.senders.flush_all()?;
            if self.progress_next_level() {
                break;
            }
        }
        if shared.config.print_io_stat {
            let stats = self.io.stats();
            worker_info!(
                "worker {} io stat: {} reads, {} bytes",
                self.id,
                stats.reads,
                stats.bytes_read
            );
        }
        Ok(())
    }

    /// fetch up to `budget` vertices (stealing when the own frontier is
    /// empty), pre-run them and issue reads for the accepted ones
    #[instrument(skip(self))]
    fn process_activated(&mut self, budget: usize) -> Result<usize, EngineError> {
        if budget == 0 {
            return Ok(0);
        }
        let shared = Arc::clone(&self.shared);
        let program = Arc::clone(&self.program);
        let me = &shared.workers[self.id];

        self.ids_buf.clear();
        let mut num = me.frontier.fetch(&mut self.ids_buf, budget);
        if num == 0 {
            num = self.steal(budget);
        }
        if num == 0 {
            return Ok(0);
        }
        me.num_activated.add(num);

        let level = shared.level.load();
        let ids = std::mem::take(&mut self.ids_buf);
        self.req_buf.clear();
        for &id in &ids {
            let v = shared.arena.vertex(id);
            let mut ctx = EngineContext::new(&shared, self.id, level, &mut self.senders);
            if program.pre_run(&mut ctx, v) {
                let key = self.pool.alloc(UserCompute::full(id));
                self.req_buf.push(IoRequest {
                    offset: v.ext_mem_off(),
                    len: v.ext_mem_size() as usize,
                    compute: Some(key),
                });
            } else {
                shared.complete_one(self.id);
            }
        }
        self.ids_buf = ids;
        if !self.req_buf.is_empty() {
            if shared.trace_requests {
                worker_trace!("worker {} submits {} vertex reads", self.id, self.req_buf.len());
            }
            let mut reqs = std::mem::take(&mut self.req_buf);
            self.io.submit(&mut reqs)?;
            self.req_buf = reqs;
        }
        Ok(num)
    }

    /// steal a share of a peer's frontier, round-robin over all peers.
    /// More may be stolen than the local budget allows; the overflow is
    /// requeued on the own frontier so no vertex is lost.
    #[instrument(skip(self))]
    fn steal(&mut self, budget: usize) -> usize {
        let shared = Arc::clone(&self.shared);
        let num_workers = shared.config.num_threads;
        if num_workers == 1 {
            return 0;
        }
        if self.steal_from == self.id {
            self.steal_from = (self.steal_from + 1) % num_workers;
        }
        let mut buf: Vec<VertexId> = Vec::with_capacity(MAX_STOLEN);
        let mut tries = 0;
        let mut num = 0;
        while num == 0 && tries < num_workers {
            let victim = &shared.workers[self.steal_from];
            tries += 1;
            // take as much as possible without getting overloaded by it
            let share = (victim.frontier.len() / num_workers)
                .max(1)
                .min(MAX_STOLEN);
            num = victim.frontier.fetch(&mut buf, share);
            if num == 0 {
                self.steal_from = (self.steal_from + 1) % num_workers;
                if self.steal_from == self.id {
                    self.steal_from = (self.steal_from + 1) % num_workers;
                }
            }
        }
        if num > 0 {
            worker_trace!("worker {} stole {} vertices from {}", self.id, num, self.steal_from);
        }
        let take = num.min(budget);
        self.ids_buf.extend_from_slice(&buf[..take]);
        if num > take {
            shared.workers[self.id].frontier.requeue(&buf[take..]);
        }
        take
    }

    /// drain the inbound queue in bounded batches
    fn process_msgs(&mut self) -> Result<(), EngineError> {
        let shared = Arc::clone(&self.shared);
        loop {
            self.batch_buf.clear();
            if shared.workers[self.id]
                .inbox
                .fetch(&mut self.batch_buf, MSG_BATCH)
                == 0
            {
                return Ok(());
            }
            let batches = std::mem::take(&mut self.batch_buf);
            for batch in &batches {
                self.process_batch(batch)?;
            }
            self.batch_buf = batches;
        }
    }

    fn process_batch(&mut self, batch: &MessageBatch) -> Result<(), EngineError> {
        let shared = Arc::clone(&self.shared);
        let program = Arc::clone(&self.program);
        let me = &shared.workers[self.id];
        let level = shared.level.load();
        for msg in batch.iter() {
            match msg {
                MessageRef::Point {
                    dest,
                    activate,
                    payload,
                } => {
                    if shared.arena.get(dest).is_none() {
                        return Err(unknown_vertex(dest));
                    }
                    let (part, off) = shared.partitioner.map2loc(dest);
                    if part != self.id {
                        return Err(wrong_partition(dest, self.id, part));
                    }
                    if !payload.is_empty() {
                        let v = shared.arena.vertex(dest);
                        let mut ctx =
                            EngineContext::new(&shared, self.id, level, &mut self.senders);
                        program.on_messages(&mut ctx, v, &[payload]);
                    }
                    if activate {
                        me.next_activated.set(off);
                    }
                }
                MessageRef::Multicast(mmsg) => {
                    let payload = mmsg.payload();
                    for i in 0..mmsg.num_dests() {
                        let dest = mmsg.dest(i);
                        if shared.arena.get(dest).is_none() {
                            return Err(unknown_vertex(dest));
                        }
                        let (part, off) = shared.partitioner.map2loc(dest);
                        if part != self.id {
                            return Err(wrong_partition(dest, self.id, part));
                        }
                        if !payload.is_empty() {
                            let v = shared.arena.vertex(dest);
                            let mut ctx =
                                EngineContext::new(&shared, self.id, level, &mut self.senders);
                            program.on_messages(&mut ctx, v, &[payload]);
                        }
                        if mmsg.is_activate() {
                            me.next_activated.set(off);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// pull follow-up reads out of the live computes through the
    /// throughput scheduler and hand them to the I/O layer
    fn issue_compute_requests(&mut self) -> Result<(), EngineError> {
        let shared = Arc::clone(&self.shared);
        let budget = shared
            .config
            .max_processing_vertices
            .saturating_sub(self.io.pending());
        if budget == 0 || (self.pool.live() == 0 && self.sched.parked() == 0) {
            return Ok(());
        }
        self.pool.keys(&mut self.key_buf);
        let keys = std::mem::take(&mut self.key_buf);
        let mut sched = std::mem::take(&mut self.sched);
        let mut out = std::mem::take(&mut self.req_buf);
        out.clear();
        let num = sched.get_requests(&keys, |key| self.next_request_for(key), &mut out, budget);
        self.sched = sched;
        self.key_buf = keys;
        if num > 0 {
            if shared.trace_requests {
                worker_trace!("worker {} submits {} neighbor reads", self.id, num);
            }
            self.io.submit(&mut out)?;
        }
        self.req_buf = out;
        self.retire_idle_computes();
        Ok(())
    }

    /// the next read wanted by compute `key`, if any. A time-series
    /// window request on a large record spawns a partial compute whose
    /// first read is the header page; small records are read whole.
    fn next_request_for(&mut self, key: ComputeKey) -> Option<IoRequest> {
        let shared = Arc::clone(&self.shared);
        let program = Arc::clone(&self.program);
        let mut spawn_part: Option<(VertexId, VertexId, TimestampRange)> = None;
        let direct = match self.pool.get_mut(key)? {
            UserCompute::Full(c) => {
                let v = shared.arena.vertex(c.vid);
                if !program.has_required_vertices(v) {
                    None
                } else {
                    match program.next_required_vertex(v)? {
                        NeighborRequest::Full(target) => {
                            let t = shared.arena.vertex(target);
                            c.issued += 1;
                            Some(IoRequest {
                                offset: t.ext_mem_off(),
                                len: t.ext_mem_size() as usize,
                                compute: Some(key),
                            })
                        }
                        NeighborRequest::TimeRange { id: target, range } => {
                            let t = shared.arena.vertex(target);
                            let start_pg = round_page(t.ext_mem_off());
                            let end_pg =
                                roundup_page(t.ext_mem_off() + t.ext_mem_size() as u64);
                            if end_pg - start_pg <= SMALL_TS_RECORD_PAGES * PAGE_SIZE as u64 {
                                // partial fetches have overhead; a record
                                // on a few pages is read whole
                                c.issued += 1;
                                Some(IoRequest {
                                    offset: t.ext_mem_off(),
                                    len: t.ext_mem_size() as usize,
                                    compute: Some(key),
                                })
                            } else {
                                spawn_part = Some((c.vid, target, range));
                                None
                            }
                        }
                    }
                }
            }
            UserCompute::PartTs(c) => match c.phase {
                TsPhase::AwaitRange { issued: false } => {
                    let header = c.header.as_ref().expect("ts header parsed");
                    let (start, end) = header
                        .edge_list_range(c.range)
                        .expect("window checked at header parse");
                    let t = shared.arena.vertex(c.target);
                    c.phase = TsPhase::AwaitRange { issued: true };
                    Some(IoRequest {
                        offset: t.ext_mem_off() + start as u64,
                        len: end - start,
                        compute: Some(key),
                    })
                }
                _ => None,
            },
        };
        if let Some((requester, target, range)) = spawn_part {
            let part_key = self
                .pool
                .alloc(UserCompute::part_ts(requester, target, range));
            let t = shared.arena.vertex(target);
            // the slot table never outgrows the first page
            let len = PAGE_SIZE.min(t.ext_mem_size() as usize);
            return Some(IoRequest {
                offset: t.ext_mem_off(),
                len,
                compute: Some(part_key),
            });
        }
        direct
    }

    /// free full computes whose reads all arrived and whose vertex wants
    /// nothing more; happens when a program hands its last neighbor fetch
    /// over to a partial time-series compute
    fn retire_idle_computes(&mut self) {
        let shared = Arc::clone(&self.shared);
        self.pool.keys(&mut self.key_buf);
        let keys = std::mem::take(&mut self.key_buf);
        for &key in &keys {
            let retire = match self.pool.get(key) {
                Some(UserCompute::Full(c)) => {
                    c.ran_self
                        && c.issued == c.fetched
                        && !self.program.has_required_vertices(shared.arena.vertex(c.vid))
                }
                _ => false,
            };
            if retire {
                self.pool.free(key);
            }
        }
        self.key_buf = keys;
    }

    /// bounded completion polling; dispatches each arrived page into the
    /// owning compute
    fn poll_completions(&mut self, min_complete: usize) -> Result<(), EngineError> {
        if self.io.pending() == 0 {
            return Ok(());
        }
        self.completion_buf.clear();
        let mut completions = std::mem::take(&mut self.completion_buf);
        self.io.wait(min_complete, &mut completions)?;
        for completion in completions.drain(..) {
            self.handle_completion(completion)?;
        }
        self.completion_buf = completions;
        Ok(())
    }

    fn handle_completion(&mut self, completion: IoCompletion) -> Result<(), EngineError> {
        let Some(key) = completion.compute else {
            return Ok(());
        };
        match self.pool.get(key) {
            Some(UserCompute::Full(_)) => self.handle_full_page(key, &completion.data),
            Some(UserCompute::PartTs(_)) => self.handle_part_ts_page(key, &completion.data),
            None => Err(EngineError::Protocol(
                "completion for a retired compute".into(),
            )),
        }
    }

    /// a page for a full compute: the first one is the vertex's own record
    /// and goes to `run`, every later one is a neighbor and goes to
    /// `run_on_neighbors`
    fn handle_full_page(&mut self, key: ComputeKey, data: &[u8]) -> Result<(), EngineError> {
        let shared = Arc::clone(&self.shared);
        let program = Arc::clone(&self.program);
        let page = shared.decoder.decode(data)?;
        let (vid, first_page) = {
            let Some(UserCompute::Full(c)) = self.pool.get_mut(key) else {
                unreachable!("checked by caller");
            };
            let first_page = !c.ran_self;
            if first_page {
                c.ran_self = true;
            } else {
                c.fetched += 1;
            }
            (c.vid, first_page)
        };
        let v = shared.arena.vertex(vid);
        let level = shared.level.load();
        let completed = {
            let mut ctx = EngineContext::new(&shared, self.id, level, &mut self.senders);
            if first_page {
                program.run(&mut ctx, v, &page)
            } else {
                program.run_on_neighbors(&mut ctx, v, std::slice::from_ref(&page))
            }
        };
        let wants_more = program.has_required_vertices(v);
        let (newly_completed, retire, was_completed) = {
            let Some(UserCompute::Full(c)) = self.pool.get_mut(key) else {
                unreachable!("checked by caller");
            };
            let newly_completed = completed && !c.completed;
            if newly_completed {
                c.completed = true;
            }
            (newly_completed, c.issued == c.fetched && !wants_more, c.completed)
        };
        if newly_completed {
            shared.complete_one(self.id);
        }
        if retire {
            debug_assert!(
                was_completed,
                "vertex {} retired without declaring completion",
                vid
            );
            self.pool.free(key);
        }
        Ok(())
    }

    /// a page for a partial time-series compute: first the header, then
    /// the requested byte range, which is decoded and delivered to the
    /// requesting vertex
    fn handle_part_ts_page(&mut self, key: ComputeKey, data: &[u8]) -> Result<(), EngineError> {
        let shared = Arc::clone(&self.shared);
        let program = Arc::clone(&self.program);
        let level = shared.level.load();

        let awaiting_header = {
            let Some(UserCompute::PartTs(c)) = self.pool.get(key) else {
                unreachable!("checked by caller");
            };
            matches!(c.phase, TsPhase::AwaitHeader)
        };
        if awaiting_header {
            let header = shared.decoder.ts_index(data)?;
            let (requester, target, empty_window) = {
                let Some(UserCompute::PartTs(c)) = self.pool.get_mut(key) else {
                    unreachable!("checked by caller");
                };
                let empty = header.edge_list_range(c.range).is_none();
                if empty {
                    c.phase = TsPhase::Done;
                } else {
                    c.header = Some(header);
                    c.phase = TsPhase::AwaitRange { issued: false };
                }
                (c.requester, c.target, empty)
            };
            if empty_window {
                // nothing stored for the window; deliver an empty neighbor
                let page = PageVertex::directed(target, Vec::new(), Vec::new());
                let v = shared.arena.vertex(requester);
                let completed = {
                    let mut ctx = EngineContext::new(&shared, self.id, level, &mut self.senders);
                    program.run_on_neighbors(&mut ctx, v, std::slice::from_ref(&page))
                };
                if completed {
                    shared.complete_one(self.id);
                }
                self.pool.free(key);
            }
            return Ok(());
        }

        let (requester, range, header) = {
            let Some(UserCompute::PartTs(c)) = self.pool.get_mut(key) else {
                unreachable!("checked by caller");
            };
            debug_assert!(matches!(c.phase, TsPhase::AwaitRange { issued: true }));
            c.phase = TsPhase::Done;
            (
                c.requester,
                c.range,
                c.header.clone().expect("ts header parsed"),
            )
        };
        let page = shared.decoder.decode_ts_range(&header, range, data)?;
        let v = shared.arena.vertex(requester);
        let completed = {
            let mut ctx = EngineContext::new(&shared, self.id, level, &mut self.senders);
            program.run_on_neighbors(&mut ctx, v, std::slice::from_ref(&page))
        };
        if completed {
            shared.complete_one(self.id);
        }
        self.pool.free(key);
        Ok(())
    }

    /// translate the next-level bitmap into the new frontier after all
    /// peer messages are in
    fn enter_next_level(&mut self) -> Result<usize, EngineError> {
        self.process_msgs()?;
        let shared = Arc::clone(&self.shared);
        let me = &shared.workers[self.id];
        let num = me
            .frontier
            .init_from_bitmap(&me.next_activated, self.id, &shared.partitioner)?;
        me.next_activated.clear_all();
        Ok(num)
    }

    /// two-phase level barrier. The last worker to arrive between the
    /// barriers aggregates the next level's activation total, advances the
    /// level counter and raises the termination flag when nothing is left.
    #[instrument(skip(self))]
    fn progress_next_level(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        shared.barrier1.wait();
        let num = if shared.aborted() {
            0
        } else {
            match self.enter_next_level() {
                Ok(num) => num,
                Err(e) => {
                    shared.record_error(e);
                    0
                }
            }
        };
        shared.tot_activates.add(num);
        if shared.arrived.increment() + 1 == shared.config.num_threads {
            let tot = shared.tot_activates.load();
            let level = shared.level.increment() + 1;
            if !shared.aborted() {
                debug_assert_eq!(shared.num_remaining.load(), 0);
            }
            shared.num_remaining.store(tot);
            shared.complete.store(tot == 0 || shared.aborted());
            shared.tot_activates.store(0);
            shared.arrived.store(0);
            worker_info!("progress to level {}, {} vertices in this level", level, tot);
        }
        shared.barrier2.wait();
        shared.complete.load()
    }
}

fn wrong_partition(dest: VertexId, worker: WorkerId, owner: WorkerId) -> EngineError {
    EngineError::Protocol(format!(
        "message for vertex {} reached worker {}, owner is {}",
        dest, worker, owner
    ))
}

fn unknown_vertex(dest: VertexId) -> EngineError {
    EngineError::Protocol(format!("message for vertex {} outside the graph", dest))
}
