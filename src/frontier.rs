use std::sync::Arc;

use rayon::prelude::*;

use crate::{
    bitmap::AtomicBitmap,
    error::EngineError,
    partition::VertexPartitioner,
    types::{Mutex, VertexId, WorkerId},
};

/// frontier ordering hook installed via `GraphEngine::set_scheduler`;
/// replaces the default ascending-id order
pub type VertexScheduler = dyn Fn(&mut Vec<VertexId>) + Send + Sync;

const PAR_SORT_THRESHOLD: usize = 1 << 13;

struct Inner {
    sorted: Vec<VertexId>,
    fetch_idx: usize,
}

/// per-worker queue of the vertices activated for the current level.
/// Fetched by the owner and by stealers under the internal lock;
/// re-initialized by the owner only, between levels.
pub struct FrontierQueue {
    inner: Mutex<Inner>,
    scheduler: Option<Arc<VertexScheduler>>,
}

impl FrontierQueue {
    /// empty queue; `scheduler` overrides the default ascending order
    pub fn new(scheduler: Option<Arc<VertexScheduler>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sorted: Vec::new(),
                fetch_idx: 0,
            }),
            scheduler,
        }
    }

    fn order(&self, ids: &mut Vec<VertexId>) {
        match &self.scheduler {
            Some(s) => s(ids),
            None if ids.len() >= PAR_SORT_THRESHOLD => ids.par_sort_unstable(),
            None => ids.sort_unstable(),
        }
    }

    /// replace the queue contents, sorting unless `sorted` says otherwise.
    /// Fails with `FrontierBusy` when a concurrent fetch holds the lock;
    /// initialization is only legal between levels.
    pub fn init(&self, mut ids: Vec<VertexId>, sorted: bool) -> Result<usize, EngineError> {
        if !sorted {
            self.order(&mut ids);
        }
        let mut guard = self.inner.try_lock().ok_or(EngineError::FrontierBusy)?;
        guard.fetch_idx = 0;
        let num = ids.len();
        guard.sorted = ids;
        Ok(num)
    }

    /// translate the set bits of `map` back to vertex ids and install them
    pub fn init_from_bitmap(
        &self,
        map: &AtomicBitmap,
        part: WorkerId,
        partitioner: &VertexPartitioner,
    ) -> Result<usize, EngineError> {
        let mut offs = Vec::new();
        map.get_set_bits(&mut offs);
        let mut ids: Vec<VertexId> = offs
            .into_iter()
            .map(|off| partitioner.loc2map(part, off))
            .collect();
        // ascending offsets translate to ascending ids under the modular
        // map, so only a custom scheduler needs to reorder
        if let Some(s) = &self.scheduler {
            s(&mut ids);
        }
        let mut guard = self.inner.try_lock().ok_or(EngineError::FrontierBusy)?;
        guard.fetch_idx = 0;
        let num = ids.len();
        guard.sorted = ids;
        Ok(num)
    }

    /// pop up to `max` ids from the front into `out`; returns the count,
    /// `0` when the queue is drained
    pub fn fetch(&self, out: &mut Vec<VertexId>, max: usize) -> usize {
        let mut guard = self.inner.lock();
        let start = guard.fetch_idx;
        let num = max.min(guard.sorted.len() - start);
        out.extend_from_slice(&guard.sorted[start..start + num]);
        guard.fetch_idx += num;
        num
    }

    /// put stolen overflow back. The stealer's own queue is drained when
    /// this is called, so the ids become the new contents; anything not yet
    /// consumed is kept ahead of them.
    pub fn requeue(&self, ids: &[VertexId]) {
        let mut guard = self.inner.lock();
        if guard.fetch_idx == guard.sorted.len() {
            guard.sorted.clear();
            guard.fetch_idx = 0;
        }
        guard.sorted.extend_from_slice(ids);
    }

    /// vertices not yet fetched
    pub fn len(&self) -> usize {
        let guard = self.inner.lock();
        guard.sorted.len() - guard.fetch_idx
    }

    /// whether every vertex has been fetched
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn hold_lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sorts_and_fetch_drains_in_order() {
        let q = FrontierQueue::new(None);
        q.init(vec![5, 1, 9, 3], false).unwrap();
        assert_eq!(q.len(), 4);
        let mut out = Vec::new();
        assert_eq!(q.fetch(&mut out, 3), 3);
        assert_eq!(out, vec![1, 3, 5]);
        assert_eq!(q.fetch(&mut out, 3), 1);
        assert_eq!(out, vec![1, 3, 5, 9]);
        assert_eq!(q.fetch(&mut out, 3), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn init_fails_while_lock_is_held() {
        let q = FrontierQueue::new(None);
        q.init(vec![1, 2], true).unwrap();
        let guard = q.hold_lock();
        assert!(matches!(
            q.init(vec![3], true),
            Err(EngineError::FrontierBusy)
        ));
        drop(guard);
        q.init(vec![3], true).unwrap();
    }

    #[test]
    fn custom_scheduler_controls_order() {
        let q = FrontierQueue::new(Some(Arc::new(|ids: &mut Vec<VertexId>| {
            ids.sort_unstable_by(|a, b| b.cmp(a))
        })));
        q.init(vec![1, 3, 2], false).unwrap();
        let mut out = Vec::new();
        q.fetch(&mut out, 3);
        assert_eq!(out, vec![3, 2, 1]);
    }

    #[test]
    fn requeue_preserves_every_vertex() {
        let q = FrontierQueue::new(None);
        q.init(vec![1, 2, 3, 4], true).unwrap();
        let mut out = Vec::new();
        q.fetch(&mut out, 4);
        q.requeue(&[7, 8]);
        let mut rest = Vec::new();
        assert_eq!(q.fetch(&mut rest, 10), 2);
        assert_eq!(rest, vec![7, 8]);
    }

    #[test]
    fn bitmap_init_translates_offsets() {
        let p = VertexPartitioner::new(4);
        let map = AtomicBitmap::new(16);
        // local offsets 0 and 2 of partition 1 are ids 1 and 9
        map.set(0);
        map.set(2);
        let q = FrontierQueue::new(None);
        assert_eq!(q.init_from_bitmap(&map, 1, &p).unwrap(), 2);
        let mut out = Vec::new();
        q.fetch(&mut out, 4);
        assert_eq!(out, vec![1, 9]);
    }

    #[test]
    fn concurrent_fetch_is_exact_once() {
        let q = Arc::new(FrontierQueue::new(None));
        q.init((0..10_000).collect(), true).unwrap();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    let before = got.len();
                    if q.fetch(&mut got, 33) == 0 {
                        break;
                    }
                    assert!(got.len() > before);
                }
                got
            }));
        }
        let mut all: Vec<VertexId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..10_000).collect::<Vec<_>>());
    }
}
