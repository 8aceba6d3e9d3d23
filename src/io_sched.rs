use std::{
    cmp::Reverse,
    collections::{BinaryHeap, VecDeque},
};

use tracing::instrument;

use crate::{compute::ComputeKey, io::IoRequest};

/// Reorders candidate requests by file offset to favor throughput: all
/// active user computes are processed together so consecutive requests
/// land close on disk and the page cache gets reused.
///
/// Each round takes one request per compute into a min-heap keyed by
/// offset, releases them ascending, and parks whatever was fetched but
/// did not fit for the next round.
#[derive(Default)]
pub struct ThroughputScheduler {
    parked: VecDeque<IoRequest>,
}

struct HeapEntry {
    req: IoRequest,
    key: ComputeKey,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.req.offset == other.req.offset && self.key == other.key
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.req
            .offset
            .cmp(&other.req.offset)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl ThroughputScheduler {
    /// empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// requests parked for the next round
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    /// fill `out` with up to `budget` requests and return the count
    /// pushed. `next` pulls the next candidate request of one compute;
    /// computes with nothing to read answer `None`. Within the heap round
    /// emitted offsets are non-decreasing.
    #[instrument(skip(self, next, out))]
    pub fn get_requests<F>(
        &mut self,
        keys: &[ComputeKey],
        mut next: F,
        out: &mut Vec<IoRequest>,
        budget: usize,
    ) -> usize
    where
        F: FnMut(ComputeKey) -> Option<IoRequest>,
    {
        let mut num = 0;
        // requests parked by the previous round leave first, in order
        while num < budget {
            match self.parked.pop_front() {
                Some(req) => {
                    out.push(req);
                    num += 1;
                }
                None => break,
            }
        }
        if num >= budget {
            return num;
        }

        let mut heap = BinaryHeap::with_capacity(keys.len());
        for &key in keys {
            if let Some(req) = next(key) {
                heap.push(Reverse(HeapEntry { req, key }));
            }
        }

        let mut prev = 0u64;
        while num < budget {
            let Some(Reverse(entry)) = heap.pop() else {
                break;
            };
            debug_assert!(prev <= entry.req.offset);
            prev = entry.req.offset;
            let key = entry.key;
            out.push(entry.req);
            num += 1;
            if let Some(req) = next(key) {
                heap.push(Reverse(HeapEntry { req, key }));
            }
        }

        // already fetched from their computes but out of budget; keep them
        // for the next call
        while let Some(Reverse(entry)) = heap.pop() {
            self.parked.push_back(entry.req);
        }
        num
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn req(offset: u64) -> IoRequest {
        IoRequest {
            offset,
            len: 16,
            compute: None,
        }
    }

    fn run(
        sched: &mut ThroughputScheduler,
        queues: &mut [VecDeque<IoRequest>],
        budget: usize,
    ) -> Vec<u64> {
        let keys: Vec<ComputeKey> = (0..queues.len()).map(ComputeKey).collect();
        let mut out = Vec::new();
        let n = sched.get_requests(&keys, |k| queues[k.0].pop_front(), &mut out, budget);
        assert_eq!(n, out.len());
        out.into_iter().map(|r| r.offset).collect()
    }

    #[test]
    fn offsets_are_emitted_ascending() {
        let mut sched = ThroughputScheduler::new();
        let mut queues = vec![
            VecDeque::from(vec![req(400), req(500)]),
            VecDeque::from(vec![req(100)]),
            VecDeque::from(vec![req(250), req(900)]),
        ];
        let offsets = run(&mut sched, &mut queues, 16);
        assert_eq!(offsets, vec![100, 250, 400, 500, 900]);
        assert_eq!(sched.parked(), 0);
    }

    #[test]
    fn budget_parks_the_rest_for_the_next_round() {
        let mut sched = ThroughputScheduler::new();
        let mut queues = vec![
            VecDeque::from(vec![req(300)]),
            VecDeque::from(vec![req(100)]),
            VecDeque::from(vec![req(200)]),
        ];
        let offsets = run(&mut sched, &mut queues, 2);
        assert_eq!(offsets, vec![100, 200]);
        assert_eq!(sched.parked(), 1);

        // the parked request drains first on the next call
        let offsets = run(&mut sched, &mut queues, 4);
        assert_eq!(offsets, vec![300]);
        assert_eq!(sched.parked(), 0);
    }

    #[test]
    fn one_request_per_compute_then_refill() {
        let mut sched = ThroughputScheduler::new();
        // the second request of the low compute sits behind a high offset,
        // so the heap interleaves computes rather than draining one
        let mut queues = vec![
            VecDeque::from(vec![req(10), req(700)]),
            VecDeque::from(vec![req(600)]),
        ];
        let offsets = run(&mut sched, &mut queues, 16);
        assert_eq!(offsets, vec![10, 600, 700]);
    }
}
