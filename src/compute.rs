use crate::{format::TsIndex, types::VertexId, vertex::TimestampRange};

/// handle of a pooled user compute; carried by in-flight I/O requests
/// instead of a back-pointer into the worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComputeKey(pub(crate) usize);

/// progress of a partial time-series read
#[derive(Debug)]
pub(crate) enum TsPhase {
    /// header page in flight
    AwaitHeader,
    /// header parsed; the range read goes out when `issued` flips
    AwaitRange {
        /// whether the range request was handed to the I/O layer
        issued: bool,
    },
    /// neighbor delivered to the requesting vertex
    Done,
}

/// tracks the outstanding reads issued on behalf of one vertex
#[derive(Debug)]
pub(crate) struct FullCompute {
    /// vertex being processed
    pub vid: VertexId,
    /// neighbor requests attributed to this compute
    pub issued: usize,
    /// neighbor pages delivered
    pub fetched: usize,
    /// whether the vertex's own page has been dispatched to `run`
    pub ran_self: bool,
    /// whether a user call declared the vertex complete
    pub completed: bool,
}

/// reads one neighbor's time slice in two steps and hands the decoded
/// neighbor to the requesting vertex
#[derive(Debug)]
pub(crate) struct PartTsCompute {
    /// vertex the neighbor will be delivered to
    pub requester: VertexId,
    /// neighbor being read
    pub target: VertexId,
    /// requested window
    pub range: TimestampRange,
    /// read progress
    pub phase: TsPhase,
    /// slot table parsed from the header page
    pub header: Option<TsIndex>,
}

pub(crate) enum UserCompute {
    Full(FullCompute),
    PartTs(PartTsCompute),
}

impl UserCompute {
    pub fn full(vid: VertexId) -> Self {
        Self::Full(FullCompute {
            vid,
            issued: 0,
            fetched: 0,
            ran_self: false,
            completed: false,
        })
    }

    pub fn part_ts(requester: VertexId, target: VertexId, range: TimestampRange) -> Self {
        Self::PartTs(PartTsCompute {
            requester,
            target,
            range,
            phase: TsPhase::AwaitHeader,
            header: None,
        })
    }
}

/// per-worker slab pool of user computes; alloc and free are O(1) and
/// unsynchronized (each worker owns its pool)
pub(crate) struct ComputePool {
    slots: Vec<Option<UserCompute>>,
    free: Vec<usize>,
    live: usize,
}

impl ComputePool {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn alloc(&mut self, compute: UserCompute) -> ComputeKey {
        self.live += 1;
        match self.free.pop() {
            Some(at) => {
                self.slots[at] = Some(compute);
                ComputeKey(at)
            }
            None => {
                self.slots.push(Some(compute));
                ComputeKey(self.slots.len() - 1)
            }
        }
    }

    pub fn free(&mut self, key: ComputeKey) -> UserCompute {
        let compute = self.slots[key.0].take().expect("free of an empty slot");
        self.free.push(key.0);
        self.live -= 1;
        compute
    }

    pub fn get(&self, key: ComputeKey) -> Option<&UserCompute> {
        self.slots.get(key.0).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, key: ComputeKey) -> Option<&mut UserCompute> {
        self.slots.get_mut(key.0).and_then(|s| s.as_mut())
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// collect the keys of all live computes
    pub fn keys(&self, out: &mut Vec<ComputeKey>) {
        out.clear();
        for (at, slot) in self.slots.iter().enumerate() {
            if slot.is_some() {
                out.push(ComputeKey(at));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_freed_slots() {
        let mut pool = ComputePool::new();
        let a = pool.alloc(UserCompute::full(1));
        let b = pool.alloc(UserCompute::full(2));
        assert_eq!(pool.live(), 2);
        pool.free(a);
        let c = pool.alloc(UserCompute::full(3));
        assert_eq!(a, c);
        assert_eq!(pool.live(), 2);
        match pool.get(c) {
            Some(UserCompute::Full(f)) => assert_eq!(f.vid, 3),
            _ => panic!("expected full compute"),
        }
        let mut keys = Vec::new();
        pool.keys(&mut keys);
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&b));
    }
}
