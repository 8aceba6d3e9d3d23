use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use smallvec::SmallVec;

use crate::{
    error::EngineError,
    types::{VertexId, WorkerId},
};

const KIND_POINT: u8 = 0;
const KIND_MULTICAST: u8 = 1;
const FLAG_ACTIVATE: u8 = 1;
const MAX_ACTIVATION_DESTS: usize = 512;

/// one flushed sender buffer; the unit of transfer between workers
pub struct MessageBatch {
    data: Vec<u8>,
}

impl MessageBatch {
    /// iterate the records of the batch in send order
    pub fn iter(&self) -> MessageIter<'_> {
        MessageIter {
            buf: &self.data,
            pos: 0,
        }
    }

    /// serialized size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// whether the batch carries no records
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// decoded view of one inbound record
pub enum MessageRef<'a> {
    /// point-to-point record
    Point {
        /// destination vertex
        dest: VertexId,
        /// activation flag
        activate: bool,
        /// user payload; empty for pure activations
        payload: &'a [u8],
    },
    /// one body with many destinations
    Multicast(MulticastRef<'a>),
}

/// decoded view of a multicast record
pub struct MulticastRef<'a> {
    activate: bool,
    dests: &'a [u8],
    num_dests: usize,
    payload: &'a [u8],
}

impl<'a> MulticastRef<'a> {
    /// number of destination vertices
    pub fn num_dests(&self) -> usize {
        self.num_dests
    }

    /// destination `i`
    pub fn dest(&self, i: usize) -> VertexId {
        let at = i * 8;
        u64::from_le_bytes(self.dests[at..at + 8].try_into().expect("dest slot"))
    }

    /// activation flag
    pub fn is_activate(&self) -> bool {
        self.activate
    }

    /// shared payload; empty for pure activations
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

/// iterator over the records of a [`MessageBatch`]
pub struct MessageIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(buf.get(at..at + 8)?.try_into().ok()?))
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = MessageRef<'a>;

    fn next(&mut self) -> Option<MessageRef<'a>> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let kind = self.buf[self.pos];
        let flags = *self.buf.get(self.pos + 1)?;
        let activate = flags & FLAG_ACTIVATE != 0;
        let mut pos = self.pos + 2;
        match kind {
            KIND_POINT => {
                let dest = read_u64(self.buf, pos)?;
                pos += 8;
                let plen = read_u32(self.buf, pos)? as usize;
                pos += 4;
                let payload = self.buf.get(pos..pos + plen)?;
                self.pos = pos + plen;
                Some(MessageRef::Point {
                    dest,
                    activate,
                    payload,
                })
            }
            KIND_MULTICAST => {
                let num_dests = read_u32(self.buf, pos)? as usize;
                pos += 4;
                let dests = self.buf.get(pos..pos + num_dests * 8)?;
                pos += num_dests * 8;
                let plen = read_u32(self.buf, pos)? as usize;
                pos += 4;
                let payload = self.buf.get(pos..pos + plen)?;
                self.pos = pos + plen;
                Some(MessageRef::Multicast(MulticastRef {
                    activate,
                    dests,
                    num_dests,
                    payload,
                }))
            }
            _ => {
                debug_assert!(false, "corrupt message batch");
                None
            }
        }
    }
}

/// bounded inbound queue of message batches: many producers, one consumer.
/// A send that finds the queue full is a protocol violation, not backpressure.
pub struct MsgQueue {
    tx: Sender<MessageBatch>,
    rx: Receiver<MessageBatch>,
}

impl MsgQueue {
    /// queue holding up to `cap` batches
    pub fn new(cap: usize) -> Self {
        let (tx, rx) = bounded(cap);
        Self { tx, rx }
    }

    /// producer handle for a peer worker's senders
    pub fn sender(&self) -> Sender<MessageBatch> {
        self.tx.clone()
    }

    /// drain up to `max` batches without blocking; returns the count
    pub fn fetch(&self, out: &mut Vec<MessageBatch>, max: usize) -> usize {
        let mut num = 0;
        while num < max {
            match self.rx.try_recv() {
                Ok(batch) => {
                    out.push(batch);
                    num += 1;
                }
                Err(_) => break,
            }
        }
        num
    }

    /// whether no batch is waiting
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

fn push_batch(tx: &Sender<MessageBatch>, data: Vec<u8>) -> Result<(), EngineError> {
    match tx.try_send(MessageBatch { data }) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(EngineError::Protocol(
            "inbound message queue overflowed its cap".into(),
        )),
        Err(TrySendError::Disconnected(_)) => Err(EngineError::Protocol(
            "message queue receiver is gone".into(),
        )),
    }
}

/// point-to-point sender; one per (source, destination) worker pair.
/// Records accumulate in a buffer handed over as a single batch on flush.
pub struct SimpleSender {
    tx: Sender<MessageBatch>,
    buf: Vec<u8>,
    flush_bytes: usize,
}

impl SimpleSender {
    /// sender flushing automatically past `flush_bytes` buffered bytes
    pub fn new(tx: Sender<MessageBatch>, flush_bytes: usize) -> Self {
        Self {
            tx,
            buf: Vec::new(),
            flush_bytes,
        }
    }

    /// buffer one message for `dest`
    pub fn send(
        &mut self,
        dest: VertexId,
        activate: bool,
        payload: &[u8],
    ) -> Result<(), EngineError> {
        let record = 2 + 8 + 4 + payload.len();
        if !self.buf.is_empty() && self.buf.len() + record > self.flush_bytes {
            self.flush()?;
        }
        self.buf.push(KIND_POINT);
        self.buf.push(if activate { FLAG_ACTIVATE } else { 0 });
        self.buf.extend_from_slice(&dest.to_le_bytes());
        self.buf
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    /// enqueue the buffered records at the destination worker. Does not
    /// wait for processing, only for the enqueue.
    pub fn flush(&mut self) -> Result<(), EngineError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        push_batch(&self.tx, std::mem::take(&mut self.buf))
    }
}

/// multicast sender: records carrying one body and many destinations
pub struct MulticastSender {
    tx: Sender<MessageBatch>,
    buf: Vec<u8>,
    flush_bytes: usize,
}

impl MulticastSender {
    /// sender flushing automatically past `flush_bytes` buffered bytes
    pub fn new(tx: Sender<MessageBatch>, flush_bytes: usize) -> Self {
        Self {
            tx,
            buf: Vec::new(),
            flush_bytes,
        }
    }

    /// buffer one body for `dests`
    pub fn multicast(
        &mut self,
        activate: bool,
        payload: &[u8],
        dests: &[VertexId],
    ) -> Result<(), EngineError> {
        if dests.is_empty() {
            return Ok(());
        }
        let record = 2 + 4 + dests.len() * 8 + 4 + payload.len();
        if !self.buf.is_empty() && self.buf.len() + record > self.flush_bytes {
            self.flush()?;
        }
        self.buf.push(KIND_MULTICAST);
        self.buf.push(if activate { FLAG_ACTIVATE } else { 0 });
        self.buf
            .extend_from_slice(&(dests.len() as u32).to_le_bytes());
        for dest in dests {
            self.buf.extend_from_slice(&dest.to_le_bytes());
        }
        self.buf
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    /// enqueue the buffered records at the destination worker
    pub fn flush(&mut self) -> Result<(), EngineError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        push_batch(&self.tx, std::mem::take(&mut self.buf))
    }
}

/// degenerate multicast carrying only activation bits; destinations
/// accumulate across calls and leave as one empty-body record
pub struct ActivationSender {
    tx: Sender<MessageBatch>,
    dests: SmallVec<[VertexId; 64]>,
}

impl ActivationSender {
    /// empty activation sender
    pub fn new(tx: Sender<MessageBatch>) -> Self {
        Self {
            tx,
            dests: SmallVec::new(),
        }
    }

    /// record one activation
    pub fn add(&mut self, dest: VertexId) -> Result<(), EngineError> {
        self.dests.push(dest);
        if self.dests.len() >= MAX_ACTIVATION_DESTS {
            self.flush()?;
        }
        Ok(())
    }

    /// enqueue the accumulated activations at the destination worker
    pub fn flush(&mut self) -> Result<(), EngineError> {
        if self.dests.is_empty() {
            return Ok(());
        }
        let mut data = Vec::with_capacity(2 + 4 + self.dests.len() * 8 + 4);
        data.push(KIND_MULTICAST);
        data.push(FLAG_ACTIVATE);
        data.extend_from_slice(&(self.dests.len() as u32).to_le_bytes());
        for dest in &self.dests {
            data.extend_from_slice(&dest.to_le_bytes());
        }
        data.extend_from_slice(&0u32.to_le_bytes());
        self.dests.clear();
        push_batch(&self.tx, data)
    }
}

/// a worker's outbound senders, one of each kind per destination worker
pub(crate) struct SenderSet {
    simple: Vec<SimpleSender>,
    multicast: Vec<MulticastSender>,
    activate: Vec<ActivationSender>,
}

impl SenderSet {
    pub fn new(queues: &[Sender<MessageBatch>], flush_bytes: usize) -> Self {
        Self {
            simple: queues
                .iter()
                .map(|tx| SimpleSender::new(tx.clone(), flush_bytes))
                .collect(),
            multicast: queues
                .iter()
                .map(|tx| MulticastSender::new(tx.clone(), flush_bytes))
                .collect(),
            activate: queues
                .iter()
                .map(|tx| ActivationSender::new(tx.clone()))
                .collect(),
        }
    }

    pub fn simple(&mut self, w: WorkerId) -> &mut SimpleSender {
        &mut self.simple[w]
    }

    pub fn multicast_to(&mut self, w: WorkerId) -> &mut MulticastSender {
        &mut self.multicast[w]
    }

    pub fn activate_to(&mut self, w: WorkerId) -> &mut ActivationSender {
        &mut self.activate[w]
    }

    /// flush every sender; mandatory at the level barrier
    pub fn flush_all(&mut self) -> Result<(), EngineError> {
        for s in &mut self.simple {
            s.flush()?;
        }
        for s in &mut self.multicast {
            s.flush()?;
        }
        for s in &mut self.activate {
            s.flush()?;
        }
        Ok(())
    }
}
