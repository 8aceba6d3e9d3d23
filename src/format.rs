//! On-disk layouts and their decoders. The engine only consumes the
//! [`VertexDecoder`] contract; the concrete record codecs live here so the
//! driver can pick one from the graph header, and the encoders back the
//! graph construction tools and tests.
//!
//! Record layouts (little-endian):
//!
//! - directed: `id u64 | num_in u32 | num_out u32 | in ids u64* | out ids u64*`
//! - undirected: `id u64 | num u32 | ids u64*`
//! - ts-directed: `id u64 | num_ts u32 | (ts u32, count u32)* | edge ids u64*`,
//!   edge arrays concatenated in slot order after the header

use crate::{
    error::EngineError,
    types::{Timestamp, VertexId, PAGE_SIZE},
    vertex::{PageVertex, TimestampRange},
};

/// graph file magic
pub const GRAPH_MAGIC: u64 = u64::from_le_bytes(*b"galegrph");
/// index file magic
pub const INDEX_MAGIC: u64 = u64::from_le_bytes(*b"galevidx");
/// on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// kind of graph stored in a file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphType {
    /// separate in- and out-edge lists per record
    Directed,
    /// one symmetric edge list per record
    Undirected,
    /// directed edges bucketed by timestamp
    TsDirected,
}

/// header page at offset 0 of the graph file
#[derive(Clone, Debug)]
pub struct GraphHeader {
    /// graph kind tag
    pub graph_type: GraphType,
    /// number of vertices in the file
    pub num_vertices: u64,
    /// maximum timestamps per record; time-series graphs only
    pub max_num_timestamps: u32,
}

impl GraphHeader {
    /// the header owns the first page
    pub const SIZE: usize = PAGE_SIZE;

    /// serialize the header page
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&GRAPH_MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        let tag: u32 = match self.graph_type {
            GraphType::Directed => 1,
            GraphType::Undirected => 2,
            GraphType::TsDirected => 3,
        };
        buf[12..16].copy_from_slice(&tag.to_le_bytes());
        buf[16..24].copy_from_slice(&self.num_vertices.to_le_bytes());
        buf[24..28].copy_from_slice(&self.max_num_timestamps.to_le_bytes());
        buf
    }

    /// decode and verify a header page
    pub fn decode(buf: &[u8]) -> Result<Self, EngineError> {
        if u64_at(buf, 0)? != GRAPH_MAGIC {
            return Err(EngineError::Format("bad graph file magic".into()));
        }
        let version = u32_at(buf, 8)?;
        if version != FORMAT_VERSION {
            return Err(EngineError::Format(format!(
                "unsupported format version {}",
                version
            )));
        }
        let graph_type = match u32_at(buf, 12)? {
            1 => GraphType::Directed,
            2 => GraphType::Undirected,
            3 => GraphType::TsDirected,
            tag => {
                return Err(EngineError::Format(format!("unknown graph type {}", tag)));
            }
        };
        Ok(Self {
            graph_type,
            num_vertices: u64_at(buf, 16)?,
            max_num_timestamps: u32_at(buf, 24)?,
        })
    }
}

/// decodes raw vertex records of one on-disk layout. The time-series
/// entry points answer for `GraphType::TsDirected` only.
pub trait VertexDecoder: Send + Sync {
    /// decode a full record
    fn decode(&self, bytes: &[u8]) -> Result<PageVertex, EngineError>;

    /// parse the slot table from the header portion of a record
    fn ts_index(&self, _bytes: &[u8]) -> Result<TsIndex, EngineError> {
        Err(EngineError::Format("not a time-series record".into()))
    }

    /// decode the byte range previously located via [`TsIndex`]
    fn decode_ts_range(
        &self,
        _index: &TsIndex,
        _range: TimestampRange,
        _bytes: &[u8],
    ) -> Result<PageVertex, EngineError> {
        Err(EngineError::Format("not a time-series record".into()))
    }
}

/// slot table parsed from a time-series record header; byte offsets are
/// relative to the record start
#[derive(Clone, Debug)]
pub struct TsIndex {
    id: VertexId,
    slots: Vec<TsSlot>,
}

#[derive(Clone, Copy, Debug)]
struct TsSlot {
    ts: Timestamp,
    start: usize,
    end: usize,
}

impl TsIndex {
    /// id of the record the header belongs to
    pub fn id(&self) -> VertexId {
        self.id
    }

    /// byte range `[start, end)` covering every slot inside `range`,
    /// relative to the record start; `None` when no slot matches
    pub fn edge_list_range(&self, range: TimestampRange) -> Option<(usize, usize)> {
        let mut lo = usize::MAX;
        let mut hi = 0;
        for slot in &self.slots {
            if range.contains(slot.ts) {
                lo = lo.min(slot.start);
                hi = hi.max(slot.end);
            }
        }
        (lo < hi).then_some((lo, hi))
    }
}

/// `GraphType::Directed` records
pub struct DirectedDecoder;

impl VertexDecoder for DirectedDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<PageVertex, EngineError> {
        let id = u64_at(bytes, 0)?;
        let num_in = u32_at(bytes, 8)? as usize;
        let num_out = u32_at(bytes, 12)? as usize;
        let mut pos = 16;
        let ins = read_ids(bytes, &mut pos, num_in)?;
        let outs = read_ids(bytes, &mut pos, num_out)?;
        Ok(PageVertex::directed(id, ins, outs))
    }
}

/// `GraphType::Undirected` records
pub struct UndirectedDecoder;

impl VertexDecoder for UndirectedDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<PageVertex, EngineError> {
        let id = u64_at(bytes, 0)?;
        let num = u32_at(bytes, 8)? as usize;
        let mut pos = 12;
        let neighbors = read_ids(bytes, &mut pos, num)?;
        Ok(PageVertex::undirected(id, neighbors))
    }
}

/// `GraphType::TsDirected` records
pub struct TsDecoder {
    max_num_timestamps: u32,
}

impl TsDecoder {
    /// decoder honoring the header's timestamp cap
    pub fn new(max_num_timestamps: u32) -> Self {
        Self { max_num_timestamps }
    }

    fn parse_slots(&self, bytes: &[u8]) -> Result<(VertexId, Vec<TsSlot>), EngineError> {
        let id = u64_at(bytes, 0)?;
        let num_ts = u32_at(bytes, 8)? as usize;
        if num_ts > self.max_num_timestamps as usize {
            return Err(EngineError::Format(format!(
                "record has {} timestamps, file allows {}",
                num_ts, self.max_num_timestamps
            )));
        }
        let header_len = 12 + num_ts * 8;
        let mut slots = Vec::with_capacity(num_ts);
        let mut edge_off = header_len;
        for i in 0..num_ts {
            let ts = u32_at(bytes, 12 + i * 8)?;
            let count = u32_at(bytes, 16 + i * 8)? as usize;
            slots.push(TsSlot {
                ts,
                start: edge_off,
                end: edge_off + count * 8,
            });
            edge_off += count * 8;
        }
        Ok((id, slots))
    }
}

impl VertexDecoder for TsDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<PageVertex, EngineError> {
        let (id, slots) = self.parse_slots(bytes)?;
        let mut outs = Vec::new();
        for slot in &slots {
            let mut pos = slot.start;
            let count = (slot.end - slot.start) / 8;
            outs.extend(read_ids(bytes, &mut pos, count)?);
        }
        Ok(PageVertex::directed(id, Vec::new(), outs))
    }

    fn ts_index(&self, bytes: &[u8]) -> Result<TsIndex, EngineError> {
        let (id, slots) = self.parse_slots(bytes)?;
        Ok(TsIndex { id, slots })
    }

    fn decode_ts_range(
        &self,
        index: &TsIndex,
        range: TimestampRange,
        bytes: &[u8],
    ) -> Result<PageVertex, EngineError> {
        // `bytes` is the fetched `[start, end)` slice; the slots inside the
        // window are contiguous within it
        let (start, _) = index
            .edge_list_range(range)
            .ok_or_else(|| EngineError::Format("window matches no slot".into()))?;
        let mut outs = Vec::new();
        for slot in &index.slots {
            if range.contains(slot.ts) {
                let mut pos = slot.start - start;
                let count = (slot.end - slot.start) / 8;
                outs.extend(read_ids(bytes, &mut pos, count)?);
            }
        }
        Ok(PageVertex::directed(index.id, Vec::new(), outs))
    }
}

/// serialize one directed record
pub fn encode_directed(id: VertexId, ins: &[VertexId], outs: &[VertexId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + (ins.len() + outs.len()) * 8);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&(ins.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(outs.len() as u32).to_le_bytes());
    for v in ins.iter().chain(outs) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// serialize one undirected record
pub fn encode_undirected(id: VertexId, neighbors: &[VertexId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + neighbors.len() * 8);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&(neighbors.len() as u32).to_le_bytes());
    for v in neighbors {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// serialize one time-series record; `slots` are `(timestamp, edges)` pairs
pub fn encode_ts(id: VertexId, slots: &[(Timestamp, Vec<VertexId>)]) -> Vec<u8> {
    let num_edges: usize = slots.iter().map(|(_, e)| e.len()).sum();
    let mut buf = Vec::with_capacity(12 + slots.len() * 8 + num_edges * 8);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&(slots.len() as u32).to_le_bytes());
    for (ts, edges) in slots {
        buf.extend_from_slice(&ts.to_le_bytes());
        buf.extend_from_slice(&(edges.len() as u32).to_le_bytes());
    }
    for (_, edges) in slots {
        for v in edges {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
    buf
}

pub(crate) fn u32_at(buf: &[u8], at: usize) -> Result<u32, EngineError> {
    let s = buf
        .get(at..at + 4)
        .ok_or_else(|| EngineError::Format(format!("record truncated at byte {}", at)))?;
    Ok(u32::from_le_bytes(s.try_into().expect("4 bytes")))
}

pub(crate) fn u64_at(buf: &[u8], at: usize) -> Result<u64, EngineError> {
    let s = buf
        .get(at..at + 8)
        .ok_or_else(|| EngineError::Format(format!("record truncated at byte {}", at)))?;
    Ok(u64::from_le_bytes(s.try_into().expect("8 bytes")))
}

fn read_ids(buf: &[u8], pos: &mut usize, count: usize) -> Result<Vec<VertexId>, EngineError> {
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(u64_at(buf, *pos)?);
        *pos += 8;
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vertex::EdgeDir;

    #[test]
    fn header_round_trips_and_verifies() {
        let header = GraphHeader {
            graph_type: GraphType::TsDirected,
            num_vertices: 42,
            max_num_timestamps: 7,
        };
        let buf = header.encode();
        let back = GraphHeader::decode(&buf).unwrap();
        assert_eq!(back.graph_type, GraphType::TsDirected);
        assert_eq!(back.num_vertices, 42);
        assert_eq!(back.max_num_timestamps, 7);

        let mut bad = buf.clone();
        bad[0] ^= 0xff;
        assert!(GraphHeader::decode(&bad).is_err());
    }

    #[test]
    fn directed_record_decodes() {
        let rec = encode_directed(5, &[1, 2], &[3]);
        let page = DirectedDecoder.decode(&rec).unwrap();
        assert_eq!(page.id(), 5);
        assert_eq!(page.neighbors(EdgeDir::In), &[1, 2]);
        assert_eq!(page.neighbors(EdgeDir::Out), &[3]);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let rec = encode_directed(5, &[1, 2], &[3]);
        assert!(DirectedDecoder.decode(&rec[..rec.len() - 1]).is_err());
    }

    #[test]
    fn ts_slots_locate_edge_ranges() {
        let rec = encode_ts(9, &[(10, vec![1, 2]), (20, vec![3]), (30, vec![4, 5, 6])]);
        let dec = TsDecoder::new(8);
        let index = dec.ts_index(&rec).unwrap();
        assert_eq!(index.id(), 9);

        // header is 12 + 3*8 = 36 bytes; slot 20 starts after two edges
        let range = TimestampRange { start: 20, end: 21 };
        let (start, end) = index.edge_list_range(range).unwrap();
        assert_eq!((start, end), (36 + 16, 36 + 24));
        let page = dec.decode_ts_range(&index, range, &rec[start..end]).unwrap();
        assert_eq!(page.neighbors(EdgeDir::Out), &[3]);

        // a window spanning two slots covers their contiguous bytes
        let range = TimestampRange { start: 15, end: 31 };
        let (start, end) = index.edge_list_range(range).unwrap();
        let page = dec.decode_ts_range(&index, range, &rec[start..end]).unwrap();
        assert_eq!(page.neighbors(EdgeDir::Out), &[3, 4, 5, 6]);

        assert!(index
            .edge_list_range(TimestampRange { start: 40, end: 50 })
            .is_none());

        // the full decode flattens every slot
        let page = dec.decode(&rec).unwrap();
        assert_eq!(page.neighbors(EdgeDir::Out), &[1, 2, 3, 4, 5, 6]);
    }
}
