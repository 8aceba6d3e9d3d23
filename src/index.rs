use crate::{
    error::EngineError,
    format::{u32_at, u64_at, INDEX_MAGIC},
    io::{read_sync, IoBackend, IoCompletion, IoRequest},
    types::{VertexId, PAGE_SIZE},
};

const INDEX_HEADER_SIZE: usize = PAGE_SIZE * 2;
const READ_CHUNK: usize = 100 * 1024 * 1024;
const ENTRY_SIZE: usize = 12;
const PENDING_HIGH_WATER: usize = 100;

/// memory-loaded location table: `(offset, size)` of every vertex record,
/// plus the ordered enumeration of all ids.
///
/// On-disk layout: `magic u64 | num_vertices u64 | (offset u64, size u32)*`.
pub struct VertexIndex {
    entries: Vec<(u64, u32)>,
}

impl VertexIndex {
    /// build directly from entries; ids are the entry positions
    pub fn from_entries(entries: Vec<(u64, u32)>) -> Self {
        Self { entries }
    }

    /// serialize to the on-disk layout
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.entries.len() * ENTRY_SIZE);
        buf.extend_from_slice(&INDEX_MAGIC.to_le_bytes());
        buf.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        for &(off, size) in &self.entries {
            buf.extend_from_slice(&off.to_le_bytes());
            buf.extend_from_slice(&size.to_le_bytes());
        }
        buf
    }

    /// number of vertices covered
    pub fn num_vertices(&self) -> usize {
        self.entries.len()
    }

    /// `(offset, size)` of `id`, `None` when outside the graph
    pub fn entry(&self, id: VertexId) -> Option<(u64, u32)> {
        self.entries.get(id as usize).copied()
    }

    /// ordered enumeration of all vertex ids
    pub fn all_vertices(&self) -> impl Iterator<Item = VertexId> + '_ {
        0..self.entries.len() as VertexId
    }

    pub(crate) fn entries(&self) -> &[(u64, u32)] {
        &self.entries
    }

    /// load an index file through the async I/O contract. The bulk is read
    /// with page-aligned chunked requests (pending I/O throttled), the
    /// trailing partial page separately.
    pub fn load(io: &mut dyn IoBackend) -> Result<Self, EngineError> {
        let file_size = io.file_size() as usize;
        if file_size < 16 {
            return Err(EngineError::Format("index file too small".into()));
        }
        let head_len = INDEX_HEADER_SIZE.min(file_size);
        let head = read_sync(io, 0, head_len)?;
        if u64_at(&head, 0)? != INDEX_MAGIC {
            return Err(EngineError::Format("bad index file magic".into()));
        }
        let num_vertices = u64_at(&head, 8)? as usize;
        let index_size = 16 + num_vertices * ENTRY_SIZE;
        if index_size > file_size {
            return Err(EngineError::Format(format!(
                "index of {} vertices needs {} bytes, file has {}",
                num_vertices, index_size, file_size
            )));
        }

        let mut buf = vec![0u8; index_size];
        let copied = head.len().min(index_size);
        buf[..copied].copy_from_slice(&head[..copied]);

        if copied < index_size {
            let aligned = index_size - index_size % PAGE_SIZE;
            let mut completions: Vec<IoCompletion> = Vec::new();
            let mut reqs = Vec::new();
            let mut off = copied;
            while off < aligned {
                let len = READ_CHUNK.min(aligned - off);
                reqs.push(IoRequest {
                    offset: off as u64,
                    len,
                    compute: None,
                });
                io.submit(&mut reqs)?;
                off += len;
                if io.pending() > PENDING_HIGH_WATER {
                    io.wait(io.pending() / 10, &mut completions)?;
                }
            }
            while io.pending() > 0 {
                io.wait(io.pending(), &mut completions)?;
            }
            for c in completions {
                let at = c.offset as usize;
                let n = c.data.len().min(buf.len().saturating_sub(at));
                buf[at..at + n].copy_from_slice(&c.data[..n]);
            }
            // the data may only occupy part of the last page
            if aligned < index_size && aligned >= copied {
                let tail = read_sync(io, aligned as u64, PAGE_SIZE)?;
                let n = index_size - aligned;
                buf[aligned..].copy_from_slice(&tail[..n]);
            }
        }

        let mut entries = Vec::with_capacity(num_vertices);
        for i in 0..num_vertices {
            let base = 16 + i * ENTRY_SIZE;
            entries.push((u64_at(&buf, base)?, u32_at(&buf, base + 8)?));
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_round_trips_entries() {
        let entries = vec![(4096u64, 100u32), (4196, 50), (4246, 0)];
        let index = VertexIndex::from_entries(entries);
        let buf = index.encode();
        assert_eq!(buf.len(), 16 + 3 * ENTRY_SIZE);
        assert_eq!(index.entry(1), Some((4196, 50)));
        assert_eq!(index.entry(3), None);
        assert_eq!(index.all_vertices().collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
