// RIFF CHUNK READER
//
// RIFF is a tree of (fourcc, u32 little-endian length, payload) records.
// LIST and RIFF chunks carry a 4-byte type followed by nested chunks.
// Odd-sized payloads are followed by one pad byte that is not counted
// in the length.
//
// The whole tree is materialized in one pass. Payloads are `Bytes`
// slices of the input buffer, never copies.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::config::RiffConfig;
use crate::error::{CodecError, Result};

// ============================================================================
// FourCC
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const RIFF: FourCC = FourCC(*b"RIFF");
    pub const LIST: FourCC = FourCC(*b"LIST");
    pub const JUNK: FourCC = FourCC(*b"JUNK");

    // AVI form and lists
    pub const AVI: FourCC = FourCC(*b"AVI ");
    pub const HDRL: FourCC = FourCC(*b"hdrl");  // header list
    pub const STRL: FourCC = FourCC(*b"strl");  // stream list
    pub const MOVI: FourCC = FourCC(*b"movi");  // movie data
    pub const REC: FourCC = FourCC(*b"rec ");   // interleave group inside movi
    pub const INFO: FourCC = FourCC(*b"INFO");

    // AVI chunks
    pub const AVIH: FourCC = FourCC(*b"avih");  // main header
    pub const STRH: FourCC = FourCC(*b"strh");  // stream header
    pub const STRF: FourCC = FourCC(*b"strf");  // stream format
    pub const STRD: FourCC = FourCC(*b"strd");  // codec private data
    pub const STRN: FourCC = FourCC(*b"strn");  // stream name
    pub const IDX1: FourCC = FourCC(*b"idx1");  // legacy index

    // Stream types
    pub const VIDS: FourCC = FourCC(*b"vids");
    pub const AUDS: FourCC = FourCC(*b"auds");
    pub const MIDS: FourCC = FourCC(*b"mids");
    pub const TXTS: FourCC = FourCC(*b"txts");

    pub const fn from_u32_le(value: u32) -> Self {
        FourCC(value.to_le_bytes())
    }

    pub const fn to_u32_le(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    fn is_printable(&self) -> bool {
        self.0.iter().all(|&b| b.is_ascii_graphic() || b == b' ')
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_printable() {
            for &b in &self.0 {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "0x{:08x}", self.to_u32_le())
        }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(bytes: [u8; 4]) -> Self {
        FourCC(bytes)
    }
}

// ============================================================================
// Chunk tree
// ============================================================================

pub const CHUNK_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkBody {
    Data(Bytes),
    List { list_type: FourCC, children: Vec<Chunk> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: FourCC,
    /// Offset of the chunk header in the parsed buffer. Zero for chunks
    /// built in memory.
    pub offset: u64,
    /// Declared payload length, header and pad byte excluded.
    pub size: u32,
    pub body: ChunkBody,
}

impl Chunk {
    /// Leaf chunk built in memory.
    pub fn data(id: FourCC, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Chunk {
            id,
            offset: 0,
            size: payload.len() as u32,
            body: ChunkBody::Data(payload),
        }
    }

    /// `LIST` chunk built in memory.
    pub fn list(list_type: FourCC, children: Vec<Chunk>) -> Self {
        Self::container(FourCC::LIST, list_type, children)
    }

    /// Top-level `RIFF` chunk built in memory.
    pub fn riff(form_type: FourCC, children: Vec<Chunk>) -> Self {
        Self::container(FourCC::RIFF, form_type, children)
    }

    fn container(id: FourCC, list_type: FourCC, children: Vec<Chunk>) -> Self {
        let size = 4 + children.iter().map(Chunk::padded_len).sum::<usize>();
        Chunk {
            id,
            offset: 0,
            size: size as u32,
            body: ChunkBody::List { list_type, children },
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self.body, ChunkBody::List { .. })
    }

    pub fn list_type(&self) -> Option<FourCC> {
        match &self.body {
            ChunkBody::List { list_type, .. } => Some(*list_type),
            ChunkBody::Data(_) => None,
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match &self.body {
            ChunkBody::Data(bytes) => Some(bytes),
            ChunkBody::List { .. } => None,
        }
    }

    pub fn children(&self) -> &[Chunk] {
        match &self.body {
            ChunkBody::List { children, .. } => children,
            ChunkBody::Data(_) => &[],
        }
    }

    pub fn payload_offset(&self) -> u64 {
        self.offset + CHUNK_HEADER_SIZE as u64
    }

    /// Header, payload and pad byte.
    pub fn padded_len(&self) -> usize {
        let size = self.size as usize;
        CHUNK_HEADER_SIZE + size + (size & 1)
    }

    /// First direct child leaf with this id.
    pub fn find(&self, id: FourCC) -> Option<&Chunk> {
        self.children().iter().find(|c| c.id == id && !c.is_list())
    }

    /// First direct child `LIST` of this type.
    pub fn find_list(&self, list_type: FourCC) -> Option<&Chunk> {
        self.children()
            .iter()
            .find(|c| c.id == FourCC::LIST && c.list_type() == Some(list_type))
    }

    pub fn lists(&self, list_type: FourCC) -> impl Iterator<Item = &Chunk> {
        self.children()
            .iter()
            .filter(move |c| c.id == FourCC::LIST && c.list_type() == Some(list_type))
    }

    /// Depth-first visit of this chunk and everything below it.
    pub fn walk<F: FnMut(usize, &Chunk)>(&self, f: &mut F) {
        self.walk_at(0, f);
    }

    fn walk_at<F: FnMut(usize, &Chunk)>(&self, depth: usize, f: &mut F) {
        f(depth, self);
        for child in self.children() {
            child.walk_at(depth + 1, f);
        }
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_slice(self.id.as_bytes());
        out.put_u32_le(self.size);
        match &self.body {
            ChunkBody::Data(bytes) => out.put_slice(bytes),
            ChunkBody::List { list_type, children } => {
                out.put_slice(list_type.as_bytes());
                for child in children {
                    child.write_to(out);
                }
            }
        }
        if self.size % 2 == 1 {
            out.put_u8(0);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.padded_len());
        self.write_to(&mut out);
        out.freeze()
    }
}

/// A parsed RIFF file: the top-level chunk and the buffer it was read from.
#[derive(Debug, Clone)]
pub struct RiffTree {
    root: Chunk,
    data: Bytes,
}

impl RiffTree {
    pub fn form_type(&self) -> FourCC {
        self.root.list_type().unwrap_or_default()
    }

    pub fn root(&self) -> &Chunk {
        &self.root
    }

    pub fn chunks(&self) -> &[Chunk] {
        self.root.children()
    }

    /// The full input buffer, including anything after the RIFF chunk.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

// ============================================================================
// Reader
// ============================================================================

#[derive(Debug, Clone)]
pub struct RiffReader {
    max_depth: usize,
}

impl Default for RiffReader {
    fn default() -> Self {
        Self::with_config(&RiffConfig::default())
    }
}

impl RiffReader {
    pub fn with_config(config: &RiffConfig) -> Self {
        Self { max_depth: config.max_depth }
    }

    /// Parse a complete RIFF buffer whose form type must be `expected_form`.
    pub fn parse(&self, data: Bytes, expected_form: FourCC) -> Result<RiffTree> {
        if data.len() < 12 {
            return Err(CodecError::bad_format(format!(
                "buffer of {} bytes is shorter than a RIFF header",
                data.len()
            )));
        }

        let mut header = &data[..12];
        let id = read_fourcc(&mut header);
        let size = header.get_u32_le();
        let form_type = read_fourcc(&mut header);

        if id != FourCC::RIFF {
            return Err(CodecError::bad_format(format!("not a RIFF file (found {})", id)));
        }
        if size < 4 {
            return Err(CodecError::bad_format(format!("RIFF length {} too small", size)));
        }
        let end = CHUNK_HEADER_SIZE
            .checked_add(size as usize)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                CodecError::bad_format(format!(
                    "RIFF length {} runs past end of {} byte buffer",
                    size,
                    data.len()
                ))
            })?;
        if form_type != expected_form {
            return Err(CodecError::bad_format(format!(
                "form type {} is not {}",
                form_type, expected_form
            )));
        }

        let children = self.parse_children(&data, 12, end, 1)?;

        let trailing = data.len() - end;
        if trailing > (size as usize & 1) {
            tracing::debug!("Ignoring {} bytes after RIFF '{}' chunk", trailing, form_type);
        }

        tracing::debug!("Parsed RIFF '{}' with {} top-level chunks", form_type, children.len());

        Ok(RiffTree {
            root: Chunk {
                id,
                offset: 0,
                size,
                body: ChunkBody::List { list_type: form_type, children },
            },
            data,
        })
    }

    /// Parse the chunks filling `data[start..end]` exactly.
    fn parse_children(&self, data: &Bytes, start: usize, end: usize, depth: usize) -> Result<Vec<Chunk>> {
        if depth > self.max_depth {
            return Err(CodecError::bad_format(format!(
                "lists nested deeper than {} levels",
                self.max_depth
            )));
        }

        let mut children = Vec::new();
        let mut pos = start;

        while pos < end {
            if end - pos < CHUNK_HEADER_SIZE {
                return Err(CodecError::bad_format(format!(
                    "{} stray bytes at offset {} do not form a chunk header",
                    end - pos,
                    pos
                )));
            }

            let mut header = &data[pos..pos + CHUNK_HEADER_SIZE];
            let id = read_fourcc(&mut header);
            let size = header.get_u32_le();

            let payload_start = pos + CHUNK_HEADER_SIZE;
            let payload_end = payload_start
                .checked_add(size as usize)
                .filter(|&e| e <= end)
                .ok_or_else(|| {
                    CodecError::bad_format(format!(
                        "chunk '{}' at offset {} declares {} bytes, only {} remain",
                        id,
                        pos,
                        size,
                        end - payload_start
                    ))
                })?;

            let body = if id == FourCC::LIST {
                if size < 4 {
                    return Err(CodecError::bad_format(format!(
                        "LIST at offset {} has length {}",
                        pos, size
                    )));
                }
                let mut type_bytes = &data[payload_start..payload_start + 4];
                let list_type = read_fourcc(&mut type_bytes);
                let nested = self.parse_children(data, payload_start + 4, payload_end, depth + 1)?;
                ChunkBody::List { list_type, children: nested }
            } else {
                ChunkBody::Data(data.slice(payload_start..payload_end))
            };

            let next = payload_end + (size as usize & 1);
            if next > end {
                return Err(CodecError::bad_format(format!(
                    "chunk '{}' at offset {} is missing its pad byte",
                    id, pos
                )));
            }

            children.push(Chunk { id, offset: pos as u64, size, body });
            pos = next;
        }

        Ok(children)
    }
}

/// Parse `data` with default limits.
pub fn parse(data: impl Into<Bytes>, expected_form: FourCC) -> Result<RiffTree> {
    RiffReader::default().parse(data.into(), expected_form)
}

fn read_fourcc(buf: &mut &[u8]) -> FourCC {
    let mut id = [0u8; 4];
    buf.copy_to_slice(&mut id);
    FourCC(id)
}

// ============================================================================
// Tests
// ============================================================================
