// AVI DEMUXER - RIFF/AVI container model
//
// Interprets a parsed RIFF tree as an AVI file:
//
// RIFF 'AVI '
// ├── LIST 'hdrl'
// │   ├── avih (main header)
// │   └── LIST 'strl' (per stream)
// │       ├── strh (stream header)
// │       ├── strf (stream format)
// │       ├── strd (codec data, optional)
// │       └── strn (stream name, optional)
// ├── LIST 'INFO' (optional metadata)
// ├── LIST 'movi'
// │   ├── 00dc (video data)
// │   └── 01wb (audio data)
// └── idx1 (index, optional)
//
// Stream info is derived at query time: the stream header's sample size is
// replaced by the format's block alignment without any validation, and an
// empty video rectangle falls back to the main header geometry.

use bytes::{Buf, Bytes};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use crate::config::{AvikitConfig, RiffConfig};
use crate::error::{CodecError, Result};
use crate::riff::{Chunk, FourCC, RiffReader, RiffTree, CHUNK_HEADER_SIZE};

// ============================================================================
// Constants
// ============================================================================

const AVIIF_LIST: u32 = 0x01;
const AVIIF_KEYFRAME: u32 = 0x10;

const MAIN_HEADER_SIZE: usize = 56;
// 56 with rcFrame; early writers omit it
const STREAM_HEADER_MIN_SIZE: usize = 48;
const BITMAPINFOHEADER_SIZE: usize = 40;
const WAVEFORMAT_SIZE: usize = 14;

// Video codecs (FourCC)
const XVID: FourCC = FourCC(*b"XVID");
const DIVX: FourCC = FourCC(*b"DIVX");
const DX50: FourCC = FourCC(*b"DX50");
const H264: FourCC = FourCC(*b"H264");
const AVC1: FourCC = FourCC(*b"AVC1");
const X264: FourCC = FourCC(*b"X264");
const MJPG: FourCC = FourCC(*b"MJPG");
const I420: FourCC = FourCC(*b"I420");  // Raw YUV
const YV12: FourCC = FourCC(*b"YV12");
const CVID: FourCC = FourCC(*b"CVID");  // Cinepak
const IV50: FourCC = FourCC(*b"IV50");  // Intel Indeo 5

// ============================================================================
// Headers
// ============================================================================

/// `avih` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MainHeader {
    pub microsec_per_frame: u32,
    pub max_bytes_per_sec: u32,
    pub padding_granularity: u32,
    pub flags: u32,
    pub total_frames: u32,
    pub initial_frames: u32,
    pub streams: u32,
    pub suggested_buffer_size: u32,
    pub width: u32,
    pub height: u32,
    pub reserved: [u32; 4],
}

impl MainHeader {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < MAIN_HEADER_SIZE {
            return Err(CodecError::bad_format(format!(
                "avih is {} bytes, expected {}",
                payload.len(),
                MAIN_HEADER_SIZE
            )));
        }
        let mut buf = payload;
        Ok(Self {
            microsec_per_frame: buf.get_u32_le(),
            max_bytes_per_sec: buf.get_u32_le(),
            padding_granularity: buf.get_u32_le(),
            flags: buf.get_u32_le(),
            total_frames: buf.get_u32_le(),
            initial_frames: buf.get_u32_le(),
            streams: buf.get_u32_le(),
            suggested_buffer_size: buf.get_u32_le(),
            width: buf.get_u32_le(),
            height: buf.get_u32_le(),
            reserved: [buf.get_u32_le(), buf.get_u32_le(), buf.get_u32_le(), buf.get_u32_le()],
        })
    }
}

/// `strh` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub fcc_type: FourCC,
    pub fcc_handler: FourCC,
    pub flags: u32,
    pub priority: u16,
    pub language: u16,
    pub initial_frames: u32,
    pub scale: u32,
    pub rate: u32,
    pub start: u32,
    pub length: u32,
    pub suggested_buffer_size: u32,
    pub quality: u32,
    /// Stored value only. See [`AviStream::info`].
    pub sample_size: u32,
    /// left, top, right, bottom
    pub frame: [i16; 4],
}

impl StreamHeader {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < STREAM_HEADER_MIN_SIZE {
            return Err(CodecError::bad_format(format!(
                "strh is {} bytes, expected at least {}",
                payload.len(),
                STREAM_HEADER_MIN_SIZE
            )));
        }
        let mut buf = payload;
        let mut header = Self {
            fcc_type: FourCC::from_u32_le(buf.get_u32_le()),
            fcc_handler: FourCC::from_u32_le(buf.get_u32_le()),
            flags: buf.get_u32_le(),
            priority: buf.get_u16_le(),
            language: buf.get_u16_le(),
            initial_frames: buf.get_u32_le(),
            scale: buf.get_u32_le(),
            rate: buf.get_u32_le(),
            start: buf.get_u32_le(),
            length: buf.get_u32_le(),
            suggested_buffer_size: buf.get_u32_le(),
            quality: buf.get_u32_le(),
            sample_size: buf.get_u32_le(),
            frame: [0; 4],
        };
        if buf.remaining() >= 8 {
            for v in header.frame.iter_mut() {
                *v = buf.get_i16_le();
            }
        }
        Ok(header)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Video,
    Audio,
    Midi,
    Text,
    Other([u8; 4]),
}

impl StreamKind {
    pub fn from_fourcc(fcc: FourCC) -> Self {
        match fcc {
            FourCC::VIDS => StreamKind::Video,
            FourCC::AUDS => StreamKind::Audio,
            FourCC::MIDS => StreamKind::Midi,
            FourCC::TXTS => StreamKind::Text,
            other => StreamKind::Other(other.0),
        }
    }

    pub fn fourcc(&self) -> FourCC {
        match self {
            StreamKind::Video => FourCC::VIDS,
            StreamKind::Audio => FourCC::AUDS,
            StreamKind::Midi => FourCC::MIDS,
            StreamKind::Text => FourCC::TXTS,
            StreamKind::Other(bytes) => FourCC(*bytes),
        }
    }
}

// ============================================================================
// Stream formats
// ============================================================================

/// `BITMAPINFOHEADER`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapInfoHeader {
    pub size: u32,
    pub width: i32,
    /// Negative for top-down bitmaps.
    pub height: i32,
    pub planes: u16,
    pub bit_count: u16,
    pub compression: FourCC,
    pub size_image: u32,
    pub x_pels_per_meter: i32,
    pub y_pels_per_meter: i32,
    pub clr_used: u32,
    pub clr_important: u32,
}

/// `WAVEFORMAT`, `PCMWAVEFORMAT` or `WAVEFORMATEX`, depending on length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveFormat {
    pub format_tag: u16,
    pub channels: u16,
    pub samples_per_sec: u32,
    pub avg_bytes_per_sec: u32,
    pub block_align: u16,
    pub bits_per_sample: Option<u16>,
    /// Bytes announced by `cbSize`, clamped to what is present.
    pub extra: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFormat {
    Video(BitmapInfoHeader),
    Audio(WaveFormat),
    Raw(Bytes),
}

impl StreamFormat {
    pub fn parse(kind: StreamKind, data: &Bytes) -> Self {
        match kind {
            StreamKind::Video if data.len() >= BITMAPINFOHEADER_SIZE => {
                let mut buf = &data[..];
                StreamFormat::Video(BitmapInfoHeader {
                    size: buf.get_u32_le(),
                    width: buf.get_i32_le(),
                    height: buf.get_i32_le(),
                    planes: buf.get_u16_le(),
                    bit_count: buf.get_u16_le(),
                    compression: FourCC::from_u32_le(buf.get_u32_le()),
                    size_image: buf.get_u32_le(),
                    x_pels_per_meter: buf.get_i32_le(),
                    y_pels_per_meter: buf.get_i32_le(),
                    clr_used: buf.get_u32_le(),
                    clr_important: buf.get_u32_le(),
                })
            }
            StreamKind::Audio if data.len() >= WAVEFORMAT_SIZE => {
                let mut buf = &data[..];
                let format_tag = buf.get_u16_le();
                let channels = buf.get_u16_le();
                let samples_per_sec = buf.get_u32_le();
                let avg_bytes_per_sec = buf.get_u32_le();
                let block_align = buf.get_u16_le();
                let bits_per_sample = (buf.remaining() >= 2).then(|| buf.get_u16_le());
                let extra = if buf.remaining() >= 2 {
                    let cb_size = buf.get_u16_le() as usize;
                    let start = WAVEFORMAT_SIZE + 4;
                    data.slice(start..start + cb_size.min(data.len() - start))
                } else {
                    Bytes::new()
                };
                StreamFormat::Audio(WaveFormat {
                    format_tag,
                    channels,
                    samples_per_sec,
                    avg_bytes_per_sec,
                    block_align,
                    bits_per_sample,
                    extra,
                })
            }
            _ => StreamFormat::Raw(data.clone()),
        }
    }

    /// The format's own sample-size field, when it has one.
    pub fn block_align(&self) -> Option<u16> {
        match self {
            StreamFormat::Audio(wf) => Some(wf.block_align),
            _ => None,
        }
    }
}

// ============================================================================
// Streams
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Resolved per-stream information, as `AVISTREAMINFO` reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub fcc_type: FourCC,
    pub fcc_handler: FourCC,
    pub flags: u32,
    pub caps: u32,
    pub priority: u16,
    pub language: u16,
    pub scale: u32,
    pub rate: u32,
    pub start: u32,
    pub length: u32,
    pub initial_frames: u32,
    pub suggested_buffer_size: u32,
    pub quality: u32,
    pub sample_size: u32,
    pub frame: Rect,
    pub edit_count: u32,
    pub format_change_count: u32,
    pub name: String,
}

/// One stream of an open AVI file. Handed out as `Arc<AviStream>`.
#[derive(Debug)]
pub struct AviStream {
    number: u32,
    header: StreamHeader,
    format: RwLock<Option<Bytes>>,
    codec_data: Option<Bytes>,
    name: Option<String>,
    // Largest data chunk of this stream, zero without data
    max_chunk_size: u32,
    // Fallback display rectangle from avih
    main_width: u32,
    main_height: u32,
}

impl AviStream {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn kind(&self) -> StreamKind {
        StreamKind::from_fourcc(self.header.fcc_type)
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn codec_data(&self) -> Option<&Bytes> {
        self.codec_data.as_ref()
    }

    /// `None` when the stream has no format chunk.
    pub fn format_size(&self) -> Option<usize> {
        self.format.read().as_ref().map(|f| f.len())
    }

    pub fn read_format(&self) -> Option<Bytes> {
        self.format.read().clone()
    }

    pub fn set_format(&self, format: impl Into<Bytes>) {
        *self.format.write() = Some(format.into());
    }

    pub fn parsed_format(&self) -> Option<StreamFormat> {
        let kind = self.kind();
        self.format.read().as_ref().map(|f| StreamFormat::parse(kind, f))
    }

    pub fn frame_rate(&self) -> Option<f64> {
        (self.header.scale > 0 && self.header.rate > 0)
            .then(|| self.header.rate as f64 / self.header.scale as f64)
    }

    /// Derive the stream info from the header and the current format.
    ///
    /// Sample size comes from the format's block alignment whenever the
    /// format has one, even if it is nonsense. Consumers rely on seeing the
    /// format's value, corrupt or not. The suggested buffer size is the
    /// largest data chunk the stream actually has.
    pub fn info(&self) -> StreamInfo {
        let h = &self.header;

        let sample_size = match self.parsed_format().and_then(|f| f.block_align()) {
            Some(align) => align as u32,
            None => h.sample_size,
        };

        let mut frame = Rect {
            left: h.frame[0] as i32,
            top: h.frame[1] as i32,
            right: h.frame[2] as i32,
            bottom: h.frame[3] as i32,
        };
        if self.kind() == StreamKind::Video && frame == Rect::default() {
            frame.right = self.main_width as i32;
            frame.bottom = self.main_height as i32;
        }

        StreamInfo {
            fcc_type: h.fcc_type,
            fcc_handler: h.fcc_handler,
            flags: h.flags,
            caps: 0,
            priority: h.priority,
            language: h.language,
            scale: h.scale,
            rate: h.rate,
            start: h.start,
            length: h.length,
            initial_frames: h.initial_frames,
            suggested_buffer_size: self.max_chunk_size,
            quality: h.quality,
            sample_size,
            frame,
            edit_count: 0,
            format_change_count: 0,
            name: self.name.clone().unwrap_or_default(),
        }
    }
}

// ============================================================================
// Index
// ============================================================================

/// `idx1` entry. `offset` is relative to the `movi` list type field in most
/// files, absolute in some.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub ckid: FourCC,
    pub flags: u32,
    pub offset: u32,
    pub size: u32,
}

impl IndexEntry {
    pub fn stream_number(&self) -> Option<u32> {
        stream_number(self.ckid)
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags & AVIIF_KEYFRAME != 0
    }
}

/// Stream number from a `##xx` data chunk id. The digits are hex.
fn stream_number(ckid: FourCC) -> Option<u32> {
    let hi = (ckid.0[0] as char).to_digit(16)?;
    let lo = (ckid.0[1] as char).to_digit(16)?;
    Some(hi * 16 + lo)
}

#[derive(Debug, Clone, Copy)]
struct PacketRef {
    stream: u32,
    keyframe: bool,
    offset: usize,
    size: usize,
}

// ============================================================================
// AVI File
// ============================================================================

#[derive(Debug)]
pub struct AviFile {
    main: MainHeader,
    streams: Vec<Arc<AviStream>>,
    metadata: BTreeMap<String, String>,
    index: Vec<IndexEntry>,
    packets: Vec<PacketRef>,
    indexed: bool,
    movi_offset: u64,
    data: Bytes,
}

impl AviFile {
    /// Parse with the environment's parser limits.
    pub fn from_bytes(data: impl Into<Bytes>) -> Result<Self> {
        Self::from_bytes_with_config(data, &AvikitConfig::from_env().riff)
    }

    pub fn from_bytes_with_config(data: impl Into<Bytes>, config: &RiffConfig) -> Result<Self> {
        let tree = RiffReader::with_config(config).parse(data.into(), FourCC::AVI)?;
        Self::open(tree)
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::from_bytes(data)
    }

    /// Build the container model. Nothing is returned unless the whole
    /// header structure is valid.
    pub fn open(tree: RiffTree) -> Result<Self> {
        if tree.form_type() != FourCC::AVI {
            return Err(CodecError::bad_format(format!("form type {} is not AVI", tree.form_type())));
        }
        let root = tree.root();

        let hdrl = root
            .find_list(FourCC::HDRL)
            .ok_or_else(|| CodecError::bad_format("missing hdrl list"))?;

        let mut avih = hdrl.children().iter().filter(|c| c.id == FourCC::AVIH);
        let main = match (avih.next(), avih.next()) {
            (Some(chunk), None) => MainHeader::parse(chunk.payload().map(|b| &b[..]).unwrap_or(&[]))?,
            (None, _) => return Err(CodecError::bad_format("missing avih")),
            (Some(_), Some(_)) => return Err(CodecError::bad_format("more than one avih")),
        };

        let mut streams = Vec::new();
        for strl in hdrl.lists(FourCC::STRL) {
            streams.push(parse_strl(strl, streams.len() as u32, &main)?);
        }
        if streams.len() != main.streams as usize {
            tracing::warn!(
                "avih declares {} streams, found {} stream lists",
                main.streams,
                streams.len()
            );
        }

        let movi = root
            .find_list(FourCC::MOVI)
            .ok_or_else(|| CodecError::bad_format("missing movi list"))?;

        let mut metadata = BTreeMap::new();
        for info in root.lists(FourCC::INFO).chain(hdrl.lists(FourCC::INFO)) {
            collect_info(info, &mut metadata);
        }

        let index = root
            .find(FourCC::IDX1)
            .and_then(Chunk::payload)
            .map(|p| parse_idx1(p))
            .unwrap_or_default();

        let data = tree.data().clone();
        let (packets, indexed) = match resolve_index(&data, movi, &index) {
            Some(packets) => (packets, true),
            None => {
                if !index.is_empty() {
                    tracing::warn!("idx1 does not match movi contents, scanning movi instead");
                }
                (scan_movi(movi), false)
            }
        };

        for packet in &packets {
            if let Some(stream) = streams.get_mut(packet.stream as usize) {
                stream.max_chunk_size = stream.max_chunk_size.max(packet.size as u32);
            }
        }
        let streams: Vec<Arc<AviStream>> = streams.into_iter().map(Arc::new).collect();

        tracing::debug!(
            "Opened AVI: {} streams, {} packets, index={}",
            streams.len(),
            packets.len(),
            indexed
        );

        Ok(Self {
            main,
            streams,
            metadata,
            index,
            packets,
            indexed,
            movi_offset: movi.payload_offset(),
            data,
        })
    }

    pub fn main_header(&self) -> &MainHeader {
        &self.main
    }

    pub fn streams(&self) -> &[Arc<AviStream>] {
        &self.streams
    }

    /// Stream `index` among streams of `kind` (any kind when `None`), in
    /// declaration order.
    pub fn get_stream(&self, kind: Option<StreamKind>, index: usize) -> Result<Arc<AviStream>> {
        self.streams
            .iter()
            .filter(|s| kind.map_or(true, |k| s.kind() == k))
            .nth(index)
            .cloned()
            .ok_or_else(|| CodecError::NotFound(format!("stream {:?} #{}", kind, index)))
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    /// Offset of the `movi` list type field, the base for relative index offsets.
    pub fn movi_offset(&self) -> u64 {
        self.movi_offset
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    pub fn demuxer(&self) -> AviDemuxer<'_> {
        AviDemuxer::new(self)
    }

    pub fn info(&self) -> AviInfo {
        let mut info = AviInfo {
            duration_us: 0,
            width: self.main.width,
            height: self.main.height,
            fps: 0.0,
            total_frames: self.main.total_frames,
            streams: self.streams.iter().map(|s| summarize(s)).collect(),
            has_index: !self.index.is_empty(),
        };

        if self.main.microsec_per_frame > 0 {
            info.fps = 1_000_000.0 / self.main.microsec_per_frame as f64;
            info.duration_us = self.main.total_frames as i64 * self.main.microsec_per_frame as i64;
        }

        // Prefer the video stream's own timing
        if let Some(video) = self.streams.iter().find(|s| s.kind() == StreamKind::Video) {
            if let Some(fps) = video.frame_rate() {
                info.fps = fps;
                info.duration_us = (video.header.length as f64 / fps * 1_000_000.0) as i64;
            }
        }

        info
    }
}

fn parse_strl(strl: &Chunk, number: u32, main: &MainHeader) -> Result<AviStream> {
    let children = strl.children();
    let strh_pos = children
        .iter()
        .position(|c| c.id == FourCC::STRH)
        .ok_or_else(|| CodecError::bad_format(format!("stream {} has no strh", number)))?;
    let header = StreamHeader::parse(children[strh_pos].payload().map(|b| &b[..]).unwrap_or(&[]))?;

    // First strf after strh wins
    let after = &children[strh_pos + 1..];
    let format = after.iter().find(|c| c.id == FourCC::STRF).and_then(|c| c.payload().cloned());
    if format.is_none() {
        tracing::warn!("stream {} has no strf, format size unknown", number);
    }
    let codec_data = after.iter().find(|c| c.id == FourCC::STRD).and_then(|c| c.payload().cloned());
    let name = after
        .iter()
        .find(|c| c.id == FourCC::STRN)
        .and_then(Chunk::payload)
        .map(|p| c_string(p));

    Ok(AviStream {
        number,
        header,
        format: RwLock::new(format),
        codec_data,
        name,
        max_chunk_size: 0,
        main_width: main.width,
        main_height: main.height,
    })
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn collect_info(list: &Chunk, out: &mut BTreeMap<String, String>) {
    for chunk in list.children() {
        if let Some(payload) = chunk.payload() {
            out.insert(chunk.id.to_string(), c_string(payload));
        }
    }
}

fn parse_idx1(payload: &Bytes) -> Vec<IndexEntry> {
    let mut buf = &payload[..];
    let mut entries = Vec::with_capacity(buf.len() / 16);
    while buf.remaining() >= 16 {
        entries.push(IndexEntry {
            ckid: FourCC::from_u32_le(buf.get_u32_le()),
            flags: buf.get_u32_le(),
            offset: buf.get_u32_le(),
            size: buf.get_u32_le(),
        });
    }
    entries
}

fn tag_at(data: &Bytes, pos: u64) -> Option<FourCC> {
    let pos = usize::try_from(pos).ok()?;
    let bytes = data.get(pos..pos.checked_add(4)?)?;
    Some(FourCC([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Map index entries onto packet payloads. `None` if the index is empty or
/// its offsets match neither the relative nor the absolute convention.
fn resolve_index(data: &Bytes, movi: &Chunk, index: &[IndexEntry]) -> Option<Vec<PacketRef>> {
    let first = index
        .iter()
        .find(|e| e.flags & AVIIF_LIST == 0 && e.stream_number().is_some())?;

    let base = [movi.payload_offset(), 0]
        .into_iter()
        .find(|&base| tag_at(data, base + first.offset as u64) == Some(first.ckid))?;

    let mut packets = Vec::with_capacity(index.len());
    for entry in index {
        if entry.flags & AVIIF_LIST != 0 {
            continue;
        }
        let Some(stream) = entry.stream_number() else { continue };

        let pos = base + entry.offset as u64;
        let start = pos as usize + CHUNK_HEADER_SIZE;
        let end = start + entry.size as usize;
        if tag_at(data, pos) != Some(entry.ckid) || end > data.len() {
            tracing::warn!("Skipping index entry {} at offset {}", entry.ckid, entry.offset);
            continue;
        }

        packets.push(PacketRef {
            stream,
            keyframe: entry.is_keyframe(),
            offset: start,
            size: entry.size as usize,
        });
    }
    Some(packets)
}

/// Sequential packet table from the movi tree, descending into `rec ` lists.
fn scan_movi(movi: &Chunk) -> Vec<PacketRef> {
    let mut packets = Vec::new();
    collect_packets(movi.children(), &mut packets);
    packets
}

fn collect_packets(chunks: &[Chunk], out: &mut Vec<PacketRef>) {
    for chunk in chunks {
        if chunk.list_type() == Some(FourCC::REC) {
            collect_packets(chunk.children(), out);
            continue;
        }
        if chunk.is_list() {
            continue;
        }
        if let Some(stream) = stream_number(chunk.id) {
            out.push(PacketRef {
                stream,
                // Can't know without parsing the bitstream
                keyframe: true,
                offset: chunk.payload_offset() as usize,
                size: chunk.size as usize,
            });
        }
    }
}

// ============================================================================
// Packets
// ============================================================================

#[derive(Debug, Clone)]
pub struct AviPacket {
    pub stream_index: u32,
    pub pts: i64,
    pub keyframe: bool,
    pub data: Bytes,
}

/// Cursor over an open file's packets.
pub struct AviDemuxer<'a> {
    file: &'a AviFile,
    position: usize,
    // Per-stream timing units consumed so far
    units: Vec<u64>,
}

impl<'a> AviDemuxer<'a> {
    fn new(file: &'a AviFile) -> Self {
        Self {
            file,
            position: 0,
            units: vec![0; file.streams.len()],
        }
    }

    pub fn read_packet(&mut self) -> Option<AviPacket> {
        let packet = *self.file.packets.get(self.position)?;
        self.position += 1;

        let data = self.file.data.slice(packet.offset..packet.offset + packet.size);
        let idx = packet.stream as usize;

        let pts = match self.file.streams.get(idx) {
            Some(stream) => {
                let consumed = self.units[idx];
                self.units[idx] += packet_units(stream, packet.size);
                units_to_us(consumed, stream.header())
            }
            None => 0,
        };

        Some(AviPacket {
            stream_index: packet.stream,
            pts,
            keyframe: packet.keyframe,
            data,
        })
    }

    /// Seek to the nearest video keyframe at or before `timestamp_us`.
    pub fn seek(&mut self, timestamp_us: i64) -> Result<()> {
        if !self.file.indexed {
            return Err(CodecError::NotFound("cannot seek without an index".into()));
        }

        let Some(video) = self.file.streams.iter().find(|s| s.kind() == StreamKind::Video) else {
            return Err(CodecError::NotFound("no video stream to seek on".into()));
        };
        let video_idx = video.number();
        let fps = video.frame_rate().unwrap_or(30.0);
        let target_frame = (timestamp_us.max(0) as f64 / 1_000_000.0 * fps) as u64;

        let mut best = (0usize, 0u64);
        let mut frame = 0u64;
        for (i, packet) in self.file.packets.iter().enumerate() {
            if packet.stream != video_idx {
                continue;
            }
            if packet.keyframe && frame <= target_frame {
                best = (i, frame);
            }
            frame += 1;
        }

        // Every stream resumes from what precedes the new position
        self.position = best.0;
        self.units.iter_mut().for_each(|u| *u = 0);
        for packet in &self.file.packets[..best.0] {
            if let Some(stream) = self.file.streams.get(packet.stream as usize) {
                self.units[packet.stream as usize] += packet_units(stream, packet.size);
            }
        }
        Ok(())
    }
}

impl Iterator for AviDemuxer<'_> {
    type Item = AviPacket;

    fn next(&mut self) -> Option<AviPacket> {
        self.read_packet()
    }
}

/// Timing units a packet covers: samples for fixed-size streams, else one.
fn packet_units(stream: &AviStream, size: usize) -> u64 {
    match stream.info().sample_size {
        0 => 1,
        sample_size => size as u64 / sample_size as u64,
    }
}

fn units_to_us(units: u64, header: &StreamHeader) -> i64 {
    if header.rate == 0 {
        return 0;
    }
    (units as u128 * header.scale as u128 * 1_000_000 / header.rate as u128) as i64
}

// ============================================================================
// Summary
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AviInfo {
    pub duration_us: i64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub total_frames: u32,
    pub streams: Vec<StreamSummary>,
    pub has_index: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSummary {
    pub index: u32,
    pub kind: StreamKind,
    pub codec_fourcc: String,
    pub codec: CodecType,
    pub name: Option<String>,
    // Video-specific
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub bit_depth: Option<u16>,
    // Audio-specific
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub bits_per_sample: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecType {
    // Video
    H264,
    MPEG4,    // DivX/Xvid
    MJPEG,
    RawYUV,
    Cinepak,
    Indeo,
    // Audio
    PCM,
    MP3,
    AC3,
    AAC,
    Unknown,
}

fn summarize(stream: &AviStream) -> StreamSummary {
    let kind = stream.kind();
    let mut summary = StreamSummary {
        index: stream.number(),
        kind,
        codec_fourcc: stream.header().fcc_handler.to_string(),
        codec: CodecType::Unknown,
        name: stream.name().map(str::to_string),
        width: None,
        height: None,
        fps: None,
        bit_depth: None,
        sample_rate: None,
        channels: None,
        bits_per_sample: None,
    };

    match stream.parsed_format() {
        Some(StreamFormat::Video(bih)) => {
            summary.width = Some(bih.width.unsigned_abs());
            summary.height = Some(bih.height.unsigned_abs());
            summary.bit_depth = Some(bih.bit_count);
            summary.fps = stream.frame_rate();
            // Compression field is more specific than the handler
            let fourcc = if bih.compression.to_u32_le() != 0 {
                bih.compression
            } else {
                stream.header().fcc_handler
            };
            summary.codec_fourcc = fourcc.to_string();
            summary.codec = identify_video_codec(fourcc);
        }
        Some(StreamFormat::Audio(wf)) => {
            summary.sample_rate = Some(wf.samples_per_sec);
            summary.channels = Some(wf.channels);
            summary.bits_per_sample = wf.bits_per_sample;
            summary.codec = match wf.format_tag {
                0x0001 => CodecType::PCM,
                0x0055 => CodecType::MP3,
                0x2000 => CodecType::AC3,
                0x00FF => CodecType::AAC,
                _ => CodecType::Unknown,
            };
        }
        _ => {
            if kind == StreamKind::Video {
                summary.fps = stream.frame_rate();
                summary.codec = identify_video_codec(stream.header().fcc_handler);
            }
        }
    }

    summary
}

fn identify_video_codec(fourcc: FourCC) -> CodecType {
    let upper = FourCC(fourcc.0.map(|b| b.to_ascii_uppercase()));
    match upper {
        H264 | AVC1 | X264 => CodecType::H264,
        XVID | DIVX | DX50 => CodecType::MPEG4,
        MJPG => CodecType::MJPEG,
        I420 | YV12 => CodecType::RawYUV,
        CVID => CodecType::Cinepak,
        IV50 => CodecType::Indeo,
        _ => {
            let s = upper.to_string();
            if s.contains("264") || s.contains("AVC") {
                CodecType::H264
            } else if s.contains("XVID") || s.contains("DIVX") || s.contains("MP4") {
                CodecType::MPEG4
            } else {
                CodecType::Unknown
            }
        }
    }
}

// ============================================================================
// Probe
// ============================================================================

pub fn avi_probe(path: &std::path::Path) -> Result<AviInfo> {
    let file = std::fs::File::open(path)?;
    let avi = AviFile::from_reader(file)?;
    Ok(avi.info())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::riff::Chunk;
    use crate::test_support::*;

    #[test]
    fn opens_default_file() {
        let avi = AviFile::from_bytes(default_avi()).expect("open");
        assert_eq!(avi.streams().len(), 2);
        assert_eq!(avi.main_header().width, 8);
        assert_eq!(avi.main_header().height, 6);
        assert_eq!(avi.metadata().get("ISFT").map(String::as_str), Some("Lavf52.37.0"));
    }

    #[test]
    fn video_info_matches_header() {
        let avi = AviFile::from_bytes(default_avi()).unwrap();
        let info = avi.get_stream(None, 0).unwrap().info();
        assert_eq!(info.fcc_type, FourCC::VIDS);
        assert_eq!(info.fcc_handler, FourCC::from_u32_le(0x30323449));
        assert_eq!(info.scale, 1001);
        assert_eq!(info.rate, 30000);
        assert_eq!(info.length, 1);
        assert_eq!(info.quality, 0xffffffff);
        assert_eq!(info.sample_size, 0);
        assert_eq!(info.frame, Rect { left: 0, top: 0, right: 8, bottom: 6 });
        assert_eq!(info.suggested_buffer_size, 72);
        assert_eq!(info.edit_count, 0);
        assert_eq!(info.format_change_count, 0);
    }

    #[test]
    fn audio_rect_stays_empty() {
        let avi = AviFile::from_bytes(default_avi()).unwrap();
        let info = avi.get_stream(None, 1).unwrap().info();
        assert_eq!(info.fcc_type, FourCC::AUDS);
        assert_eq!(info.rate, 11025);
        assert_eq!(info.length, 1637);
        assert_eq!(info.sample_size, 2);
        assert_eq!(info.suggested_buffer_size, 64);
        assert_eq!(info.frame, Rect::default());
    }

    #[test]
    fn buffer_size_tracks_largest_chunk() {
        let mut fixture = AviFixture::default();
        fixture.video_frames = 3;
        fixture.interleave = true;
        let avi = AviFile::from_bytes(fixture.build()).unwrap();
        assert_eq!(avi.get_stream(None, 0).unwrap().info().suggested_buffer_size, 72);
        assert_eq!(avi.get_stream(None, 1).unwrap().info().suggested_buffer_size, 64);

        fixture.empty_movi = true;
        let avi = AviFile::from_bytes(fixture.build()).unwrap();
        for stream in avi.streams() {
            assert_eq!(stream.info().suggested_buffer_size, 0);
        }
    }

    #[test]
    fn stream_name_and_codec_data() {
        let mut fixture = AviFixture::default();
        fixture.video_name = Some("Video #1");
        fixture.video_codec_data = Some(vec![1, 2, 3, 4, 5]);
        let avi = AviFile::from_bytes(fixture.build()).unwrap();

        let video = avi.get_stream(Some(StreamKind::Video), 0).unwrap();
        assert_eq!(video.name(), Some("Video #1"));
        assert_eq!(video.info().name, "Video #1");
        assert_eq!(video.codec_data().map(|d| &d[..]), Some(&[1u8, 2, 3, 4, 5][..]));
        assert_eq!(avi.info().streams[0].name.as_deref(), Some("Video #1"));

        let audio = avi.get_stream(Some(StreamKind::Audio), 0).unwrap();
        assert_eq!(audio.name(), None);
        assert_eq!(audio.info().name, "");
        assert!(audio.codec_data().is_none());
    }

    #[test]
    fn explicit_rect_is_verbatim() {
        let mut fixture = AviFixture::default();
        fixture.video.frame = [1, 2, 5, 4];
        let avi = AviFile::from_bytes(fixture.build()).unwrap();
        let info = avi.get_stream(Some(StreamKind::Video), 0).unwrap().info();
        assert_eq!(info.frame, Rect { left: 1, top: 2, right: 5, bottom: 4 });
    }

    #[test]
    fn stored_sample_size_is_replaced_by_block_align() {
        let mut fixture = AviFixture::default();
        fixture.audio.sample_size = 0xdeadbeef;
        let avi = AviFile::from_bytes(fixture.build()).unwrap();
        let audio = avi.get_stream(Some(StreamKind::Audio), 0).unwrap();
        assert_eq!(audio.header().sample_size, 0xdeadbeef);
        assert_eq!(audio.info().sample_size, 2);
    }

    #[test]
    fn corrupt_block_align_passes_through() {
        let mut fixture = AviFixture::default();
        fixture.pcm.block_align = 0xdead;
        let avi = AviFile::from_bytes(fixture.build()).unwrap();
        let audio = avi.get_stream(None, 1).unwrap();
        assert_eq!(audio.info().sample_size, 0xdead);
    }

    #[test]
    fn sample_size_follows_replaced_format() {
        let avi = AviFile::from_bytes(default_avi()).unwrap();
        let audio = avi.get_stream(Some(StreamKind::Audio), 0).unwrap();
        assert_eq!(audio.info().sample_size, 2);

        let mut format = audio.read_format().unwrap().to_vec();
        format[12..14].copy_from_slice(&4u16.to_le_bytes());
        audio.set_format(format);
        assert_eq!(audio.info().sample_size, 4);
    }

    #[test]
    fn audio_format_fields() {
        let avi = AviFile::from_bytes(default_avi()).unwrap();
        let audio = avi.get_stream(None, 1).unwrap();
        assert_eq!(audio.format_size(), Some(16));
        match audio.parsed_format() {
            Some(StreamFormat::Audio(wf)) => {
                assert_eq!(wf.format_tag, 1);
                assert_eq!(wf.channels, 2);
                assert_eq!(wf.samples_per_sec, 11025);
                assert_eq!(wf.avg_bytes_per_sec, 22050);
                assert_eq!(wf.block_align, 2);
                assert_eq!(wf.bits_per_sample, Some(8));
                assert!(wf.extra.is_empty());
            }
            other => panic!("unexpected format {:?}", other),
        }
    }

    #[test]
    fn wave_format_ex_extra_bytes() {
        let mut fixture = AviFixture::default();
        fixture.pcm_extra = Some((2, vec![0xaa, 0xbb]));
        let avi = AviFile::from_bytes(fixture.build()).unwrap();
        let audio = avi.get_stream(None, 1).unwrap();
        assert_eq!(audio.format_size(), Some(20));
        match audio.parsed_format() {
            Some(StreamFormat::Audio(wf)) => {
                assert_eq!(wf.bits_per_sample, Some(8));
                assert_eq!(&wf.extra[..], &[0xaa, 0xbb]);
            }
            other => panic!("unexpected format {:?}", other),
        }
    }

    #[test]
    fn wave_format_ex_extra_clamped_to_chunk() {
        let mut fixture = AviFixture::default();
        fixture.pcm_extra = Some((10, vec![1, 2, 3]));
        let avi = AviFile::from_bytes(fixture.build()).unwrap();
        let audio = avi.get_stream(None, 1).unwrap();
        match audio.parsed_format() {
            Some(StreamFormat::Audio(wf)) => assert_eq!(&wf.extra[..], &[1, 2, 3]),
            other => panic!("unexpected format {:?}", other),
        }
        assert_eq!(audio.info().sample_size, 2);
    }

    #[test]
    fn missing_format_is_size_unknown() {
        let mut fixture = AviFixture::default();
        fixture.omit_audio_format = true;
        let avi = AviFile::from_bytes(fixture.build()).unwrap();
        let audio = avi.get_stream(Some(StreamKind::Audio), 0).unwrap();
        assert_eq!(audio.format_size(), None);
        assert!(audio.read_format().is_none());
        // No format to override from
        assert_eq!(audio.info().sample_size, 2);
    }

    #[test]
    fn first_format_chunk_wins() {
        let mut fixture = AviFixture::default();
        fixture.duplicate_audio_format = true;
        let avi = AviFile::from_bytes(fixture.build()).unwrap();
        let audio = avi.get_stream(Some(StreamKind::Audio), 0).unwrap();
        assert_eq!(audio.info().sample_size, 2);
    }

    #[test]
    fn get_stream_by_kind_and_index() {
        let avi = AviFile::from_bytes(default_avi()).unwrap();
        assert_eq!(avi.get_stream(Some(StreamKind::Video), 0).unwrap().number(), 0);
        assert_eq!(avi.get_stream(Some(StreamKind::Audio), 0).unwrap().number(), 1);
        assert!(matches!(avi.get_stream(Some(StreamKind::Video), 1), Err(CodecError::NotFound(_))));
        assert!(matches!(avi.get_stream(Some(StreamKind::Text), 0), Err(CodecError::NotFound(_))));
        assert!(matches!(avi.get_stream(None, 2), Err(CodecError::NotFound(_))));
    }

    #[test]
    fn missing_avih_is_bad_format() {
        let bytes = Chunk::riff(
            FourCC::AVI,
            vec![
                Chunk::list(FourCC::HDRL, vec![]),
                Chunk::list(FourCC::MOVI, vec![]),
            ],
        )
        .to_bytes();
        assert!(matches!(AviFile::from_bytes(bytes), Err(CodecError::BadFormat(_))));
    }

    #[test]
    fn short_avih_is_bad_format() {
        let bytes = Chunk::riff(
            FourCC::AVI,
            vec![
                Chunk::list(FourCC::HDRL, vec![Chunk::data(FourCC::AVIH, vec![0u8; 40])]),
                Chunk::list(FourCC::MOVI, vec![]),
            ],
        )
        .to_bytes();
        assert!(matches!(AviFile::from_bytes(bytes), Err(CodecError::BadFormat(_))));
    }

    #[test]
    fn short_strh_is_bad_format() {
        let avih = [0u8; 56];
        let bytes = Chunk::riff(
            FourCC::AVI,
            vec![
                Chunk::list(
                    FourCC::HDRL,
                    vec![
                        Chunk::data(FourCC::AVIH, avih.to_vec()),
                        Chunk::list(FourCC::STRL, vec![Chunk::data(FourCC::STRH, vec![0u8; 40])]),
                    ],
                ),
                Chunk::list(FourCC::MOVI, vec![]),
            ],
        )
        .to_bytes();
        match AviFile::from_bytes(bytes) {
            Err(CodecError::BadFormat(msg)) => assert!(msg.contains("expected at least 48"), "{}", msg),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn near_miss_form_type_fails_open() {
        let mut bytes = default_avi().to_vec();
        bytes[8..12].copy_from_slice(b"AVi ");
        assert!(matches!(AviFile::from_bytes(bytes), Err(CodecError::BadFormat(_))));
    }

    #[test]
    fn sequential_packets() {
        let avi = AviFile::from_bytes(default_avi()).unwrap();
        let packets: Vec<_> = avi.demuxer().collect();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].stream_index, 0);
        assert_eq!(packets[0].data.len(), 8 * 6 * 3 / 2);
        assert_eq!(packets[1].stream_index, 1);
        assert_eq!(packets[1].data.len(), 64);
        assert!(avi.index().is_empty());
    }

    #[test]
    fn indexed_packets_and_seek() {
        let mut fixture = AviFixture::default();
        fixture.video_frames = 4;
        fixture.with_index = true;
        let avi = AviFile::from_bytes(fixture.build()).unwrap();
        assert_eq!(avi.index().len(), 5);
        assert!(avi.info().has_index);

        let mut demuxer = avi.demuxer();
        let first = demuxer.read_packet().unwrap();
        assert!(first.keyframe);
        assert_eq!(first.pts, 0);
        let second = demuxer.read_packet().unwrap();
        assert_eq!(second.stream_index, 0);
        assert!(!second.keyframe);
        assert_eq!(second.pts, 33_366);

        // Keyframes every other frame: frame 3 snaps back to frame 2
        demuxer.seek(3 * 33_367).unwrap();
        let packet = demuxer.read_packet().unwrap();
        assert_eq!(packet.stream_index, 0);
        assert!(packet.keyframe);
        assert_eq!(packet.pts, 66_733);
    }

    #[test]
    fn seek_keeps_audio_timing() {
        let mut fixture = AviFixture::default();
        fixture.video_frames = 4;
        fixture.interleave = true;
        fixture.with_index = true;
        let avi = AviFile::from_bytes(fixture.build()).unwrap();

        let audio_pts: Vec<_> = avi.demuxer().filter(|p| p.stream_index == 1).map(|p| p.pts).collect();
        assert_eq!(audio_pts, vec![0, 2902, 5804, 8707]);

        let mut demuxer = avi.demuxer();
        demuxer.seek(2 * 33_367).unwrap();
        let after: Vec<_> = demuxer.map(|p| (p.stream_index, p.pts)).collect();
        assert_eq!(after, vec![(0, 66_733), (1, 5804), (0, 100_100), (1, 8707)]);
    }

    #[test]
    fn absolute_index_offsets() {
        let mut fixture = AviFixture::default();
        fixture.video_frames = 4;
        fixture.with_index = true;
        fixture.absolute_index = true;
        let avi = AviFile::from_bytes(fixture.build()).unwrap();

        // First chunk sits right after the movi list type
        assert_eq!(avi.index()[0].offset as u64, avi.movi_offset() + 4);
        assert_eq!(avi.packet_count(), 5);

        let packets: Vec<_> = avi.demuxer().collect();
        assert!(packets[0].keyframe);
        assert!(!packets[1].keyframe);
        assert_eq!(packets[1].data[0], 1);
        assert_eq!(packets[4].stream_index, 1);
        assert_eq!(packets[4].data.len(), 64);
    }

    #[test]
    fn rec_lists_are_scanned() {
        let mut fixture = AviFixture::default();
        fixture.video_frames = 3;
        fixture.interleave = true;
        fixture.rec_lists = true;
        let avi = AviFile::from_bytes(fixture.build()).unwrap();
        assert!(avi.index().is_empty());

        let packets: Vec<_> = avi.demuxer().map(|p| (p.stream_index, p.data[0], p.data.len())).collect();
        assert_eq!(
            packets,
            vec![(0, 0, 72), (1, 0x80, 64), (0, 1, 72), (1, 0x81, 64), (0, 2, 72), (1, 0x82, 64)]
        );
    }

    #[test]
    fn seek_without_index_fails() {
        let avi = AviFile::from_bytes(default_avi()).unwrap();
        assert!(matches!(avi.demuxer().seek(0), Err(CodecError::NotFound(_))));
    }

    #[test]
    fn summary_info() {
        let avi = AviFile::from_bytes(default_avi()).unwrap();
        let info = avi.info();
        assert_eq!(info.width, 8);
        assert_eq!(info.streams.len(), 2);
        assert_eq!(info.streams[0].codec, CodecType::RawYUV);
        assert_eq!(info.streams[0].width, Some(8));
        assert_eq!(info.streams[0].height, Some(6));
        assert_eq!(info.streams[1].codec, CodecType::PCM);
        assert_eq!(info.streams[1].sample_rate, Some(11025));
        assert!((info.fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn stream_numbers_are_hex() {
        assert_eq!(stream_number(FourCC(*b"00dc")), Some(0));
        assert_eq!(stream_number(FourCC(*b"0Awb")), Some(10));
        assert_eq!(stream_number(FourCC(*b"ix00")), None);
    }
}
