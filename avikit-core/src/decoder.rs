//! # Bitmap Decoders
//!
//! Reference-counted decoder objects bound to a shared seekable stream.
//!
//! A decoder starts out with no stream and no session. `initialize` binds a
//! stream and opens a codec session exactly once; queries that need a session
//! fail with `WrongState` until then. When the last reference goes away the
//! session is closed first and the stream released after it.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::avi_demux::{AviFile, StreamKind};
use crate::config::{AvikitConfig, RiffConfig};
use crate::error::{CodecError, Result};
use crate::stream_io::SeekableStream;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    Tiff,
    Avi,
}

impl ContainerFormat {
    /// Registered container GUID, where one exists.
    pub fn guid(&self) -> Option<&'static str> {
        match self {
            ContainerFormat::Tiff => Some("163bcc30-e2e9-4f0b-961d-a3e9fdb788a3"),
            ContainerFormat::Avi => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContainerFormat::Tiff => "TIFF",
            ContainerFormat::Avi => "AVI",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// When metadata is read: lazily or while initializing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheOptions {
    #[default]
    OnDemand,
    OnLoad,
}

/// Interfaces a decoder can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceId {
    Unknown,
    BitmapDecoder,
    BitmapFrameDecode,
    BitmapEncoder,
    MetadataQueryReader,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub index: usize,
    pub keyframe: bool,
    pub data: Bytes,
}

pub type Metadata = BTreeMap<String, String>;

// ============================================================================
// Codec traits
// ============================================================================

/// An open codec handle. Dropping it closes the handle.
pub trait CodecSession: Send {
    fn frame_count(&self) -> Result<usize> {
        Err(CodecError::NotImplemented("frame count"))
    }

    fn frame(&self, _index: usize) -> Result<Frame> {
        Err(CodecError::NotImplemented("frame decode"))
    }

    fn metadata(&self) -> Result<Metadata> {
        Err(CodecError::NotImplemented("metadata"))
    }
}

pub trait Codec: Send + Sync {
    type Session: CodecSession;

    fn container_format(&self) -> ContainerFormat;

    /// Open a session reading from `stream`. Must not keep a strong
    /// reference to the stream past a failed open.
    fn open_session(&self, stream: &Arc<dyn SeekableStream>, mode: OpenMode) -> Result<Self::Session>;
}

/// Object-safe decoder surface.
pub trait BitmapDecoder: Send + Sync {
    fn query_capability(&self, stream: &Arc<dyn SeekableStream>) -> Result<u32>;
    fn initialize(&self, stream: &Arc<dyn SeekableStream>, options: CacheOptions) -> Result<()>;
    fn container_format(&self) -> ContainerFormat;
    fn decoder_info(&self) -> Result<String>;
    fn copy_palette(&self) -> Result<Vec<u32>>;
    fn metadata(&self) -> Result<Metadata>;
    fn preview(&self) -> Result<Frame>;
    fn color_contexts(&self) -> Result<Vec<Bytes>>;
    fn thumbnail(&self) -> Result<Frame>;
    fn frame_count(&self) -> Result<usize>;
    fn frame(&self, index: usize) -> Result<Frame>;
}

// ============================================================================
// Decoder
// ============================================================================

struct DecoderState<S> {
    session: Option<S>,
    stream: Option<Arc<dyn SeekableStream>>,
}

/// Generic decoder object over a [`Codec`].
pub struct Decoder<C: Codec> {
    codec: C,
    // Held while the session is used or the initialized state changes.
    state: Mutex<DecoderState<C::Session>>,
}

impl<C: Codec + 'static> Decoder<C> {
    pub fn create(codec: C) -> Arc<Self> {
        let format = codec.container_format();
        tracing::trace!("created {} decoder ({})", format.name(), format.guid().unwrap_or("no container GUID"));
        Arc::new(Self {
            codec,
            state: Mutex::new(DecoderState { session: None, stream: None }),
        })
    }

    /// Another reference to this decoder as `iid`.
    pub fn query_interface(self: &Arc<Self>, iid: InterfaceId) -> Result<Arc<dyn BitmapDecoder>> {
        match iid {
            InterfaceId::Unknown | InterfaceId::BitmapDecoder => Ok(self.clone() as Arc<dyn BitmapDecoder>),
            _ => Err(CodecError::NoInterface),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().session.is_some()
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Run `f` against the open session under the decoder lock.
    pub fn with_session<R>(&self, f: impl FnOnce(&C::Session) -> Result<R>) -> Result<R> {
        let state = self.state.lock();
        let session = state.session.as_ref().ok_or(CodecError::WrongState("decoder not initialized"))?;
        f(session)
    }
}

impl<C: Codec> Drop for Decoder<C> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        drop(state.session.take());
        drop(state.stream.take());
    }
}

impl<C: Codec + 'static> BitmapDecoder for Decoder<C> {
    fn query_capability(&self, _stream: &Arc<dyn SeekableStream>) -> Result<u32> {
        Err(CodecError::NotImplemented("query capability"))
    }

    fn initialize(&self, stream: &Arc<dyn SeekableStream>, options: CacheOptions) -> Result<()> {
        tracing::debug!("initializing {} decoder ({:?})", self.codec.container_format().name(), options);
        let mut state = self.state.lock();

        if state.session.is_some() {
            return Err(CodecError::WrongState("decoder already initialized"));
        }

        let session = self.codec.open_session(stream, OpenMode::Read)?;
        state.session = Some(session);
        state.stream = Some(stream.clone());
        Ok(())
    }

    fn container_format(&self) -> ContainerFormat {
        self.codec.container_format()
    }

    fn decoder_info(&self) -> Result<String> {
        Err(CodecError::NotImplemented("decoder info"))
    }

    fn copy_palette(&self) -> Result<Vec<u32>> {
        Err(CodecError::NotImplemented("palette"))
    }

    fn metadata(&self) -> Result<Metadata> {
        self.with_session(|s| s.metadata())
    }

    fn preview(&self) -> Result<Frame> {
        Err(CodecError::NotImplemented("preview"))
    }

    fn color_contexts(&self) -> Result<Vec<Bytes>> {
        Err(CodecError::NotImplemented("color contexts"))
    }

    fn thumbnail(&self) -> Result<Frame> {
        Err(CodecError::NoThumbnail)
    }

    fn frame_count(&self) -> Result<usize> {
        self.with_session(|s| s.frame_count())
    }

    fn frame(&self, index: usize) -> Result<Frame> {
        self.with_session(|s| s.frame(index))
    }
}

// ============================================================================
// AVI codec
// ============================================================================

/// Pure Rust AVI reader behind the decoder interface.
#[derive(Debug, Clone)]
pub struct AviCodec {
    config: RiffConfig,
}

impl AviCodec {
    pub fn new(config: RiffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiffConfig {
        &self.config
    }
}

impl Default for AviCodec {
    /// Parser limits from the environment.
    fn default() -> Self {
        Self::new(AvikitConfig::from_env().riff)
    }
}

pub struct AviSession {
    file: AviFile,
}

impl AviSession {
    pub fn file(&self) -> &AviFile {
        &self.file
    }

    fn video_number(&self) -> Option<u32> {
        self.file.get_stream(Some(StreamKind::Video), 0).ok().map(|s| s.number())
    }
}

impl CodecSession for AviSession {
    fn frame_count(&self) -> Result<usize> {
        match self.file.get_stream(Some(StreamKind::Video), 0) {
            Ok(video) => Ok(video.header().length as usize),
            Err(_) => Ok(self.file.main_header().total_frames as usize),
        }
    }

    fn frame(&self, index: usize) -> Result<Frame> {
        let number = self
            .video_number()
            .ok_or_else(|| CodecError::NotFound("no video stream".into()))?;

        self.file
            .demuxer()
            .filter(|p| p.stream_index == number)
            .nth(index)
            .map(|p| Frame { index, keyframe: p.keyframe, data: p.data })
            .ok_or_else(|| CodecError::NotFound(format!("frame {}", index)))
    }

    fn metadata(&self) -> Result<Metadata> {
        Ok(self.file.metadata().clone())
    }
}

impl Codec for AviCodec {
    type Session = AviSession;

    fn container_format(&self) -> ContainerFormat {
        ContainerFormat::Avi
    }

    fn open_session(&self, stream: &Arc<dyn SeekableStream>, mode: OpenMode) -> Result<AviSession> {
        if mode == OpenMode::Write {
            return Err(CodecError::NotImplemented("AVI writing"));
        }

        let data = stream.read_all()?;
        let file = AviFile::from_bytes_with_config(data, &self.config)?;
        tracing::debug!("AVI session opened: {} streams", file.streams().len());
        Ok(AviSession { file })
    }
}

pub type AviDecoder = Decoder<AviCodec>;

#[cfg(feature = "libtiff")]
pub type TiffDecoder = Decoder<crate::tiff::TiffCodec>;

/// New TIFF decoder; `Unavailable` when libtiff cannot be loaded.
#[cfg(feature = "libtiff")]
pub fn create_tiff_decoder() -> Result<Arc<TiffDecoder>> {
    Ok(Decoder::create(crate::tiff::TiffCodec::new()?))
}

pub fn create_avi_decoder() -> Arc<AviDecoder> {
    Decoder::create(AviCodec::default())
}

// ============================================================================
// Tests
// ============================================================================
