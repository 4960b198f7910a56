//! libtiff binding
//!
//! libtiff is loaded at runtime the first time a TIFF session is opened.
//! Sessions feed it through the client I/O callbacks in [`crate::stream_io`],
//! so the caller's stream is never handed over to the library.

use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::Arc;

use libc::{c_char, c_void};

use crate::config::AvikitConfig;
use crate::decoder::{Codec, CodecSession, ContainerFormat, OpenMode};
use crate::error::{CodecError, Result};
use crate::loader::{self, LazyLibrary, LoadedLibrary};
use crate::stream_io::{
    ClientHandle, CloseProc, MapProc, ReadWriteProc, SeekProc, SeekableStream, SizeProc,
    StreamClient, UnmapProc,
};

// ============================================================================
// FFI
// ============================================================================

type TiffClientOpenFn = unsafe extern "C" fn(
    name: *const c_char,
    mode: *const c_char,
    handle: ClientHandle,
    read: ReadWriteProc,
    write: ReadWriteProc,
    seek: SeekProc,
    close: CloseProc,
    size: SizeProc,
    map: MapProc,
    unmap: UnmapProc,
) -> *mut c_void;

type TiffCloseFn = unsafe extern "C" fn(tiff: *mut c_void);

const STREAM_NAME: &CStr = c"<stream>";

/// Resolved libtiff entry points.
pub struct LibTiff {
    // Keeps the function pointers below valid.
    _library: libloading::Library,
    client_open: TiffClientOpenFn,
    close: TiffCloseFn,
}

// Plain function pointers into a library that is never unloaded.
unsafe impl Send for LibTiff {}
unsafe impl Sync for LibTiff {}

impl LibTiff {
    fn load() -> std::result::Result<Self, String> {
        let config = AvikitConfig::from_env();
        let LoadedLibrary { path, library } = loader::load_first(&loader::libtiff_candidates(&config.codec))?;
        tracing::debug!("libtiff found at {}", path.display());

        unsafe {
            let client_open: TiffClientOpenFn = *library.get(b"TIFFClientOpen\0").map_err(|e| {
                tracing::error!("failed to load symbol TIFFClientOpen: {}", e);
                e.to_string()
            })?;
            let close: TiffCloseFn = *library.get(b"TIFFClose\0").map_err(|e| {
                tracing::error!("failed to load symbol TIFFClose: {}", e);
                e.to_string()
            })?;

            Ok(Self { _library: library, client_open, close })
        }
    }
}

static LIBTIFF: LazyLibrary<LibTiff> = LazyLibrary::new("libtiff");

/// The process-wide libtiff, loaded on first call.
pub fn libtiff() -> Result<&'static LibTiff> {
    LIBTIFF.get_or_load(LibTiff::load)
}

// ============================================================================
// Codec
// ============================================================================

/// An open libtiff handle reading through a [`StreamClient`].
pub struct TiffSession {
    lib: &'static LibTiff,
    tiff: NonNull<c_void>,
    // Must outlive `tiff`; libtiff holds its handle.
    _client: StreamClient,
}

// libtiff handles may move between threads; the decoder lock serializes use.
unsafe impl Send for TiffSession {}

impl Drop for TiffSession {
    fn drop(&mut self) {
        tracing::trace!("closing TIFF session");
        unsafe { (self.lib.close)(self.tiff.as_ptr()) }
    }
}

impl CodecSession for TiffSession {}

/// TIFF codec backed by the system libtiff.
pub struct TiffCodec {
    lib: &'static LibTiff,
}

impl TiffCodec {
    /// Fails with `Unavailable` when libtiff cannot be loaded.
    pub fn new() -> Result<Self> {
        Ok(Self { lib: libtiff()? })
    }
}

impl Codec for TiffCodec {
    type Session = TiffSession;

    fn container_format(&self) -> ContainerFormat {
        ContainerFormat::Tiff
    }

    fn open_session(&self, stream: &Arc<dyn SeekableStream>, mode: OpenMode) -> Result<TiffSession> {
        let client = StreamClient::new(stream);
        let procs = client.procs();
        let mode: &CStr = match mode {
            OpenMode::Read => c"r",
            OpenMode::Write => c"w",
        };

        let tiff = unsafe {
            (self.lib.client_open)(
                STREAM_NAME.as_ptr(),
                mode.as_ptr(),
                client.handle(),
                procs.read,
                procs.write,
                procs.seek,
                procs.close,
                procs.size,
                procs.map,
                procs.unmap,
            )
        };

        let tiff = NonNull::new(tiff).ok_or_else(|| CodecError::BadFormat("libtiff rejected the stream".into()))?;
        tracing::debug!("TIFF session opened");

        Ok(TiffSession { lib: self.lib, tiff, _client: client })
    }
}

// ============================================================================
// Tests
// ============================================================================
