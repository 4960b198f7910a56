//! # Stream I/O
//!
//! Seekable streams shared between decoders and their callers, and the
//! client I/O callbacks that let a C codec library pull from them.
//!
//! The callback set follows libtiff's client-open contract: read, write,
//! lseek-style seek, close, size, map and unmap, all keyed by an opaque
//! client handle. The handle only borrows the stream; closing it never
//! releases the caller's reference.

use libc::{c_int, c_void};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Weak};

// ============================================================================
// Seekable stream
// ============================================================================

/// Random-access byte stream with interior locking, shared through `Arc`.
pub trait SeekableStream: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    fn seek(&self, pos: SeekFrom) -> io::Result<u64>;
    fn size(&self) -> io::Result<u64>;

    /// Rewind and read everything.
    fn read_all(&self) -> io::Result<Vec<u8>> {
        let size = self.size()?;
        self.seek(SeekFrom::Start(0))?;

        let mut data = Vec::with_capacity(size.min(64 << 20) as usize);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match self.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(data)
    }
}

/// Growable in-memory stream.
#[derive(Debug, Default)]
pub struct MemoryStream {
    inner: Mutex<Cursor<Vec<u8>>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: impl Into<Vec<u8>>) -> Self {
        Self { inner: Mutex::new(Cursor::new(data.into())) }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().get_ref().clone()
    }

    pub fn position(&self) -> u64 {
        self.inner.lock().position()
    }
}

impl SeekableStream for MemoryStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.lock().read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.lock().seek(pos)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.inner.lock().get_ref().len() as u64)
    }
}

#[derive(Debug)]
pub struct FileStream {
    file: Mutex<File>,
}

impl FileStream {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::from_file(File::open(path)?))
    }

    pub fn create(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::from_file(file))
    }

    pub fn from_file(file: File) -> Self {
        Self { file: Mutex::new(file) }
    }
}

impl SeekableStream for FileStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.lock().read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.file.lock().write(buf)
    }

    fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        self.file.lock().seek(pos)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }
}

// ============================================================================
// Whence
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

impl Whence {
    /// Map a POSIX `SEEK_*` value.
    pub fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            libc::SEEK_SET => Some(Whence::Start),
            libc::SEEK_CUR => Some(Whence::Current),
            libc::SEEK_END => Some(Whence::End),
            _ => None,
        }
    }

    pub fn to_seek_from(self, offset: i64) -> io::Result<SeekFrom> {
        match self {
            Whence::Start => u64::try_from(offset).map(SeekFrom::Start).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "negative absolute seek")
            }),
            Whence::Current => Ok(SeekFrom::Current(offset)),
            Whence::End => Ok(SeekFrom::End(offset)),
        }
    }
}

// ============================================================================
// Client I/O callbacks
// ============================================================================

/// Opaque per-session handle passed to every callback (`thandle_t`).
pub type ClientHandle = *mut c_void;
/// Signed transfer size (`tmsize_t`).
pub type ClientSize = isize;
/// File offset (`toff_t`). Errors are reported as all ones.
pub type ClientOffset = u64;

pub type ReadWriteProc = unsafe extern "C" fn(ClientHandle, *mut c_void, ClientSize) -> ClientSize;
pub type SeekProc = unsafe extern "C" fn(ClientHandle, ClientOffset, c_int) -> ClientOffset;
pub type CloseProc = unsafe extern "C" fn(ClientHandle) -> c_int;
pub type SizeProc = unsafe extern "C" fn(ClientHandle) -> ClientOffset;
pub type MapProc = unsafe extern "C" fn(ClientHandle, *mut *mut c_void, *mut ClientOffset) -> c_int;
pub type UnmapProc = unsafe extern "C" fn(ClientHandle, *mut c_void, ClientOffset);

pub const OFFSET_ERROR: ClientOffset = ClientOffset::MAX;

/// Callback table handed to the codec library.
#[derive(Clone, Copy)]
pub struct ClientProcs {
    pub read: ReadWriteProc,
    pub write: ReadWriteProc,
    pub seek: SeekProc,
    pub close: CloseProc,
    pub size: SizeProc,
    pub map: MapProc,
    pub unmap: UnmapProc,
}

pub const CLIENT_PROCS: ClientProcs = ClientProcs {
    read: stream_read,
    write: stream_write,
    seek: stream_seek,
    close: stream_close,
    size: stream_size,
    map: stream_map,
    unmap: stream_unmap,
};

struct ClientData {
    stream: Weak<dyn SeekableStream>,
}

/// Borrowed view of a stream, addressable from C through [`handle`].
///
/// Holds no strong reference: once every owner has released the stream,
/// the callbacks fail instead of touching freed memory.
///
/// [`handle`]: StreamClient::handle
pub struct StreamClient {
    data: Box<ClientData>,
}

impl StreamClient {
    pub fn new(stream: &Arc<dyn SeekableStream>) -> Self {
        Self {
            data: Box::new(ClientData { stream: Arc::downgrade(stream) }),
        }
    }

    /// Valid for as long as this client is alive.
    pub fn handle(&self) -> ClientHandle {
        &*self.data as *const ClientData as *mut c_void
    }

    pub fn procs(&self) -> ClientProcs {
        CLIENT_PROCS
    }
}

/// # Safety
/// `handle` must come from [`StreamClient::handle`] on a live client.
unsafe fn client_stream(handle: ClientHandle) -> Option<Arc<dyn SeekableStream>> {
    if handle.is_null() {
        return None;
    }
    let data = &*(handle as *const ClientData);
    data.stream.upgrade()
}

unsafe extern "C" fn stream_read(handle: ClientHandle, buf: *mut c_void, size: ClientSize) -> ClientSize {
    let Some(stream) = client_stream(handle) else { return 0 };
    if buf.is_null() || size <= 0 {
        return 0;
    }
    let buf = std::slice::from_raw_parts_mut(buf as *mut u8, size as usize);

    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("Client read failed after {} bytes: {}", filled, e);
                break;
            }
        }
    }
    filled as ClientSize
}

unsafe extern "C" fn stream_write(handle: ClientHandle, buf: *mut c_void, size: ClientSize) -> ClientSize {
    let Some(stream) = client_stream(handle) else { return 0 };
    if buf.is_null() || size <= 0 {
        return 0;
    }
    let buf = std::slice::from_raw_parts(buf as *const u8, size as usize);

    let mut written = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("Client write failed after {} bytes: {}", written, e);
                break;
            }
        }
    }
    written as ClientSize
}

unsafe extern "C" fn stream_seek(handle: ClientHandle, offset: ClientOffset, whence: c_int) -> ClientOffset {
    let Some(whence) = Whence::from_raw(whence) else {
        tracing::error!("unknown whence value {}", whence);
        return OFFSET_ERROR;
    };
    let Some(stream) = client_stream(handle) else { return OFFSET_ERROR };

    // toff_t is unsigned; relative seeks carry negative offsets in two's complement
    let pos = match whence.to_seek_from(offset as i64) {
        Ok(pos) => pos,
        Err(_) => return OFFSET_ERROR,
    };
    stream.seek(pos).unwrap_or(OFFSET_ERROR)
}

unsafe extern "C" fn stream_close(_handle: ClientHandle) -> c_int {
    // Caller is responsible for releasing the stream
    0
}

unsafe extern "C" fn stream_size(handle: ClientHandle) -> ClientOffset {
    match client_stream(handle) {
        Some(stream) => stream.size().unwrap_or(OFFSET_ERROR),
        None => OFFSET_ERROR,
    }
}

unsafe extern "C" fn stream_map(_handle: ClientHandle, _addr: *mut *mut c_void, _size: *mut ClientOffset) -> c_int {
    // Streams cannot be memory mapped
    0
}

unsafe extern "C" fn stream_unmap(_handle: ClientHandle, _addr: *mut c_void, _size: ClientOffset) {}

// ============================================================================
// Tests
// ============================================================================
