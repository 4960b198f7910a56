//! # AVIKit Core
//!
//! RIFF/AVI container reading and codec decoder objects over shared streams.

// ============================================================================
// Containers
// ============================================================================
pub mod riff;
pub mod avi_demux;

// ============================================================================
// Streams / Codecs
// ============================================================================
pub mod stream_io;
pub mod loader;
pub mod decoder;
#[cfg(feature = "libtiff")]
pub mod tiff;

// ============================================================================
// Support
// ============================================================================
pub mod config;
pub mod error;

#[cfg(test)]
mod test_support;

pub use avi_demux::{AviFile, AviInfo, AviStream, StreamInfo, StreamKind};
pub use config::AvikitConfig;
pub use decoder::{BitmapDecoder, Decoder};
pub use error::{CodecError, Result};
pub use riff::{Chunk, FourCC, RiffReader};
pub use stream_io::{FileStream, MemoryStream, SeekableStream};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
