//! In-memory AVI fixtures for unit tests.
//!
//! The default file has an 8x6 I420 video stream at 30000/1001 and an
//! 11025 Hz stereo 8-bit PCM audio stream. Data chunks are 72 bytes of video
//! per frame and 64 bytes of audio.

use bytes::{BufMut, Bytes, BytesMut};

use crate::avi_demux::{MainHeader, StreamHeader};
use crate::riff::{Chunk, FourCC};

pub(crate) struct PcmFormat {
    pub format_tag: u16,
    pub channels: u16,
    pub samples_per_sec: u32,
    pub avg_bytes_per_sec: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

pub(crate) struct AviFixture {
    pub main: MainHeader,
    pub video: StreamHeader,
    pub audio: StreamHeader,
    pub pcm: PcmFormat,
    pub omit_audio_format: bool,
    pub duplicate_audio_format: bool,
    pub video_frames: usize,
    pub with_index: bool,
    /// One audio chunk after every video frame instead of a single one at the end.
    pub interleave: bool,
    /// Index offsets from the start of the file instead of the `movi` list type.
    pub absolute_index: bool,
    /// Group data chunks in pairs under `rec ` lists. Not combined with an index.
    pub rec_lists: bool,
    pub empty_movi: bool,
    pub video_name: Option<&'static str>,
    pub video_codec_data: Option<Vec<u8>>,
    /// `cbSize` and the bytes that follow it, turning the PCM format into
    /// `WAVEFORMATEX`.
    pub pcm_extra: Option<(u16, Vec<u8>)>,
}

impl Default for AviFixture {
    fn default() -> Self {
        Self {
            main: MainHeader {
                microsec_per_frame: 0x8256,
                max_bytes_per_sec: 0x80e8,
                padding_granularity: 0,
                flags: 0x910,
                total_frames: 1,
                initial_frames: 0,
                streams: 2,
                suggested_buffer_size: 0x0010_0000,
                width: 8,
                height: 6,
                reserved: [0; 4],
            },
            video: StreamHeader {
                fcc_type: FourCC::VIDS,
                fcc_handler: FourCC::from_u32_le(0x30323449),
                scale: 0x3e9,
                rate: 0x7530,
                length: 1,
                suggested_buffer_size: 0x0010_0000,
                quality: 0xffff_ffff,
                ..Default::default()
            },
            audio: StreamHeader {
                fcc_type: FourCC::AUDS,
                fcc_handler: FourCC::from_u32_le(1),
                scale: 1,
                rate: 0x2b11,
                length: 0x665,
                suggested_buffer_size: 0x3000,
                quality: 0xffff_ffff,
                sample_size: 2,
                ..Default::default()
            },
            pcm: PcmFormat {
                format_tag: 1,
                channels: 2,
                samples_per_sec: 11025,
                avg_bytes_per_sec: 22050,
                block_align: 2,
                bits_per_sample: 8,
            },
            omit_audio_format: false,
            duplicate_audio_format: false,
            video_frames: 1,
            with_index: false,
            interleave: false,
            absolute_index: false,
            rec_lists: false,
            empty_movi: false,
            video_name: None,
            video_codec_data: None,
            pcm_extra: None,
        }
    }
}

pub(crate) fn default_avi() -> Bytes {
    AviFixture::default().build()
}

impl AviFixture {
    pub fn build(&self) -> Bytes {
        assert!(!(self.rec_lists && self.with_index), "rec lists are only scanned");

        let mut video_children = vec![
            Chunk::data(FourCC::STRH, strh_bytes(&self.video)),
            Chunk::data(FourCC::STRF, bitmap_info(8, 6, FourCC(*b"I420"))),
        ];
        if let Some(data) = &self.video_codec_data {
            video_children.push(Chunk::data(FourCC::STRD, data.clone()));
        }
        if let Some(name) = self.video_name {
            let mut bytes = name.as_bytes().to_vec();
            bytes.push(0);
            video_children.push(Chunk::data(FourCC::STRN, bytes));
        }
        video_children.push(Chunk::data(FourCC::JUNK, vec![0u8; 12]));
        let video_strl = Chunk::list(FourCC::STRL, video_children);

        let mut audio_children = vec![Chunk::data(FourCC::STRH, strh_bytes(&self.audio))];
        if !self.omit_audio_format {
            let mut format = pcm_bytes(&self.pcm);
            if let Some((cb_size, extra)) = &self.pcm_extra {
                format.extend_from_slice(&cb_size.to_le_bytes());
                format.extend_from_slice(extra);
            }
            audio_children.push(Chunk::data(FourCC::STRF, format));
        }
        if self.duplicate_audio_format {
            let mut other = pcm_bytes(&self.pcm);
            other[12..14].copy_from_slice(&0x7777u16.to_le_bytes());
            audio_children.push(Chunk::data(FourCC::STRF, other));
        }
        let audio_strl = Chunk::list(FourCC::STRL, audio_children);

        let hdrl = Chunk::list(
            FourCC::HDRL,
            vec![Chunk::data(FourCC::AVIH, avih_bytes(&self.main)), video_strl, audio_strl],
        );
        let info = Chunk::list(
            FourCC::INFO,
            vec![Chunk::data(FourCC(*b"ISFT"), b"Lavf52.37.0\0".to_vec())],
        );

        let mut frames = Vec::new();
        if !self.empty_movi {
            for i in 0..self.video_frames {
                frames.push(Chunk::data(FourCC(*b"00dc"), vec![i as u8; 72]));
                if self.interleave {
                    frames.push(Chunk::data(FourCC(*b"01wb"), vec![0x80 + i as u8; 64]));
                }
            }
            if !self.interleave {
                frames.push(Chunk::data(FourCC(*b"01wb"), vec![0x80u8; 64]));
            }
        }

        // RIFF header, hdrl, INFO, then the movi header before its list type
        let movi_base = 12 + hdrl.padded_len() + info.padded_len() + 8;
        let first_offset = if self.absolute_index { movi_base as u32 + 4 } else { 4 };
        let index = self.with_index.then(|| idx1_bytes(&frames, first_offset));

        let movi = if self.rec_lists {
            let groups = frames.chunks(2).map(|pair| Chunk::list(FourCC::REC, pair.to_vec())).collect();
            Chunk::list(FourCC::MOVI, groups)
        } else {
            Chunk::list(FourCC::MOVI, frames)
        };

        let mut top = vec![hdrl, info, movi];
        if let Some(index) = index {
            top.push(Chunk::data(FourCC::IDX1, index));
        }

        Chunk::riff(FourCC::AVI, top).to_bytes()
    }
}

pub(crate) fn avih_bytes(h: &MainHeader) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(56);
    for v in [
        h.microsec_per_frame,
        h.max_bytes_per_sec,
        h.padding_granularity,
        h.flags,
        h.total_frames,
        h.initial_frames,
        h.streams,
        h.suggested_buffer_size,
        h.width,
        h.height,
    ] {
        out.put_u32_le(v);
    }
    for v in h.reserved {
        out.put_u32_le(v);
    }
    out.to_vec()
}

pub(crate) fn strh_bytes(h: &StreamHeader) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(56);
    out.put_slice(&h.fcc_type.0);
    out.put_slice(&h.fcc_handler.0);
    out.put_u32_le(h.flags);
    out.put_u16_le(h.priority);
    out.put_u16_le(h.language);
    for v in [
        h.initial_frames,
        h.scale,
        h.rate,
        h.start,
        h.length,
        h.suggested_buffer_size,
        h.quality,
        h.sample_size,
    ] {
        out.put_u32_le(v);
    }
    for v in h.frame {
        out.put_i16_le(v);
    }
    out.to_vec()
}

fn bitmap_info(width: i32, height: i32, compression: FourCC) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(40);
    out.put_u32_le(40);
    out.put_i32_le(width);
    out.put_i32_le(height);
    out.put_u16_le(1);
    out.put_u16_le(24);
    out.put_slice(&compression.0);
    out.put_u32_le(0x90);
    out.put_bytes(0, 16);
    out.to_vec()
}

fn pcm_bytes(f: &PcmFormat) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(16);
    out.put_u16_le(f.format_tag);
    out.put_u16_le(f.channels);
    out.put_u32_le(f.samples_per_sec);
    out.put_u32_le(f.avg_bytes_per_sec);
    out.put_u16_le(f.block_align);
    out.put_u16_le(f.bits_per_sample);
    out.to_vec()
}

/// Entries for consecutive chunks, the first at `first_offset`. Even video
/// frames are keyframes.
fn idx1_bytes(frames: &[Chunk], first_offset: u32) -> Vec<u8> {
    let mut out = BytesMut::new();
    let mut offset = first_offset;
    let mut video = 0;
    for chunk in frames {
        let keyframe = if chunk.id == FourCC(*b"00dc") {
            video += 1;
            (video - 1) % 2 == 0
        } else {
            true
        };
        out.put_slice(&chunk.id.0);
        out.put_u32_le(if keyframe { 0x10 } else { 0 });
        out.put_u32_le(offset);
        out.put_u32_le(chunk.size);
        offset += chunk.padded_len() as u32;
    }
    out.to_vec()
}
