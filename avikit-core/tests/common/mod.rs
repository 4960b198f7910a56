//! Two-stream AVI files built from raw header words.

#![allow(dead_code)]

use avikit_core::riff::{Chunk, FourCC};

pub struct TestAvi {
    pub form_type: FourCC,
    pub video_rect: [i16; 4],
    pub audio_sample_size: u32,
    pub audio_block_align: u16,
    pub main_size: (u32, u32),
}

impl Default for TestAvi {
    fn default() -> Self {
        Self {
            form_type: FourCC::AVI,
            video_rect: [0; 4],
            audio_sample_size: 2,
            audio_block_align: 2,
            main_size: (8, 6),
        }
    }
}

fn dwords(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn stream_header(fcc_type: &[u8; 4], handler: u32, scale: u32, rate: u32, length: u32, buffer: u32, sample_size: u32, rect: [i16; 4]) -> Vec<u8> {
    let mut out = fcc_type.to_vec();
    out.extend(dwords(&[handler, 0, 0, 0, scale, rate, 0, length, buffer, 0xffff_ffff, sample_size]));
    for v in rect {
        out.extend(v.to_le_bytes());
    }
    out
}

impl TestAvi {
    pub fn build(&self) -> Vec<u8> {
        let (width, height) = self.main_size;
        let avih = dwords(&[0x8256, 0x80e8, 0, 0x910, 1, 0, 2, 0x0010_0000, width, height, 0, 0, 0, 0]);

        let video = Chunk::list(
            FourCC::STRL,
            vec![
                Chunk::data(FourCC::STRH, stream_header(b"vids", 0x3032_3449, 0x3e9, 0x7530, 1, 0x0010_0000, 0, self.video_rect)),
                Chunk::data(
                    FourCC::STRF,
                    dwords(&[0x28, 8, 6, 0x0018_0001, 0x3032_3449, 0x90, 0, 0, 0, 0]),
                ),
                Chunk::data(FourCC::JUNK, dwords(&[4, 0, 0x6364_3030])),
            ],
        );

        let mut pcm = Vec::new();
        pcm.extend(1u16.to_le_bytes());
        pcm.extend(2u16.to_le_bytes());
        pcm.extend(dwords(&[11025, 22050]));
        pcm.extend(self.audio_block_align.to_le_bytes());
        pcm.extend(8u16.to_le_bytes());

        let audio = Chunk::list(
            FourCC::STRL,
            vec![
                Chunk::data(FourCC::STRH, stream_header(b"auds", 1, 1, 0x2b11, 0x665, 0x3000, self.audio_sample_size, [0; 4])),
                Chunk::data(FourCC::STRF, pcm),
            ],
        );

        let hdrl = Chunk::list(FourCC::HDRL, vec![Chunk::data(FourCC::AVIH, avih), video, audio]);
        let info = Chunk::list(FourCC::INFO, vec![Chunk::data(FourCC(*b"ISFT"), b"Lavf52.37.0\0".to_vec())]);
        let movi = Chunk::list(
            FourCC::MOVI,
            vec![
                Chunk::data(FourCC(*b"00dc"), vec![0x10u8; 72]),
                Chunk::data(FourCC(*b"01wb"), vec![0x80u8; 64]),
            ],
        );

        Chunk::riff(self.form_type, vec![hdrl, info, movi]).to_bytes().to_vec()
    }
}
