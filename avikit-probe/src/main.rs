//! AVIKit Probe
//!
//! Prints what an AVI file contains.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use tracing::info;

use avikit_core::avi_demux::{AviFile, AviInfo, StreamInfo};
use avikit_core::riff::{Chunk, FourCC, RiffReader};
use avikit_core::AvikitConfig;

struct ProbeOptions {
    input: PathBuf,
    json: bool,
    streams: bool,
    chunks: bool,
    config: Option<PathBuf>,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    #[serde(flatten)]
    info: &'a AviInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_info: Option<Vec<JsonStreamInfo>>,
}

#[derive(Serialize)]
struct JsonStreamInfo {
    fcc_type: String,
    fcc_handler: String,
    scale: u32,
    rate: u32,
    length: u32,
    sample_size: u32,
    frame: [i32; 4],
    name: String,
}

impl From<&StreamInfo> for JsonStreamInfo {
    fn from(s: &StreamInfo) -> Self {
        Self {
            fcc_type: s.fcc_type.to_string(),
            fcc_handler: s.fcc_handler.to_string(),
            scale: s.scale,
            rate: s.rate,
            length: s.length,
            sample_size: s.sample_size,
            frame: [s.frame.left, s.frame.top, s.frame.right, s.frame.bottom],
            name: s.name.clone(),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("avikit_core=info".parse()?)
                .add_directive("avikit_probe=info".parse()?),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let config = match &options.config {
        Some(path) => AvikitConfig::load(path).map_err(|e| anyhow::anyhow!(e))?,
        None => AvikitConfig::from_env(),
    };

    info!("avikit-probe v{} reading {}", avikit_core::VERSION, options.input.display());

    let data = std::fs::read(&options.input)
        .with_context(|| format!("Failed to read {}", options.input.display()))?;
    let tree = RiffReader::with_config(&config.riff)
        .parse(data.into(), FourCC::AVI)
        .with_context(|| format!("{} is not a RIFF AVI file", options.input.display()))?;

    if options.chunks && !options.json {
        print_chunks(tree.root());
    }

    let avi = AviFile::open(tree).with_context(|| format!("Failed to open {}", options.input.display()))?;
    let info = avi.info();
    let stream_info: Vec<StreamInfo> = avi.streams().iter().map(|s| s.info()).collect();

    if options.json {
        let report = JsonReport {
            info: &info,
            stream_info: options
                .streams
                .then(|| stream_info.iter().map(JsonStreamInfo::from).collect()),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_summary(&avi, &info);
    if options.streams {
        for (i, s) in stream_info.iter().enumerate() {
            print_stream_info(i, s);
        }
    }

    Ok(())
}

fn print_chunks(root: &Chunk) {
    println!("Chunks:");
    root.walk(&mut |depth, chunk| {
        let indent = "  ".repeat(depth + 1);
        match chunk.list_type() {
            Some(list_type) => println!(
                "{}{} '{}' size={} @{}",
                indent, chunk.id, list_type, chunk.size, chunk.offset
            ),
            None => println!("{}{} size={} @{}", indent, chunk.id, chunk.size, chunk.offset),
        }
    });
    println!();
}

fn print_summary(avi: &AviFile, info: &AviInfo) {
    println!("AVI {}x{} @ {:.3} fps", info.width, info.height, info.fps);
    println!("  frames:   {}", info.total_frames);
    println!("  duration: {:.3} s", info.duration_us as f64 / 1_000_000.0);
    println!("  packets:  {}", avi.packet_count());
    println!("  index:    {}", if info.has_index { "idx1" } else { "none (scanned movi)" });

    for s in &info.streams {
        print!("  stream {}: {:?} {} ({:?})", s.index, s.kind, s.codec_fourcc, s.codec);
        if let (Some(w), Some(h)) = (s.width, s.height) {
            print!(" {}x{}", w, h);
        }
        if let Some(rate) = s.sample_rate {
            print!(" {} Hz", rate);
        }
        if let Some(channels) = s.channels {
            print!(" {} ch", channels);
        }
        if let Some(name) = &s.name {
            print!(" \"{}\"", name);
        }
        println!();
    }

    for (key, value) in avi.metadata() {
        println!("  {}: {}", key, value);
    }
}

fn print_stream_info(index: usize, s: &StreamInfo) {
    println!("\nStream {}:", index);
    println!("  type:        {} / {}", s.fcc_type, s.fcc_handler);
    println!("  rate/scale:  {}/{}", s.rate, s.scale);
    println!("  start:       {}", s.start);
    println!("  length:      {}", s.length);
    println!("  buffer:      {}", s.suggested_buffer_size);
    println!("  quality:     {}", s.quality as i32);
    println!("  sample size: {}", s.sample_size);
    println!(
        "  frame:       ({}, {}) - ({}, {})",
        s.frame.left, s.frame.top, s.frame.right, s.frame.bottom
    );
    if !s.name.is_empty() {
        println!("  name:        {}", s.name);
    }
}

fn parse_args(args: &[String]) -> Result<ProbeOptions> {
    let mut input: Option<PathBuf> = None;
    let mut json = false;
    let mut streams = false;
    let mut chunks = false;
    let mut config = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--json" => {
                json = true;
                i += 1;
            }
            "--streams" => {
                streams = true;
                i += 1;
            }
            "--chunks" => {
                chunks = true;
                i += 1;
            }
            "--config" | "-c" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --config"))?;
                config = Some(PathBuf::from(value));
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other if other.starts_with('-') => {
                print_usage();
                anyhow::bail!("Unknown option {}", other);
            }
            other => {
                input = Some(PathBuf::from(other));
                i += 1;
            }
        }
    }

    let input = input.ok_or_else(|| {
        print_usage();
        anyhow::anyhow!("Missing input file")
    })?;

    Ok(ProbeOptions { input, json, streams, chunks, config })
}

fn print_usage() {
    eprintln!("\nUsage:\n  avikit-probe <file> [--json] [--streams] [--chunks] [--config <path>]\n");
}
