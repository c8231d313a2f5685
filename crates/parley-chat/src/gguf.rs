//! Minimal GGUF header reader and GPU layer sizing.
//!
//! Only the metadata section is read; tensor data is never touched.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

const MAGIC: &[u8; 4] = b"GGUF";
/// Longest metadata string accepted before the file is treated as corrupt.
const MAX_STRING_LEN: u64 = 1 << 24;
/// Headroom on top of the file size for KV cache and scratch buffers.
const LAYER_OVERHEAD: f64 = 1.125;

/// The parts of a model header used to size GPU offload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHeader {
    pub architecture: Option<String>,
    pub block_count: Option<u32>,
}

/// Read the architecture and transformer block count from a GGUF file.
pub fn read_header(path: &Path) -> io::Result<ModelHeader> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(invalid(format!("{} is not a GGUF file", path.display())));
    }
    let version = read_u32(&mut reader)?;
    if version < 2 {
        return Err(invalid(format!("unsupported GGUF version {version}")));
    }
    let _tensor_count = read_u64(&mut reader)?;
    let kv_count = read_u64(&mut reader)?;

    let mut architecture = None;
    let mut block_counts: HashMap<String, u64> = HashMap::new();
    for _ in 0..kv_count {
        let key = read_string(&mut reader)?;
        let value_type = read_u32(&mut reader)?;
        match (key.as_str(), value_type) {
            ("general.architecture", 8) => architecture = Some(read_string(&mut reader)?),
            (k, 4) if k.ends_with(".block_count") => {
                block_counts.insert(k.to_string(), u64::from(read_u32(&mut reader)?));
            }
            (k, 10) if k.ends_with(".block_count") => {
                block_counts.insert(k.to_string(), read_u64(&mut reader)?);
            }
            _ => skip_value(&mut reader, value_type)?,
        }
    }

    let block_count = architecture
        .as_ref()
        .and_then(|arch| block_counts.get(&format!("{arch}.block_count")))
        .or_else(|| block_counts.values().next())
        .and_then(|&n| u32::try_from(n).ok());

    Ok(ModelHeader {
        architecture,
        block_count,
    })
}

/// Layers that fit into `vram_mb` for a model of `model_size_mb` split into
/// `block_count` equal layers.
pub fn fit_gpu_layers(model_size_mb: f64, block_count: u32, vram_mb: u32) -> u32 {
    if block_count == 0 || vram_mb == 0 || model_size_mb <= 0.0 {
        return 0;
    }
    let layer_size = model_size_mb * LAYER_OVERHEAD / f64::from(block_count);
    let fit = (f64::from(vram_mb) / layer_size).floor();
    if fit >= f64::from(block_count) {
        block_count
    } else {
        fit as u32
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string(reader: &mut impl Read) -> io::Result<String> {
    let len = read_u64(reader)?;
    if len > MAX_STRING_LEN {
        return Err(invalid(format!("metadata string of {len} bytes")));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn skip_bytes(reader: &mut impl Read, count: u64) -> io::Result<()> {
    let copied = io::copy(&mut reader.take(count), &mut io::sink())?;
    if copied < count {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    Ok(())
}

fn skip_value(reader: &mut impl Read, value_type: u32) -> io::Result<()> {
    match value_type {
        0 | 1 | 7 => skip_bytes(reader, 1),
        2 | 3 => skip_bytes(reader, 2),
        4..=6 => skip_bytes(reader, 4),
        10..=12 => skip_bytes(reader, 8),
        8 => {
            let len = read_u64(reader)?;
            skip_bytes(reader, len)
        }
        9 => {
            let element_type = read_u32(reader)?;
            let len = read_u64(reader)?;
            for _ in 0..len {
                skip_value(reader, element_type)?;
            }
            Ok(())
        }
        other => Err(invalid(format!("unknown metadata type {other}"))),
    }
}
