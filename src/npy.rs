//! Reader for `.npy` token arrays.
//!
//! Token ids are usually saved as `uint16` or `int32`, which candle's own npy
//! reader does not decode, so the header and payload are read here and every
//! element is converted to a `u32` id.

use anyhow::{bail, Context};
use std::path::Path;

const MAGIC: &[u8] = b"\x93NUMPY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Bool,
    Signed,
    Unsigned,
    Float,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    kind: Kind,
    width: usize,
    little_endian: bool,
    fortran_order: bool,
    shape: Vec<usize>,
}

impl Header {
    fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Returns the text following `'key':` in a python dict literal.
fn dict_value<'a>(dict: &'a str, key: &str) -> anyhow::Result<&'a str> {
    let quoted = format!("'{key}'");
    let start = dict
        .find(&quoted)
        .with_context(|| format!("npy header has no {quoted} entry"))?;
    let rest = dict[start + quoted.len()..].trim_start();
    rest.strip_prefix(':')
        .map(str::trim_start)
        .with_context(|| format!("malformed {quoted} entry in npy header"))
}

fn parse_descr(descr: &str) -> anyhow::Result<(Kind, usize, bool)> {
    let (order, code) = match descr.chars().next() {
        Some(c @ ('<' | '>' | '|' | '=')) => (c, &descr[1..]),
        _ => ('=', descr),
    };
    let little_endian = match order {
        '>' => false,
        '<' => true,
        _ => cfg!(target_endian = "little"),
    };
    let (kind, width) = match code {
        "b1" | "?" => (Kind::Bool, 1),
        "i1" | "b" => (Kind::Signed, 1),
        "i2" | "h" => (Kind::Signed, 2),
        "i4" | "i" => (Kind::Signed, 4),
        "i8" | "q" => (Kind::Signed, 8),
        "u1" | "B" => (Kind::Unsigned, 1),
        "u2" | "H" => (Kind::Unsigned, 2),
        "u4" | "I" => (Kind::Unsigned, 4),
        "u8" | "Q" => (Kind::Unsigned, 8),
        "f4" | "f" => (Kind::Float, 4),
        "f8" | "d" => (Kind::Float, 8),
        other => bail!("unsupported npy dtype {other:?}"),
    };
    Ok((kind, width, little_endian))
}

fn parse_header(dict: &str) -> anyhow::Result<Header> {
    let descr = dict_value(dict, "descr")?;
    let descr = descr
        .strip_prefix('\'')
        .and_then(|d| d.split('\'').next())
        .context("npy descr is not a quoted string")?;
    let (kind, width, little_endian) = parse_descr(descr)?;

    let fortran_order = dict_value(dict, "fortran_order")?.starts_with("True");

    let shape = dict_value(dict, "shape")?;
    let shape = shape
        .strip_prefix('(')
        .and_then(|s| s.split(')').next())
        .context("npy shape is not a tuple")?;
    let shape = shape
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| d.parse::<usize>().with_context(|| format!("bad npy dimension {d:?}")))
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Header {
        kind,
        width,
        little_endian,
        fortran_order,
        shape,
    })
}

/// Splits a raw `.npy` file into its header and payload.
fn split_file(bytes: &[u8]) -> anyhow::Result<(Header, &[u8])> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        bail!("not an npy file");
    }
    let major = bytes[6];
    let (header_len, offset) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                bail!("truncated npy header");
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            (len as usize, 12)
        }
        v => bail!("unsupported npy format version {v}"),
    };
    let end = offset + header_len;
    if bytes.len() < end {
        bail!("truncated npy header");
    }
    let dict = std::str::from_utf8(&bytes[offset..end]).context("npy header is not utf-8")?;
    let header = parse_header(dict)?;
    Ok((header, &bytes[end..]))
}

fn int_value(chunk: &[u8], signed: bool, little_endian: bool) -> i128 {
    let mut buf = [0u8; 16];
    let n = chunk.len();
    if little_endian {
        buf[..n].copy_from_slice(chunk);
    } else {
        for (dst, src) in buf.iter_mut().zip(chunk.iter().rev()) {
            *dst = *src;
        }
    }
    if signed && buf[n - 1] & 0x80 != 0 {
        buf[n..].fill(0xff);
    }
    i128::from_le_bytes(buf)
}

fn float_value(chunk: &[u8], little_endian: bool) -> f64 {
    match (chunk.len(), little_endian) {
        (4, true) => f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
        (4, false) => f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
        (_, true) => f64::from_le_bytes(chunk[..8].try_into().unwrap_or_default()),
        (_, false) => f64::from_be_bytes(chunk[..8].try_into().unwrap_or_default()),
    }
}

fn token_id(header: &Header, chunk: &[u8], pos: usize) -> anyhow::Result<u32> {
    match header.kind {
        Kind::Float => {
            let v = float_value(chunk, header.little_endian);
            if !v.is_finite() || v.fract() != 0. || v < 0. || v > u32::MAX as f64 {
                bail!("token {v} at position {pos} is not a valid id");
            }
            Ok(v as u32)
        }
        kind => {
            let v = int_value(chunk, kind == Kind::Signed, header.little_endian);
            u32::try_from(v).map_err(|_| anyhow::anyhow!("token {v} at position {pos} is not a valid id"))
        }
    }
}

/// Decodes the token ids of an in-memory `.npy` file, flattened in C order.
pub fn parse_tokens(bytes: &[u8]) -> anyhow::Result<Vec<u32>> {
    let (header, payload) = split_file(bytes)?;
    tracing::debug!(kind = ?header.kind, width = header.width, shape = ?header.shape, "read npy header");
    if header.fortran_order && header.shape.iter().filter(|&&d| d > 1).count() > 1 {
        bail!("fortran-ordered npy arrays with more than one axis are not supported");
    }
    let expected = header.elem_count() * header.width;
    if payload.len() != expected {
        bail!(
            "npy payload has {} bytes, shape {:?} needs {expected}",
            payload.len(),
            header.shape
        );
    }
    payload
        .chunks_exact(header.width)
        .enumerate()
        .map(|(pos, chunk)| token_id(&header, chunk, pos))
        .collect()
}

pub fn read_tokens(path: &Path) -> anyhow::Result<Vec<u32>> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_tokens(&bytes)
}
