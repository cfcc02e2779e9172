//! Minimal NumPy `.npy` (format 1.0) codec for 2-D float32 arrays.
//!
//! Galleries and blacklist vectors are persisted as plain `<f4` C-order
//! arrays so the files stay readable by any NumPy-compatible tool. Only
//! the subset of the format this daemon writes is accepted back; anything
//! else is a corrupt store and is reported as such.

use std::io::{Read, Write};
use thiserror::Error;

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;

#[derive(Error, Debug)]
pub enum NpyError {
    #[error("not an npy file (bad magic)")]
    BadMagic,
    #[error("unsupported npy version {0}.{1}")]
    UnsupportedVersion(u8, u8),
    #[error("malformed npy header: {0}")]
    BadHeader(String),
    #[error("unsupported dtype {0:?} (expected little-endian float32)")]
    BadDescr(String),
    #[error("payload truncated: expected {expected} floats, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize a `rows × cols` float32 array in C order.
pub fn write_f32_2d<W: Write>(
    mut out: W,
    data: &[f32],
    rows: usize,
    cols: usize,
) -> Result<(), NpyError> {
    debug_assert_eq!(data.len(), rows * cols);

    let dict = format!("{{'descr': '<f4', 'fortran_order': False, 'shape': ({rows}, {cols}), }}");
    // Pad so the payload starts on a 64-byte boundary (magic 6 + version 2
    // + header-len 2 + dict + '\n').
    let unpadded = MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    let header_len = dict.len() + padding + 1;

    out.write_all(MAGIC)?;
    out.write_all(&[1, 0])?;
    out.write_all(&(header_len as u16).to_le_bytes())?;
    out.write_all(dict.as_bytes())?;
    out.write_all(&vec![b' '; padding])?;
    out.write_all(b"\n")?;

    for v in data {
        out.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Deserialize a 2-D float32 array. Returns `(data, rows, cols)`.
pub fn read_f32_2d<R: Read>(mut input: R) -> Result<(Vec<f32>, usize, usize), NpyError> {
    let mut magic = [0u8; 6];
    input.read_exact(&mut magic).map_err(|_| NpyError::BadMagic)?;
    if &magic != MAGIC {
        return Err(NpyError::BadMagic);
    }

    let mut version = [0u8; 2];
    input.read_exact(&mut version)?;
    if version[0] != 1 {
        return Err(NpyError::UnsupportedVersion(version[0], version[1]));
    }

    let mut len_bytes = [0u8; 2];
    input.read_exact(&mut len_bytes)?;
    let header_len = u16::from_le_bytes(len_bytes) as usize;

    let mut header = vec![0u8; header_len];
    input.read_exact(&mut header)?;
    let header = String::from_utf8(header)
        .map_err(|_| NpyError::BadHeader("non-utf8 header".into()))?;

    let descr = dict_value(&header, "descr")
        .ok_or_else(|| NpyError::BadHeader("missing descr".into()))?;
    if descr != "<f4" {
        return Err(NpyError::BadDescr(descr));
    }

    let fortran = dict_value(&header, "fortran_order")
        .ok_or_else(|| NpyError::BadHeader("missing fortran_order".into()))?;
    if fortran != "False" {
        return Err(NpyError::BadHeader("fortran order not supported".into()));
    }

    let (rows, cols) = parse_shape(&header)?;

    let expected = rows * cols;
    let mut payload = Vec::new();
    input.read_to_end(&mut payload)?;
    let got = payload.len() / 4;
    if got < expected {
        return Err(NpyError::Truncated { expected, got });
    }

    let data = payload[..expected * 4]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok((data, rows, cols))
}

/// Pull a value out of the header dict. Handles the two value forms this
/// codec emits: quoted strings and bare words.
fn dict_value(header: &str, key: &str) -> Option<String> {
    let pattern = format!("'{key}':");
    let start = header.find(&pattern)? + pattern.len();
    let rest = header[start..].trim_start();

    if let Some(stripped) = rest.strip_prefix('\'') {
        let end = stripped.find('\'')?;
        Some(stripped[..end].to_string())
    } else {
        let end = rest.find([',', '}'])?;
        Some(rest[..end].trim().to_string())
    }
}

fn parse_shape(header: &str) -> Result<(usize, usize), NpyError> {
    let start = header
        .find("'shape':")
        .ok_or_else(|| NpyError::BadHeader("missing shape".into()))?;
    let rest = &header[start..];
    let open = rest
        .find('(')
        .ok_or_else(|| NpyError::BadHeader("missing shape tuple".into()))?;
    let close = rest
        .find(')')
        .ok_or_else(|| NpyError::BadHeader("unterminated shape tuple".into()))?;

    let dims: Vec<usize> = rest[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| NpyError::BadHeader(format!("bad dimension {s:?}")))
        })
        .collect::<Result<_, _>>()?;

    match dims.as_slice() {
        [rows, cols] => Ok((*rows, *cols)),
        // A (0,) or () file is an empty store
        [] | [0] => Ok((0, 0)),
        other => Err(NpyError::BadHeader(format!(
            "expected 2-D shape, got {other:?}"
        ))),
    }
}
