//! Decoder for NumPy `.npy` payloads.
//!
//! Only what connectivity uploads need: numeric `f4`/`f8`/`i4`/`i8` arrays of
//! any shape, either byte order, C or Fortran layout. The result is always
//! flattened in C order and widened to `f64`.

use std::io::{self, Cursor, Read};

use crate::error::{SimError, SimResult};
use crate::storage;

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    F4,
    F8,
    I4,
    I8,
}

impl Scalar {
    fn width(self) -> usize {
        match self {
            Scalar::F4 | Scalar::I4 => 4,
            Scalar::F8 | Scalar::I8 => 8,
        }
    }
}

/// Decoded array header plus C-order `f64` data.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl NpyArray {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_flat(self) -> Vec<f64> {
        self.data
    }
}

/// Parse an in-memory `.npy` file.
pub fn decode(bytes: &[u8]) -> SimResult<NpyArray> {
    decode_from(&mut Cursor::new(bytes)).map_err(|e| SimError::InvalidPayload(e.to_string()))
}

fn decode_from(r: &mut Cursor<&[u8]>) -> io::Result<NpyArray> {
    let magic = storage::read_exact::<6, _>(r)?;
    if &magic != NPY_MAGIC {
        return Err(invalid("not an .npy file (bad magic)"));
    }
    let [major, _minor] = storage::read_exact::<2, _>(r)?;
    let header_len = match major {
        1 => storage::read_u16_le(r)? as usize,
        2 | 3 => storage::read_u32_le(r)? as usize,
        v => return Err(invalid(&format!("unsupported .npy version {v}"))),
    };
    check_remaining(r, header_len, "header")?;
    let mut header = vec![0u8; header_len];
    r.read_exact(&mut header)?;
    let header = String::from_utf8(header).map_err(|_| invalid("header is not utf-8"))?;

    let descr = dict_value(&header, "descr").ok_or_else(|| invalid("header missing 'descr'"))?;
    let (endian, scalar) = parse_descr(strip_quotes(descr))?;
    let fortran = match dict_value(&header, "fortran_order") {
        Some(v) if v.starts_with("True") => true,
        Some(v) if v.starts_with("False") => false,
        _ => return Err(invalid("header missing 'fortran_order'")),
    };
    let shape = parse_shape(
        dict_value(&header, "shape").ok_or_else(|| invalid("header missing 'shape'"))?,
    )?;

    let count = shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| invalid("shape overflows"))?;
    let byte_len = count
        .checked_mul(scalar.width())
        .ok_or_else(|| invalid("shape overflows"))?;

    // Sizes come from an untrusted header; never allocate past what was sent.
    check_remaining(r, byte_len, "data")?;
    let mut raw = vec![0u8; byte_len];
    r.read_exact(&mut raw)?;

    let values: Vec<f64> = raw
        .chunks_exact(scalar.width())
        .map(|c| read_scalar(c, endian, scalar))
        .collect();

    let data = if fortran && shape.len() > 1 {
        fortran_to_c(&values, &shape)
    } else {
        values
    };

    Ok(NpyArray { shape, data })
}

fn check_remaining(r: &Cursor<&[u8]>, needed: usize, what: &str) -> io::Result<()> {
    let remaining = r.get_ref().len().saturating_sub(r.position() as usize);
    if needed > remaining {
        return Err(invalid(&format!(
            "{what} declares {needed} bytes but only {remaining} remain"
        )));
    }
    Ok(())
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Slice of the header starting right after `'key':`, trimmed on the left.
fn dict_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle_single = format!("'{key}'");
    let needle_double = format!("\"{key}\"");
    let start = header
        .find(&needle_single)
        .map(|i| i + needle_single.len())
        .or_else(|| header.find(&needle_double).map(|i| i + needle_double.len()))?;
    let rest = header[start..].trim_start();
    let rest = rest.strip_prefix(':')?;
    Some(rest.trim_start())
}

fn strip_quotes(v: &str) -> &str {
    let quote = match v.chars().next() {
        Some(q @ ('\'' | '"')) => q,
        _ => return v,
    };
    let inner = &v[1..];
    match inner.find(quote) {
        Some(end) => &inner[..end],
        None => inner,
    }
}

fn parse_descr(descr: &str) -> io::Result<(Endian, Scalar)> {
    let mut chars = descr.chars();
    let endian = match chars.next() {
        Some('<') => Endian::Little,
        Some('>') => Endian::Big,
        Some('=') => {
            if cfg!(target_endian = "big") {
                Endian::Big
            } else {
                Endian::Little
            }
        }
        _ => return Err(invalid(&format!("unsupported dtype '{descr}'"))),
    };
    let scalar = match chars.as_str() {
        "f4" => Scalar::F4,
        "f8" => Scalar::F8,
        "i4" => Scalar::I4,
        "i8" => Scalar::I8,
        other => return Err(invalid(&format!("unsupported dtype '{other}'"))),
    };
    Ok((endian, scalar))
}

fn parse_shape(v: &str) -> io::Result<Vec<usize>> {
    let open = v.strip_prefix('(').ok_or_else(|| invalid("shape is not a tuple"))?;
    let close = open.find(')').ok_or_else(|| invalid("shape is not a tuple"))?;
    open[..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| invalid(&format!("bad shape entry '{s}'")))
        })
        .collect()
}

fn read_scalar(c: &[u8], endian: Endian, scalar: Scalar) -> f64 {
    let mut b4 = [0u8; 4];
    let mut b8 = [0u8; 8];
    match scalar {
        Scalar::F4 | Scalar::I4 => b4.copy_from_slice(c),
        Scalar::F8 | Scalar::I8 => b8.copy_from_slice(c),
    }
    match (scalar, endian) {
        (Scalar::F4, Endian::Little) => f32::from_le_bytes(b4) as f64,
        (Scalar::F4, Endian::Big) => f32::from_be_bytes(b4) as f64,
        (Scalar::I4, Endian::Little) => i32::from_le_bytes(b4) as f64,
        (Scalar::I4, Endian::Big) => i32::from_be_bytes(b4) as f64,
        (Scalar::F8, Endian::Little) => f64::from_le_bytes(b8),
        (Scalar::F8, Endian::Big) => f64::from_be_bytes(b8),
        (Scalar::I8, Endian::Little) => i64::from_le_bytes(b8) as f64,
        (Scalar::I8, Endian::Big) => i64::from_be_bytes(b8) as f64,
    }
}

fn fortran_to_c(values: &[f64], shape: &[usize]) -> Vec<f64> {
    let ndim = shape.len();
    // Column-major strides.
    let mut f_strides = vec![1usize; ndim];
    for d in 1..ndim {
        f_strides[d] = f_strides[d - 1] * shape[d - 1];
    }
    let mut out = Vec::with_capacity(values.len());
    let mut index = vec![0usize; ndim];
    for _ in 0..values.len() {
        let offset: usize = index.iter().zip(&f_strides).map(|(i, s)| i * s).sum();
        out.push(values[offset]);
        // Advance the C-order multi-index (last axis fastest).
        for d in (0..ndim).rev() {
            index[d] += 1;
            if index[d] < shape[d] {
                break;
            }
            index[d] = 0;
        }
    }
    out
}

/// Encode a C-order little-endian `f8` array (v1 header).
///
/// Used by the CLI and tests to produce payloads the decoder accepts.
pub fn encode_f64(shape: &[usize], data: &[f64]) -> Vec<u8> {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    let shape_str = if dims.len() == 1 {
        format!("({},)", dims[0])
    } else {
        format!("({})", dims.join(", "))
    };
    let mut header =
        format!("{{'descr': '<f8', 'fortran_order': False, 'shape': {shape_str}, }}");
    // Pad so the data starts on a 64-byte boundary, newline-terminated.
    let unpadded = NPY_MAGIC.len() + 2 + 2 + header.len() + 1;
    let pad = (64 - unpadded % 64) % 64;
    header.push_str(&" ".repeat(pad));
    header.push('\n');

    let mut out = Vec::with_capacity(unpadded + pad + data.len() * 8);
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for v in data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}
