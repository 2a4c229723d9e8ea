//! NPY-format array readout.
//!
//! joblib writes each numpy array as a placeholder record in the pickle
//! stream followed by an out-of-band NPY block: the `\x93NUMPY` magic, a
//! version pair, a length-prefixed Python-literal header with `descr`,
//! `fortran_order` and `shape`, then the raw element bytes. The decoder
//! hands this module the stream cursor right after the placeholder's
//! BUILD opcode; everything the block consumes is accounted to `pos`.

use crate::error::UnpickleError;

pub const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
    /// Single-byte or sub-byte kinds where order does not apply ('|')
    None,
}

/// Parsed numpy dtype descriptor, e.g. `<f8`, `|b1`, `<U10`.
#[derive(Debug, Clone, PartialEq)]
pub struct DType {
    /// The descriptor string exactly as the header spelled it
    pub descr: String,
    pub order: ByteOrder,
    /// numpy kind character: b, i, u, f, c, S or U
    pub kind: char,
    /// Bytes per element ('U' counts 4 bytes per code point)
    pub item_size: usize,
}

impl DType {
    pub fn parse(descr: &str) -> Result<DType, UnpickleError> {
        let corrupt =
            |msg: String| -> UnpickleError { UnpickleError::CorruptArrayPayload(msg) };

        let mut chars = descr.chars();
        let order = match chars.next() {
            Some('<') | Some('=') => ByteOrder::Little,
            Some('>') => ByteOrder::Big,
            Some('|') => ByteOrder::None,
            _ => return Err(corrupt(format!("bad dtype descriptor: {descr:?}"))),
        };
        let kind = chars
            .next()
            .ok_or_else(|| corrupt(format!("bad dtype descriptor: {descr:?}")))?;
        let width: usize = chars
            .as_str()
            .parse()
            .map_err(|_| corrupt(format!("bad dtype width in {descr:?}")))?;

        let item_size = match kind {
            'b' | 'i' | 'u' | 'f' | 'c' | 'S' => width,
            'U' => width
                .checked_mul(4)
                .ok_or_else(|| corrupt(format!("bad dtype width in {descr:?}")))?,
            // object, void and datetime elements have no flat byte layout
            _ => return Err(corrupt(format!("unsupported dtype kind: {descr:?}"))),
        };

        Ok(DType {
            descr: descr.to_string(),
            order,
            kind,
            item_size,
        })
    }
}

/// A materialized numpy array: dtype, dimensions and the raw element
/// bytes in the order the file stored them.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub fortran_order: bool,
    pub data: Vec<u8>,
}

impl NdArray {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Float elements widened to f64, honoring the stored byte order.
    /// Returns None for non-float dtypes.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        if self.dtype.kind != 'f' {
            return None;
        }
        let big = self.dtype.order == ByteOrder::Big;
        match self.dtype.item_size {
            8 => Some(
                self.data
                    .chunks_exact(8)
                    .map(|chunk| {
                        let raw: [u8; 8] = chunk.try_into().unwrap();
                        if big {
                            f64::from_be_bytes(raw)
                        } else {
                            f64::from_le_bytes(raw)
                        }
                    })
                    .collect(),
            ),
            4 => Some(
                self.data
                    .chunks_exact(4)
                    .map(|chunk| {
                        let raw: [u8; 4] = chunk.try_into().unwrap();
                        if big {
                            f32::from_be_bytes(raw) as f64
                        } else {
                            f32::from_le_bytes(raw) as f64
                        }
                    })
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Read one NPY block from `data` starting at `pos`, advancing `pos`
/// past the element bytes. Every failure is a corrupt payload; the
/// block either reads out completely or the decode dies.
pub fn read_array(data: &[u8], pos: &mut usize) -> Result<NdArray, UnpickleError> {
    let magic = take(data, pos, 6, "NPY magic")?;
    if magic != NPY_MAGIC {
        return Err(UnpickleError::CorruptArrayPayload(format!(
            "bad NPY magic: {magic:02x?}"
        )));
    }

    let version = take(data, pos, 2, "NPY version")?;
    let header_len = match version[0] {
        1 => {
            let raw = take(data, pos, 2, "NPY header length")?;
            u16::from_le_bytes([raw[0], raw[1]]) as usize
        }
        2 | 3 => {
            let raw = take(data, pos, 4, "NPY header length")?;
            u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
        }
        major => {
            return Err(UnpickleError::CorruptArrayPayload(format!(
                "unsupported NPY version {}.{}",
                major, version[1]
            )))
        }
    };

    let header_bytes = take(data, pos, header_len, "NPY header")?;
    let header = std::str::from_utf8(header_bytes).map_err(|_| {
        UnpickleError::CorruptArrayPayload("NPY header is not UTF-8".to_string())
    })?;
    let (descr, fortran_order, shape) = parse_header(header)?;
    let dtype = DType::parse(&descr)?;

    let count = shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| {
            UnpickleError::CorruptArrayPayload("shape element count overflows".to_string())
        })?;
    let total = count.checked_mul(dtype.item_size).ok_or_else(|| {
        UnpickleError::CorruptArrayPayload("array byte size overflows".to_string())
    })?;

    let payload = take(data, pos, total, "array payload")?;

    Ok(NdArray {
        dtype,
        shape,
        fortran_order,
        data: payload.to_vec(),
    })
}

fn take<'a>(
    data: &'a [u8],
    pos: &mut usize,
    n: usize,
    what: &str,
) -> Result<&'a [u8], UnpickleError> {
    let end = pos
        .checked_add(n)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| {
            UnpickleError::CorruptArrayPayload(format!(
                "{what} truncated: wanted {n} bytes, stream has {}",
                data.len().saturating_sub(*pos)
            ))
        })?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

/// Pull descr/fortran_order/shape out of the header dict literal, e.g.
/// `{'descr': '<f8', 'fortran_order': False, 'shape': (2, 3), }`.
/// Key order is not assumed.
fn parse_header(header: &str) -> Result<(String, bool, Vec<usize>), UnpickleError> {
    let descr_raw = field_value(header, "descr")?;
    let descr = match descr_raw.chars().next() {
        Some(quote @ ('\'' | '"')) => {
            let inner = &descr_raw[1..];
            let end = inner.find(quote).ok_or_else(|| {
                UnpickleError::CorruptArrayPayload("unterminated descr string".to_string())
            })?;
            inner[..end].to_string()
        }
        Some('[') => {
            return Err(UnpickleError::CorruptArrayPayload(
                "structured dtypes are not supported".to_string(),
            ))
        }
        _ => {
            return Err(UnpickleError::CorruptArrayPayload(
                "descr is not a string".to_string(),
            ))
        }
    };

    let fortran_raw = field_value(header, "fortran_order")?;
    let fortran_order = if fortran_raw.starts_with("True") {
        true
    } else if fortran_raw.starts_with("False") {
        false
    } else {
        return Err(UnpickleError::CorruptArrayPayload(
            "fortran_order is not a bool".to_string(),
        ));
    };

    let shape_raw = field_value(header, "shape")?;
    let open = shape_raw.strip_prefix('(').ok_or_else(|| {
        UnpickleError::CorruptArrayPayload("shape is not a tuple".to_string())
    })?;
    let end = open.find(')').ok_or_else(|| {
        UnpickleError::CorruptArrayPayload("unterminated shape tuple".to_string())
    })?;
    let mut shape = Vec::new();
    for dim in open[..end].split(',') {
        let dim = dim.trim();
        if dim.is_empty() {
            continue;
        }
        let dim: usize = dim.parse().map_err(|_| {
            UnpickleError::CorruptArrayPayload(format!("bad shape dimension: {dim:?}"))
        })?;
        shape.push(dim);
    }

    Ok((descr, fortran_order, shape))
}

/// The text following `'key':`, trimmed of leading whitespace.
fn field_value<'h>(header: &'h str, key: &str) -> Result<&'h str, UnpickleError> {
    let pattern = format!("'{key}'");
    let start = header.find(&pattern).ok_or_else(|| {
        UnpickleError::CorruptArrayPayload(format!("NPY header missing {key}"))
    })?;
    let rest = header[start + pattern.len()..].trim_start();
    let rest = rest.strip_prefix(':').ok_or_else(|| {
        UnpickleError::CorruptArrayPayload(format!("NPY header missing value for {key}"))
    })?;
    Ok(rest.trim_start())
}
