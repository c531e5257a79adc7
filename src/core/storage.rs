//! Chunked binary checkpoint for trained readout weights.
//!
//! Layout: `MAGIC`, `u32` version, then chunks of `tag: [u8; 4]`,
//! `len: u32`, `uncompressed_len: u32`, LZ4 block. Unknown chunks are
//! skipped on load.

use std::io::{self, Read, Write};

use crate::readout::WeightMatrix;

pub const MAGIC: &[u8; 8] = b"SPKRDT01";
pub const VERSION_CURRENT: u32 = 1;

const WEIGHTS_TAG: [u8; 4] = *b"WGTS";

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    lz4_flex::decompress(input, expected_size).map_err(|_| invalid("lz4 decompression failed"))
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f64_le<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_f64_le<R: Read>(r: &mut R) -> io::Result<f64> {
    Ok(f64::from_le_bytes(read_exact::<8, _>(r)?))
}

/// Write one LZ4 chunk, preceded by the uncompressed length.
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = u32::try_from(payload.len()).map_err(|_| invalid("chunk too large"))?;
    let total_len = u32::try_from(compressed.len())
        .ok()
        .and_then(|n| n.checked_add(4))
        .ok_or_else(|| invalid("chunk too large"))?;

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

fn read_chunk_payload<R: Read>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    let mut take = r.take(len as u64);
    let uncompressed_len = read_u32_le(&mut take)? as usize;
    let mut compressed = Vec::with_capacity((len as usize).saturating_sub(4));
    take.read_to_end(&mut compressed)?;
    if compressed.len() + 4 != len as usize {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated chunk"));
    }
    decompress_lz4(&compressed, uncompressed_len)
}

/// Serialize `weights` as a versioned checkpoint.
pub fn save_weights_to<W: Write>(weights: &WeightMatrix, w: &mut W) -> io::Result<()> {
    w.write_all(MAGIC)?;
    write_u32_le(w, VERSION_CURRENT)?;

    let mut payload = Vec::with_capacity(8 + weights.as_slice().len() * 8);
    let rows = u32::try_from(weights.num_classes()).map_err(|_| invalid("too many classes"))?;
    let cols = u32::try_from(weights.cols()).map_err(|_| invalid("too many outputs"))?;
    write_u32_le(&mut payload, rows)?;
    write_u32_le(&mut payload, cols)?;
    for &v in weights.as_slice() {
        write_f64_le(&mut payload, v)?;
    }
    write_chunk_lz4(w, WEIGHTS_TAG, &payload)
}

pub fn load_weights_from<R: Read>(r: &mut R) -> io::Result<WeightMatrix> {
    let magic = read_exact::<8, _>(r)?;
    if &magic != MAGIC {
        return Err(invalid("bad checkpoint magic"));
    }
    if read_u32_le(r)? != VERSION_CURRENT {
        return Err(invalid("unsupported checkpoint version"));
    }

    let mut weights = None;
    loop {
        let (tag, len) = match read_chunk_header(r) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        let payload = read_chunk_payload(r, len)?;
        if tag == WEIGHTS_TAG {
            let mut cursor = io::Cursor::new(payload);
            let rows = read_u32_le(&mut cursor)? as usize;
            let cols = read_u32_le(&mut cursor)? as usize;
            let n = rows.checked_mul(cols).ok_or_else(|| invalid("WGTS shape overflow"))?;
            let expected = n
                .checked_mul(8)
                .and_then(|b| b.checked_add(8))
                .ok_or_else(|| invalid("WGTS shape overflow"))?;
            if cursor.get_ref().len() != expected {
                return Err(invalid("WGTS length does not match its shape"));
            }
            let values = (0..n)
                .map(|_| read_f64_le(&mut cursor))
                .collect::<io::Result<Vec<f64>>>()?;
            weights = Some(WeightMatrix::from_parts(rows, cols, values).ok_or_else(|| invalid("WGTS has zero columns"))?);
        }
    }
    weights.ok_or_else(|| invalid("missing WGTS"))
}
