//! Deterministic PAX-sparse single-entry tar archive (spec §4.2).
//!
//! Every byte is reproducible: uid=gid=0, empty uname/gname, mode=0o644,
//! mtime=0, ustar magic/version, checksum computed with the checksum field
//! blanked to spaces. Hand-rolled rather than built on `tar::Builder`
//! because the crate's public writer API has no support for emitting the
//! GNU sparse PAX extension with this exact, digest-stable byte layout
//! (mirrors the teacher's own fixed-width `to_bytes`/`from_bytes` header
//! structs in `smolvm-pack/src/packer.rs`).

use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::sparse::SparseExtent;

const BLOCK: usize = 512;
const PAX_ENTRY_NAME: &str = "PaxHeader/disk.chunk";
const SPARSE_ENTRY_NAME: &str = "GNUSparseFile.0/disk.chunk";

fn octal_field(value: u64, width: usize) -> Vec<u8> {
    let digits = format!("{:0width$o}", value, width = width - 1);
    let mut buf = Vec::with_capacity(width);
    buf.extend_from_slice(digits.as_bytes());
    buf.push(0);
    buf
}

fn name_field(name: &str) -> [u8; 100] {
    let mut buf = [0u8; 100];
    let bytes = name.as_bytes();
    buf[..bytes.len()].copy_from_slice(bytes);
    buf
}

/// Build one 512-byte ustar header block with the checksum filled in.
fn build_header(name: &str, typeflag: u8, size: u64) -> [u8; BLOCK] {
    let mut block = [0u8; BLOCK];
    block[0..100].copy_from_slice(&name_field(name));
    block[100..108].copy_from_slice(&octal_field(0o644, 8)); // mode
    block[108..116].copy_from_slice(&octal_field(0, 8)); // uid
    block[116..124].copy_from_slice(&octal_field(0, 8)); // gid
    block[124..136].copy_from_slice(&octal_field(size, 12)); // size
    block[136..148].copy_from_slice(&octal_field(0, 12)); // mtime
    block[148..156].copy_from_slice(b"        "); // checksum, blanked for computation
    block[156] = typeflag;
    // linkname (157..257) stays zero.
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");
    // uname/gname (265..329) stay empty.
    block[329..337].copy_from_slice(&octal_field(0, 8)); // devmajor
    block[337..345].copy_from_slice(&octal_field(0, 8)); // devminor
    // prefix (345..500) and pad (500..512) stay zero.

    let checksum: u32 = block.iter().map(|&b| b as u32).sum();
    let digits = format!("{:06o}", checksum);
    block[148..154].copy_from_slice(digits.as_bytes());
    block[154] = 0;
    block[155] = b' ';
    block
}

fn pad_to_block(len: usize) -> usize {
    let rem = len % BLOCK;
    if rem == 0 {
        0
    } else {
        BLOCK - rem
    }
}

fn pax_record(key: &str, value: &str) -> String {
    let mut len = key.len() + value.len() + 3;
    loop {
        let new_len = len.to_string().len() + 1 + key.len() + 1 + value.len() + 1;
        if new_len == len {
            break;
        }
        len = new_len;
    }
    format!("{} {}={}\n", len, key, value)
}

fn sparse_map_value(extents: &[SparseExtent]) -> String {
    extents
        .iter()
        .flat_map(|e| vec![e.offset.to_string(), e.length.to_string()])
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_sparse_map_value(value: &str) -> Result<Vec<SparseExtent>> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() % 2 != 0 {
        return Err(Error::format("GNU.sparse.map has an odd number of fields"));
    }
    let mut extents = Vec::with_capacity(parts.len() / 2);
    for pair in parts.chunks(2) {
        let offset: i64 = pair[0]
            .parse()
            .map_err(|_| Error::format("GNU.sparse.map offset is not an integer"))?;
        let length: i64 = pair[1]
            .parse()
            .map_err(|_| Error::format("GNU.sparse.map length is not an integer"))?;
        extents.push(SparseExtent { offset, length });
    }
    Ok(extents)
}

/// Write the sparse tar archive for one chunk (spec §4.2, archive structure
/// items 1-7). `read_extent` must return exactly `extent.length` bytes
/// starting at `chunk_offset + extent.offset` within the source disk.
pub fn write_chunk_tar<W: Write>(
    out: &mut W,
    chunk_length: u64,
    extents: &[SparseExtent],
    mut read_extent: impl FnMut(&SparseExtent) -> std::io::Result<Vec<u8>>,
) -> Result<()> {
    let records = format!(
        "{}{}{}",
        pax_record("GNU.sparse.map", &sparse_map_value(extents)),
        pax_record("GNU.sparse.name", "disk.chunk"),
        pax_record("GNU.sparse.realsize", &chunk_length.to_string()),
    );
    let pax_payload = records.into_bytes();

    out.write_all(&build_header(PAX_ENTRY_NAME, b'x', pax_payload.len() as u64))
        .map_err(Error::PlainIo)?;
    out.write_all(&pax_payload).map_err(Error::PlainIo)?;
    out.write_all(&vec![0u8; pad_to_block(pax_payload.len())])
        .map_err(Error::PlainIo)?;

    let data_len: i64 = extents.iter().map(|e| e.length).sum();
    out.write_all(&build_header(SPARSE_ENTRY_NAME, b'0', data_len as u64))
        .map_err(Error::PlainIo)?;

    let mut written = 0usize;
    for extent in extents {
        let bytes = read_extent(extent).map_err(Error::PlainIo)?;
        if bytes.len() as i64 != extent.length {
            return Err(Error::format(format!(
                "extent read returned {} bytes, expected {}",
                bytes.len(),
                extent.length
            )));
        }
        out.write_all(&bytes).map_err(Error::PlainIo)?;
        written += bytes.len();
    }
    out.write_all(&vec![0u8; pad_to_block(written)])
        .map_err(Error::PlainIo)?;

    out.write_all(&[0u8; BLOCK]).map_err(Error::PlainIo)?;
    out.write_all(&[0u8; BLOCK]).map_err(Error::PlainIo)?;
    Ok(())
}

/// Parsed contents of a chunk's sparse tar archive.
pub struct ParsedChunkTar {
    pub extents: Vec<SparseExtent>,
    pub realsize: u64,
    /// Extent data, concatenated in extent order; split by `extents[i].length`.
    pub data: Vec<u8>,
}

fn read_exact_block<R: Read>(reader: &mut R) -> Result<[u8; BLOCK]> {
    let mut block = [0u8; BLOCK];
    reader.read_exact(&mut block).map_err(Error::PlainIo)?;
    Ok(block)
}

fn octal_field_value(field: &[u8]) -> Result<u64> {
    let end = field
        .iter()
        .position(|&b| b == 0 || b == b' ')
        .unwrap_or(field.len());
    let s = std::str::from_utf8(&field[..end]).map_err(|_| Error::format("non-utf8 octal field"))?;
    if s.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(s, 8).map_err(|_| Error::format("invalid octal field"))
}

/// Parse one chunk's sparse tar archive as produced by [`write_chunk_tar`].
pub fn read_chunk_tar<R: Read>(reader: &mut R) -> Result<ParsedChunkTar> {
    let pax_header = read_exact_block(reader)?;
    if pax_header[156] != b'x' {
        return Err(Error::format("expected PAX extended header (typeflag 'x')"));
    }
    let pax_size = octal_field_value(&pax_header[124..136])? as usize;

    let mut payload = vec![0u8; pax_size];
    reader.read_exact(&mut payload).map_err(Error::PlainIo)?;
    let pad = pad_to_block(pax_size);
    if pad > 0 {
        let mut skip = vec![0u8; pad];
        reader.read_exact(&mut skip).map_err(Error::PlainIo)?;
    }

    let mut extents = None;
    let mut realsize = None;
    let mut cursor = 0usize;
    while cursor < payload.len() {
        let rest = &payload[cursor..];
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::format("malformed PAX record: missing length"))?;
        let len_str = std::str::from_utf8(&rest[..space])
            .map_err(|_| Error::format("malformed PAX record length"))?;
        let record_len: usize = len_str
            .parse()
            .map_err(|_| Error::format("malformed PAX record length"))?;
        if record_len == 0 || cursor + record_len > payload.len() {
            return Err(Error::format("malformed PAX record length"));
        }
        let record = &payload[cursor..cursor + record_len];
        let body = &record[space + 1..record.len() - 1]; // drop "len " prefix and trailing \n
        let body_str =
            std::str::from_utf8(body).map_err(|_| Error::format("non-utf8 PAX record"))?;
        let eq = body_str
            .find('=')
            .ok_or_else(|| Error::format("malformed PAX record: missing '='"))?;
        let (key, value) = (&body_str[..eq], &body_str[eq + 1..]);
        match key {
            "GNU.sparse.map" => extents = Some(parse_sparse_map_value(value)?),
            "GNU.sparse.realsize" => {
                realsize = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| Error::format("invalid GNU.sparse.realsize"))?,
                )
            }
            _ => {}
        }
        cursor += record_len;
    }

    let extents = extents.ok_or_else(|| Error::format("missing GNU.sparse.map record"))?;
    let realsize = realsize.ok_or_else(|| Error::format("missing GNU.sparse.realsize record"))?;

    let file_header = read_exact_block(reader)?;
    if file_header[156] != b'0' && file_header[156] != 0 {
        return Err(Error::format("expected regular file header (typeflag '0')"));
    }
    let data_len = octal_field_value(&file_header[124..136])? as usize;
    let mut data = vec![0u8; data_len];
    reader.read_exact(&mut data).map_err(Error::PlainIo)?;
    let pad = pad_to_block(data_len);
    if pad > 0 {
        let mut skip = vec![0u8; pad];
        reader.read_exact(&mut skip).map_err(Error::PlainIo)?;
    }

    Ok(ParsedChunkTar {
        extents,
        realsize,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pax_record_length_is_self_inclusive() {
        let record = pax_record("GNU.sparse.name", "disk.chunk");
        let space = record.find(' ').unwrap();
        let declared_len: usize = record[..space].parse().unwrap();
        assert_eq!(declared_len, record.len());
    }

    #[test]
    fn round_trips_a_single_extent() {
        let extents = vec![SparseExtent {
            offset: 0,
            length: 3,
        }];
        let data = vec![1u8, 2, 3];
        let mut out = Vec::new();
        write_chunk_tar(&mut out, 3, &extents, |_| Ok(data.clone())).unwrap();

        assert_eq!(out.len() % BLOCK, 0);
        assert!(out.len() >= 5 * BLOCK);

        let mut cursor = std::io::Cursor::new(out);
        let parsed = read_chunk_tar(&mut cursor).unwrap();
        assert_eq!(parsed.extents, extents);
        assert_eq!(parsed.realsize, 3);
        assert_eq!(parsed.data, data);
    }

    #[test]
    fn round_trips_multiple_extents_and_holes() {
        let extents = vec![
            SparseExtent {
                offset: 0,
                length: 16,
            },
            SparseExtent {
                offset: 1_048_576,
                length: 16,
            },
        ];
        let data: Vec<u8> = (0..32u8).collect();
        let mut out = Vec::new();
        let chunk_len = 2 * 1024 * 1024;
        write_chunk_tar(&mut out, chunk_len, &extents, {
            let mut offset = 0usize;
            move |e| {
                let n = e.length as usize;
                let slice = data[offset..offset + n].to_vec();
                offset += n;
                Ok(slice)
            }
        })
        .unwrap();

        let mut cursor = std::io::Cursor::new(out);
        let parsed = read_chunk_tar(&mut cursor).unwrap();
        assert_eq!(parsed.extents, extents);
        assert_eq!(parsed.realsize, chunk_len);
        assert_eq!(parsed.data.len(), 32);
    }

    #[test]
    fn header_checksum_is_computed_with_blanked_field() {
        let header = build_header(PAX_ENTRY_NAME, b'x', 100);
        let declared = octal_field_value(&header[148..154]).unwrap();
        let mut recomputed_input = header;
        recomputed_input[148..156].copy_from_slice(b"        ");
        let sum: u32 = recomputed_input.iter().map(|&b| b as u32).sum();
        assert_eq!(declared as u32, sum);
    }

    #[test]
    fn same_inputs_produce_byte_identical_archives() {
        let extents = vec![SparseExtent {
            offset: 0,
            length: 3,
        }];
        let data = vec![9u8, 8, 7];
        let mut a = Vec::new();
        let mut b = Vec::new();
        write_chunk_tar(&mut a, 3, &extents, |_| Ok(data.clone())).unwrap();
        write_chunk_tar(&mut b, 3, &extents, |_| Ok(data.clone())).unwrap();
        assert_eq!(a, b);
    }
}
