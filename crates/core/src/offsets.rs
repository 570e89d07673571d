// clueweb22 is a toolkit for scanning and extracting the ClueWeb22 web corpus.
// Copyright (C) 2024 clueweb22 authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Random access into the fixed-width offset tables that accompany every
//! container file. Entry `i` occupies bytes `i * 22 .. i * 22 + 22` and holds
//! two newline-terminated 10-digit ASCII integers: the `[start, end)` byte
//! range of record `i` in the container.

use std::io::{Read, Seek, SeekFrom};

use crate::Error;

pub const ENTRY_BYTES: u64 = 22;

/// Number of records described by an offset table of `len` bytes.
pub fn num_records(len: u64) -> u64 {
    len / ENTRY_BYTES
}

fn parse_ascii(digits: &[u8]) -> Result<u64, Error> {
    let mut value = 0u64;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(Error::InvalidOffsets);
        }
        value = value * 10 + u64::from(b - b'0');
    }
    Ok(value)
}

/// Read the `[start, end)` byte range of record `index`.
pub fn read_offset<R: Read + Seek>(reader: &mut R, index: u64) -> Result<(u64, u64), Error> {
    reader.seek(SeekFrom::Start(index * ENTRY_BYTES))?;

    let mut buf = [0u8; ENTRY_BYTES as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled < buf.len() {
        return Err(Error::TruncatedOffsets {
            expected: buf.len(),
            got: filled,
        });
    }

    let start = parse_ascii(&buf[0..10])?;
    let end = parse_ascii(&buf[11..21])?;

    Ok((start, end))
}

/// Read the byte ranges for a list of record indices in the given order.
/// Callers that sort the indices ascending first save seeks; the result is
/// identical either way.
pub fn read_offsets<R: Read + Seek>(
    reader: &mut R,
    indices: &[u64],
) -> Result<Vec<(u64, u64)>, Error> {
    indices.iter().map(|&i| read_offset(reader, i)).collect()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn table(ranges: &[(u64, u64)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (start, end) in ranges {
            out.extend_from_slice(format!("{start:010}\n{end:010}\n").as_bytes());
        }
        out
    }

    #[test]
    fn lookup() {
        let bytes = table(&[(0, 100), (100, 250), (250, 400)]);
        assert_eq!(bytes.len(), 66);
        assert_eq!(num_records(bytes.len() as u64), 3);

        let mut reader = Cursor::new(bytes);
        assert_eq!(read_offset(&mut reader, 1).unwrap(), (100, 250));
        assert_eq!(read_offset(&mut reader, 0).unwrap(), (0, 100));
        assert_eq!(read_offset(&mut reader, 2).unwrap(), (250, 400));
    }

    #[test]
    fn truncated_table() {
        let mut bytes = table(&[(0, 100)]);
        bytes.truncate(30);

        let mut reader = Cursor::new(bytes);
        match read_offset(&mut reader, 1) {
            Err(Error::TruncatedOffsets { expected: 22, got: 8 }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        let mut reader = Cursor::new(b"abcdefghij\nabcdefghij\n".to_vec());
        assert!(matches!(
            read_offset(&mut reader, 0),
            Err(Error::InvalidOffsets)
        ));
    }

    #[test]
    fn batch_order_is_preserved() {
        let bytes = table(&[(0, 10), (10, 20), (20, 30)]);
        let mut reader = Cursor::new(bytes);

        let ranges = read_offsets(&mut reader, &[2, 0]).unwrap();
        assert_eq!(ranges, vec![(20, 30), (0, 10)]);
    }
}
