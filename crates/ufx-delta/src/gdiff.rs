//! GDIFF (version 4) patch format.
//!
//! A patch is the magic bytes and version, followed by a stream of commands
//! that either append literal bytes (DATA) or copy a range of the source
//! (COPY), terminated by EOF. All integers are big-endian.

use std::collections::HashMap;
use std::io::{self, Write};

/// Leading magic bytes of every GDIFF stream.
pub const MAGIC: [u8; 4] = [0xd1, 0xff, 0xd1, 0xff];

/// GDIFF format version.
pub const VERSION: u8 = 4;

/// Block size used to index the source for matches.
pub const CHUNK_SIZE: usize = 16;

const EOF: u8 = 0;
const DATA_MAX: u8 = 246;
const DATA_USHORT: u8 = 247;
const DATA_INT: u8 = 248;
const COPY_USHORT_UBYTE: u8 = 249;
const COPY_USHORT_USHORT: u8 = 250;
const COPY_USHORT_INT: u8 = 251;
const COPY_INT_UBYTE: u8 = 252;
const COPY_INT_USHORT: u8 = 253;
const COPY_INT_INT: u8 = 254;
const COPY_LONG_INT: u8 = 255;

const MAX_INT: u64 = i32::MAX as u64;

/// Streams GDIFF commands to an underlying writer.
///
/// Literal bytes are buffered so that adjacent DATA runs collapse into a
/// single command.
pub struct GdiffWriter<W: Write> {
    out: W,
    pending: Vec<u8>,
}

impl<W: Write> GdiffWriter<W> {
    /// Create a writer and emit the header.
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(&MAGIC)?;
        out.write_all(&[VERSION])?;
        Ok(Self {
            out,
            pending: Vec::new(),
        })
    }

    /// Append literal bytes.
    pub fn add_data(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Copy `len` bytes starting at `offset` of the source.
    pub fn add_copy(&mut self, mut offset: u64, mut len: u64) -> io::Result<()> {
        self.flush_data()?;
        while len > 0 {
            let step = len.min(MAX_INT);
            self.write_copy(offset, step)?;
            offset += step;
            len -= step;
        }
        Ok(())
    }

    /// Flush pending data, write EOF and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_data()?;
        self.out.write_all(&[EOF])?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn flush_data(&mut self) -> io::Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for chunk in pending.chunks(MAX_INT as usize) {
            let n = chunk.len();
            if n <= DATA_MAX as usize {
                self.out.write_all(&[n as u8])?;
            } else if n <= u16::MAX as usize {
                self.out.write_all(&[DATA_USHORT])?;
                self.out.write_all(&(n as u16).to_be_bytes())?;
            } else {
                self.out.write_all(&[DATA_INT])?;
                self.out.write_all(&(n as i32).to_be_bytes())?;
            }
            self.out.write_all(chunk)?;
        }
        Ok(())
    }

    fn write_copy(&mut self, offset: u64, len: u64) -> io::Result<()> {
        let out = &mut self.out;
        if offset <= u16::MAX as u64 {
            let off = (offset as u16).to_be_bytes();
            if len <= u8::MAX as u64 {
                out.write_all(&[COPY_USHORT_UBYTE])?;
                out.write_all(&off)?;
                out.write_all(&[len as u8])
            } else if len <= u16::MAX as u64 {
                out.write_all(&[COPY_USHORT_USHORT])?;
                out.write_all(&off)?;
                out.write_all(&(len as u16).to_be_bytes())
            } else {
                out.write_all(&[COPY_USHORT_INT])?;
                out.write_all(&off)?;
                out.write_all(&(len as i32).to_be_bytes())
            }
        } else if offset <= MAX_INT {
            let off = (offset as i32).to_be_bytes();
            if len <= u8::MAX as u64 {
                out.write_all(&[COPY_INT_UBYTE])?;
                out.write_all(&off)?;
                out.write_all(&[len as u8])
            } else if len <= u16::MAX as u64 {
                out.write_all(&[COPY_INT_USHORT])?;
                out.write_all(&off)?;
                out.write_all(&(len as u16).to_be_bytes())
            } else {
                out.write_all(&[COPY_INT_INT])?;
                out.write_all(&off)?;
                out.write_all(&(len as i32).to_be_bytes())
            }
        } else {
            out.write_all(&[COPY_LONG_INT])?;
            out.write_all(&(offset as i64).to_be_bytes())?;
            out.write_all(&(len as i32).to_be_bytes())
        }
    }
}

/// Write a patch turning `source` into `target`.
///
/// The source is indexed in non-overlapping blocks of [`CHUNK_SIZE`]; the
/// target is scanned byte by byte and every block hit is extended forward as
/// far as the bytes keep matching.
pub fn write_diff<W: Write>(source: &[u8], target: &[u8], out: W) -> io::Result<W> {
    let mut index: HashMap<&[u8], usize> = HashMap::new();
    for (i, block) in source.chunks_exact(CHUNK_SIZE).enumerate() {
        index.entry(block).or_insert(i * CHUNK_SIZE);
    }

    let mut writer = GdiffWriter::new(out)?;
    let mut pos = 0;
    while pos < target.len() {
        if pos + CHUNK_SIZE <= target.len() {
            if let Some(&src) = index.get(&target[pos..pos + CHUNK_SIZE]) {
                let mut len = CHUNK_SIZE;
                while src + len < source.len()
                    && pos + len < target.len()
                    && source[src + len] == target[pos + len]
                {
                    len += 1;
                }
                writer.add_copy(src as u64, len as u64)?;
                pos += len;
                continue;
            }
        }
        writer.add_data(&target[pos..pos + 1]);
        pos += 1;
    }
    writer.finish()
}

/// Apply a patch to `source`, returning the reconstructed target.
pub fn apply(source: &[u8], patch: &[u8]) -> io::Result<Vec<u8>> {
    let mut cursor = Cursor { bytes: patch, pos: 0 };
    if cursor.take(4)? != MAGIC {
        return Err(invalid("bad GDIFF magic"));
    }
    if cursor.u8()? != VERSION {
        return Err(invalid("unsupported GDIFF version"));
    }

    let mut out = Vec::new();
    loop {
        let command = cursor.u8()?;
        match command {
            EOF => return Ok(out),
            1..=DATA_MAX => out.extend_from_slice(cursor.take(command as usize)?),
            DATA_USHORT => {
                let n = cursor.u16()? as usize;
                out.extend_from_slice(cursor.take(n)?);
            }
            DATA_INT => {
                let n = cursor.i32()? as usize;
                out.extend_from_slice(cursor.take(n)?);
            }
            _ => {
                let (offset, len) = match command {
                    COPY_USHORT_UBYTE => (cursor.u16()? as u64, cursor.u8()? as u64),
                    COPY_USHORT_USHORT => (cursor.u16()? as u64, cursor.u16()? as u64),
                    COPY_USHORT_INT => (cursor.u16()? as u64, cursor.i32()? as u64),
                    COPY_INT_UBYTE => (cursor.i32()? as u64, cursor.u8()? as u64),
                    COPY_INT_USHORT => (cursor.i32()? as u64, cursor.u16()? as u64),
                    COPY_INT_INT => (cursor.i32()? as u64, cursor.i32()? as u64),
                    _ => (cursor.i64()? as u64, cursor.i32()? as u64),
                };
                let start = offset as usize;
                let end = start
                    .checked_add(len as usize)
                    .filter(|&end| end <= source.len())
                    .ok_or_else(|| invalid("copy outside source"))?;
                out.extend_from_slice(&source[start..end]);
            }
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| invalid("truncated patch"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> io::Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> io::Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> io::Result<i64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(i64::from_be_bytes(buf))
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
