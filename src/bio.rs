//! Common envelope for the binary model files (means, variances, mixture
//! weights, transition matrices, sendump).
//!
//! Every file starts with a textual header of `name value` lines terminated
//! by a line reading `endhdr`, followed by a 32-bit byteorder magic
//! `0x11223344`. Reading the magic back as `0x44332211` means the producer
//! had the opposite endianness and every subsequent scalar is byte-swapped.
//! When the header declares `chksum0` a rolling checksum accumulates over
//! the payload and is verified against a trailing word.
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

pub const BYTE_ORDER_MAGIC: u32 = 0x1122_3344;

#[derive(Debug)]
pub struct BinReader<R> {
    inner: R,
    file: String,
    swap: bool,
    chksum: u32,
    has_chksum: bool,
    header: Vec<(String, String)>,
}

impl BinReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::format(path.display().to_string(), e.to_string()))?;
        Self::new(BufReader::new(file), path.display().to_string())
    }
}

impl<R: Read> BinReader<R> {
    pub fn new(mut inner: R, file: String) -> Result<Self> {
        let mut header = Vec::new();
        loop {
            let line = read_line(&mut inner)
                .map_err(|_| Error::format(&file, "unterminated header"))?;
            let line = line.trim();
            if line == "endhdr" {
                break;
            }
            if line.is_empty() || line.starts_with("s3") {
                // Leading format marker such as "s3\n".
                continue;
            }
            match line.split_once(char::is_whitespace) {
                Some((name, value)) => {
                    header.push((name.to_string(), value.trim().to_string()))
                }
                None => header.push((line.to_string(), String::new())),
            }
        }

        let magic = inner
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::format(&file, e.to_string()))?;
        let swap = if magic == BYTE_ORDER_MAGIC {
            false
        } else if magic.swap_bytes() == BYTE_ORDER_MAGIC {
            true
        } else {
            return Err(Error::format(
                &file,
                format!("bad byteorder magic {magic:#010x}"),
            ));
        };

        let has_chksum = header.iter().any(|(name, _)| name == "chksum0");
        Ok(BinReader {
            inner,
            file,
            swap,
            chksum: 0,
            has_chksum,
            header,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.header
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Warn-level version check: mismatches are tolerated, absences are not
    /// errors. Callers that require exact versions compare themselves.
    pub fn version(&self) -> Option<&str> {
        self.header("version")
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    fn accum(&mut self, val: u32) {
        self.chksum = (self.chksum << 5 | self.chksum >> 27).wrapping_add(val);
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let v = if self.swap {
            self.inner.read_u32::<BigEndian>()
        } else {
            self.inner.read_u32::<LittleEndian>()
        }
        .map_err(|e| Error::format(&self.file, e.to_string()))?;
        self.accum(v);
        Ok(v)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f32_vec(&mut self, n: usize) -> Result<Vec<f32>> {
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(self.read_f32()?);
        }
        Ok(v)
    }

    pub fn read_i32_vec(&mut self, n: usize) -> Result<Vec<i32>> {
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(self.read_i32()?);
        }
        Ok(v)
    }

    pub fn read_u8_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut v = vec![0u8; n];
        self.inner
            .read_exact(&mut v)
            .map_err(|e| Error::format(&self.file, e.to_string()))?;
        for &b in &v {
            self.accum(b as u32);
        }
        Ok(v)
    }

    /// Verify the trailing checksum if the header declared one. Must be
    /// called after the payload and before [`Self::expect_eof`].
    pub fn verify_chksum(&mut self) -> Result<()> {
        if !self.has_chksum {
            return Ok(());
        }
        let expected = self.chksum;
        let stored = if self.swap {
            self.inner.read_u32::<BigEndian>()
        } else {
            self.inner.read_u32::<LittleEndian>()
        }
        .map_err(|e| Error::format(&self.file, e.to_string()))?;
        if stored != expected {
            return Err(Error::format(
                &self.file,
                format!("checksum mismatch: stored {stored:#010x}, computed {expected:#010x}"),
            ));
        }
        Ok(())
    }

    pub fn expect_eof(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        match self.inner.read(&mut byte) {
            Ok(0) => Ok(()),
            Ok(_) => Err(Error::format(&self.file, "more data than expected")),
            Err(e) => Err(Error::format(&self.file, e.to_string())),
        }
    }
}

fn read_line(r: &mut impl Read) -> std::io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        r.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 4096 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "header line too long",
            ));
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Native-endian writer producing files [`BinReader`] accepts. Used by the
/// tests and by the lattice/dictionary save paths.
#[derive(Debug)]
pub struct BinWriter<W> {
    inner: W,
    chksum: u32,
    with_chksum: bool,
}

impl<W: Write> BinWriter<W> {
    pub fn new(mut inner: W, header: &[(&str, &str)], with_chksum: bool) -> Result<Self> {
        for (name, value) in header {
            writeln!(inner, "{name} {value}")?;
        }
        if with_chksum {
            writeln!(inner, "chksum0 yes")?;
        }
        writeln!(inner, "endhdr")?;
        inner.write_u32::<LittleEndian>(BYTE_ORDER_MAGIC)?;
        Ok(BinWriter {
            inner,
            chksum: 0,
            with_chksum,
        })
    }

    fn accum(&mut self, val: u32) {
        self.chksum = (self.chksum << 5 | self.chksum >> 27).wrapping_add(val);
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.inner.write_u32::<LittleEndian>(v)?;
        self.accum(v);
        Ok(())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_u32(v as u32)
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.write_u32(v.to_bits())
    }

    pub fn write_u8_slice(&mut self, v: &[u8]) -> Result<()> {
        self.inner.write_all(v)?;
        for &b in v {
            self.accum(b as u32);
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        if self.with_chksum {
            let sum = self.chksum;
            self.inner.write_u32::<LittleEndian>(sum)?;
        }
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_file(with_chksum: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut w = BinWriter::new(
                &mut buf,
                &[("version", "1.0"), ("generated_by", "test")],
                with_chksum,
            )
            .unwrap();
            w.write_i32(3).unwrap();
            w.write_f32(0.5).unwrap();
            w.write_f32(-1.25).unwrap();
            w.finish().unwrap();
        }
        buf
    }

    #[test]
    fn round_trip_with_checksum() {
        let buf = sample_file(true);
        let mut r = BinReader::new(Cursor::new(buf), "test".into()).unwrap();
        assert_eq!(r.version(), Some("1.0"));
        assert_eq!(r.read_i32().unwrap(), 3);
        assert_eq!(r.read_f32().unwrap(), 0.5);
        assert_eq!(r.read_f32().unwrap(), -1.25);
        r.verify_chksum().unwrap();
        r.expect_eof().unwrap();
    }

    #[test]
    fn corrupt_payload_fails_checksum() {
        let mut buf = sample_file(true);
        let n = buf.len();
        buf[n - 6] ^= 0xff; // inside the last f32, before the checksum word
        let mut r = BinReader::new(Cursor::new(buf), "test".into()).unwrap();
        r.read_i32().unwrap();
        r.read_f32().unwrap();
        r.read_f32().unwrap();
        assert!(r.verify_chksum().is_err());
    }

    #[test]
    fn byteswapped_file_reads_back() {
        // Hand-build a big-endian file; the reader must detect the swapped
        // magic and unswap every scalar.
        let mut buf = Vec::new();
        buf.extend_from_slice(b"version 1.0\nendhdr\n");
        buf.extend_from_slice(&BYTE_ORDER_MAGIC.to_be_bytes());
        buf.extend_from_slice(&7i32.to_be_bytes());
        buf.extend_from_slice(&2.5f32.to_bits().to_be_bytes());
        let mut r = BinReader::new(Cursor::new(buf), "test".into()).unwrap();
        assert_eq!(r.read_i32().unwrap(), 7);
        assert_eq!(r.read_f32().unwrap(), 2.5);
        r.expect_eof().unwrap();
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        let mut buf = sample_file(false);
        buf.push(0xAA);
        let mut r = BinReader::new(Cursor::new(buf), "test".into()).unwrap();
        r.read_i32().unwrap();
        r.read_f32().unwrap();
        r.read_f32().unwrap();
        assert!(r.expect_eof().is_err());
    }

    #[test]
    fn bad_magic_is_a_format_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"endhdr\n");
        buf.extend_from_slice(&0xdeadbeefu32.to_le_bytes());
        assert!(BinReader::new(Cursor::new(buf), "test".into()).is_err());
    }
}
