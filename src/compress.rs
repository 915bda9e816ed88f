//! Streamed block-compressed byte channel used for the binary trace file.
//!
//! The write side feeds everything through a single zstd frame and closes
//! it deterministically on `finish`. The read side sniffs the leading magic
//! bytes so that uncompressed debug dumps pass through verbatim and the
//! same reader serves both.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Write side: bytes in, one zstd frame out.
pub struct CompressedWriter {
    encoder: zstd::stream::write::Encoder<'static, BufWriter<File>>,
}

impl CompressedWriter {
    /// Create (truncate) `path` and start a compression stream on it.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        let encoder = zstd::stream::write::Encoder::new(BufWriter::new(file), 0)?;
        Ok(Self { encoder })
    }

    /// End the zstd frame and flush the underlying file. Must be called
    /// exactly once; dropping without it leaves a truncated frame.
    pub fn finish(self) -> io::Result<()> {
        let mut inner = self.encoder.finish()?;
        inner.flush()
    }
}

impl Write for CompressedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

enum ReaderKind {
    Zstd(zstd::stream::read::Decoder<'static, BufReader<File>>),
    Plain(BufReader<File>),
}

/// Read side: decompresses zstd input, passes anything else through.
pub struct CompressedReader {
    inner: ReaderKind,
}

impl CompressedReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let head = reader.fill_buf()?;
        let compressed = head.len() >= ZSTD_MAGIC.len() && head[..4] == ZSTD_MAGIC;
        let inner = if compressed {
            ReaderKind::Zstd(zstd::stream::read::Decoder::with_buffer(reader)?)
        } else {
            ReaderKind::Plain(reader)
        };
        Ok(Self { inner })
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.inner, ReaderKind::Zstd(_))
    }
}

impl Read for CompressedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            ReaderKind::Zstd(decoder) => decoder.read(buf),
            ReaderKind::Plain(reader) => reader.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.bin");

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let mut writer = CompressedWriter::create(&path).unwrap();
        writer.write_all(&payload).unwrap();
        writer.finish().unwrap();

        let mut reader = CompressedReader::open(&path).unwrap();
        assert!(reader.is_compressed());
        let mut back = Vec::new();
        reader.read_to_end(&mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_output_starts_with_zstd_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.bin");

        let mut writer = CompressedWriter::create(&path).unwrap();
        writer.write_all(b"hello").unwrap();
        writer.finish().unwrap();

        let raw = fs::read(&path).unwrap();
        assert!(raw.len() >= 4);
        assert_eq!(&raw[..4], &ZSTD_MAGIC);
    }

    #[test]
    fn test_uncompressed_passthrough() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.bin");
        fs::write(&path, b"not a zstd frame at all").unwrap();

        let mut reader = CompressedReader::open(&path).unwrap();
        assert!(!reader.is_compressed());
        let mut back = Vec::new();
        reader.read_to_end(&mut back).unwrap();
        assert_eq!(back, b"not a zstd frame at all");
    }

    #[test]
    fn test_empty_write_still_valid_stream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.bin");

        let writer = CompressedWriter::create(&path).unwrap();
        writer.finish().unwrap();

        let mut reader = CompressedReader::open(&path).unwrap();
        let mut back = Vec::new();
        reader.read_to_end(&mut back).unwrap();
        assert!(back.is_empty());
    }
}
