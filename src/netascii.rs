//! NETASCII line-ending transcoding.
//!
//! On the wire a newline is CR LF and a bare carriage return is CR NUL.
//! The decoded-side newline is the crate-wide [`NL`] constant (LF), not the
//! host's line separator, so both ends agree regardless of platform.

use super::backend::{Reader, Writer};
use super::error::Error;
use async_trait::async_trait;
use bytes::Bytes;

pub const CR: u8 = 0x0d;
pub const LF: u8 = 0x0a;
pub const NUL: u8 = 0x00;

/// The decoded newline byte.
pub const NL: u8 = LF;

pub fn to_netascii(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);

    for &ch in data {
        match ch {
            NL => {
                out.push(CR);
                out.push(LF);
            }
            CR => {
                out.push(CR);
                out.push(NUL);
            }
            _ => out.push(ch),
        }
    }

    out
}

pub fn from_netascii(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());

    let mut i = 0;
    while i < data.len() {
        let ch = data[i];
        if ch == CR && i + 1 < data.len() {
            match data[i + 1] {
                LF => {
                    out.push(NL);
                    i += 2;
                    continue;
                }
                NUL => {
                    out.push(CR);
                    i += 2;
                    continue;
                }
                // unpaired CR, pass through
                _ => {}
            }
        }
        out.push(ch);
        i += 1;
    }

    out
}

/// Encodes an underlying reader's bytes into netascii, keeping the exact
/// `read(n)` contract by buffering the expansion overflow.
pub struct NetasciiReader<R> {
    inner: R,
    buffer: Vec<u8>,
}

impl<R> NetasciiReader<R> {
    pub fn new(inner: R) -> NetasciiReader<R> {
        NetasciiReader {
            inner,
            buffer: Vec::new(),
        }
    }
}

#[async_trait]
impl<R: Reader> Reader for NetasciiReader<R> {
    async fn read(&mut self, n: usize) -> Result<Bytes, Error> {
        if self.buffer.len() < n {
            let need = n - self.buffer.len();
            let data = self.inner.read(need).await?;
            self.buffer.extend_from_slice(&to_netascii(&data));
        }

        let take = n.min(self.buffer.len());
        let out: Vec<u8> = self.buffer.drain(..take).collect();
        Ok(Bytes::from(out))
    }

    async fn finish(&mut self) {
        self.inner.finish().await
    }
}

/// Decodes netascii into an underlying writer, carrying a pending CR so a
/// CR LF or CR NUL pair split across blocks is still rejoined.
pub struct NetasciiWriter<W> {
    inner: W,
    carry_cr: bool,
}

impl<W> NetasciiWriter<W> {
    pub fn new(inner: W) -> NetasciiWriter<W> {
        NetasciiWriter {
            inner,
            carry_cr: false,
        }
    }
}

#[async_trait]
impl<W: Writer> Writer for NetasciiWriter<W> {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut chunk = Vec::with_capacity(data.len() + 1);
        if self.carry_cr {
            chunk.push(CR);
        }
        chunk.extend_from_slice(data);

        self.carry_cr = chunk.last() == Some(&CR);
        if self.carry_cr {
            chunk.pop();
        }

        self.inner.write(&from_netascii(&chunk)).await
    }

    async fn finish(&mut self) -> Result<(), Error> {
        if self.carry_cr {
            self.carry_cr = false;
            self.inner.write(&[CR]).await?;
        }
        self.inner.finish().await
    }

    async fn cancel(&mut self) {
        self.inner.cancel().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemReader {
        data: Vec<u8>,
        pos: usize,
        eof: bool,
    }

    impl MemReader {
        fn new(data: &[u8]) -> MemReader {
            MemReader {
                data: data.to_vec(),
                pos: 0,
                eof: false,
            }
        }
    }

    #[async_trait]
    impl Reader for MemReader {
        async fn read(&mut self, n: usize) -> Result<Bytes, Error> {
            if self.eof {
                return Ok(Bytes::new());
            }
            let end = (self.pos + n).min(self.data.len());
            let out = Bytes::copy_from_slice(&self.data[self.pos..end]);
            self.pos = end;
            if out.len() < n {
                self.eof = true;
            }
            Ok(out)
        }

        async fn finish(&mut self) {
            self.eof = true;
        }
    }

    #[derive(Default)]
    struct MemWriter {
        data: Vec<u8>,
        finished: bool,
    }

    #[async_trait]
    impl Writer for MemWriter {
        async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
            self.data.extend_from_slice(data);
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), Error> {
            self.finished = true;
            Ok(())
        }

        async fn cancel(&mut self) {
            self.data.clear();
        }
    }

    #[test]
    fn encodes_newlines_and_carriage_returns() {
        assert_eq!(b"a\r\nb\r\x00c".to_vec(), to_netascii(b"a\nb\rc"));
    }

    #[test]
    fn decodes_pairs_and_keeps_lone_cr() {
        assert_eq!(b"a\nb\rc".to_vec(), from_netascii(b"a\r\nb\r\x00c"));
        assert_eq!(b"a\rb".to_vec(), from_netascii(b"a\rb"));
    }

    #[test]
    fn roundtrip() {
        let cases: &[&[u8]] = &[
            b"",
            b"plain text",
            b"line one\nline two\n",
            b"ends with cr\r",
            b"\r\r\n\n\r",
            b"\x00binary\x01\xff",
        ];
        for case in cases {
            assert_eq!(case.to_vec(), from_netascii(&to_netascii(case)));
        }
    }

    #[tokio::test]
    async fn reader_buffers_expansion_overflow() -> Result<(), Error> {
        let mut reader = NetasciiReader::new(MemReader::new(b"a\nb"));

        let first = reader.read(2).await?;
        assert_eq!(&b"a\r"[..], first.as_ref());

        let second = reader.read(2).await?;
        assert_eq!(&b"\nb"[..], second.as_ref());

        // EOF is only reported once the buffered tail drains
        assert!(reader.read(2).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn writer_rejoins_pair_split_across_blocks() -> Result<(), Error> {
        let mut writer = NetasciiWriter::new(MemWriter::default());
        writer.write(b"line\r").await?;
        writer.write(b"\nnext\r").await?;
        writer.write(b"\x00end").await?;
        writer.finish().await?;

        assert_eq!(b"line\nnext\rend".to_vec(), writer.inner.data);
        assert!(writer.inner.finished);
        Ok(())
    }

    #[tokio::test]
    async fn writer_flushes_trailing_cr_on_finish() -> Result<(), Error> {
        let mut writer = NetasciiWriter::new(MemWriter::default());
        writer.write(b"tail\r").await?;
        writer.finish().await?;

        assert_eq!(b"tail\r".to_vec(), writer.inner.data);
        Ok(())
    }

    #[tokio::test]
    async fn full_stream_roundtrip() -> Result<(), Error> {
        let original = b"first\nsecond\rthird\n";

        let mut reader = NetasciiReader::new(MemReader::new(original));
        let mut writer = NetasciiWriter::new(MemWriter::default());

        loop {
            let block = reader.read(8).await?;
            writer.write(&block).await?;
            if block.len() < 8 {
                break;
            }
        }
        writer.finish().await?;

        assert_eq!(original.to_vec(), writer.inner.data);
        Ok(())
    }
}
