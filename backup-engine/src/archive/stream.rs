//! Forward-only tar writer for non-seekable sinks.
//!
//! Used for the inner upload archives, which are piped through a compressor
//! and therefore cannot have headers patched after the fact. Entry sizes must
//! be known up front.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::header::{encode_header, padding_for, EntryType, MemberAttributes, BLOCK_SIZE};

pub struct TarStreamWriter<W> {
    inner: W,
    entries: u64,
}

impl<W: AsyncWrite + Unpin> TarStreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, entries: 0 }
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Append `size` bytes read from `reader`.
    ///
    /// If the reader ends early the entry is zero-filled to its declared size
    /// so the stream stays well-formed, and `UnexpectedEof` is returned.
    /// A name or size that does not fit a ustar header yields `InvalidInput`
    /// before anything is written.
    pub async fn append<R>(
        &mut self,
        name: &str,
        attrs: &MemberAttributes,
        size: u64,
        reader: &mut R,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let header = encode_header(name, size, attrs, EntryType::Regular)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        self.inner.write_all(&header).await?;

        let mut limited = reader.take(size);
        let copied = tokio::io::copy(&mut limited, &mut self.inner).await?;
        let short = size - copied;
        write_zeros(&mut self.inner, short + padding_for(size)).await?;
        self.entries += 1;

        if short > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank by {} bytes while archiving", name, short),
            ));
        }
        Ok(())
    }

    /// Write the end-of-archive marker, flush, and hand back the sink.
    pub async fn finish(mut self) -> io::Result<W> {
        write_zeros(&mut self.inner, 2 * BLOCK_SIZE).await?;
        self.inner.flush().await?;
        Ok(self.inner)
    }
}

async fn write_zeros<W: AsyncWrite + Unpin>(out: &mut W, mut len: u64) -> io::Result<()> {
    const ZEROS: [u8; 1024] = [0u8; 1024];
    while len > 0 {
        let chunk = len.min(ZEROS.len() as u64) as usize;
        out.write_all(&ZEROS[..chunk]).await?;
        len -= chunk as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::header::parse_octal;
    use super::*;

    fn attrs() -> MemberAttributes {
        MemberAttributes {
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            uname: "app".into(),
            gname: "app".into(),
            mtime: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_entries_are_block_aligned() {
        let mut tar = TarStreamWriter::new(Vec::new());
        tar.append("a.txt", &attrs(), 5, &mut &b"hello"[..])
            .await
            .unwrap();
        tar.append("b/c.txt", &attrs(), 3, &mut &b"abc"[..])
            .await
            .unwrap();
        assert_eq!(tar.entries(), 2);

        let bytes = tar.finish().await.unwrap();
        assert_eq!(bytes.len(), 4 * 512 + 2 * 512);
        assert_eq!(&bytes[0..5], b"a.txt");
        assert_eq!(parse_octal(&bytes[124..136]), 5);
        assert_eq!(&bytes[512..517], b"hello");
        assert_eq!(&bytes[1024..1031], b"b/c.txt");
        assert!(bytes[2048..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_short_reader_keeps_stream_valid() {
        let mut tar = TarStreamWriter::new(Vec::new());
        let err = tar
            .append("gone.png", &attrs(), 10, &mut &b"abc"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        tar.append("next.png", &attrs(), 1, &mut &b"z"[..])
            .await
            .unwrap();
        let bytes = tar.finish().await.unwrap();

        assert_eq!(&bytes[512..515], b"abc");
        assert!(bytes[515..522].iter().all(|&b| b == 0));
        assert_eq!(&bytes[1024..1032], b"next.png");
    }

    #[tokio::test]
    async fn test_unencodable_name_writes_nothing() {
        let mut tar = TarStreamWriter::new(Vec::new());
        let long_name = format!("{}.png", "a".repeat(120));
        let err = tar
            .append(&long_name, &attrs(), 3, &mut &b"abc"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(tar.entries(), 0);

        tar.append("ok.png", &attrs(), 2, &mut &b"ok"[..])
            .await
            .unwrap();
        let bytes = tar.finish().await.unwrap();
        assert_eq!(bytes.len(), 2 * 512 + 2 * 512);
        assert_eq!(&bytes[0..6], b"ok.png");
    }
}
