//! Seekable tar container for the final backup archive.
//!
//! Members are streamed straight into the file. Their header is written as a
//! zeroed block first and patched once the body length is known, so member
//! bodies never have to be buffered or staged on disk.
//!
//! A placeholder reserves space for a member whose content is only known
//! later (the metadata document). Filling it writes into the reserved region;
//! unused blocks are covered with a pax global header so the archive stays
//! readable by standard tar tools.

pub mod header;
pub mod stream;

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub use header::MemberAttributes;
use header::{encode_header, padded_size, padding_for, EntryType, BLOCK_SIZE};
pub use stream::TarStreamWriter;

use crate::utils::{EngineError, Result};

const FILLER_NAME: &str = "pax_global_header";
const FILLER_KEY: &str = "comment=";

/// Handle to a reserved, not yet written member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderId(usize);

#[derive(Debug)]
struct Placeholder {
    name: String,
    attrs: MemberAttributes,
    header_offset: u64,
    capacity: u64,
    filled: bool,
}

pub struct ArchiveWriter {
    path: PathBuf,
    file: File,
    /// End of the last complete member
    position: u64,
    open_member: Option<String>,
    placeholders: Vec<Placeholder>,
    members: Vec<(u64, String)>,
}

impl ArchiveWriter {
    pub async fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).await?;
        debug!("Created archive {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            file,
            position: 0,
            open_member: None,
            placeholders: Vec::new(),
            members: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of completed members in archive order.
    pub fn members(&self) -> Vec<String> {
        let mut members = self.members.clone();
        members.sort_by_key(|(offset, _)| *offset);
        members.into_iter().map(|(_, name)| name).collect()
    }

    fn ensure_idle(&self) -> Result<()> {
        match &self.open_member {
            Some(name) => Err(EngineError::Archive(format!(
                "member '{}' is still open",
                name
            ))),
            None => Ok(()),
        }
    }

    /// Start a member whose length is unknown until its body is complete.
    pub async fn begin_member(
        &mut self,
        name: &str,
        attrs: &MemberAttributes,
    ) -> Result<MemberBody<'_>> {
        self.ensure_idle()?;
        // Reject bad names before anything touches the file.
        encode_header(name, 0, attrs, EntryType::Regular)?;

        let header_offset = self.position;
        self.file.seek(SeekFrom::Start(header_offset)).await?;
        write_zeros(&mut self.file, BLOCK_SIZE).await?;
        self.open_member = Some(name.to_string());

        Ok(MemberBody {
            writer: self,
            name: name.to_string(),
            attrs: attrs.clone(),
            kind: BodyKind::Streamed { header_offset },
            written: 0,
        })
    }

    /// Reserve room for a member written later with [`fill_placeholder`].
    ///
    /// [`fill_placeholder`]: ArchiveWriter::fill_placeholder
    pub async fn add_file_placeholder(
        &mut self,
        name: &str,
        attrs: &MemberAttributes,
        estimated_size: u64,
    ) -> Result<PlaceholderId> {
        self.ensure_idle()?;
        encode_header(name, estimated_size, attrs, EntryType::Regular)?;

        let header_offset = self.position;
        let capacity = padded_size(estimated_size);
        self.file.seek(SeekFrom::Start(header_offset)).await?;
        write_zeros(&mut self.file, BLOCK_SIZE + capacity).await?;
        self.position = header_offset + BLOCK_SIZE + capacity;

        self.placeholders.push(Placeholder {
            name: name.to_string(),
            attrs: attrs.clone(),
            header_offset,
            capacity,
            filled: false,
        });
        debug!(
            "Reserved {} bytes for '{}' at offset {}",
            capacity, name, header_offset
        );

        Ok(PlaceholderId(self.placeholders.len() - 1))
    }

    pub async fn fill_placeholder(&mut self, id: PlaceholderId) -> Result<MemberBody<'_>> {
        self.ensure_idle()?;
        let placeholder = self
            .placeholders
            .get(id.0)
            .ok_or_else(|| EngineError::Archive("unknown placeholder".into()))?;
        if placeholder.filled {
            return Err(EngineError::Archive(format!(
                "placeholder '{}' was already filled",
                placeholder.name
            )));
        }

        let name = placeholder.name.clone();
        let attrs = placeholder.attrs.clone();
        let header_offset = placeholder.header_offset;
        let capacity = placeholder.capacity;

        self.file
            .seek(SeekFrom::Start(header_offset + BLOCK_SIZE))
            .await?;
        self.open_member = Some(name.clone());

        Ok(MemberBody {
            writer: self,
            name,
            attrs,
            kind: BodyKind::Placeholder {
                index: id.0,
                header_offset,
                capacity,
            },
            written: 0,
        })
    }

    /// Write the end-of-archive marker and flush to disk.
    pub async fn close(mut self) -> Result<PathBuf> {
        self.ensure_idle()?;
        if let Some(pending) = self.placeholders.iter().find(|p| !p.filled) {
            return Err(EngineError::Archive(format!(
                "placeholder '{}' was never filled",
                pending.name
            )));
        }

        self.file.seek(SeekFrom::Start(self.position)).await?;
        write_zeros(&mut self.file, 2 * BLOCK_SIZE).await?;
        self.file.flush().await?;
        self.file.sync_all().await?;

        debug!(
            "Closed archive {} with {} members",
            self.path.display(),
            self.members.len()
        );
        Ok(self.path)
    }

    /// Cover `len` bytes at `offset` with a pax global header whose body is a
    /// single padding record.
    async fn write_filler(&mut self, offset: u64, len: u64) -> Result<()> {
        debug_assert!(len >= BLOCK_SIZE && len % BLOCK_SIZE == 0);
        let body_len = len - BLOCK_SIZE;
        let attrs = MemberAttributes {
            mode: 0o644,
            ..MemberAttributes::current_process()
        };
        let header = encode_header(FILLER_NAME, body_len, &attrs, EntryType::GlobalExtended)?;

        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(&header).await?;
        if body_len > 0 {
            self.file.write_all(&filler_record(body_len)).await?;
        }
        Ok(())
    }
}

/// A pax record of exactly `len` bytes: `"<len> comment=<padding>\n"`.
fn filler_record(len: u64) -> Vec<u8> {
    let digits = len.to_string().len() as u64;
    let padding = len - digits - 1 - FILLER_KEY.len() as u64 - 1;

    let mut record = Vec::with_capacity(len as usize);
    record.extend_from_slice(len.to_string().as_bytes());
    record.push(b' ');
    record.extend_from_slice(FILLER_KEY.as_bytes());
    record.resize(record.len() + padding as usize, b' ');
    record.push(b'\n');
    record
}

async fn write_zeros(file: &mut File, mut len: u64) -> io::Result<()> {
    const ZEROS: [u8; 8192] = [0u8; 8192];
    while len > 0 {
        let chunk = len.min(ZEROS.len() as u64) as usize;
        file.write_all(&ZEROS[..chunk]).await?;
        len -= chunk as u64;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum BodyKind {
    Streamed {
        header_offset: u64,
    },
    Placeholder {
        index: usize,
        header_offset: u64,
        capacity: u64,
    },
}

/// Body of an open member. Must end with [`finish`] or [`discard`]; a body
/// dropped without either leaves the writer refusing further members.
///
/// [`finish`]: MemberBody::finish
/// [`discard`]: MemberBody::discard
pub struct MemberBody<'a> {
    writer: &'a mut ArchiveWriter,
    name: String,
    attrs: MemberAttributes,
    kind: BodyKind,
    written: u64,
}

impl MemberBody<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Pad the body and write its real header. Returns the body length.
    pub async fn finish(self) -> Result<u64> {
        let MemberBody {
            writer,
            name,
            attrs,
            kind,
            written,
        } = self;

        write_zeros(&mut writer.file, padding_for(written)).await?;
        let header = encode_header(&name, written, &attrs, EntryType::Regular)?;

        let header_offset = match kind {
            BodyKind::Streamed { header_offset } => {
                writer.position = header_offset + BLOCK_SIZE + padded_size(written);
                header_offset
            }
            BodyKind::Placeholder {
                index,
                header_offset,
                capacity,
            } => {
                let leftover = capacity - padded_size(written);
                if leftover > 0 {
                    let filler_offset = header_offset + BLOCK_SIZE + padded_size(written);
                    writer.write_filler(filler_offset, leftover).await?;
                }
                writer.placeholders[index].filled = true;
                header_offset
            }
        };

        writer.file.seek(SeekFrom::Start(header_offset)).await?;
        writer.file.write_all(&header).await?;
        writer.file.flush().await?;

        writer.members.push((header_offset, name.clone()));
        writer.open_member = None;
        debug!("Finished member '{}' ({} bytes)", name, written);
        Ok(written)
    }

    /// Drop the member. A streamed member is cut from the file; a placeholder
    /// becomes filler.
    pub async fn discard(self) -> Result<()> {
        let MemberBody {
            writer, name, kind, ..
        } = self;

        match kind {
            BodyKind::Streamed { header_offset } => {
                writer.file.flush().await?;
                writer.file.set_len(header_offset).await?;
                writer.file.seek(SeekFrom::Start(header_offset)).await?;
                writer.position = header_offset;
            }
            BodyKind::Placeholder {
                index,
                header_offset,
                capacity,
            } => {
                writer
                    .write_filler(header_offset, BLOCK_SIZE + capacity)
                    .await?;
                writer.file.flush().await?;
                writer.placeholders[index].filled = true;
            }
        }

        writer.open_member = None;
        debug!("Discarded member '{}'", name);
        Ok(())
    }
}

impl AsyncWrite for MemberBody<'_> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let BodyKind::Placeholder { capacity, .. } = this.kind {
            if this.written + buf.len() as u64 > capacity {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "'{}' exceeds its reserved {} bytes",
                        this.name, capacity
                    ),
                )));
            }
        }

        match Pin::new(&mut this.writer.file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer.file).poll_flush(cx)
    }

    // The archive outlives its members; shutting down a body only flushes.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer.file).poll_flush(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::header::parse_octal;
    use super::*;
    use tempfile::TempDir;

    fn attrs() -> MemberAttributes {
        MemberAttributes {
            mode: 0o644,
            uid: 0,
            gid: 0,
            uname: "root".into(),
            gname: "root".into(),
            mtime: 1_700_000_000,
        }
    }

    struct Entry {
        name: String,
        kind: u8,
        body: Vec<u8>,
    }

    fn read_entries(bytes: &[u8]) -> Vec<Entry> {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset + 512 <= bytes.len() {
            let header = &bytes[offset..offset + 512];
            if header.iter().all(|&b| b == 0) {
                break;
            }
            let name: String = header[..100]
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| b as char)
                .collect();
            let size = parse_octal(&header[124..136]) as usize;
            let body = bytes[offset + 512..offset + 512 + size].to_vec();
            entries.push(Entry {
                name,
                kind: header[156],
                body,
            });
            offset += 512 + padded_size(size as u64) as usize;
        }
        entries
    }

    async fn write_member(writer: &mut ArchiveWriter, name: &str, body: &[u8]) -> u64 {
        let mut member = writer.begin_member(name, &attrs()).await.unwrap();
        member.write_all(body).await.unwrap();
        member.finish().await.unwrap()
    }

    #[tokio::test]
    async fn test_streamed_members_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("site.tar");

        let mut writer = ArchiveWriter::create(&path).await.unwrap();
        assert_eq!(write_member(&mut writer, "dump.sql.zst", b"dump bytes").await, 10);
        write_member(&mut writer, "uploads.tar.zst", &vec![7u8; 1500]).await;
        let closed = writer.close().await.unwrap();
        assert_eq!(closed, path);

        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(bytes.len() % 512, 0);
        let entries = read_entries(&bytes);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "dump.sql.zst");
        assert_eq!(entries[0].body, b"dump bytes");
        assert_eq!(entries[1].body.len(), 1500);
    }

    #[tokio::test]
    async fn test_placeholder_filled_after_later_members() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("site.tar");

        let mut writer = ArchiveWriter::create(&path).await.unwrap();
        let meta = writer
            .add_file_placeholder("meta.json", &attrs(), 2000)
            .await
            .unwrap();
        write_member(&mut writer, "dump.sql.zst", b"dump").await;

        let mut body = writer.fill_placeholder(meta).await.unwrap();
        body.write_all(br#"{"version":1}"#).await.unwrap();
        body.finish().await.unwrap();

        assert_eq!(writer.members(), vec!["meta.json", "dump.sql.zst"]);
        writer.close().await.unwrap();

        let entries = read_entries(&tokio::fs::read(&path).await.unwrap());
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["meta.json", FILLER_NAME, "dump.sql.zst"]);
        assert_eq!(entries[0].body, br#"{"version":1}"#);
        assert_eq!(entries[1].kind, b'g');
        let record = String::from_utf8(entries[1].body.clone()).unwrap();
        assert!(record.starts_with(&format!("{} comment=", record.len())));
        assert!(record.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_placeholder_exact_fit_needs_no_filler() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("site.tar");

        let mut writer = ArchiveWriter::create(&path).await.unwrap();
        let id = writer
            .add_file_placeholder("meta.json", &attrs(), 512)
            .await
            .unwrap();
        let mut body = writer.fill_placeholder(id).await.unwrap();
        body.write_all(&[b'x'; 512]).await.unwrap();
        body.finish().await.unwrap();
        writer.close().await.unwrap();

        let entries = read_entries(&tokio::fs::read(&path).await.unwrap());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].body.len(), 512);
    }

    #[tokio::test]
    async fn test_placeholder_overflow_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut writer = ArchiveWriter::create(&dir.path().join("a.tar")).await.unwrap();
        let id = writer
            .add_file_placeholder("meta.json", &attrs(), 10)
            .await
            .unwrap();

        let mut body = writer.fill_placeholder(id).await.unwrap();
        let err = body.write_all(&[0u8; 600]).await.unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[tokio::test]
    async fn test_discarded_member_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("site.tar");

        let mut writer = ArchiveWriter::create(&path).await.unwrap();
        write_member(&mut writer, "dump.sql.zst", b"dump").await;

        let mut partial = writer.begin_member("uploads.tar.zst", &attrs()).await.unwrap();
        partial.write_all(&[1u8; 4096]).await.unwrap();
        partial.discard().await.unwrap();

        write_member(&mut writer, "meta.json", b"{}").await;
        writer.close().await.unwrap();

        let entries = read_entries(&tokio::fs::read(&path).await.unwrap());
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["dump.sql.zst", "meta.json"]);
    }

    #[tokio::test]
    async fn test_unfinished_member_blocks_writer() {
        let dir = TempDir::new().unwrap();
        let mut writer = ArchiveWriter::create(&dir.path().join("a.tar")).await.unwrap();

        let body = writer.begin_member("dump.sql.zst", &attrs()).await.unwrap();
        drop(body);

        assert!(writer.begin_member("other", &attrs()).await.is_err());
        assert!(writer.close().await.is_err());
    }

    #[tokio::test]
    async fn test_close_rejects_unfilled_placeholder() {
        let dir = TempDir::new().unwrap();
        let mut writer = ArchiveWriter::create(&dir.path().join("a.tar")).await.unwrap();
        writer
            .add_file_placeholder("meta.json", &attrs(), 100)
            .await
            .unwrap();

        let err = writer.close().await.unwrap_err();
        assert!(err.to_string().contains("never filled"));
    }

    #[test]
    fn test_filler_record_has_exact_length() {
        for len in [512u64, 1024, 9728, 1_048_576] {
            let record = filler_record(len);
            assert_eq!(record.len() as u64, len);
            assert!(record.starts_with(format!("{} comment=", len).as_bytes()));
        }
    }
}
