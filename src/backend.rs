use super::error::Error;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Source of the bytes a read session sends.
#[async_trait]
pub trait Reader: Send {
    /// Returns up to `n` bytes. A result shorter than `n` signals end of
    /// file; every later call returns an empty buffer.
    async fn read(&mut self, n: usize) -> Result<Bytes, Error>;

    /// Releases the resource.
    async fn finish(&mut self);
}

/// Sink for the bytes a write session receives. Implementations stage
/// writes and materialize the result only on [`finish`](Writer::finish).
#[async_trait]
pub trait Writer: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Commits the staged bytes.
    async fn finish(&mut self) -> Result<(), Error>;

    /// Discards the staged bytes; no partial result is left behind.
    async fn cancel(&mut self);
}

#[async_trait]
impl<R: Reader + ?Sized> Reader for Box<R> {
    async fn read(&mut self, n: usize) -> Result<Bytes, Error> {
        (**self).read(n).await
    }

    async fn finish(&mut self) {
        (**self).finish().await
    }
}

#[async_trait]
impl<W: Writer + ?Sized> Writer for Box<W> {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        (**self).write(data).await
    }

    async fn finish(&mut self) -> Result<(), Error> {
        (**self).finish().await
    }

    async fn cancel(&mut self) {
        (**self).cancel().await
    }
}

/// Hands out readers and writers for named resources.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_reader(&self, filename: &str) -> Result<Box<dyn Reader>, Error>;

    async fn get_writer(&self, filename: &str) -> Result<Box<dyn Writer>, Error>;
}

/// Serves a directory subtree.
#[derive(Debug)]
pub struct FilesystemBackend {
    root: PathBuf,
    can_read: bool,
    can_write: bool,
}

impl FilesystemBackend {
    pub fn new(root: &Path) -> Result<FilesystemBackend, Error> {
        Ok(FilesystemBackend {
            root: root.canonicalize()?,
            can_read: true,
            can_write: true,
        })
    }

    pub fn with_permissions(mut self, can_read: bool, can_write: bool) -> FilesystemBackend {
        self.can_read = can_read;
        self.can_write = can_write;
        self
    }

    fn resolve(&self, filename: &str) -> Result<PathBuf, Error> {
        let relative = Path::new(filename.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::AccessViolation);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Backend for FilesystemBackend {
    async fn get_reader(&self, filename: &str) -> Result<Box<dyn Reader>, Error> {
        if !self.can_read {
            return Err(Error::Unsupported("Reading not supported".to_string()));
        }

        let path = self.resolve(filename)?;
        let reader = FilesystemReader::open(&path).await?;
        Ok(Box::new(reader))
    }

    async fn get_writer(&self, filename: &str) -> Result<Box<dyn Writer>, Error> {
        if !self.can_write {
            return Err(Error::Unsupported("Writing not supported".to_string()));
        }

        let path = self.resolve(filename)?;
        let writer = FilesystemWriter::create(&path).await?;
        Ok(Box::new(writer))
    }
}

pub struct FilesystemReader {
    file: Option<File>,
    eof: bool,
}

impl FilesystemReader {
    pub async fn open(path: &Path) -> Result<FilesystemReader, Error> {
        let file = match OpenOptions::new().read(true).open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::FileNotFound),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(Error::AccessViolation)
            }
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(FilesystemReader {
            file: Some(file),
            eof: false,
        })
    }
}

#[async_trait]
impl Reader for FilesystemReader {
    async fn read(&mut self, n: usize) -> Result<Bytes, Error> {
        if self.eof {
            return Ok(Bytes::new());
        }

        let file = match self.file.as_mut() {
            Some(file) => file,
            _ => return Ok(Bytes::new()),
        };

        // File::read may return short before the end; the session takes a
        // short block as EOF, so keep filling until the buffer is full or
        // the file truly ends.
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let count = file.read(&mut buf[filled..]).await?;
            if count == 0 {
                break;
            }
            filled += count;
        }

        if filled < n {
            self.eof = true;
            self.file = None;
        }

        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn finish(&mut self) {
        self.file = None;
        self.eof = true;
    }
}

/// Stages into a `.part` sibling and renames into place on `finish`.
pub struct FilesystemWriter {
    destination: PathBuf,
    staging: PathBuf,
    file: Option<File>,
}

impl FilesystemWriter {
    pub async fn create(path: &Path) -> Result<FilesystemWriter, Error> {
        if fs::metadata(path).await.is_ok() {
            return Err(Error::FileExists);
        }

        let staging = staging_path(path);
        let file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::FileNotFound),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(Error::AccessViolation)
            }
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(FilesystemWriter {
            destination: path.to_path_buf(),
            staging,
            file: Some(file),
        })
    }
}

#[async_trait]
impl Writer for FilesystemWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        match self.file.as_mut() {
            Some(file) => Ok(file.write_all(data).await?),
            _ => Err(Error::Backend("write after finalization".to_string())),
        }
    }

    async fn finish(&mut self) -> Result<(), Error> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            drop(file);
            fs::rename(&self.staging, &self.destination).await?;
        }
        Ok(())
    }

    async fn cancel(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.staging).await;
        }
    }
}

impl Drop for FilesystemWriter {
    fn drop(&mut self) {
        // a session task aborted mid-transfer never reaches cancel()
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.staging);
        }
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn reader_signals_eof_consistently() -> Result<(), Error> {
        let dir = fixture();
        std::fs::write(dir.path().join("blob"), b"hello world").unwrap();

        let backend = FilesystemBackend::new(dir.path())?;
        let mut reader = backend.get_reader("blob").await?;

        assert_eq!(&b"hello"[..], reader.read(5).await?.as_ref());
        assert_eq!(&b" world"[..], reader.read(512).await?.as_ref());
        assert!(reader.read(512).await?.is_empty());
        assert!(reader.read(512).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_file_not_found() {
        let dir = fixture();
        let backend = FilesystemBackend::new(dir.path()).unwrap();
        let ret = backend.get_reader("nope").await;
        assert!(matches!(ret, Err(Error::FileNotFound)));
    }

    #[tokio::test]
    async fn traversal_is_access_violation() {
        let dir = fixture();
        let backend = FilesystemBackend::new(dir.path()).unwrap();
        let ret = backend.get_reader("../etc/passwd").await;
        assert!(matches!(ret, Err(Error::AccessViolation)));
    }

    #[tokio::test]
    async fn leading_slash_is_stripped() -> Result<(), Error> {
        let dir = fixture();
        std::fs::write(dir.path().join("blob"), b"x").unwrap();

        let backend = FilesystemBackend::new(dir.path())?;
        assert!(backend.get_reader("/blob").await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn permission_toggles_map_to_unsupported() {
        let dir = fixture();
        let backend = FilesystemBackend::new(dir.path())
            .unwrap()
            .with_permissions(false, false);

        assert!(matches!(
            backend.get_reader("x").await,
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            backend.get_writer("x").await,
            Err(Error::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn writer_stages_until_finish() -> Result<(), Error> {
        let dir = fixture();
        let backend = FilesystemBackend::new(dir.path())?;
        let destination = dir.path().join("upload");

        let mut writer = backend.get_writer("upload").await?;
        writer.write(b"part one, ").await?;
        writer.write(b"part two").await?;
        assert!(!destination.exists());

        writer.finish().await?;
        assert_eq!(
            b"part one, part two".to_vec(),
            std::fs::read(&destination).unwrap()
        );
        assert!(!staging_path(&destination).exists());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_writer_leaves_nothing() -> Result<(), Error> {
        let dir = fixture();
        let backend = FilesystemBackend::new(dir.path())?;

        let mut writer = backend.get_writer("upload").await?;
        writer.write(b"half a file").await?;
        writer.cancel().await;

        assert!(!dir.path().join("upload").exists());
        assert!(!staging_path(&dir.path().join("upload")).exists());
        Ok(())
    }

    #[tokio::test]
    async fn existing_target_is_file_exists() {
        let dir = fixture();
        std::fs::write(dir.path().join("taken"), b"x").unwrap();

        let backend = FilesystemBackend::new(dir.path()).unwrap();
        let ret = backend.get_writer("taken").await;
        assert!(matches!(ret, Err(Error::FileExists)));
    }

    #[tokio::test]
    async fn finish_twice_is_harmless() -> Result<(), Error> {
        let dir = fixture();
        let backend = FilesystemBackend::new(dir.path())?;

        let mut writer = backend.get_writer("upload").await?;
        writer.write(b"done").await?;
        writer.finish().await?;
        writer.finish().await?;

        assert_eq!(b"done".to_vec(), std::fs::read(dir.path().join("upload")).unwrap());
        Ok(())
    }
}
