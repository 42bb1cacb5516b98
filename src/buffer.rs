use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

/// Re-openable container for an immutable message body.
///
/// `open` may be called any number of times and every reader is independent.
/// A buffer received as an argument is only valid for the duration of the
/// call; a callee that needs the body later must copy it into storage it
/// owns ("rebuffering").
pub trait BodyBuffer: Send + Sync {
    /// A fresh reader positioned at the start of the body.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    fn len(&self) -> io::Result<u64>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Release backing storage. Idempotent; called once by the creator.
    fn remove(&self) -> io::Result<()>;
}

/// Read a body into memory in one go.
pub fn read_to_vec(buffer: &dyn BodyBuffer) -> io::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(buffer.len()? as usize);
    buffer.open()?.read_to_end(&mut data)?;
    Ok(data)
}

/// Body held in memory, cheap to clone.
#[derive(Debug, Clone)]
pub struct MemoryBuffer {
    data: Arc<[u8]>,
}

impl MemoryBuffer {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into().into(),
        }
    }
}

impl BodyBuffer for MemoryBuffer {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(io::Cursor::new(self.data.clone())))
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn remove(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Body backed by a file owned by the buffer's creator.
#[derive(Debug, Clone)]
pub struct FileBuffer {
    path: PathBuf,
}

impl FileBuffer {
    /// Wrap an existing file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Write `data` to `path` and wrap the result.
    pub fn create(path: impl Into<PathBuf>, data: &[u8]) -> io::Result<Self> {
        let path = path.into();
        fs::write(&path, data)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl BodyBuffer for FileBuffer {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(&self.path)?))
    }

    fn len(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_readers_are_independent() {
        let buffer = MemoryBuffer::new(b"hello world".to_vec());
        let mut first = String::new();
        let mut second = String::new();
        buffer.open().unwrap().read_to_string(&mut first).unwrap();
        buffer.open().unwrap().read_to_string(&mut second).unwrap();
        assert_eq!(first, "hello world");
        assert_eq!(first, second);
        assert_eq!(buffer.len().unwrap(), 11);
    }

    #[test]
    fn file_buffer_roundtrip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body");
        let buffer = FileBuffer::create(&path, b"message body").unwrap();

        assert_eq!(read_to_vec(&buffer).unwrap(), b"message body");
        assert_eq!(buffer.len().unwrap(), 12);

        buffer.remove().unwrap();
        assert!(buffer.open().is_err());
        // second remove is a no-op
        buffer.remove().unwrap();
    }
}
