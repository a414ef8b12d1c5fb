use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Key-value medium the disk index is saved to between runs, addressed by a namespace tag.
pub trait PersistenceMedium: Send + Sync {
    fn write(&self, tag: &str, bytes: &[u8]) -> io::Result<()>;

    /// `Ok(None)` when nothing was ever saved under `tag`.
    fn read(&self, tag: &str) -> io::Result<Option<Vec<u8>>>;

    fn remove(&self, tag: &str) -> io::Result<bool>;
}

/// Stores each tag as `<directory>/<tag>.index`.
#[derive(Debug, Clone)]
pub struct DirectoryMedium {
    directory: PathBuf,
}

impl DirectoryMedium {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        DirectoryMedium {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, tag: &str) -> io::Result<PathBuf> {
        let valid = !tag.is_empty()
            && tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            && tag != "."
            && tag != "..";
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid persistence tag {tag:?}"),
            ));
        }
        Ok(self.directory.join(format!("{tag}.index")))
    }
}

impl PersistenceMedium for DirectoryMedium {
    fn write(&self, tag: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.path_for(tag)?;
        fs::create_dir_all(&self.directory)?;

        // Readers never see a half-written index.
        let temp = path.with_extension("index.tmp");
        fs::write(&temp, bytes)?;
        fs::rename(&temp, &path)
    }

    fn read(&self, tag: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(tag)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn remove(&self, tag: &str) -> io::Result<bool> {
        match fs::remove_file(self.path_for(tag)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Process-local medium, for embedding into another store or for tests.
#[derive(Debug, Default)]
pub struct MemoryMedium {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceMedium for MemoryMedium {
    fn write(&self, tag: &str, bytes: &[u8]) -> io::Result<()> {
        self.data.lock().insert(tag.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, tag: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.data.lock().get(tag).cloned())
    }

    fn remove(&self, tag: &str) -> io::Result<bool> {
        Ok(self.data.lock().remove(tag).is_some())
    }
}
