use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use bytes::Bytes;

use super::{MetadataError, MetadataStore};

/// Discovery store backed by a directory, typically on a shared filesystem.
/// Each key maps to one file; writes go through a temp file and a rename so
/// readers never observe a torn document.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let root = root.as_ref().to_path_buf();
        if root.as_os_str().is_empty() {
            return Err(MetadataError::Unavailable(
                "file store path is empty".to_string(),
            ));
        }
        fs::create_dir_all(&root).map_err(|error| {
            MetadataError::Unavailable(format!("create {}: {error}", root.display()))
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, MetadataError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(MetadataError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn unavailable(path: &Path, error: io::Error) -> MetadataError {
    MetadataError::Unavailable(format!("{}: {error}", path.display()))
}

impl MetadataStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Bytes>, MetadataError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(unavailable(&path, error)),
        }
    }

    fn set(&self, key: &str, value: Bytes) -> Result<(), MetadataError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| unavailable(parent, error))?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".tmp.{}", std::process::id()));
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, &value).map_err(|error| unavailable(&tmp, error))?;
        fs::rename(&tmp, &path).map_err(|error| unavailable(&path, error))
    }

    fn remove(&self, key: &str) -> Result<(), MetadataError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(unavailable(&path, error)),
        }
    }
}
