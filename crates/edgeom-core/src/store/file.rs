// JSON-file stores. Every write goes to a temporary file in the same
// directory and is renamed over the target, so a crash never leaves a
// half-written row behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{CertRepository, NetConfigStore};
use crate::error::CoreError;
use crate::model::{CertPool, NetConfig};

#[derive(Debug)]
struct JsonFile {
    path: PathBuf,
    write: Mutex<()>,
}

impl JsonFile {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    fn read<T: DeserializeOwned>(&self, default: impl FnOnce() -> T) -> Result<T, CoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| CoreError::Storage {
                message: format!("{}: {e}", self.path.display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default()),
            Err(e) => Err(CoreError::storage(format!("{}: {e}", self.path.display()))),
        }
    }

    fn write<T: Serialize>(&self, value: &T) -> Result<(), CoreError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let body = serde_json::to_vec_pretty(value).map_err(CoreError::storage)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| CoreError::storage(format!("{}: {}", self.path.display(), e.error)))?;
        Ok(())
    }

    fn modify<T, R>(
        &self,
        default: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> Result<R, CoreError>,
    ) -> Result<R, CoreError>
    where
        T: Serialize + DeserializeOwned,
    {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let mut value = self.read(default)?;
        let out = f(&mut value)?;
        self.write(&value)?;
        Ok(out)
    }
}

/// [`NetConfigStore`] backed by one JSON file.
#[derive(Debug)]
pub struct JsonNetConfigStore {
    file: JsonFile,
}

impl JsonNetConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }
}

impl NetConfigStore for JsonNetConfigStore {
    fn load(&self) -> Result<NetConfig, CoreError> {
        self.file.read(NetConfig::web_defaults)
    }

    fn modify(&self, f: &mut dyn FnMut(&mut NetConfig)) -> Result<NetConfig, CoreError> {
        self.file.modify(NetConfig::web_defaults, |cfg| {
            f(cfg);
            Ok(cfg.clone())
        })
    }
}

/// [`CertRepository`] backed by one JSON file.
#[derive(Debug)]
pub struct JsonCertRepository {
    file: JsonFile,
}

impl JsonCertRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }
}

impl CertRepository for JsonCertRepository {
    fn snapshot(&self) -> Result<CertPool, CoreError> {
        self.file.read(CertPool::default)
    }

    fn transaction(
        &self,
        f: &mut dyn FnMut(&mut CertPool) -> Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        self.file.modify(CertPool::default, |pool| f(pool))
    }
}
