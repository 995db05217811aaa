//! Local infrastructure state cache

use rigger_core::error::{RiggerError, RiggerResult};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub trait StateCache: Send + Sync {
    /// Filesystem path the entry lives at. Runners use it as their state file.
    fn path(&self, name: &str) -> PathBuf;

    fn in_cache(&self, name: &str) -> RiggerResult<bool>;

    fn load(&self, name: &str) -> RiggerResult<Vec<u8>>;

    fn save(&self, name: &str, data: &[u8]) -> RiggerResult<()>;

    fn delete(&self, name: &str) -> RiggerResult<()>;

    /// Call `f` for every entry name.
    fn iterate(&self, f: &mut dyn FnMut(&str, &[u8]) -> RiggerResult<()>) -> RiggerResult<()>;
}

/// Cache backed by one directory, one file per entry
#[derive(Debug, Clone)]
pub struct FileStateCache {
    dir: PathBuf,
}

impl FileStateCache {
    pub fn new(dir: impl Into<PathBuf>) -> RiggerResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl StateCache for FileStateCache {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn in_cache(&self, name: &str) -> RiggerResult<bool> {
        Ok(self.path(name).is_file())
    }

    fn load(&self, name: &str) -> RiggerResult<Vec<u8>> {
        fs::read(self.path(name)).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                RiggerError::not_found(format!("cache entry {}", name))
            } else {
                e.into()
            }
        })
    }

    fn save(&self, name: &str, data: &[u8]) -> RiggerResult<()> {
        fs::write(self.path(name), data)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> RiggerResult<()> {
        match fs::remove_file(self.path(name)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn iterate(&self, f: &mut dyn FnMut(&str, &[u8]) -> RiggerResult<()>) -> RiggerResult<()> {
        let mut names: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();

        for name in names {
            let data = self.load(&name)?;
            f(&name, &data)?;
        }
        Ok(())
    }
}

/// Cache that stores nothing. Used when state comes from the cluster.
#[derive(Debug, Clone)]
pub struct DummyCache {
    dir: PathBuf,
}

impl DummyCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Default for DummyCache {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl StateCache for DummyCache {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn in_cache(&self, _name: &str) -> RiggerResult<bool> {
        Ok(false)
    }

    fn load(&self, name: &str) -> RiggerResult<Vec<u8>> {
        Err(RiggerError::not_found(format!("cache entry {}", name)))
    }

    fn save(&self, _name: &str, _data: &[u8]) -> RiggerResult<()> {
        Ok(())
    }

    fn delete(&self, _name: &str) -> RiggerResult<()> {
        Ok(())
    }

    fn iterate(&self, _f: &mut dyn FnMut(&str, &[u8]) -> RiggerResult<()>) -> RiggerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileStateCache::new(dir.path().join("cache")).unwrap();

        assert!(!cache.in_cache("base-infrastructure.tfstate").unwrap());
        cache.save("base-infrastructure.tfstate", b"{}").unwrap();
        cache.save("a.tfstate", b"[]").unwrap();
        assert!(cache.in_cache("base-infrastructure.tfstate").unwrap());
        assert_eq!(cache.load("base-infrastructure.tfstate").unwrap(), b"{}");

        let mut seen = Vec::new();
        cache
            .iterate(&mut |name, _| {
                seen.push(name.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec!["a.tfstate", "base-infrastructure.tfstate"]);

        cache.delete("a.tfstate").unwrap();
        cache.delete("a.tfstate").unwrap();
        assert!(matches!(
            cache.load("a.tfstate"),
            Err(RiggerError::NotFound { .. })
        ));
    }

    #[test]
    fn test_dummy_cache_is_empty() {
        let cache = DummyCache::default();
        cache.save("x", b"1").unwrap();
        assert!(!cache.in_cache("x").unwrap());
        assert!(cache.load("x").is_err());
    }
}
