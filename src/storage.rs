use std::io::{Error, ErrorKind};
use std::path::{Component, Path, PathBuf};

use crate::eid::Eid;

/// Slash separated file tree rooted at `base_dir`. Writes land in a
/// temp file next to the target and are renamed into place.
#[derive(Clone, Debug)]
pub struct LocalFiles {
    pub base_dir: PathBuf,
}

impl LocalFiles {
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(LocalFiles { base_dir })
    }

    /// Resolve an ident to a path, rejecting anything that would escape the root.
    pub fn path(&self, ident: &str) -> std::io::Result<PathBuf> {
        let relative = Path::new(ident.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if ident.trim().is_empty() || escapes {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("invalid storage path: {ident:?}"),
            ));
        }
        Ok(self.base_dir.join(relative))
    }

    pub fn exists(&self, ident: &str) -> bool {
        self.path(ident).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path(ident)?)
    }

    pub fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let path = self.path(ident)?;
        let temp_path = self.temp_sibling(&path)?;

        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &path).inspect_err(|_| {
            let _ = std::fs::remove_file(&temp_path);
        })
    }

    /// Copy an outside file into the tree.
    pub fn copy_in(&self, source: &Path, ident: &str) -> std::io::Result<u64> {
        let path = self.path(ident)?;
        let temp_path = self.temp_sibling(&path)?;

        let copied = std::fs::copy(source, &temp_path).inspect_err(|_| {
            let _ = std::fs::remove_file(&temp_path);
        })?;
        std::fs::rename(&temp_path, &path).inspect_err(|_| {
            let _ = std::fs::remove_file(&temp_path);
        })?;
        Ok(copied)
    }

    /// Copy a file of the tree to an outside path.
    pub fn copy_out(&self, ident: &str, dest: &Path) -> std::io::Result<u64> {
        let path = self.path(ident)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(path, dest)
    }

    pub fn delete(&self, ident: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.path(ident)?)
    }

    /// All file idents starting with `prefix`, sorted.
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.trim_start_matches('/');
        // only walk the deepest directory the prefix names
        let start = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start_dir = if start.is_empty() {
            self.base_dir.clone()
        } else {
            match self.path(start) {
                Ok(dir) => dir,
                Err(_) => return vec![],
            }
        };

        let mut found = vec![];
        self.walk(&start_dir, &mut found);
        found.retain(|ident| ident.starts_with(prefix));
        found.sort();
        found
    }

    fn walk(&self, dir: &Path, found: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };

        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(".tmp-"))
                .unwrap_or(true);

            if path.is_dir() {
                self.walk(&path, found);
            } else if !is_temp {
                if let Ok(relative) = path.strip_prefix(&self.base_dir) {
                    let ident = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    found.push(ident);
                }
            }
        }
    }

    fn temp_sibling(&self, path: &Path) -> std::io::Result<PathBuf> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "path has no parent"))?;
        std::fs::create_dir_all(parent)?;
        Ok(parent.join(format!(".tmp-{}", Eid::new())))
    }
}
