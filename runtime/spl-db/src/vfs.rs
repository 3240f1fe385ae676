//! Mount table mapping the engine's virtual paths onto host directories.

use crate::error::{Error, Result};
use crate::value::Value;
use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use tracing::debug;

const ROOT_MOUNT: &str = "root";
const MEMORY: &str = ":memory:";

/// A buffer materialized as a file when mounted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MountFile {
    pub name: String,
    pub data: Bytes,
}

impl MountFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn into_value(self) -> Value {
        Value::map([("name", Value::Text(self.name)), ("data", Value::Blob(self.data))])
    }

    pub(crate) fn from_value(value: &Value) -> Result<Self> {
        let entries = value
            .as_map()
            .ok_or_else(|| Error::invalid_argument("fs.mount", 2, "a list of { name, data }"))?;
        let name = entries
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_argument("fs.mount", 2, "a file name"))?;
        let data = match entries.get("data") {
            Some(Value::Blob(bytes)) => bytes.clone(),
            Some(Value::Text(text)) => Bytes::from(text.clone().into_bytes()),
            _ => return Err(Error::invalid_argument("fs.mount", 2, "file data")),
        };
        Ok(Self::new(name, data))
    }
}

#[derive(Debug)]
struct Mount {
    host: PathBuf,
    /// Directory created for materialized buffers, removed on unmount.
    owned: bool,
}

pub struct Vfs {
    root: PathBuf,
    cwd: Vec<String>,
    mounts: IndexMap<String, Mount>,
    _scratch: Option<TempDir>,
}

impl Vfs {
    /// Uses `root` when given, otherwise a temporary directory that lives as
    /// long as the table.
    pub fn new(root: Option<PathBuf>) -> Result<Self> {
        let (root, scratch) = match root {
            Some(root) => {
                fs::create_dir_all(&root)?;
                (root, None)
            }
            None => {
                let dir = tempfile::Builder::new().prefix("spl-").tempdir()?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };
        Ok(Self {
            root,
            cwd: Vec::new(),
            mounts: IndexMap::new(),
            _scratch: scratch,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cwd(&self) -> String {
        format!("/{}", self.cwd.join("/"))
    }

    fn components(&self, path: &str) -> Result<Vec<String>> {
        let mut parts = if path.starts_with('/') {
            Vec::new()
        } else {
            self.cwd.clone()
        };
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => return Err(Error::Protocol(format!("Invalid path '{path}'"))),
                part => parts.push(part.to_string()),
            }
        }
        Ok(parts)
    }

    /// Host location of a virtual path; the longest matching mountpoint wins.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let parts = self.components(path)?;
        let mut best: Option<(usize, &Mount)> = None;
        for (key, mount) in &self.mounts {
            let depth = key.split('/').count();
            if is_under(&parts, key) && best.is_none_or(|(current, _)| depth > current) {
                best = Some((depth, mount));
            }
        }
        let (base, rest) = match best {
            Some((depth, mount)) => (mount.host.clone(), &parts[depth..]),
            None => (self.root.clone(), &parts[..]),
        };
        Ok(rest.iter().fold(base, |path, part| path.join(part)))
    }

    /// Path handed to the engine: `:memory:` passes through, everything else
    /// resolves through the mount table.
    pub fn engine_path(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() || path == MEMORY {
            return Ok(PathBuf::from(MEMORY));
        }
        self.resolve(path)
    }

    /// A uniquely named file under the root, deleted when dropped.
    pub fn scratch_file(&self) -> Result<NamedTempFile> {
        Ok(tempfile::Builder::new()
            .prefix(".spl-")
            .suffix(".db")
            .tempfile_in(&self.root)?)
    }

    /// Mounts a host directory, or the given buffers as files, at
    /// `mountpoint`. `root`, `.`, `/` and the empty string mount at `/root`
    /// and make it the working directory.
    pub fn mount(&mut self, path: &str, mountpoint: &str, files: Vec<MountFile>) -> Result<()> {
        let to_root = matches!(mountpoint, "" | "." | "/" | ROOT_MOUNT);
        let key = if to_root {
            ROOT_MOUNT.to_string()
        } else {
            let parts = self.components(mountpoint)?;
            if parts.is_empty() {
                return Err(Error::Protocol(format!("Invalid mountpoint '{mountpoint}'")));
            }
            parts.join("/")
        };
        if self.mounts.contains_key(&key) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Mountpoint '/{key}' already in use"),
            )
            .into());
        }
        let mount = if files.is_empty() {
            let host = PathBuf::from(path);
            if !fs::metadata(&host)?.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::NotADirectory,
                    format!("Not a directory: '{path}'"),
                )
                .into());
            }
            Mount { host, owned: false }
        } else {
            let host = self.root.join(format!(".mount-{}", key.replace('/', "-")));
            fs::create_dir_all(&host)?;
            for file in files {
                if file.name.is_empty() || file.name.contains('/') || file.name == ".." {
                    return Err(Error::Protocol(format!("Invalid file name '{}'", file.name)));
                }
                fs::write(host.join(&file.name), &file.data)?;
            }
            Mount { host, owned: true }
        };
        debug!(mountpoint = %key, host = %mount.host.display(), "mounted");
        self.mounts.insert(key.clone(), mount);
        if to_root {
            self.cwd = vec![key];
        }
        Ok(())
    }

    pub fn unmount(&mut self, mountpoint: &str) -> Result<()> {
        let key = self.components(mountpoint)?.join("/");
        let mount = self.mounts.shift_remove(&key).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("Mountpoint not found: '{mountpoint}'"),
            )
        })?;
        if is_under(&self.cwd, &key) {
            self.cwd.clear();
        }
        if mount.owned {
            fs::remove_dir_all(&mount.host)?;
        }
        debug!(mountpoint = %key, "unmounted");
        Ok(())
    }

    pub fn file(&self, path: &str) -> Result<Bytes> {
        Ok(Bytes::from(fs::read(self.resolve(path)?)?))
    }

    /// Entry names, sorted; mountpoints directly below the directory are
    /// listed too.
    pub fn dir(&self, path: &str) -> Result<Vec<String>> {
        let parts = self.components(path)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(self.resolve(path)?)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name != "." && name != ".." && !name.starts_with(".spl-") && !name.starts_with(".mount-") {
                names.push(name);
            }
        }
        for key in self.mounts.keys() {
            let segments: Vec<&str> = key.split('/').collect();
            if segments.len() == parts.len() + 1 && is_under(&parts, &segments[..parts.len()].join("/")) {
                names.push(segments[parts.len()].to_string());
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve(path)?)?;
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir(self.resolve(path)?)?;
        Ok(())
    }
}

/// `parts` starts with every segment of `key`.
fn is_under(parts: &[String], key: &str) -> bool {
    if key.is_empty() {
        return true;
    }
    let segments: Vec<&str> = key.split('/').collect();
    parts.len() >= segments.len()
        && segments
            .iter()
            .zip(parts)
            .all(|(segment, part)| *segment == part.as_str())
}
