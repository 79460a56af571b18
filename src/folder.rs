//! A directory bound to a mutable string->string map persisted as a single
//! packed record in a well-known filename within the directory.
//!
//! Grounded on `original_source/dqp/storage.py::Folder`: open lazily, flush
//! only on close, and only if the vars actually changed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::prelude::*;

pub const VARS_FILENAME: &str = "vars.msgpack";

pub type VarsMap = BTreeMap<String, String>;

/// A directory-scoped vars map, opened on construction and flushed on
/// `close` iff its contents changed (or the file already existed).
pub struct Folder {
    path: PathBuf,
    vars: VarsMap,
    read_bytes: Option<Vec<u8>>,
}

impl Folder {
    /// Ensure `path` exists and read `vars.msgpack` if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Folder> {
        let path = path.into();
        fs::create_dir_all(&path)
            .with_context(|| format!("creating folder {}", path.display()))?;

        let vars_path = path.join(VARS_FILENAME);
        let (vars, read_bytes) = match fs::read(&vars_path) {
            Ok(bytes) => {
                let vars: VarsMap = rmp_serde::from_slice(&bytes)
                    .with_context(|| format!("decoding {}", vars_path.display()))?;
                (vars, Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (VarsMap::new(), None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", vars_path.display())),
        };

        Ok(Folder {
            path,
            vars,
            read_bytes,
        })
    }

    /// Join `sub` onto this folder's path. Purely lexical, no I/O.
    pub fn child(&self, sub: impl AsRef<Path>) -> PathBuf {
        self.path.join(sub)
    }

    /// Ensure the child directory exists and return it.
    pub fn create_path(&self, sub: impl AsRef<Path>) -> Result<PathBuf> {
        let full = self.child(sub);
        fs::create_dir_all(&full)
            .with_context(|| format!("creating {}", full.display()))?;
        Ok(full)
    }

    pub fn vars(&self) -> &VarsMap {
        &self.vars
    }

    pub fn vars_mut(&mut self) -> &mut VarsMap {
        &mut self.vars
    }

    /// Flush vars to disk iff they changed, then drop this handle. A Folder
    /// whose vars were never touched and whose file didn't previously exist
    /// leaves no file behind.
    pub fn close(self) -> Result<()> {
        let vars_path = self.path.join(VARS_FILENAME);
        if self.vars.is_empty() && self.read_bytes.is_none() {
            return Ok(());
        }
        let packed =
            rmp_serde::to_vec_named(&self.vars).context("packing vars map")?;
        if self.read_bytes.as_deref() == Some(packed.as_slice()) {
            trace!(path = %vars_path.display(), "vars unchanged, not rewriting");
            return Ok(());
        }
        fs::write(&vars_path, &packed)
            .with_context(|| format!("writing {}", vars_path.display()))?;
        Ok(())
    }
}
