//! Composition root tying a root `Folder` to the `queue/<name>` and
//! `state/<name>` storage conventions.
//!
//! Grounded on `original_source/dqp/queue.py::Project`: a root folder, a
//! list of best-effort closeables run in registration order, and a
//! checkpoint convention of `{prefix}{name}_last_filename` /
//! `{prefix}{name}_last_idx` vars.
//!
//! One deliberate departure from the Python original: `state_folder`'s
//! `Folder` is owned outright by the caller rather than shared with a
//! closeable captured here, since `Folder::close` consumes `self` and Rust
//! has no equivalent of reaching back into a live Python object through a
//! bound method. The caller closes it directly; `Project::close` only
//! replays queue checkpoints into the root folder.

use crate::folder::Folder;
use crate::prelude::*;
use crate::queue::{Cursor, Sink, Source};

/// Manages a base folder's `queue/` and `state/` conventions, and runs
/// best-effort checkpoint persistence on close.
pub struct Project {
    storage_folder: Folder,
    vars_prefix: String,
    closeables: Vec<Box<dyn FnOnce(&mut Folder) -> Result<()>>>,
}

impl Project {
    pub fn open(base_path: impl Into<std::path::PathBuf>, vars_prefix: &str) -> Result<Project> {
        let storage_folder = Folder::open(base_path)?;
        let vars_prefix = if vars_prefix.is_empty() {
            String::new()
        } else {
            format!("{vars_prefix}_")
        };
        Ok(Project {
            storage_folder,
            vars_prefix,
            closeables: Vec::new(),
        })
    }

    /// Open (or create) a sink at `queue/<name>`.
    pub fn open_sink(&mut self, name: &str) -> Result<Sink> {
        let path = self.storage_folder.create_path(format!("queue/{name}"))?;
        Sink::open(path)
    }

    /// Open a source at `queue/<name>`, registering a closeable that
    /// persists the reached checkpoint (if any records were read) when the
    /// project closes.
    pub fn open_source(&mut self, name: &str, starting_from: Option<Cursor>) -> Result<Source> {
        let path = self.storage_folder.child(format!("queue/{name}"));
        if !path.is_dir() {
            return Err(DqpError::NotFound(format!(
                "queue {name:?} has no directory at {}",
                path.display()
            ))
            .into());
        }
        let source = Source::open(path, starting_from)?;
        let last = source.shared_last();
        let filename_key = format!("{}{name}_last_filename", self.vars_prefix);
        let idx_key = format!("{}{name}_last_idx", self.vars_prefix);

        self.closeables.push(Box::new(move |root: &mut Folder| {
            if let Some((filename, idx)) = last.borrow().clone() {
                root.vars_mut().insert(filename_key, filename);
                root.vars_mut().insert(idx_key, idx.to_string());
            }
            Ok(())
        }));

        Ok(source)
    }

    /// Resume `name` from its last recorded checkpoint, or from the start if
    /// none is recorded.
    pub fn continue_source(&mut self, name: &str) -> Result<Source> {
        let filename_key = format!("{}{name}_last_filename", self.vars_prefix);
        let idx_key = format!("{}{name}_last_idx", self.vars_prefix);

        let starting_from = match self.storage_folder.vars().get(&filename_key) {
            Some(filename) => {
                let idx: usize = self
                    .storage_folder
                    .vars()
                    .get(&idx_key)
                    .ok_or_else(|| {
                        DqpError::StateError(format!("{idx_key} missing alongside {filename_key}"))
                    })?
                    .parse()
                    .with_context(|| format!("parsing {idx_key}"))?;
                Some((filename.clone(), idx + 1))
            }
            None => None,
        };
        self.open_source(name, starting_from)
    }

    /// Child `Folder` at `state/<name>`. The caller owns it and is
    /// responsible for calling `close` on it when done.
    pub fn state_folder(&mut self, name: &str) -> Result<Folder> {
        let path = self.storage_folder.create_path(format!("state/{name}"))?;
        Folder::open(path)
    }

    /// Run every registered checkpoint closeable in registration order
    /// against the root folder, then close it. Best-effort: every closeable
    /// runs regardless of earlier failures; the first error encountered is
    /// returned once all have run.
    pub fn close(mut self) -> Result<()> {
        let mut first_err = None;
        for closeable in self.closeables.drain(..) {
            if let Err(e) = closeable(&mut self.storage_folder) {
                warn!(error = %e, "project closeable failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        self.storage_folder.close()?;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
