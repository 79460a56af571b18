use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ring::digest;

use crate::codec;
use crate::prelude::*;
use crate::queue::HASH_SEPARATOR;

pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Single-writer append sink. Produces time-named files under `base_path`,
/// rotating after `head_timeout` and finalizing each file with a running
/// content hash on close.
pub struct Sink {
    base_path: PathBuf,
    head_timeout: Duration,
    output_file: File,
    output_path: PathBuf,
    output_index: usize,
    hasher: digest::Context,
    last_open_time: DateTime<Utc>,
    finalized: bool,
}

fn now_path(base_path: &std::path::Path, now: DateTime<Utc>) -> PathBuf {
    base_path.join(now.format("%Y/%m/%d/%H%M%S").to_string())
}

impl Sink {
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Sink> {
        Self::open_with_timeout(base_path, DEFAULT_HEAD_TIMEOUT)
    }

    pub fn open_with_timeout(
        base_path: impl Into<PathBuf>,
        head_timeout: Duration,
    ) -> Result<Sink> {
        let base_path = base_path.into();
        let now = Utc::now();
        let (output_file, output_path) = Self::open_file_at(&base_path, now)?;
        Ok(Sink {
            base_path,
            head_timeout,
            output_file,
            output_path,
            output_index: 0,
            hasher: digest::Context::new(&digest::SHA256),
            last_open_time: now,
            finalized: false,
        })
    }

    fn open_file_at(base_path: &std::path::Path, now: DateTime<Utc>) -> Result<(File, PathBuf)> {
        let path = now_path(base_path, now);
        if path.exists() {
            return Err(DqpError::StateError(format!(
                "{} already exists: a same-second reopen is not supported, drive rotation with monotonic time",
                path.display()
            ))
            .into());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        Ok((file, path))
    }

    /// Pack and append `record`, flushing before returning. Rotates the
    /// live file if `head_timeout` has elapsed since it was opened.
    pub fn write(&mut self, record: &Value) -> Result<()> {
        let packed = codec::pack(record)?;
        self.output_file
            .write_all(&packed)
            .with_context(|| format!("writing to {}", self.output_path.display()))?;
        self.output_file
            .flush()
            .with_context(|| format!("flushing {}", self.output_path.display()))?;
        self.output_index += 1;
        self.hasher.update(&packed);

        let elapsed = Utc::now().signed_duration_since(self.last_open_time);
        if elapsed.to_std().unwrap_or_default() >= self.head_timeout {
            self.rotate()?;
        }
        Ok(())
    }

    /// Finalize (or delete) the live file, then open a fresh one.
    pub fn rotate(&mut self) -> Result<()> {
        self.finalize_current()?;
        let now = Utc::now();
        let (file, path) = Self::open_file_at(&self.base_path, now)?;
        self.output_file = file;
        self.output_path = path;
        self.output_index = 0;
        self.hasher = digest::Context::new(&digest::SHA256);
        self.last_open_time = now;
        Ok(())
    }

    fn finalize_current(&mut self) -> Result<()> {
        self.output_file
            .sync_all()
            .with_context(|| format!("syncing {}", self.output_path.display()))?;
        if self.output_index > 0 {
            let hash = digest::Context::clone(&self.hasher).finish();
            let hex = data_encoding::HEXLOWER.encode(hash.as_ref());
            let finalized = PathBuf::from(format!(
                "{}{}{}",
                self.output_path.display(),
                HASH_SEPARATOR,
                hex
            ));
            fs::rename(&self.output_path, &finalized).with_context(|| {
                format!(
                    "finalizing {} -> {}",
                    self.output_path.display(),
                    finalized.display()
                )
            })?;
            debug!(path = %finalized.display(), records = self.output_index, "finalized queue file");
        } else {
            fs::remove_file(&self.output_path)
                .with_context(|| format!("removing empty {}", self.output_path.display()))?;
        }
        Ok(())
    }

    /// Finalize (or delete) the live file. Consumes `self` so a sink cannot
    /// be written to after close.
    pub fn close(mut self) -> Result<()> {
        self.finalize_current()?;
        self.finalized = true;
        Ok(())
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        if !self.finalized {
            if let Err(e) = self.finalize_current() {
                warn!(error = %e, "failed to finalize queue file on drop");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_then_close_finalizes_with_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = Sink::open(dir.path()).unwrap();
        sink.write(&Value::from(1_i64)).unwrap();
        sink.close().unwrap();

        let files: Vec<_> = walkdir::WalkDir::new(dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().to_str().unwrap();
        assert!(name.contains('_'));
    }

    #[test]
    fn close_with_no_writes_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Sink::open(dir.path()).unwrap();
        sink.close().unwrap();

        let files: Vec<_> = walkdir::WalkDir::new(dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .collect();
        assert_eq!(files.len(), 0);
    }

    #[test]
    fn rotation_finalizes_current_and_opens_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = Sink::open_with_timeout(dir.path(), Duration::from_millis(0)).unwrap();
        sink.write(&Value::from(1_i64)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        sink.write(&Value::from(2_i64)).unwrap();
        sink.close().unwrap();

        let files: Vec<_> = walkdir::WalkDir::new(dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .collect();
        assert!(files.len() >= 2);
    }
}
