//! Replayable cached sequence: memoizes the output of an expensive lazy
//! producer to disk, so that later calls replay recorded values instead of
//! recomputing them.
//!
//! Grounded on `original_source/dqp/disk_cache.py` (the `cached_iter`
//! decorator, `tee`/`scan`, the per-path `threading.Lock` registry) and
//! `kvstore.rs`'s lock-then-atomic-commit idiom for the on-disk side.

use std::collections::HashMap;
use std::fmt::Display;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use ring::digest;

use crate::codec;
use crate::prelude::*;

/// Where cache files live and how their fingerprint is sized.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub base_path: PathBuf,
    pub digest_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            base_path: std::env::temp_dir(),
            digest_size: 8,
        }
    }
}

/// Stable short hex digest over the string form of `callable_id` and
/// `args`. Stability depends entirely on the `Display` impls of `args`:
/// values whose string form embeds non-deterministic data (memory
/// addresses) yield an unstable digest -- a known limitation, not papered
/// over here.
pub fn short_digest(callable_id: &str, args: &[&dyn Display], digest_size: usize) -> String {
    let mut input = callable_id.to_string();
    for arg in args {
        input.push('#');
        input.push_str(&arg.to_string());
    }
    let full = digest::digest(&digest::SHA256, input.as_bytes());
    let truncated = &full.as_ref()[..digest_size.min(full.as_ref().len())];
    data_encoding::HEXLOWER.encode(truncated)
}

fn default_key_fn(config: &CacheConfig, callable_id: &str, args: &[&dyn Display]) -> PathBuf {
    let digest = short_digest(callable_id, args, config.digest_size);
    config.base_path.join(format!("dqp_{digest}.msgpacks"))
}

static CACHE_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Canonicalize `path` (falling back to the literal path if it doesn't
/// exist yet -- `canonicalize` requires the target to exist) and return the
/// process-wide mutex guarding that cache path.
fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut registry = CACHE_LOCKS.lock();
    registry
        .entry(canonical)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// A replayed or freshly-produced sequence of cached values. The per-path
/// mutex returned by `lock_for` is held as an owned guard for the whole
/// lifetime of either variant -- readers and tees both occupy the critical
/// section until they are fully consumed or dropped.
pub enum CachedSequence<I> {
    Hit(Hit),
    Miss(Tee<I>),
}

/// A replay of a previously-finalized cache file.
pub struct Hit {
    inner: codec::UnpackIter<BufReader<File>>,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl Iterator for Hit {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.map_err(Into::into))
    }
}

impl<I: Iterator<Item = Value>> Iterator for CachedSequence<I> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            CachedSequence::Hit(hit) => hit.next(),
            CachedSequence::Miss(tee) => tee.next(),
        }
    }
}

/// Forwards `inner`'s values while writing each one to `path`; deletes the
/// partial file if the producer or the write fails before completion.
pub struct Tee<I> {
    inner: I,
    path: PathBuf,
    tmp: Option<tempfile::NamedTempFile>,
    _guard: ArcMutexGuard<RawMutex, ()>,
    failed: bool,
    finished: bool,
}

impl<I: Iterator<Item = Value>> Iterator for Tee<I> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.finished {
            return None;
        }
        match self.inner.next() {
            Some(value) => match self.write_one(&value) {
                Ok(()) => Some(Ok(value)),
                Err(e) => {
                    self.fail();
                    Some(Err(e))
                }
            },
            None => {
                self.finish();
                None
            }
        }
    }
}

impl<I> Tee<I> {
    fn write_one(&mut self, value: &Value) -> Result<()> {
        let packed = codec::pack(value)?;
        let tmp = self
            .tmp
            .as_mut()
            .expect("tmp file only cleared on fail/finish");
        use std::io::Write;
        tmp.write_all(&packed).context("writing cache record")?;
        Ok(())
    }

    fn fail(&mut self) {
        self.failed = true;
        if let Some(tmp) = self.tmp.take() {
            drop(tmp); // NamedTempFile's own Drop removes the underlying file.
        }
        warn!(path = %self.path.display(), "cache producer failed, removing partial file");
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(tmp) = self.tmp.take() {
            if let Err(e) = tmp.persist(&self.path) {
                warn!(error = %e, path = %self.path.display(), "failed to finalize cache file");
            }
        }
    }
}

/// Compute the path `(callable_id, args)` would map to under `config`.
pub fn key_for(config: &CacheConfig, callable_id: &str, args: &[&dyn Display]) -> PathBuf {
    default_key_fn(config, callable_id, args)
}

/// Replay `path` if it exists, otherwise tee `producer()`'s output through
/// to `path` while forwarding it to the caller.
pub fn cached<F, I>(
    config: &CacheConfig,
    callable_id: &str,
    args: &[&dyn Display],
    producer: F,
) -> Result<CachedSequence<I>>
where
    F: FnOnce() -> I,
    I: Iterator<Item = Value>,
{
    let path = key_for(config, callable_id, args);
    let lock = lock_for(&path);
    // An owned guard, not a borrowed one: it travels inside the returned
    // `Hit`/`Tee` so the mutex stays held for the caller's whole iteration,
    // not just for this function's setup.
    let guard = Mutex::lock_arc(&lock);

    if path.exists() {
        trace!(path = %path.display(), "cache hit");
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        Ok(CachedSequence::Hit(Hit {
            inner: codec::stream_unpack(BufReader::new(file)),
            _guard: guard,
        }))
    } else {
        trace!(path = %path.display(), "cache miss, producing");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = tempfile::NamedTempFile::new_in(path.parent().unwrap_or(&config.base_path))
            .context("creating temp cache file")?;
        Ok(CachedSequence::Miss(Tee {
            inner: producer(),
            path,
            tmp: Some(tmp),
            _guard: guard,
            failed: false,
            finished: false,
        }))
    }
}

/// Remove the cache file `(callable_id, args)` would map to. Missing file
/// is not an error.
pub fn clear(config: &CacheConfig, callable_id: &str, args: &[&dyn Display]) -> Result<()> {
    let path = key_for(config, callable_id, args);
    let lock = lock_for(&path);
    let _entered = lock.lock();
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

/// First element of a restartable iterable or an already-advancing
/// iterator, or `None` for an empty/absent input.
pub fn first<I: IntoIterator>(seq: Option<I>) -> Option<I::Item> {
    seq.and_then(|s| s.into_iter().next())
}

/// Consume and count `seq`. Destructive for non-restartable sequences.
pub fn count<I: IntoIterator>(seq: I) -> usize {
    seq.into_iter().count()
}
