use std::cell::RefCell;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use walkdir::WalkDir;

use crate::codec;
use crate::prelude::*;
use crate::queue::{matches_prefix, Cursor};

/// Read-only view over a queue directory. Walks `QueueFile`s in
/// deterministic lexicographic order and yields `(relative_file, index,
/// record)` triples; `last` advances as records are yielded.
///
/// `last` is kept behind an `Rc<RefCell<_>>` rather than a plain field so a
/// `Project` can hold a second handle onto it and read the final position
/// after handing the `Source` itself to a caller (mirrors the Python
/// `Project.open_source` closure over the live `Source` object).
pub struct Source {
    input_path: PathBuf,
    starting_from: Option<Cursor>,
    last: Rc<RefCell<Option<Cursor>>>,
}

impl Source {
    pub fn open(input_path: impl AsRef<Path>, starting_from: Option<Cursor>) -> Result<Source> {
        let input_path = input_path
            .as_ref()
            .to_str()
            .map(|s| s.trim_end_matches('/'))
            .ok_or_else(|| DqpError::InvalidValue("input path is not valid UTF-8".to_string()))?;
        if input_path.is_empty() {
            return Err(DqpError::InvalidValue("input path was empty after stripping trailing /".to_string()).into());
        }
        Ok(Source {
            input_path: PathBuf::from(input_path),
            starting_from,
            last: Rc::new(RefCell::new(None)),
        })
    }

    pub fn last(&self) -> Option<Cursor> {
        self.last.borrow().clone()
    }

    /// A second handle onto the same `last` cell, for a `Project` to read
    /// after the `Source` has been handed to its caller.
    pub(crate) fn shared_last(&self) -> Rc<RefCell<Option<Cursor>>> {
        self.last.clone()
    }

    /// All queue file relative paths, in deterministic lexicographic order:
    /// at each directory level, subdirectories and filenames sort ascending.
    pub fn queue_filenames(&self) -> Result<Vec<PathBuf>> {
        let mut names = Vec::new();
        let walker = WalkDir::new(&self.input_path)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()));
        for entry in walker {
            let entry = entry.with_context(|| {
                format!("walking {}", self.input_path.display())
            })?;
            if entry.file_type().is_file() {
                let relative = entry
                    .path()
                    .strip_prefix(&self.input_path)
                    .expect("walkdir entries are under input_path")
                    .to_path_buf();
                names.push(relative);
            }
        }
        Ok(names)
    }

    /// Decode every record in `relative_file`, updating `self.last` before
    /// each yield. Takes `&self`, not `&mut self`: `last` is an
    /// `Rc<RefCell<_>>`, so advancing it doesn't need an exclusive borrow of
    /// `Source` -- which is what lets `all_dict`/`all_dict_from` chain many
    /// of these across files into a single lazy iterator instead of
    /// collecting each file's records before opening the next.
    pub fn dicts_from<'a>(
        &'a self,
        relative_file: &Path,
    ) -> Result<impl Iterator<Item = Result<(PathBuf, usize, Value)>> + 'a> {
        let abs_path = self.input_path.join(relative_file);
        let file = File::open(&abs_path)
            .with_context(|| format!("opening {}", abs_path.display()))?;
        let reader = BufReader::new(file);
        let relative_file = relative_file.to_path_buf();
        let path_for_errors = abs_path.clone();
        let mut idx = 0usize;
        let last = self.last.clone();
        Ok(
            codec::stream_unpack(reader).map(move |record| match record {
                Ok(value) => {
                    let this_idx = idx;
                    idx += 1;
                    *last.borrow_mut() =
                        Some((relative_file.to_string_lossy().into_owned(), this_idx));
                    Ok((relative_file.clone(), this_idx, value))
                }
                Err(DqpError::Corrupt { reason, .. }) => Err(DqpError::Corrupt {
                    path: path_for_errors.clone(),
                    reason,
                }
                .into()),
                Err(other) => Err(other.into()),
            }),
        )
    }

    /// All records in the queue, ignoring `starting_from`. Lazy: opens each
    /// queue file only as the caller pulls past the previous one, so `last`
    /// advances only as far as the caller has actually consumed. The file
    /// listing itself (`queue_filenames`) is still fetched up front, since
    /// file order and boundaries have to be known before any record is
    /// decoded -- only decoding is deferred.
    pub fn all_dict<'a>(&'a self) -> Result<impl Iterator<Item = Result<(PathBuf, usize, Value)>> + 'a> {
        let filenames = self.queue_filenames()?;
        Ok(filenames.into_iter().flat_map(move |filename| {
            match self.dicts_from(&filename) {
                Ok(iter) => {
                    Box::new(iter) as Box<dyn Iterator<Item = Result<(PathBuf, usize, Value)>> + 'a>
                }
                Err(e) => Box::new(std::iter::once(Err(e))),
            }
        }))
    }

    /// Records from the file whose relative path starts with `file_prefix`
    /// onward, skipping records before `index` in that first file only;
    /// subsequent files are taken in full. No match is not an error -- an
    /// empty result, same as an exhausted `dropwhile`. Lazy for the same
    /// reason as `all_dict`.
    pub fn all_dict_from<'a>(
        &'a self,
        file_prefix: &str,
        index: usize,
    ) -> Result<impl Iterator<Item = Result<(PathBuf, usize, Value)>> + 'a> {
        let filenames = self.queue_filenames()?;
        let file_prefix = file_prefix.to_string();
        let mut reached_first_match = false;
        Ok(filenames.into_iter().flat_map(move |filename| {
            if !reached_first_match {
                if !matches_prefix(&filename.to_string_lossy(), &file_prefix) {
                    return Box::new(std::iter::empty())
                        as Box<dyn Iterator<Item = Result<(PathBuf, usize, Value)>> + 'a>;
                }
                reached_first_match = true;
                match self.dicts_from(&filename) {
                    Ok(iter) => Box::new(iter.filter(move |record| match record {
                        Ok((_, idx, _)) => *idx >= index,
                        Err(_) => true,
                    })) as Box<dyn Iterator<Item = Result<(PathBuf, usize, Value)>> + 'a>,
                    Err(e) => Box::new(std::iter::once(Err(e))),
                }
            } else {
                match self.dicts_from(&filename) {
                    Ok(iter) => Box::new(iter) as Box<dyn Iterator<Item = Result<(PathBuf, usize, Value)>> + 'a>,
                    Err(e) => Box::new(std::iter::once(Err(e))),
                }
            }
        }))
    }

    /// Dispatches on `starting_from`: `all_dict_from` if set, else
    /// `all_dict`. Boxed because the two branches are different concrete
    /// iterator types; still lazy underneath.
    pub fn iter(&self) -> Result<Box<dyn Iterator<Item = Result<(PathBuf, usize, Value)>> + '_>> {
        match self.starting_from.clone() {
            Some((prefix, index)) => Ok(Box::new(self.all_dict_from(&prefix, index)?)),
            None => Ok(Box::new(self.all_dict()?)),
        }
    }

    /// Delete every queue file strictly preceding the first file matching
    /// `file_prefix` (or `self.last`'s file if `file_prefix` is `None`).
    /// Returns the number of files unlinked.
    pub fn unlink_to(&self, file_prefix: Option<&str>) -> Result<usize> {
        let owned;
        let file_prefix = match file_prefix {
            Some(p) => p,
            None => {
                let last = self
                    .last()
                    .ok_or_else(|| DqpError::NotFound("no last position recorded".to_string()))?;
                owned = last.0;
                &owned
            }
        };

        let filenames = self.queue_filenames()?;
        if !filenames
            .iter()
            .any(|f| matches_prefix(&f.to_string_lossy(), file_prefix))
        {
            return Err(DqpError::NotFound(format!(
                "no queue file matches prefix {file_prefix:?}"
            ))
            .into());
        }

        let mut unlinked = 0;
        for filename in filenames {
            if matches_prefix(&filename.to_string_lossy(), file_prefix) {
                break;
            }
            let abs_path = self.input_path.join(&filename);
            std::fs::remove_file(&abs_path)
                .with_context(|| format!("removing {}", abs_path.display()))?;
            unlinked += 1;
        }
        Ok(unlinked)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::queue::Sink;

    fn write_three(dir: &Path) {
        let mut sink = Sink::open(dir).unwrap();
        sink.write(&crate::value::map([("a".to_string(), Value::from(1_i64))]))
            .unwrap();
        sink.write(&crate::value::map([("b".to_string(), Value::from(2_i64))]))
            .unwrap();
        sink.write(&crate::value::map([("c".to_string(), Value::from(3_i64))]))
            .unwrap();
        sink.close().unwrap();
    }

    #[test]
    fn all_dict_yields_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_three(dir.path());

        let source = Source::open(dir.path(), None).unwrap();
        let records: Vec<_> = source.all_dict().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].1, 1);
        assert_eq!(
            records[1].2,
            crate::value::map([("b".to_string(), Value::from(2_i64))])
        );
    }

    #[test]
    fn relative_paths_never_contain_input_path() {
        let dir = tempfile::tempdir().unwrap();
        write_three(dir.path());

        let source = Source::open(dir.path(), None).unwrap();
        for name in source.queue_filenames().unwrap() {
            let name = name.to_string_lossy();
            assert!(!name.starts_with('/'));
            assert!(!name.contains(dir.path().to_str().unwrap()));
        }
    }

    #[test]
    fn unlink_to_removes_preceding_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sink = Sink::open_with_timeout(
                dir.path(),
                std::time::Duration::from_millis(0),
            )
            .unwrap();
            sink.write(&crate::value::map([("a".to_string(), Value::from(1_i64))]))
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(1100));
            sink.write(&crate::value::map([("b".to_string(), Value::from(1_i64))]))
                .unwrap();
            sink.close().unwrap();
        }

        let source = Source::open(dir.path(), None).unwrap();
        let all: Vec<_> = source.all_dict().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(all.len(), 2);
        assert!(source.last().is_some());

        let unlinked = source.unlink_to(None).unwrap();
        assert_eq!(unlinked, 1);

        let source2 = Source::open(dir.path(), None).unwrap();
        let remaining: Vec<_> = source2.all_dict().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn unlink_to_missing_prefix_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        write_three(dir.path());

        let source = Source::open(dir.path(), None).unwrap();
        let err = source.unlink_to(Some("does/not/exist")).unwrap_err();
        assert!(err.downcast_ref::<DqpError>().is_some());
    }
}
