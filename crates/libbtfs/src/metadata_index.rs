use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::file_info::FileEntry;

pub const ROOT: &str = "/";

/// Path <-> file and directory <-> children maps of a torrent.
///
/// Built in one pass once metadata is known and never mutated afterwards; a
/// metadata update builds a fresh index.
#[derive(Debug)]
pub struct MetadataIndex {
    files: Vec<FileEntry>,
    by_path: HashMap<String, usize>,
    dirs: BTreeMap<String, BTreeSet<String>>,
    piece_length: u32,
    has_metadata: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    Dir(&'a BTreeSet<String>),
    File(&'a FileEntry),
}

impl Default for MetadataIndex {
    fn default() -> Self {
        Self::empty()
    }
}

impl MetadataIndex {
    /// What a mount looks like before metadata arrives: just the root.
    pub fn empty() -> Self {
        Self {
            files: Vec::new(),
            by_path: HashMap::new(),
            dirs: BTreeMap::from([(ROOT.to_owned(), BTreeSet::new())]),
            piece_length: 0,
            has_metadata: false,
        }
    }

    pub fn build(files: Vec<FileEntry>, piece_length: u32) -> Self {
        let mut index = Self::empty();
        index.piece_length = piece_length;
        index.has_metadata = true;

        for (pos, file) in files.iter().enumerate() {
            let mut parent = String::new();
            let mut components = file.components().peekable();
            if components.peek().is_none() {
                warn!(index = file.index, path = %file.path, "skipping file with empty path");
                continue;
            }
            for c in components {
                let key = if parent.is_empty() { ROOT } else { &parent };
                index
                    .dirs
                    .entry(key.to_owned())
                    .or_default()
                    .insert(c.to_owned());
                parent.push('/');
                parent.push_str(c);
            }
            if index.by_path.insert(parent.clone(), pos).is_some() {
                warn!(path = %parent, "duplicate path in torrent, the last one wins");
            }
        }

        // A file path that's also a prefix of another file can't be both.
        index.by_path.retain(|path, _| {
            let is_dir = index.dirs.contains_key(path);
            if is_dir {
                warn!(%path, "path is both a file and a directory, treating as directory");
            }
            !is_dir
        });

        debug!(
            files = index.by_path.len(),
            dirs = index.dirs.len(),
            "built metadata index"
        );
        index.files = files;
        index
    }

    pub fn has_metadata(&self) -> bool {
        self.has_metadata
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn lookup(&self, path: &str) -> Option<Lookup<'_>> {
        if let Some(children) = self.dirs.get(path) {
            return Some(Lookup::Dir(children));
        }
        self.by_path
            .get(path)
            .and_then(|pos| self.files.get(*pos))
            .map(Lookup::File)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains_key(path)
    }

    pub fn file(&self, path: &str) -> Option<&FileEntry> {
        match self.lookup(path)? {
            Lookup::File(f) => Some(f),
            Lookup::Dir(..) => None,
        }
    }

    pub fn children(&self, dir: &str) -> Option<&BTreeSet<String>> {
        self.dirs.get(dir)
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }
}

/// Join a directory path and a child name.
pub fn child_path(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: usize, path: &str, len: u64) -> FileEntry {
        FileEntry {
            index,
            path: path.to_owned(),
            len,
            offset_in_torrent: 0,
            piece_range: 0..1,
        }
    }

    fn names(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(|s| s.as_str()).collect()
    }

    #[test]
    fn test_every_ancestor_is_a_directory() {
        let idx = MetadataIndex::build(vec![entry(0, "a/b/c", 10)], 16);
        assert_eq!(names(idx.children("/").unwrap()), vec!["a"]);
        assert_eq!(names(idx.children("/a").unwrap()), vec!["b"]);
        assert_eq!(names(idx.children("/a/b").unwrap()), vec!["c"]);
        assert!(idx.children("/a/b/c").is_none());
        assert_eq!(idx.file("/a/b/c").unwrap().len, 10);
    }

    #[test]
    fn test_siblings_and_empty_segments() {
        let idx = MetadataIndex::build(
            vec![
                entry(0, "t//x.mkv", 1),
                entry(1, "t/sub/y.srt", 2),
                entry(2, "t/z.nfo/", 3),
            ],
            16,
        );
        assert_eq!(names(idx.children("/t").unwrap()), vec!["sub", "x.mkv", "z.nfo"]);
        assert_eq!(idx.file("/t/x.mkv").unwrap().index, 0);
        assert_eq!(idx.file("/t/z.nfo").unwrap().index, 2);
        assert!(matches!(idx.lookup("/t/sub"), Some(Lookup::Dir(..))));
        assert!(idx.lookup("/nope").is_none());
    }

    #[test]
    fn test_empty_index_has_root() {
        let idx = MetadataIndex::empty();
        assert!(!idx.has_metadata());
        assert!(idx.is_dir(ROOT));
        assert!(idx.children(ROOT).unwrap().is_empty());
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let files = vec![entry(0, "a/b", 1), entry(1, "c", 2)];
        let first = MetadataIndex::build(files.clone(), 16);
        let second = MetadataIndex::build(files, 16);
        assert_eq!(first.dirs, second.dirs);
        assert_eq!(first.by_path, second.by_path);
        assert_eq!(second.total_length(), 3);
    }

    #[test]
    fn test_file_shadowed_by_directory() {
        let idx = MetadataIndex::build(vec![entry(0, "a", 1), entry(1, "a/b", 1)], 16);
        assert!(idx.is_dir("/a"));
        assert!(idx.file("/a").is_none());
        assert!(idx.file("/a/b").is_some());
    }

    #[test]
    fn test_child_path() {
        assert_eq!(child_path("/", "a"), "/a");
        assert_eq!(child_path("/a", "b"), "/a/b");
    }
}
