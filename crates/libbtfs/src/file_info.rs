use itertools::Itertools;

/// One regular file of the torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// The engine's index of this file.
    pub index: usize,
    /// Slash-separated, relative to the mount root.
    pub path: String,
    pub len: u64,
    pub offset_in_torrent: u64,
    pub piece_range: std::ops::Range<u32>,
}

impl FileEntry {
    /// Non-empty path components.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|c| !c.is_empty())
    }

    /// Absolute mount path, e.g. "/dir/file.mkv".
    pub fn mount_path(&self) -> String {
        format!("/{}", self.components().join("/"))
    }

    pub fn piece_range_usize(&self) -> std::ops::Range<usize> {
        self.piece_range.start as usize..self.piece_range.end as usize
    }
}

#[cfg(test)]
mod tests {
    use super::FileEntry;

    #[test]
    fn test_mount_path_skips_empty_components() {
        let f = FileEntry {
            index: 0,
            path: "a//b/c/".into(),
            len: 1,
            offset_in_torrent: 0,
            piece_range: 0..1,
        };
        assert_eq!(f.components().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(f.mount_path(), "/a/b/c");
    }
}
