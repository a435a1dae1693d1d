//! Recursive copy of a sync root with the exclusion filter applied.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::fs;

/// Well-known VCS metadata directory names. Subsumed by the dotfile
/// rule on the usual spellings, kept explicit for clarity.
const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];

/// Decides which paths are replicated. A name is excluded if it is VCS
/// metadata, a dotfile or a backup file; a relative path is excluded if
/// it is on this root's ignore list. Everything else is included,
/// directories recursively.
pub struct RsyncFilter {
    ignores: Vec<PathBuf>,
}

impl RsyncFilter {
    pub fn new(ignores: &[PathBuf]) -> Self {
        Self {
            ignores: ignores.to_vec(),
        }
    }

    pub fn accepts_name(&self, name: &str) -> bool {
        !(VCS_DIRS.contains(&name) || name.starts_with('.') || name.ends_with('~'))
    }

    /// `rel` is the candidate path relative to the sync root.
    pub fn accepts(&self, rel: &Path) -> bool {
        if self.ignores.iter().any(|ignored| rel == ignored) {
            return false;
        }
        match rel.file_name().and_then(|name| name.to_str()) {
            Some(name) => self.accepts_name(name),
            None => true,
        }
    }
}

/// Copies the contents of `source` into `dest` (created if missing),
/// honoring `filter`. Symlinks and special files are skipped.
pub async fn copy_tree(source: &Path, dest: &Path, filter: &RsyncFilter) -> io::Result<()> {
    copy_dir(source, dest, PathBuf::new(), filter).await
}

fn copy_dir<'a>(
    src: &'a Path,
    dst: &'a Path,
    rel: PathBuf,
    filter: &'a RsyncFilter,
) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        fs::create_dir_all(dst).await?;
        let mut entries = fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let rel_child = rel.join(&name);
            if !filter.accepts(&rel_child) {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                copy_dir(&entry.path(), &dst.join(&name), rel_child, filter).await?;
            } else if file_type.is_file() {
                fs::copy(entry.path(), dst.join(&name)).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn filter_excludes_vcs_dotfiles_and_backups() {
        let filter = RsyncFilter::new(&[]);
        assert!(!filter.accepts(Path::new(".svn")));
        assert!(!filter.accepts(Path::new(".somedotfile")));
        assert!(!filter.accepts(Path::new("somedir/editfile~")));
        assert!(filter.accepts(Path::new("dir")));
        assert!(filter.accepts(Path::new("file.txt")));
        assert!(filter.accepts(Path::new("somedir")));
    }

    #[test]
    fn filter_ignores_only_listed_subpaths() {
        let filter = RsyncFilter::new(&[PathBuf::from("dir1/dir2")]);
        assert!(filter.accepts(Path::new("dir1")));
        assert!(!filter.accepts(Path::new("dir1/dir2")));
        assert!(filter.accepts(Path::new("dir5/dir6")));
    }

    #[tokio::test]
    async fn copy_tree_applies_filter() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        let dest = tmp.path().join("dest");

        touch(&source.join("dir").join("file.txt"));
        touch(&source.join(".svn").join("entries"));
        touch(&source.join(".somedotfile"));
        touch(&source.join("somedir").join("editfile~"));

        let filter = RsyncFilter::new(&[]);
        copy_tree(&source, &dest, &filter).await.unwrap();

        assert!(dest.join("dir").join("file.txt").is_file());
        assert!(dest.join("somedir").is_dir());
        assert!(!dest.join("somedir").join("editfile~").exists());
        assert!(!dest.join(".svn").exists());
        assert!(!dest.join(".somedotfile").exists());
    }

    #[tokio::test]
    async fn copy_tree_prunes_ignored_subtrees() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        let dest = tmp.path().join("dest");

        touch(&source.join("dir1").join("dir2").join("hello"));
        touch(&source.join("dir5").join("file"));
        touch(&source.join("dir5").join("dir6").join("bogus"));

        let filter = RsyncFilter::new(&[PathBuf::from("dir1/dir2"), PathBuf::from("dir5/dir6")]);
        copy_tree(&source, &dest, &filter).await.unwrap();

        assert!(dest.join("dir1").is_dir());
        assert!(!dest.join("dir1").join("dir2").exists());
        assert!(dest.join("dir5").join("file").is_file());
        assert!(!dest.join("dir5").join("dir6").exists());
    }
}
