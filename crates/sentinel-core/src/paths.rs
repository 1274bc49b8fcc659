use std::io;
use std::path::{Component, Path, PathBuf};

/// Longest concrete path the translator will produce, in bytes.
pub const MAX_PATH_BYTES: usize = 4096;

/// Maps virtual paths (as clients of the mount see them, rooted at `/`) to
/// concrete paths under the storage root.
///
/// Translation is pure concatenation. No normalisation or symlink resolution
/// happens here; the transport resolves names component-wise and never
/// forwards `..` segments.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    storage_root: PathBuf,
}

impl PathTranslator {
    pub fn new(storage_root: PathBuf) -> Self {
        Self { storage_root }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Translate `virtual_path` into a concrete path under the storage root.
    ///
    /// Fails with `ENAMETOOLONG` when the result would exceed
    /// [`MAX_PATH_BYTES`].
    pub fn translate(&self, virtual_path: &Path) -> io::Result<PathBuf> {
        let mut concrete = self.storage_root.clone();
        for component in virtual_path.components() {
            match component {
                Component::RootDir => {}
                Component::Normal(name) => concrete.push(name),
                // CurDir/ParentDir never arrive from the transport; keep the
                // raw concatenation contract and let the kernel reject them.
                other => concrete.push(other),
            }
        }
        if concrete.as_os_str().len() > MAX_PATH_BYTES {
            return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
        }
        Ok(concrete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_under_the_storage_root() {
        let tr = PathTranslator::new(PathBuf::from("/srv/storage"));
        assert_eq!(
            tr.translate(Path::new("/docs/report.txt")).unwrap(),
            PathBuf::from("/srv/storage/docs/report.txt")
        );
    }

    #[test]
    fn root_maps_to_the_storage_root_itself() {
        let tr = PathTranslator::new(PathBuf::from("/srv/storage"));
        assert_eq!(tr.translate(Path::new("/")).unwrap(), PathBuf::from("/srv/storage"));
    }

    #[test]
    fn overlong_result_is_rejected() {
        let tr = PathTranslator::new(PathBuf::from("/srv/storage"));
        let long = format!("/{}", "x".repeat(MAX_PATH_BYTES));
        let err = tr.translate(Path::new(&long)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENAMETOOLONG));
    }

    #[test]
    fn result_is_prefixed_by_the_storage_root() {
        let tr = PathTranslator::new(PathBuf::from("/srv/storage"));
        let concrete = tr.translate(Path::new("/a/b/c")).unwrap();
        assert!(concrete.starts_with(tr.storage_root()));
    }
}
