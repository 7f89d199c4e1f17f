use std::io::ErrorKind;
use std::path::Path;
use crate::collab::Filesystem;
use crate::error::FsError;

/// [`Filesystem`] backed by the local disk.
///
/// Symlinks are removed themselves; their targets are never followed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFilesystem;

impl Filesystem for LocalFilesystem {
    fn exists(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(path).is_ok()
    }

    fn delete(&self, path: &Path) -> Result<(), FsError> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(map_err(path, e)),
        };
        let result = if meta.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_err(path, e)),
        }
    }
}

fn map_err(path: &Path, source: std::io::Error) -> FsError {
    if source.kind() == ErrorKind::PermissionDenied {
        FsError::PermissionDenied(path.to_path_buf())
    } else {
        FsError::Other {
            path: path.to_path_buf(),
            source,
        }
    }
}
