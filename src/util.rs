use anyhow::{anyhow, Result};
use std::fs::{File, Permissions};
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Opens `path` for reading, describing it as a `kind` file on failure.
pub fn open(path: &Path, kind: &str) -> Result<File> {
    match File::open(path) {
        Err(e) => Err(anyhow!("Opening {} file `{}`: {}", kind, path.display(), e)),
        Ok(file) => Ok(file),
    }
}

/// Recursively removes `dir`. A directory that doesn't exist is already
/// clean. Read-only directories beneath `dir` are made writable first if
/// they get in the way.
pub fn remove_dir_all(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            unlock(dir)?;
            std::fs::remove_dir_all(dir)
        }
        Err(e) => Err(e),
    }
}

fn unlock(dir: &Path) -> io::Result<()> {
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            let mut permissions = entry.metadata()?.permissions();
            make_writable(&mut permissions);
            std::fs::set_permissions(entry.path(), permissions)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_writable(permissions: &mut Permissions) {
    use std::os::unix::fs::PermissionsExt;
    permissions.set_mode(permissions.mode() | 0o700);
}

#[cfg(not(unix))]
fn make_writable(permissions: &mut Permissions) {
    permissions.set_readonly(false);
}
