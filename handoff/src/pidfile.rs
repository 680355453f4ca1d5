//! Exclusive PID file for the master.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("pid file {} already exists; is another master running?", .0.display())]
    AlreadyExists(PathBuf),
    #[error("failed to write pid file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A PID file owned by this process. Removed on [`PidFile::remove`] or drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    removed: bool,
}

impl PidFile {
    /// Create `path` exclusively and write the current pid to it.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, PidFileError> {
        Self::create_with_pid(path, std::process::id())
    }

    pub fn create_with_pid(path: impl AsRef<Path>, pid: u32) -> Result<Self, PidFileError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| PidFileError::Io {
            path: path.clone(),
            source,
        };

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(PidFileError::AlreadyExists(path));
            }
            Err(e) => return Err(io_err(e)),
        };

        file.write_all(pid.to_string().as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        tracing::debug!(path = %path.display(), pid, "Wrote pid file");
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file. Safe to call more than once.
    pub fn remove(&mut self) -> io::Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Removed pid file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_decimal_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.pid");

        let pidfile = PidFile::create_with_pid(&path, 4321).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4321");
        assert_eq!(pidfile.path(), path);
    }

    #[test]
    fn second_create_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.pid");

        let _first = PidFile::create(&path).unwrap();
        let err = PidFile::create(&path).unwrap_err();
        assert!(matches!(err, PidFileError::AlreadyExists(p) if p == path));
    }

    #[test]
    fn remove_is_idempotent_and_drop_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.pid");

        let mut pidfile = PidFile::create(&path).unwrap();
        pidfile.remove().unwrap();
        assert!(!path.exists());
        pidfile.remove().unwrap();
        drop(pidfile);

        {
            let _again = PidFile::create(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("master.pid");
        assert!(matches!(
            PidFile::create(&path),
            Err(PidFileError::Io { .. })
        ));
    }
}
