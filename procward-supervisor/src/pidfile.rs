//! On-disk PID records.
//!
//! Nothing else in the crate touches a PID file directly: records are written
//! through a same-directory temp file plus rename so a reader never sees a
//! partial record, and every probe-then-act section holds an advisory lock on
//! a sibling `.lock` file.

use std::{
    env,
    ffi::OsString,
    fs::{self, File, OpenOptions, Permissions},
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use fs2::FileExt;
use log::{debug, info};
use procward_models::{ProcessError, ProcessRecord, Result};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Default)]
pub struct PidFileStore;

/// Exclusive hold on a PID file. Released on drop.
#[derive(Debug)]
pub struct PidFileLock {
    file: File,
    path: PathBuf,
}

impl Drop for PidFileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!("Failed to release {}: {}", self.path.display(), err);
        }
    }
}

impl PidFileStore {
    pub fn new() -> Self {
        Self
    }

    pub fn lock_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("pid"));
        name.push(".lock");
        path.with_file_name(name)
    }

    /// Lock for processes tracked without a PID file, keyed on their argv and
    /// kept under `$XDG_RUNTIME_DIR` (or the temp dir).
    pub fn command_lock(&self, argv: &[String]) -> Result<PidFileLock> {
        let mut hasher = Sha256::new();
        for arg in argv {
            hasher.update(arg.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hex::encode(hasher.finalize());
        let dir = env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .filter(|dir| dir.is_dir())
            .unwrap_or_else(env::temp_dir);
        self.lock(&dir.join(format!("procward-{}", &digest[..16])))
    }

    /// Blocks until no other invocation holds the lock for `path`.
    pub fn lock(&self, path: &Path) -> Result<PidFileLock> {
        let lock_path = Self::lock_path(path);
        ensure_parent(&lock_path)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|err| ProcessError::store(&lock_path, err))?;
        FileExt::lock_exclusive(&file).map_err(|err| ProcessError::store(&lock_path, err))?;
        debug!("Acquired lock {}", lock_path.display());
        Ok(PidFileLock {
            file,
            path: lock_path,
        })
    }

    pub fn write(&self, path: &Path, record: &ProcessRecord) -> Result<()> {
        let dir = ensure_parent(path)?;
        let body = serde_json::to_vec_pretty(record)
            .map_err(|err| ProcessError::store(path, io::Error::other(err)))?;

        let mut temp = tempfile::Builder::new()
            .prefix(".procward-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|err| ProcessError::store(path, err))?;
        temp.write_all(&body)
            .and_then(|_| temp.write_all(b"\n"))
            .and_then(|_| temp.as_file().set_permissions(Permissions::from_mode(0o644)))
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|err| ProcessError::store(path, err))?;
        temp.persist(path)
            .map_err(|err| ProcessError::store(path, err.error))?;

        info!("Wrote PID file {} (PID {})", path.display(), record.pid);
        Ok(())
    }

    /// `Ok(None)` when there is no record; `CorruptRecord` when there is one we
    /// cannot understand. A bare integer is accepted as a legacy record.
    pub fn read(&self, path: &Path) -> Result<Option<ProcessRecord>> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                return Err(corrupt(path, "not valid UTF-8"));
            }
            Err(err) => return Err(ProcessError::store(path, err)),
        };

        let trimmed = data.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        if trimmed.starts_with('{') {
            let record: ProcessRecord =
                serde_json::from_str(trimmed).map_err(|err| corrupt(path, err))?;
            if record.pid == 0 {
                return Err(corrupt(path, "PID 0 is not a process"));
            }
            return Ok(Some(record));
        }

        match trimmed.parse::<u32>() {
            Ok(0) => Err(corrupt(path, "PID 0 is not a process")),
            Ok(pid) => Ok(Some(ProcessRecord::legacy(pid))),
            Err(err) => Err(corrupt(path, err)),
        }
    }

    /// Removes the record; a missing file is not an error.
    pub fn delete(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                info!("Removed PID file {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ProcessError::store(path, err)),
        }
    }
}

fn corrupt(path: &Path, reason: impl ToString) -> ProcessError {
    ProcessError::CorruptRecord {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn ensure_parent(path: &Path) -> Result<PathBuf> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|err| ProcessError::store(&dir, err))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use chrono::Utc;
    use procward_models::{CommandSignature, ProcessState};

    use super::*;

    fn sample(pid: u32) -> ProcessRecord {
        ProcessRecord {
            pid,
            start_time: Some(123456),
            signature: Some(CommandSignature {
                exe: PathBuf::from("/usr/bin/sleep"),
                argv: vec!["sleep".into(), "9999".into()],
            }),
            status: ProcessState::Sleeping,
            launched_at: Some(Utc::now()),
        }
    }

    #[test]
    fn write_then_read_returns_record() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("svc.pid");
        let store = PidFileStore::new();

        let record = sample(4321);
        store.write(&path, &record).unwrap();
        assert_eq!(store.read(&path).unwrap(), Some(record));

        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn write_creates_missing_directories() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("run/nested/svc.pid");
        PidFileStore::new().write(&path, &sample(99)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn missing_and_empty_files_are_absent() {
        let temp = tempfile::tempdir().unwrap();
        let store = PidFileStore::new();
        let path = temp.path().join("none.pid");
        assert_eq!(store.read(&path).unwrap(), None);

        fs::write(&path, "\n").unwrap();
        assert_eq!(store.read(&path).unwrap(), None);
    }

    #[test]
    fn bare_pid_is_a_legacy_record() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nginx.pid");
        fs::write(&path, "1234\n").unwrap();

        let record = PidFileStore::new().read(&path).unwrap().unwrap();
        assert_eq!(record, ProcessRecord::legacy(1234));
    }

    #[test]
    fn garbage_is_corrupt() {
        let temp = tempfile::tempdir().unwrap();
        let store = PidFileStore::new();
        let path = temp.path().join("bad.pid");

        for body in ["not-a-pid", "{\"pid\": \"x\"}", "0", "{ half"] {
            fs::write(&path, body).unwrap();
            let err = store.read(&path).unwrap_err();
            assert!(
                matches!(err, ProcessError::CorruptRecord { .. }),
                "{body:?} gave {err}"
            );
        }
    }

    #[test]
    fn delete_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let store = PidFileStore::new();
        let path = temp.path().join("svc.pid");

        store.write(&path, &sample(7)).unwrap();
        store.delete(&path).unwrap();
        store.delete(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn lock_path_is_a_sibling() {
        assert_eq!(
            PidFileStore::lock_path(Path::new("/run/app/svc.pid")),
            PathBuf::from("/run/app/svc.pid.lock")
        );
    }

    #[test]
    fn lock_serializes_holders() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("svc.pid");
        let store = PidFileStore::new();

        let guard = store.lock(&path).unwrap();
        let (tx, rx) = mpsc::channel();
        let contender = {
            let path = path.clone();
            thread::spawn(move || {
                let _guard = PidFileStore::new().lock(&path).unwrap();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        contender.join().unwrap();
    }

    #[test]
    fn command_locks_are_keyed_on_argv() {
        let store = PidFileStore::new();
        let argv = vec!["procward-lock-test".to_string(), "one".to_string()];
        let other = vec!["procward-lock-test".to_string(), "two".to_string()];

        let guard = store.command_lock(&argv).unwrap();
        store.command_lock(&other).unwrap();

        let (tx, rx) = mpsc::channel();
        let contender = {
            let argv = argv.clone();
            thread::spawn(move || {
                let _guard = PidFileStore::new().command_lock(&argv).unwrap();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        contender.join().unwrap();
    }
}
