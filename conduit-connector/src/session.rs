use crate::error::ConnectorError;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Per-connection lock file holding the owner pid.
///
/// Guards against two processes serving the same connection id; removed on drop.
#[derive(Debug)]
pub struct SessionGuard {
    path: PathBuf,
}

impl SessionGuard {
    pub fn acquire(runtime_dir: &Path, conn_id: &str) -> Result<Self, ConnectorError> {
        fs::create_dir_all(runtime_dir)?;
        let path = runtime_dir.join(format!("{conn_id}.lock"));
        let own_pid = std::process::id() as i32;

        // second attempt only after reclaiming a stale file
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{own_pid}")?;
                    debug!("Session lock {} acquired", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match read_owner(&path) {
                        Some(pid) if pid != own_pid && pid_alive(pid) => {
                            return Err(ConnectorError::AlreadyRunning {
                                conn_id: conn_id.to_string(),
                                pid,
                            });
                        }
                        owner => {
                            warn!(
                                "Reclaiming stale session lock {} (owner {:?})",
                                path.display(),
                                owner
                            );
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ConnectorError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("cannot take session lock {}", path.display()),
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Session lock {} not removed: {}", self.path.display(), e);
        }
    }
}

fn read_owner(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None::<Signal>) {
        Ok(()) => true,
        // exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(pid: i32) -> bool {
    pid > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let guard = SessionGuard::acquire(dir.path(), "mtc-01").unwrap();
            let owner = read_owner(guard.path()).unwrap();
            assert_eq!(owner, std::process::id() as i32);
            guard.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_live_foreign_owner_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        // pid 1 is always alive
        fs::write(dir.path().join("mtc-01.lock"), "1\n").unwrap();
        let err = SessionGuard::acquire(dir.path(), "mtc-01").unwrap_err();
        assert!(matches!(err, ConnectorError::AlreadyRunning { pid: 1, .. }));
    }

    #[test]
    fn test_stale_or_garbage_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("mtc-01.lock"), "not a pid").unwrap();
        let guard = SessionGuard::acquire(dir.path(), "mtc-01").unwrap();
        assert_eq!(read_owner(guard.path()), Some(std::process::id() as i32));
    }
}
