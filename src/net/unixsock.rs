//! Unix domain socket lifecycle: validation, stale reclaim, permissions.
//!
//! Stale sockets are reclaimed by probing with a throwaway connect instead
//! of stat-then-unlink, which removes the TOCTTOU window: a refused connect
//! proves nothing is listening right now, and only then is the file
//! deleted. The bind itself runs under a clamped umask so the socket file
//! never appears with group/world access.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// sun_path capacity minus the NUL terminator.
#[cfg(target_os = "linux")]
pub const MAX_PATH_LEN: usize = 107;
#[cfg(not(target_os = "linux"))]
pub const MAX_PATH_LEN: usize = 103;

#[derive(Debug, thiserror::Error)]
pub enum UnixSockError {
    #[error("invalid socket path: {0}")]
    InvalidPath(String),

    #[error("socket {0} is already in use")]
    AddressInUse(PathBuf),

    #[error("io error on unix socket: {0}")]
    Io(#[from] io::Error),
}

/// Path validation: bounded length, printable bytes, no abstract
/// namespace. Tab is the only control character allowed.
pub fn validate_path(path: &Path) -> Result<(), UnixSockError> {
    use std::os::unix::ffi::OsStrExt;
    let bytes = path.as_os_str().as_bytes();

    if bytes.is_empty() {
        return Err(UnixSockError::InvalidPath("empty path".into()));
    }
    if bytes.len() > MAX_PATH_LEN {
        return Err(UnixSockError::InvalidPath(format!(
            "{} bytes exceeds the {MAX_PATH_LEN}-byte limit",
            bytes.len()
        )));
    }
    if bytes[0] == 0 {
        return Err(UnixSockError::InvalidPath(
            "abstract-namespace sockets are not supported".into(),
        ));
    }
    if bytes.contains(&0) {
        return Err(UnixSockError::InvalidPath("embedded NUL byte".into()));
    }
    if bytes.iter().any(|&b| b < 0x20 && b != b'\t') {
        return Err(UnixSockError::InvalidPath(
            "control characters other than tab".into(),
        ));
    }
    Ok(())
}

/// Reclaim a stale socket file, TOCTTOU-safely.
///
/// A throwaway connect distinguishes the cases: refusal means a dead
/// leftover (delete it), success means a live server (address in use),
/// absence means nothing to do.
fn reclaim_stale(path: &Path) -> Result<(), UnixSockError> {
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => Err(UnixSockError::AddressInUse(path.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            info!("removing stale socket {}", path.display());
            std::fs::remove_file(path)?;
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(e.into()),
        Err(e) => Err(e.into()),
    }
}

/// Bind a listening socket at `path` with the full lifecycle: validate,
/// reclaim, clamp umask to 0o077 around the bind, then audit ownership
/// and permissions of the created file.
pub fn bind_listener(path: &Path) -> Result<UnixListener, UnixSockError> {
    validate_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return Err(UnixSockError::InvalidPath(format!(
                "parent directory {} does not exist",
                parent.display()
            )));
        }
    }

    reclaim_stale(path)?;

    let old_umask = unsafe { libc::umask(0o077) };
    let bound = UnixListener::bind(path);
    unsafe { libc::umask(old_umask) };
    let listener = bound?;

    audit_socket_file(path);
    debug!("listening on unix socket {}", path.display());
    Ok(listener)
}

/// Post-listen sanity check: the socket file must belong to us and carry
/// no group/world write bits. Violations are warnings, not errors; the
/// listener already exists and refusing service here helps nobody.
fn audit_socket_file(path: &Path) {
    let md = match std::fs::metadata(path) {
        Ok(md) => md,
        Err(e) => {
            warn!("cannot stat socket {}: {}", path.display(), e);
            return;
        }
    };
    let euid = unsafe { libc::geteuid() };
    if md.uid() != euid {
        warn!(
            "socket {} is owned by uid {} (we are {})",
            path.display(),
            md.uid(),
            euid
        );
    }
    if md.mode() & 0o022 != 0 {
        warn!(
            "socket {} is group/world writable (mode {:o})",
            path.display(),
            md.mode() & 0o777
        );
    }
}

/// Connect to a server socket.
pub async fn connect(path: &Path) -> Result<UnixStream, UnixSockError> {
    validate_path(path)?;
    Ok(UnixStream::connect(path).await?)
}

/// Best-effort unlink on shutdown; errors are logged only.
pub fn cleanup(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("failed to remove socket {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::ffi::OsStrExt;

    fn temp_sock(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rcat_us_{}_{}.sock", tag, std::process::id()))
    }

    #[test]
    fn test_validate_rejects_bad_paths() {
        assert!(validate_path(Path::new("")).is_err());
        let long = "/tmp/".to_string() + &"a".repeat(MAX_PATH_LEN);
        assert!(validate_path(Path::new(&long)).is_err());
        let nul = std::ffi::OsStr::from_bytes(b"/tmp/a\0b");
        assert!(validate_path(Path::new(nul)).is_err());
        let ctrl = std::ffi::OsStr::from_bytes(b"/tmp/a\x07b");
        assert!(validate_path(Path::new(ctrl)).is_err());
        let tab = std::ffi::OsStr::from_bytes(b"/tmp/a\tb");
        assert!(validate_path(Path::new(tab)).is_ok());
        assert!(validate_path(Path::new("/tmp/ok.sock")).is_ok());
    }

    #[test]
    fn test_validate_rejects_abstract_namespace() {
        let abstract_path = std::ffi::OsStr::from_bytes(b"\0hidden");
        assert!(validate_path(Path::new(abstract_path)).is_err());
    }

    #[tokio::test]
    async fn test_bind_clamps_permissions() {
        let path = temp_sock("perm");
        let _ = std::fs::remove_file(&path);
        let _listener = bind_listener(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().mode();
        assert_eq!(mode & 0o077, 0, "socket mode {mode:o} leaks to group/world");
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_stale_socket_reclaimed() {
        let path = temp_sock("stale");
        let _ = std::fs::remove_file(&path);
        {
            let _dead = bind_listener(&path).unwrap();
            // Listener dropped here; the file remains as a stale socket.
        }
        assert!(path.exists());
        let _listener = bind_listener(&path).expect("stale socket must be reclaimed");
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_live_socket_is_address_in_use() {
        let path = temp_sock("live");
        let _ = std::fs::remove_file(&path);
        let _live = bind_listener(&path).unwrap();
        match bind_listener(&path) {
            Err(UnixSockError::AddressInUse(p)) => assert_eq!(p, path),
            other => panic!("expected AddressInUse, got {other:?}"),
        }
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_missing_parent_dir_is_invalid() {
        let path = Path::new("/tmp/rcat_no_such_dir_xyz/s.sock");
        assert!(matches!(
            bind_listener(path),
            Err(UnixSockError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_and_cleanup() {
        let path = temp_sock("conn");
        let _ = std::fs::remove_file(&path);
        let listener = bind_listener(&path).unwrap();
        let client = connect(&path).await.unwrap();
        let (_server_side, _) = listener.accept().await.unwrap();
        drop(client);
        drop(listener);
        cleanup(&path);
        assert!(!path.exists());
    }
}
