use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use crate::codec::MessageConfig;
use crate::error::{Result, TransportError};
use crate::traits::{framed_with_config, MessageStream};

/// One end of a Unix domain socket connection.
pub type UnixTransport = MessageStream<UnixStream>;

/// Unix domain socket listener producing message transports.
///
/// The socket file is created at bind time and removed on drop, but only
/// if the path still refers to the socket this listener created.
pub struct UnixMessageListener {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
    config: MessageConfig,
}

impl UnixMessageListener {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// If the path already exists and is a socket, it is removed first
    /// (stale socket cleanup). Must be called from within a Tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_err = |source: std::io::Error| TransportError::Bind {
            endpoint: path.display().to_string(),
            source,
        };

        // Remove stale socket if it exists, but never remove non-socket files.
        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            created_inode: Some((created.dev(), created.ino())),
            path,
            config: MessageConfig::default(),
        })
    }

    /// Override the message configuration applied to accepted transports.
    pub fn with_config(mut self, config: MessageConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept the next incoming connection.
    pub async fn accept(&self) -> Result<UnixTransport> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted connection");
        Ok(framed_with_config(stream, self.config.clone()))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixMessageListener {
    fn drop(&mut self) {
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(
                    path = ?self.path,
                    "socket path identity changed; skipping cleanup"
                );
            }
        }
    }
}

/// Connect to a listening Unix domain socket.
pub async fn connect(path: impl AsRef<Path>) -> Result<UnixTransport> {
    connect_with_config(path, MessageConfig::default()).await
}

/// Connect with explicit message configuration.
pub async fn connect_with_config(
    path: impl AsRef<Path>,
    config: MessageConfig,
) -> Result<UnixTransport> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path)
        .await
        .map_err(|source| TransportError::Connect {
            endpoint: path.display().to_string(),
            source,
        })?;
    debug!(?path, "connected to unix domain socket");
    Ok(framed_with_config(stream, config))
}
