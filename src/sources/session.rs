//! SFTP session over SSH for one remote host.
//!
//! [`RemoteSession`] owns a single authenticated `ssh2` transport plus its SFTP
//! channel. The primitive operations are exposed through the [`RemoteFs`]
//! trait so the mover and the registry can be exercised against fakes.
//!
//! Every primitive checks for a live SFTP channel first. When there is none,
//! it logs which operation was aborted and returns
//! [`RemoteError::NotConnected`] instead of panicking, so transport faults
//! never cross the session boundary as anything but a `Result`.

use std::fs::File;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ssh2::{ErrorCode, FileStat, Session, Sftp};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::types::RemoteEndpoint;

/// Default TCP connect / SSH blocking timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// SFTP status code for a missing path (`LIBSSH2_FX_NO_SUCH_FILE`).
const SFTP_NO_SUCH_FILE: i32 = 2;

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failure of a single remote primitive.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("{op} aborted: not connected to the SFTP server")]
    NotConnected { op: &'static str },

    #[error("remote path not found: {0}")]
    NotFound(String),

    #[error("{op} failed for '{path}': {message}")]
    Sftp {
        op: &'static str,
        path: String,
        message: String,
    },

    #[error("local I/O error at {path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RemoteError {
    /// The session itself is unusable, as opposed to one path failing locally
    /// or not existing.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::NotConnected { .. } | Self::Sftp { .. })
    }
}

/// Failure while establishing a session.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("no password or private key configured for {0}")]
    NoCredentials(String),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("TCP connection to {addr} failed: {source}")]
    Tcp {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("SSH handshake with {host} failed: {message}")]
    Handshake { host: String, message: String },

    #[error("authentication as {user}@{host} failed: {message}")]
    Auth {
        user: String,
        host: String,
        message: String,
    },

    #[error("could not open SFTP channel on {host}: {message}")]
    Channel { host: String, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    #[default]
    Other,
}

/// Attributes of a remote path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStat {
    pub kind: EntryKind,
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: Option<i64>,
}

impl RemoteStat {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

impl From<&FileStat> for RemoteStat {
    fn from(stat: &FileStat) -> Self {
        let kind = if stat.is_dir() {
            EntryKind::Dir
        } else if stat.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        Self {
            kind,
            size: stat.size.unwrap_or(0),
            mtime: stat.mtime.and_then(|t| i64::try_from(t).ok()),
        }
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Base name.
    pub name: String,
    /// Full remote path (directory joined with the base name).
    pub path: String,
    pub stat: RemoteStat,
}

/// Primitive remote filesystem operations.
pub trait RemoteFs: Send {
    /// Host identifier this filesystem talks to.
    fn host(&self) -> &str;

    fn connect(&mut self) -> Result<(), ConnectError>;

    /// True only if the transport exists and answers a liveness check.
    fn is_connected(&self) -> bool;

    /// Tear down the connection. Closing a closed session is a no-op.
    fn close(&mut self);

    fn list(&self, dir: &str) -> RemoteResult<Vec<RemoteEntry>>;

    fn stat(&self, path: &str) -> RemoteResult<RemoteStat>;

    /// Copy a remote file to `local_path`. Returns bytes written.
    fn get(&self, remote_path: &str, local_path: &Path) -> RemoteResult<u64>;

    /// Copy a local file to `remote_path`. Returns bytes written.
    fn put(&self, local_path: &Path, remote_path: &str) -> RemoteResult<u64>;

    /// Delete a remote file. Deleting a missing file succeeds.
    fn remove(&self, remote_path: &str) -> RemoteResult<()>;

    fn mkdir(&self, remote_path: &str) -> RemoteResult<()>;

    fn exists(&self, path: &str) -> RemoteResult<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_file(&self, path: &str) -> RemoteResult<bool> {
        match self.stat(path) {
            Ok(stat) => Ok(stat.is_file()),
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_dir(&self, path: &str) -> RemoteResult<bool> {
        match self.stat(path) {
            Ok(stat) => Ok(stat.is_dir()),
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Join a remote directory and a base name with `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Stream `reader` into `local_path` through a temp file in the same directory,
/// so a partially transferred file never appears under the final name.
pub fn write_local_atomically(local_path: &Path, reader: &mut dyn Read) -> RemoteResult<u64> {
    let local_err = |source: io::Error| RemoteError::Local {
        path: local_path.to_path_buf(),
        source,
    };

    let parent = match local_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(local_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(local_err)?;
    let written = io::copy(reader, &mut tmp).map_err(local_err)?;
    tmp.persist(local_path).map_err(|e| local_err(e.error))?;
    Ok(written)
}

enum AuthMethod {
    PrivateKey(PathBuf),
    Password(String),
}

/// One SSH/SFTP connection to a remote host.
pub struct RemoteSession {
    endpoint: RemoteEndpoint,
    connect_timeout: Duration,
    session: Option<Session>,
    sftp: Option<Sftp>,
    last_error: Option<String>,
}

impl RemoteSession {
    /// Create a session for `endpoint`. No connection is made until [`RemoteFs::connect`].
    pub fn new(endpoint: RemoteEndpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            session: None,
            sftp: None,
            last_error: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    /// Message of the most recent failed connect, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn username(&self) -> String {
        self.endpoint
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| dotenvy::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    }

    fn auth_method(&self) -> Result<AuthMethod, ConnectError> {
        if let Some(key) = self
            .endpoint
            .private_key_path
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
        {
            return Ok(AuthMethod::PrivateKey(expand_home(key)));
        }
        match self.endpoint.password.as_ref().filter(|p| !p.is_empty()) {
            Some(pw) => Ok(AuthMethod::Password(pw.clone())),
            None => Err(ConnectError::NoCredentials(self.endpoint.host.clone())),
        }
    }

    fn open_channel(&self) -> Result<(Session, Sftp), ConnectError> {
        let host = &self.endpoint.host;
        let auth = self.auth_method()?;
        let addr_label = format!("{}:{}", host, self.endpoint.port);

        let addr = (host.as_str(), self.endpoint.port)
            .to_socket_addrs()
            .map_err(|source| ConnectError::Tcp {
                addr: addr_label.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| ConnectError::Resolve(addr_label.clone()))?;

        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|source| {
            ConnectError::Tcp {
                addr: addr_label.clone(),
                source,
            }
        })?;

        let handshake_err = |e: ssh2::Error| ConnectError::Handshake {
            host: host.clone(),
            message: e.to_string(),
        };
        let mut session = Session::new().map_err(handshake_err)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.connect_timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake().map_err(handshake_err)?;

        let user = self.username();
        let auth_err = |message: String| ConnectError::Auth {
            user: user.clone(),
            host: host.clone(),
            message,
        };
        match &auth {
            AuthMethod::PrivateKey(path) => session
                .userauth_pubkey_file(&user, None, path, None)
                .map_err(|e| auth_err(e.to_string()))?,
            AuthMethod::Password(pw) => session
                .userauth_password(&user, pw)
                .map_err(|e| auth_err(e.to_string()))?,
        }
        if !session.authenticated() {
            return Err(auth_err("server did not accept credentials".to_string()));
        }

        let sftp = session.sftp().map_err(|e| ConnectError::Channel {
            host: host.clone(),
            message: e.to_string(),
        })?;
        Ok((session, sftp))
    }

    fn channel(&self, op: &'static str) -> RemoteResult<&Sftp> {
        match &self.sftp {
            Some(sftp) => Ok(sftp),
            None => {
                warn!(host = %self.endpoint.host, op, "remote operation aborted: not connected");
                Err(RemoteError::NotConnected { op })
            }
        }
    }
}

impl RemoteFs for RemoteSession {
    fn host(&self) -> &str {
        &self.endpoint.host
    }

    fn connect(&mut self) -> Result<(), ConnectError> {
        self.close();
        let start = Instant::now();
        match self.open_channel() {
            Ok((session, sftp)) => {
                self.session = Some(session);
                self.sftp = Some(sftp);
                self.last_error = None;
                info!(
                    host = %self.endpoint.host,
                    port = self.endpoint.port,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "sftp session established"
                );
                Ok(())
            }
            Err(e) => {
                warn!(host = %self.endpoint.host, error = %e, "ssh connect failed");
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Round-trips a `realpath(".")` request over the SFTP channel. A dead
    /// peer fails it (or times out) even while the handles are still held.
    fn is_connected(&self) -> bool {
        let (Some(session), Some(sftp)) = (&self.session, &self.sftp) else {
            return false;
        };
        if !session.authenticated() {
            return false;
        }
        match sftp.realpath(Path::new(".")) {
            Ok(_) => true,
            Err(e) => {
                debug!(host = %self.endpoint.host, error = %e, "liveness check failed");
                false
            }
        }
    }

    fn close(&mut self) {
        drop(self.sftp.take());
        if let Some(session) = self.session.take()
            && let Err(e) = session.disconnect(None, "racksync session closed", None)
        {
            debug!(host = %self.endpoint.host, error = %e, "ssh disconnect failed");
        }
    }

    fn list(&self, dir: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let sftp = self.channel("list")?;
        let entries = sftp
            .readdir(Path::new(dir))
            .map_err(|e| sftp_error("list", dir, e))?;
        Ok(entries
            .into_iter()
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                if stat.perm.is_none() {
                    debug!(
                        host = %self.endpoint.host,
                        entry = %name,
                        "server sent no permission bits; entry type unknown"
                    );
                }
                Some(RemoteEntry {
                    path: join_remote(dir, &name),
                    name,
                    stat: RemoteStat::from(&stat),
                })
            })
            .collect())
    }

    fn stat(&self, path: &str) -> RemoteResult<RemoteStat> {
        let sftp = self.channel("stat")?;
        sftp.stat(Path::new(path))
            .map(|s| RemoteStat::from(&s))
            .map_err(|e| sftp_error("stat", path, e))
    }

    fn get(&self, remote_path: &str, local_path: &Path) -> RemoteResult<u64> {
        let sftp = self.channel("get")?;
        let mut remote = sftp
            .open(Path::new(remote_path))
            .map_err(|e| sftp_error("get", remote_path, e))?;
        let written = write_local_atomically(local_path, &mut remote)?;
        debug!(
            host = %self.endpoint.host,
            remote_path,
            local_path = %local_path.display(),
            bytes = written,
            "copied remote file"
        );
        Ok(written)
    }

    fn put(&self, local_path: &Path, remote_path: &str) -> RemoteResult<u64> {
        let sftp = self.channel("put")?;
        let mut local = File::open(local_path).map_err(|source| RemoteError::Local {
            path: local_path.to_path_buf(),
            source,
        })?;
        let mut remote = sftp
            .create(Path::new(remote_path))
            .map_err(|e| sftp_error("put", remote_path, e))?;
        io::copy(&mut local, &mut remote).map_err(|e| RemoteError::Sftp {
            op: "put",
            path: remote_path.to_string(),
            message: e.to_string(),
        })
    }

    fn remove(&self, remote_path: &str) -> RemoteResult<()> {
        let sftp = self.channel("remove")?;
        match sftp.unlink(Path::new(remote_path)) {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(sftp_error("remove", remote_path, e)),
        }
    }

    fn mkdir(&self, remote_path: &str) -> RemoteResult<()> {
        let sftp = self.channel("mkdir")?;
        sftp.mkdir(Path::new(remote_path), 0o755)
            .map_err(|e| sftp_error("mkdir", remote_path, e))
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_not_found(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}

fn sftp_error(op: &'static str, path: &str, e: ssh2::Error) -> RemoteError {
    if is_not_found(&e) {
        RemoteError::NotFound(path.to_string())
    } else {
        RemoteError::Sftp {
            op,
            path: path.to_string(),
            message: e.to_string(),
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
