#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use racksync::model::types::{RemoteDirectorySpec, RemoteEndpoint, SyncTarget};
use racksync::sources::registry::SessionRegistry;
use racksync::sources::session::{
    ConnectError, EntryKind, RemoteEntry, RemoteError, RemoteFs, RemoteResult, RemoteStat,
    join_remote,
};
use racksync::sources::sync::SyncEngine;
use racksync::storage::sqlite::SqliteStorage;
use tempfile::TempDir;

/// Captures tracing output for tests.
pub struct TestTracing {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub content: Vec<u8>,
    pub mtime: i64,
}

/// Shared state behind [`MemoryFs`], inspectable from the test.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    pub files: BTreeMap<String, RemoteFile>,
    pub dirs: HashSet<String>,
    /// Paths whose `get` fails.
    pub fail_get: HashSet<String>,
    /// Paths whose `remove` fails.
    pub fail_remove: HashSet<String>,
    /// Paths listed without a file type, as when the server omits permissions.
    pub untyped: HashSet<String>,
    pub refuse_connect: bool,
    pub connects: usize,
    /// Bumped by [`MemoryRemote::drop_connections`]; sessions from an older
    /// generation have a dead transport.
    pub generation: usize,
    /// Dead sessions still claim to be connected, like a liveness check that
    /// never touches the wire.
    pub stale_looks_live: bool,
    /// Remote paths in the order they were fetched.
    pub fetched: Vec<String>,
}

impl MemoryRemote {
    /// Server side drops every open connection.
    pub fn drop_connections(&mut self) {
        self.generation += 1;
    }

    pub fn add_file(&mut self, dir: &str, name: &str, mtime: i64) {
        self.dirs.insert(dir.to_string());
        self.files.insert(
            join_remote(dir, name),
            RemoteFile {
                content: format!("<html>{name}</html>").into_bytes(),
                mtime,
            },
        );
    }
}

/// In-memory remote filesystem for one host.
pub struct MemoryFs {
    host: String,
    /// Generation this session connected in, if connected.
    connected: Option<usize>,
    state: Arc<Mutex<MemoryRemote>>,
}

impl MemoryFs {
    pub fn new(host: &str, state: Arc<Mutex<MemoryRemote>>) -> Self {
        Self {
            host: host.to_string(),
            connected: None,
            state,
        }
    }

    fn check(&self, op: &'static str) -> RemoteResult<()> {
        match self.connected {
            None => Err(RemoteError::NotConnected { op }),
            Some(generation) if generation != self.state.lock().unwrap().generation => {
                Err(RemoteError::Sftp {
                    op,
                    path: String::new(),
                    message: "connection reset by peer".into(),
                })
            }
            Some(_) => Ok(()),
        }
    }
}

impl RemoteFs for MemoryFs {
    fn host(&self) -> &str {
        &self.host
    }

    fn connect(&mut self) -> Result<(), ConnectError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.refuse_connect {
            return Err(ConnectError::Auth {
                user: "tester".into(),
                host: self.host.clone(),
                message: "denied".into(),
            });
        }
        self.connected = Some(state.generation);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let state = self.state.lock().unwrap();
        match self.connected {
            None => false,
            Some(generation) => state.stale_looks_live || generation == state.generation,
        }
    }

    fn close(&mut self) {
        self.connected = None;
    }

    fn list(&self, dir: &str) -> RemoteResult<Vec<RemoteEntry>> {
        self.check("list")?;
        let state = self.state.lock().unwrap();
        if !state.dirs.contains(dir) {
            return Err(RemoteError::NotFound(dir.to_string()));
        }
        Ok(state
            .files
            .iter()
            .filter_map(|(path, file)| {
                let name = path.strip_prefix(&join_remote(dir, ""))?;
                (!name.contains('/')).then(|| RemoteEntry {
                    name: name.to_string(),
                    path: path.clone(),
                    stat: RemoteStat {
                        kind: if state.untyped.contains(path) {
                            EntryKind::Other
                        } else {
                            EntryKind::File
                        },
                        size: file.content.len() as u64,
                        mtime: Some(file.mtime),
                    },
                })
            })
            .collect())
    }

    fn stat(&self, path: &str) -> RemoteResult<RemoteStat> {
        self.check("stat")?;
        let state = self.state.lock().unwrap();
        if let Some(file) = state.files.get(path) {
            return Ok(RemoteStat {
                kind: EntryKind::File,
                size: file.content.len() as u64,
                mtime: Some(file.mtime),
            });
        }
        if state.dirs.contains(path) {
            return Ok(RemoteStat {
                kind: EntryKind::Dir,
                ..Default::default()
            });
        }
        Err(RemoteError::NotFound(path.to_string()))
    }

    fn get(&self, remote_path: &str, local_path: &Path) -> RemoteResult<u64> {
        self.check("get")?;
        let mut state = self.state.lock().unwrap();
        if state.fail_get.contains(remote_path) {
            return Err(RemoteError::Sftp {
                op: "get",
                path: remote_path.to_string(),
                message: "transfer interrupted".into(),
            });
        }
        let content = state
            .files
            .get(remote_path)
            .map(|f| f.content.clone())
            .ok_or_else(|| RemoteError::NotFound(remote_path.to_string()))?;
        std::fs::write(local_path, &content).map_err(|source| RemoteError::Local {
            path: local_path.to_path_buf(),
            source,
        })?;
        state.fetched.push(remote_path.to_string());
        Ok(content.len() as u64)
    }

    fn put(&self, local_path: &Path, remote_path: &str) -> RemoteResult<u64> {
        self.check("put")?;
        let content = std::fs::read(local_path).map_err(|source| RemoteError::Local {
            path: local_path.to_path_buf(),
            source,
        })?;
        let len = content.len() as u64;
        self.state.lock().unwrap().files.insert(
            remote_path.to_string(),
            RemoteFile { content, mtime: 0 },
        );
        Ok(len)
    }

    fn remove(&self, remote_path: &str) -> RemoteResult<()> {
        self.check("remove")?;
        let mut state = self.state.lock().unwrap();
        if state.fail_remove.contains(remote_path) {
            return Err(RemoteError::Sftp {
                op: "remove",
                path: remote_path.to_string(),
                message: "permission denied".into(),
            });
        }
        state.files.remove(remote_path);
        Ok(())
    }

    fn mkdir(&self, remote_path: &str) -> RemoteResult<()> {
        self.check("mkdir")?;
        self.state.lock().unwrap().dirs.insert(remote_path.to_string());
        Ok(())
    }
}

/// Registry whose sessions all share one in-memory remote.
pub fn memory_registry(state: &Arc<Mutex<MemoryRemote>>) -> SessionRegistry {
    let state = Arc::clone(state);
    SessionRegistry::new(move |ep| Box::new(MemoryFs::new(&ep.host, Arc::clone(&state))))
}

/// Temp data dir with storage, an engine over a memory remote, and one target.
pub struct SyncFixture {
    pub dir: TempDir,
    pub storage: SqliteStorage,
    pub engine: SyncEngine,
    pub remote: Arc<Mutex<MemoryRemote>>,
    pub target_id: i64,
}

pub const REMOTE_DIR: &str = "/home/tester/reports";

impl SyncFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let storage = SqliteStorage::open(&dir.path().join("racksync.db")).unwrap();
        let remote = Arc::new(Mutex::new(MemoryRemote::default()));
        remote.lock().unwrap().dirs.insert(REMOTE_DIR.to_string());
        let engine = SyncEngine::new(
            &dir.path().join("media"),
            dir.path(),
            Arc::new(memory_registry(&remote)),
        );
        let target = SyncTarget {
            id: None,
            name: "rack-01".into(),
            endpoint: RemoteEndpoint {
                password: Some("secret".into()),
                ..RemoteEndpoint::new("10.0.0.5")
            },
            directory: RemoteDirectorySpec::new(REMOTE_DIR),
            archive_id: None,
        };
        let target_id = storage.upsert_target(&target).unwrap();
        Self {
            dir,
            storage,
            engine,
            remote,
            target_id,
        }
    }

    pub fn add_remote(&self, name: &str, mtime: i64) {
        self.remote.lock().unwrap().add_file(REMOTE_DIR, name, mtime);
    }

    pub fn media_root(&self) -> std::path::PathBuf {
        self.dir.path().join("media")
    }
}
