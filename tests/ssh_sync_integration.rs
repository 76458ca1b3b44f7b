//! Synchronization against a real SFTP server in Docker.
//!
//! Run with: `cargo test --test ssh_sync_integration -- --ignored`


use std::sync::Arc;
use std::time::Duration;

use racksync::model::types::{RemoteDirectorySpec, SyncTarget, Verdict};
use racksync::sources::registry::SessionRegistry;
use racksync::sources::session::{RemoteFs, RemoteSession};
use racksync::sources::sync::{RunStatus, SyncEngine};
use racksync::storage::sqlite::SqliteStorage;
use ssh_test_helper::SshTestServer;

const REMOTE_DIR: &str = "/root/reports";

#[test]
#[ignore = "requires Docker"]
fn session_primitives_against_real_server() {
    let server = SshTestServer::start().expect("SSH server should start");
    server
        .seed_files(REMOTE_DIR, &[("a.html", "<html>a</html>")])
        .unwrap();

    let mut session = RemoteSession::new(server.endpoint());
    assert!(!session.is_connected());
    session.connect().expect("connect with key");
    assert!(session.is_connected());

    assert!(session.is_dir(REMOTE_DIR).unwrap());
    assert!(session.is_file("/root/reports/a.html").unwrap());
    assert!(!session.exists("/root/reports/missing.html").unwrap());

    let tmp = tempfile::TempDir::new().unwrap();
    let local = tmp.path().join("a.html");
    assert_eq!(session.get("/root/reports/a.html", &local).unwrap(), 14);
    assert_eq!(std::fs::read_to_string(&local).unwrap(), "<html>a</html>");

    session.mkdir("/root/upload").unwrap();
    session.put(&local, "/root/upload/a.html").unwrap();
    assert!(session.is_file("/root/upload/a.html").unwrap());
    session.remove("/root/upload/a.html").unwrap();
    // Removing a missing file is not an error.
    session.remove("/root/upload/a.html").unwrap();

    session.close();
    session.close();
    assert!(!session.is_connected());
}

#[test]
#[ignore = "requires Docker"]
fn full_sync_against_real_server() {
    let server = SshTestServer::start().expect("SSH server should start");
    server
        .seed_files(
            REMOTE_DIR,
            &[
                ("2024-01-01_10-00-00_Testresult.html", "<html>ok</html>"),
                ("2024-01-02_09-30-00_Testresult_error.html", "<html>bad</html>"),
                ("notes.txt", "keep me"),
            ],
        )
        .unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let storage = SqliteStorage::open(&tmp.path().join("racksync.db")).unwrap();
    let target_id = storage
        .upsert_target(&SyncTarget {
            id: None,
            name: "docker-rack".into(),
            endpoint: server.endpoint(),
            directory: RemoteDirectorySpec::new(REMOTE_DIR),
            archive_id: None,
        })
        .unwrap();

    let registry = Arc::new(SessionRegistry::ssh(Duration::from_secs(10)));
    let engine = SyncEngine::new(&tmp.path().join("media"), tmp.path(), registry);

    let outcome = engine.synchronize(&storage, target_id, |_| {}).unwrap();
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.files_moved, 2);

    let listing = server.ssh_exec(&format!("ls {REMOTE_DIR}")).unwrap();
    assert_eq!(listing.trim(), "notes.txt");

    let target = storage.get_target(target_id).unwrap().unwrap();
    let archive = storage.load_archive(target.archive_id.unwrap()).unwrap().unwrap();
    assert_eq!(archive.reports.len(), 2);
    assert_eq!(archive.latest().unwrap().verdict, Verdict::Failed);
    assert!(
        tmp.path()
            .join("media/archive_docker-rack/2024-01-02_09-30-00_Testresult_error.html")
            .is_file()
    );
}

#[test]
#[ignore = "requires Docker"]
fn dropped_sftp_server_is_detected_and_reconnected() {
    let server = SshTestServer::start().expect("SSH server should start");
    server
        .seed_files(REMOTE_DIR, &[("a.html", "<html>a</html>")])
        .unwrap();

    let registry = SessionRegistry::ssh(Duration::from_secs(5));
    let endpoint = server.endpoint();
    let shared = registry.connected(&endpoint).unwrap();
    assert!(shared.lock().is_connected());

    // The transport stays up; only the SFTP channel's server process dies.
    server.ssh_exec("pkill -x sftp-server || true").unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert!(!shared.lock().is_connected());

    let again = registry.connected(&endpoint).unwrap();
    assert!(Arc::ptr_eq(&shared, &again));
    let session = again.lock();
    assert!(session.is_connected());
    assert!(session.is_file("/root/reports/a.html").unwrap());
}
