//! End-to-end scenarios against a real server on an ephemeral port,
//! driven through the client connection layer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use synxpo::client::Connection;
use synxpo::meta::{MemoryMetadataStore, MetadataStore};
use synxpo::protocol::{
    AskVersionIncrease, ClientMessage, DirectoryCreate, DirectorySubscribe, FileChange,
    FileChunk, FileId, FileMetadata, FileStatus, FileType, FileWrite, FileWriteEnd,
    RequestFileContent, RequestVersion, ServerMessage, VersionRequest,
};
use synxpo::server::{ServerConfig, SyncServer};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server() -> (SocketAddr, TempDir) {
    let tmp = TempDir::new().unwrap();
    let meta: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        storage_root: tmp.path().join("storage"),
        ..Default::default()
    };
    let server = SyncServer::bind(config, meta).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (addr, tmp)
}

async fn connect(addr: SocketAddr) -> (Arc<Connection>, UnboundedReceiver<ServerMessage>) {
    let (conn, callbacks) = Connection::connect(&addr.to_string()).await.unwrap();
    (Arc::new(conn), callbacks)
}

async fn create_directory(conn: &Connection) -> String {
    match conn
        .send_with_response(&ClientMessage::DirectoryCreate(DirectoryCreate), TIMEOUT)
        .await
        .unwrap()
    {
        ServerMessage::OkDirectoryCreated(m) => m.directory_id,
        other => panic!("expected OkDirectoryCreated, got {other:?}"),
    }
}

async fn subscribe(conn: &Connection, directory_id: &str) {
    match conn
        .send_with_response(
            &ClientMessage::DirectorySubscribe(DirectorySubscribe {
                directory_id: directory_id.to_string(),
            }),
            TIMEOUT,
        )
        .await
        .unwrap()
    {
        ServerMessage::OkSubscribed(_) => {}
        other => panic!("expected OkSubscribed, got {other:?}"),
    }
}

fn change(directory_id: &str, id: &str, path: &str, first_try_time: u64) -> FileChange {
    FileChange {
        id: id.to_string(),
        directory_id: directory_id.to_string(),
        current_path: path.to_string(),
        file_type: FileType::File,
        deleted: false,
        content_changed: true,
        first_try_time,
    }
}

/// Full ASK -> ALLOW -> WRITE -> END cycle for a single file.
async fn upload(
    conn: &Connection,
    directory_id: &str,
    file_id: &str,
    path: &str,
    content: &[u8],
    first_try_time: u64,
) -> Vec<FileMetadata> {
    let ask = ClientMessage::AskVersionIncrease(AskVersionIncrease {
        files: vec![change(directory_id, file_id, path, first_try_time)],
    });
    match conn.send_with_response(&ask, TIMEOUT).await.unwrap() {
        ServerMessage::VersionIncreaseAllow(_) => {}
        other => panic!("expected VersionIncreaseAllow, got {other:?}"),
    }

    conn.send(&ClientMessage::FileWrite(FileWrite {
        chunk: FileChunk {
            id: file_id.to_string(),
            directory_id: directory_id.to_string(),
            current_path: path.to_string(),
            offset: 0,
            data: bytes::Bytes::copy_from_slice(content),
        },
    }))
    .unwrap();

    match conn
        .send_with_response(&ClientMessage::FileWriteEnd(FileWriteEnd), TIMEOUT)
        .await
        .unwrap()
    {
        ServerMessage::VersionIncreased(m) => m.files,
        other => panic!("expected VersionIncreased, got {other:?}"),
    }
}

async fn request_directory_version(conn: &Connection, directory_id: &str) -> Vec<FileMetadata> {
    match conn
        .send_with_response(
            &ClientMessage::RequestVersion(RequestVersion {
                requests: vec![VersionRequest::Directory(directory_id.to_string())],
            }),
            TIMEOUT,
        )
        .await
        .unwrap()
    {
        ServerMessage::CheckVersion(m) => m.files,
        other => panic!("expected CheckVersion, got {other:?}"),
    }
}

/// REQUEST_FILE_CONTENT and reassembly of the chunk stream.
async fn download(
    conn: &Connection,
    callbacks: &mut UnboundedReceiver<ServerMessage>,
    directory_id: &str,
    file_id: &str,
) -> Vec<u8> {
    let request = ClientMessage::RequestFileContent(RequestFileContent {
        files: vec![FileId {
            id: file_id.to_string(),
            directory_id: directory_id.to_string(),
        }],
    });
    match conn.send_with_response(&request, TIMEOUT).await.unwrap() {
        ServerMessage::FileContentRequestAllow(_) => {}
        other => panic!("expected FileContentRequestAllow, got {other:?}"),
    }

    let mut content = Vec::new();
    loop {
        match tokio::time::timeout(TIMEOUT, callbacks.recv())
            .await
            .expect("timed out waiting for chunk")
            .expect("stream closed mid-download")
        {
            ServerMessage::FileWrite(write) => {
                let chunk = write.chunk;
                assert_eq!(chunk.id, file_id);
                let end = chunk.offset as usize + chunk.data.len();
                if end > content.len() {
                    content.resize(end, 0);
                }
                content[chunk.offset as usize..end].copy_from_slice(&chunk.data);
            }
            ServerMessage::FileWriteEnd(_) => return content,
            other => panic!("unexpected message during download: {other:?}"),
        }
    }
}

#[tokio::test]
async fn create_and_read() {
    let (addr, _tmp) = start_server().await;
    let (conn, mut callbacks) = connect(addr).await;

    let dir_id = create_directory(&conn).await;
    assert_eq!(dir_id.len(), 36);
    subscribe(&conn, &dir_id).await;

    let content = b"Hello, SynXpo Integration Test!";
    let updated = upload(&conn, &dir_id, "", "test.txt", content, 100).await;
    assert_eq!(updated.len(), 1);

    let files = request_directory_version(&conn, &dir_id).await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].current_path, "test.txt");
    assert_eq!(files[0].version, 1);
    assert_eq!(files[0].content_changed_version, 1);
    assert!(!files[0].deleted);

    let downloaded = download(&conn, &mut callbacks, &dir_id, &files[0].id).await;
    assert_eq!(downloaded, content);
}

#[tokio::test]
async fn rename_preserves_content_version() {
    let (addr, _tmp) = start_server().await;
    let (conn, _callbacks) = connect(addr).await;

    let dir_id = create_directory(&conn).await;
    subscribe(&conn, &dir_id).await;
    let updated = upload(&conn, &dir_id, "", "test.txt", b"body", 100).await;
    let file_id = updated[0].id.clone();

    let mut rename = change(&dir_id, &file_id, "renamed_file.txt", 200);
    rename.content_changed = false;
    let response = conn
        .send_with_response(
            &ClientMessage::AskVersionIncrease(AskVersionIncrease { files: vec![rename] }),
            TIMEOUT,
        )
        .await
        .unwrap();

    match response {
        ServerMessage::VersionIncreased(m) => {
            assert_eq!(m.files.len(), 1);
            assert_eq!(m.files[0].version, 2);
            assert_eq!(m.files[0].content_changed_version, 1);
            assert_eq!(m.files[0].current_path, "renamed_file.txt");
        }
        other => panic!("expected VersionIncreased, got {other:?}"),
    }
}

#[tokio::test]
async fn last_try_denies_older_attempt() {
    let (addr, _tmp) = start_server().await;
    let (conn_a, _cb_a) = connect(addr).await;
    let (conn_b, _cb_b) = connect(addr).await;

    let dir_id = create_directory(&conn_a).await;
    subscribe(&conn_a, &dir_id).await;
    let file_id = upload(&conn_a, &dir_id, "", "contested.txt", b"initial", 50).await[0]
        .id
        .clone();

    // Client A records T1 = 100 and pauses. Client B commits with T2 = 200.
    let updated = upload(&conn_b, &dir_id, &file_id, "contested.txt", b"from b", 200).await;
    assert_eq!(updated[0].version, 2);

    // A's stale attempt at T1 loses
    let response = conn_a
        .send_with_response(
            &ClientMessage::AskVersionIncrease(AskVersionIncrease {
                files: vec![change(&dir_id, &file_id, "contested.txt", 100)],
            }),
            TIMEOUT,
        )
        .await
        .unwrap();

    match response {
        ServerMessage::VersionIncreaseDeny(deny) => {
            assert_eq!(deny.files.len(), 1);
            assert_eq!(deny.files[0].status, FileStatus::Denied);
            assert_eq!(deny.files[0].id, file_id);
        }
        other => panic!("expected VersionIncreaseDeny, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_writer_is_blocked() {
    let (addr, _tmp) = start_server().await;
    let (conn_a, _cb_a) = connect(addr).await;
    let (conn_b, _cb_b) = connect(addr).await;

    let dir_id = create_directory(&conn_a).await;
    subscribe(&conn_a, &dir_id).await;
    let file_id = upload(&conn_a, &dir_id, "", "f.txt", b"v1", 100).await[0].id.clone();

    // A obtains ALLOW and stalls without writing
    let response = conn_a
        .send_with_response(
            &ClientMessage::AskVersionIncrease(AskVersionIncrease {
                files: vec![change(&dir_id, &file_id, "f.txt", 200)],
            }),
            TIMEOUT,
        )
        .await
        .unwrap();
    assert!(matches!(response, ServerMessage::VersionIncreaseAllow(_)));

    // B, later in time, hits the write lock
    let response = conn_b
        .send_with_response(
            &ClientMessage::AskVersionIncrease(AskVersionIncrease {
                files: vec![change(&dir_id, &file_id, "f.txt", 300)],
            }),
            TIMEOUT,
        )
        .await
        .unwrap();

    match response {
        ServerMessage::VersionIncreaseDeny(deny) => {
            assert_eq!(deny.files[0].status, FileStatus::Blocked);
        }
        other => panic!("expected VersionIncreaseDeny, got {other:?}"),
    }
}

#[tokio::test]
async fn fan_out_reaches_other_subscribers_only() {
    let (addr, _tmp) = start_server().await;
    let (conn_a, mut cb_a) = connect(addr).await;
    let (conn_b, mut cb_b) = connect(addr).await;

    let dir_id = create_directory(&conn_a).await;
    subscribe(&conn_a, &dir_id).await;
    subscribe(&conn_b, &dir_id).await;

    upload(&conn_a, &dir_id, "", "shared.txt", b"Shared content", 100).await;

    // B sees the committed change as a directory snapshot
    let notification = tokio::time::timeout(TIMEOUT, cb_b.recv())
        .await
        .expect("no notification within timeout")
        .expect("stream closed");
    let file_id = match notification {
        ServerMessage::CheckVersion(check) => {
            assert_eq!(check.files.len(), 1);
            assert_eq!(check.files[0].current_path, "shared.txt");
            assert_eq!(check.files[0].version, 1);
            check.files[0].id.clone()
        }
        other => panic!("expected CheckVersion, got {other:?}"),
    };

    let downloaded = download(&conn_b, &mut cb_b, &dir_id, &file_id).await;
    assert_eq!(downloaded, b"Shared content");

    // The committer receives no echo of its own change
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cb_a.try_recv().is_err());
}

#[tokio::test]
async fn rapid_updates_reach_version_ten() {
    let (addr, _tmp) = start_server().await;
    let (conn, mut callbacks) = connect(addr).await;

    let dir_id = create_directory(&conn).await;
    subscribe(&conn, &dir_id).await;

    let mut file_id = String::new();
    for i in 1..=10u64 {
        let body = format!("revision {i}");
        let updated = upload(&conn, &dir_id, &file_id, "rapid.txt", body.as_bytes(), 100 + i).await;
        assert_eq!(updated[0].version, i);
        file_id = updated[0].id.clone();
    }

    let files = request_directory_version(&conn, &dir_id).await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].version, 10);

    let downloaded = download(&conn, &mut callbacks, &dir_id, &file_id).await;
    assert_eq!(downloaded, b"revision 10");
}

#[tokio::test]
async fn zero_length_file_round_trips() {
    let (addr, _tmp) = start_server().await;
    let (conn, mut callbacks) = connect(addr).await;

    let dir_id = create_directory(&conn).await;
    subscribe(&conn, &dir_id).await;

    let updated = upload(&conn, &dir_id, "", "empty.txt", b"", 100).await;
    assert_eq!(updated[0].version, 1);
    assert_eq!(updated[0].content_changed_version, 1);

    let downloaded = download(&conn, &mut callbacks, &dir_id, &updated[0].id).await;
    assert!(downloaded.is_empty());
}

#[tokio::test]
async fn soft_delete_disappears_from_listing() {
    let (addr, _tmp) = start_server().await;
    let (conn, _callbacks) = connect(addr).await;

    let dir_id = create_directory(&conn).await;
    subscribe(&conn, &dir_id).await;
    let file_id = upload(&conn, &dir_id, "", "doomed.txt", b"bytes", 100).await[0].id.clone();

    let mut delete = change(&dir_id, &file_id, "doomed.txt", 200);
    delete.deleted = true;
    delete.content_changed = false;
    let response = conn
        .send_with_response(
            &ClientMessage::AskVersionIncrease(AskVersionIncrease { files: vec![delete] }),
            TIMEOUT,
        )
        .await
        .unwrap();

    match response {
        ServerMessage::VersionIncreased(m) => {
            assert!(m.files[0].deleted);
            assert_eq!(m.files[0].version, 2);
        }
        other => panic!("expected VersionIncreased, got {other:?}"),
    }

    let files = request_directory_version(&conn, &dir_id).await;
    assert!(files.is_empty());
}

#[tokio::test]
async fn disconnect_mid_upload_rolls_back() {
    let (addr, _tmp) = start_server().await;
    let (conn_a, _cb_a) = connect(addr).await;

    let dir_id = create_directory(&conn_a).await;
    subscribe(&conn_a, &dir_id).await;
    let file_id = upload(&conn_a, &dir_id, "", "f.txt", b"committed", 100).await[0].id.clone();

    // A second connection takes the write lock and dies mid-upload
    let (conn_b, _cb_b) = connect(addr).await;
    let response = conn_b
        .send_with_response(
            &ClientMessage::AskVersionIncrease(AskVersionIncrease {
                files: vec![change(&dir_id, &file_id, "f.txt", 200)],
            }),
            TIMEOUT,
        )
        .await
        .unwrap();
    assert!(matches!(response, ServerMessage::VersionIncreaseAllow(_)));
    conn_b.close();
    drop(conn_b);

    // The server notices the disconnect and releases the lock; a new
    // writer is admitted and the record is unchanged
    tokio::time::sleep(Duration::from_millis(200)).await;

    let files = request_directory_version(&conn_a, &dir_id).await;
    assert_eq!(files[0].version, 1);

    let response = conn_a
        .send_with_response(
            &ClientMessage::AskVersionIncrease(AskVersionIncrease {
                files: vec![change(&dir_id, &file_id, "f.txt", 300)],
            }),
            TIMEOUT,
        )
        .await
        .unwrap();
    assert!(matches!(response, ServerMessage::VersionIncreaseAllow(_)));
}

#[tokio::test]
async fn subscribe_to_unknown_directory_fails() {
    let (addr, _tmp) = start_server().await;
    let (conn, _callbacks) = connect(addr).await;

    let response = conn
        .send_with_response(
            &ClientMessage::DirectorySubscribe(DirectorySubscribe {
                directory_id: "no-such-directory".to_string(),
            }),
            TIMEOUT,
        )
        .await
        .unwrap();

    match response {
        ServerMessage::Error(e) => {
            assert_eq!(e.code, synxpo::protocol::ErrorCode::DirectoryNotFound);
        }
        other => panic!("expected Error, got {other:?}"),
    }
}
