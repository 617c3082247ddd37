//! Shutdown registry sweep. Kept in its own test binary: `close_all`
//! closes every registered buffer in the process, which would race with
//! buffers belonging to unrelated tests.

use spoolhouse_storage::{shutdown, BufferConfig, MessageBuffer};

#[tokio::test]
async fn test_close_all_closes_registered_buffers() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = MessageBuffer::open(dir_a.path(), BufferConfig::default())
        .await
        .unwrap();
    let b = MessageBuffer::open(dir_b.path(), BufferConfig::default())
        .await
        .unwrap();
    a.append(1, "", b"x").await.unwrap();

    shutdown::close_all().await;

    assert!(!a.is_open());
    assert!(!b.is_open());

    // a closed buffer can be reopened and still has its data
    let reopened = MessageBuffer::open(dir_a.path(), BufferConfig::default())
        .await
        .unwrap();
    assert_eq!(reopened.message_count().await.unwrap(), 1);
    reopened.close().await.unwrap();

    // close_all is safe to call again once everything is gone
    shutdown::close_all().await;
}
