//! Blocking-read tests: cursors that tail the buffer, wake on append, time
//! out, and get interrupted by close.

use std::time::Duration;

use spoolhouse_storage::{BufferConfig, Error, MessageBuffer};
use tokio::time::Instant;

fn config() -> BufferConfig {
    BufferConfig {
        max_payload_size: 1024,
        segment_length: 4096,
        auto_sync_interval_ms: 0,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocking_next_wakes_on_append() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = MessageBuffer::open(dir.path(), config()).await.unwrap();

    let mut cursor = buffer.cursor(0).await.unwrap();
    let reader = tokio::spawn(async move {
        let got = cursor.next_timeout(Some(Duration::from_secs(5))).await?;
        Ok::<_, Error>((got, cursor.message()?.clone()))
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    buffer.append(7777, "wake", b"first message").await.unwrap();

    let (got, message) = reader.await.unwrap().unwrap();
    assert!(got);
    assert_eq!(message.timestamp, 7777);
    assert_eq!(message.routing_key, "wake");
    assert_eq!(message.payload.as_ref(), b"first message");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocking_next_wakes_mid_stream() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = MessageBuffer::open(dir.path(), config()).await.unwrap();
    buffer.append(1, "", b"old").await.unwrap();

    let mut cursor = buffer.cursor(0).await.unwrap();
    assert!(cursor.next_timeout(Some(Duration::from_secs(1))).await.unwrap());
    assert_eq!(cursor.payload().unwrap().as_ref(), b"old");

    // cursor is now at the tail; the next call blocks until the append
    let reader = tokio::spawn(async move {
        let got = cursor.next_timeout(Some(Duration::from_secs(5))).await?;
        Ok::<_, Error>((got, cursor.payload()?))
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    buffer.append(2, "", b"new").await.unwrap();

    let (got, payload) = reader.await.unwrap().unwrap();
    assert!(got);
    assert_eq!(payload.as_ref(), b"new");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocking_next_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = MessageBuffer::open(dir.path(), config()).await.unwrap();

    let mut cursor = buffer.cursor(0).await.unwrap();
    let start = Instant::now();
    let got = cursor
        .next_timeout(Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert!(!got);
    assert!(start.elapsed() >= Duration::from_millis(90));
    drop(buffer);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_interrupts_blocked_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = MessageBuffer::open(dir.path(), config()).await.unwrap();

    let mut cursor = buffer.cursor(0).await.unwrap();
    let reader = tokio::spawn(async move {
        cursor.next_timeout(Some(Duration::from_secs(30))).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    buffer.close().await.unwrap();

    let result = reader.await.unwrap();
    assert!(
        matches!(result, Err(Error::Interrupted) | Err(Error::Closed)),
        "expected an interruption, got {result:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_indefinite_wait_wakes_on_append() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = MessageBuffer::open(dir.path(), config()).await.unwrap();

    let mut cursor = buffer.cursor(0).await.unwrap();
    let reader = tokio::spawn(async move {
        // no timeout: wait until a producer shows up
        let got = cursor.next_timeout(None).await?;
        Ok::<_, Error>(got)
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    buffer.append(1, "", b"x").await.unwrap();
    assert!(reader.await.unwrap().unwrap());
}

#[tokio::test]
async fn test_empty_cursor_adopts_first_segment() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = MessageBuffer::open(dir.path(), config()).await.unwrap();

    // cursor created while the buffer is empty
    let mut cursor = buffer.cursor(0).await.unwrap();
    assert!(!cursor.next().await.unwrap());
    assert!(!cursor.next().await.unwrap());

    buffer.append(5, "adopted", b"x").await.unwrap();
    assert!(cursor.next().await.unwrap());
    assert_eq!(cursor.routing_key().unwrap(), "adopted");
    assert!(!cursor.next().await.unwrap());
}

#[tokio::test]
async fn test_cursor_follows_across_rollover() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = MessageBuffer::open(
        dir.path(),
        BufferConfig {
            segment_length: 2048 + 32,
            max_payload_size: 1024,
            auto_sync_interval_ms: 0,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let mut cursor = buffer.cursor(0).await.unwrap();
    let payload = vec![3u8; 1024];
    for i in 0..4i64 {
        buffer.append(i, "", &payload).await.unwrap();
        // the tailing cursor sees each record, including across the
        // segment boundary the rollover created
        assert!(cursor.next_timeout(Some(Duration::from_secs(1))).await.unwrap());
        assert_eq!(cursor.timestamp().unwrap(), i);
    }
    assert!(buffer.file_count().await > 1);
}

#[tokio::test]
async fn test_closed_cursor_errors() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = MessageBuffer::open(dir.path(), config()).await.unwrap();
    buffer.append(0, "", b"x").await.unwrap();

    let mut cursor = buffer.cursor(0).await.unwrap();
    assert!(cursor.next().await.unwrap());
    cursor.close();

    assert!(matches!(cursor.next().await, Err(Error::Closed)));
    assert!(matches!(
        cursor.next_timeout(Some(Duration::from_millis(10))).await,
        Err(Error::Closed)
    ));
    // accessors no longer have a record
    assert!(cursor.id().is_err());
}

#[tokio::test]
async fn test_accessors_before_first_next_error() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = MessageBuffer::open(dir.path(), config()).await.unwrap();
    buffer.append(0, "", b"x").await.unwrap();

    let cursor = buffer.cursor(0).await.unwrap();
    assert!(matches!(cursor.id(), Err(Error::InvalidArgument(_))));
    assert!(matches!(cursor.payload(), Err(Error::InvalidArgument(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_waiting_cursors_both_wake() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = MessageBuffer::open(dir.path(), config()).await.unwrap();

    let mut a = buffer.cursor(0).await.unwrap();
    let mut b = buffer.cursor(0).await.unwrap();
    let reader_a =
        tokio::spawn(async move { a.next_timeout(Some(Duration::from_secs(5))).await });
    let reader_b =
        tokio::spawn(async move { b.next_timeout(Some(Duration::from_secs(5))).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    buffer.append(1, "", b"fan-out").await.unwrap();

    assert!(reader_a.await.unwrap().unwrap());
    assert!(reader_b.await.unwrap().unwrap());
}
