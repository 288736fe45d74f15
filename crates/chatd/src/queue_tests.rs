use super::*;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::task::{Context, Poll};

/// A fake transport that records every line written, optionally failing the
/// first `fail_n` writes with a given error kind before succeeding.
struct FakeWriter {
    lines: Arc<StdMutex<Vec<String>>>,
    fail_remaining: usize,
    fail_kind: io::ErrorKind,
}

impl AsyncWrite for FakeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail_remaining > 0 {
            self.fail_remaining -= 1;
            return Poll::Ready(Err(io::Error::new(self.fail_kind, "simulated failure")));
        }
        let text = String::from_utf8_lossy(buf).trim_end_matches('\n').to_owned();
        self.lines.lock().expect("lock").push(text);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn fake(fail_remaining: usize, fail_kind: io::ErrorKind) -> (Box<dyn AsyncWrite + Unpin + Send>, Arc<StdMutex<Vec<String>>>) {
    let lines = Arc::new(StdMutex::new(Vec::new()));
    let writer = FakeWriter { lines: lines.clone(), fail_remaining, fail_kind };
    (Box::new(writer), lines)
}

async fn drain_eventually(lines: &Arc<StdMutex<Vec<String>>>, expected: usize) {
    for _ in 0..200 {
        if lines.lock().expect("lock").len() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {expected} lines, got {:?}", lines.lock().expect("lock"));
}

#[tokio::test]
async fn delivers_messages_in_order() {
    let (writer, lines) = fake(0, io::ErrorKind::Other);
    let queue = MessageQueue::spawn(writer);

    queue.enqueue("one");
    queue.enqueue("two");
    queue.enqueue("three");

    drain_eventually(&lines, 3).await;
    assert_eq!(*lines.lock().expect("lock"), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn transport_dead_stops_drain_and_marks_queue_dead() {
    let (writer, lines) = fake(1, io::ErrorKind::BrokenPipe);
    let queue = MessageQueue::spawn(writer);

    queue.enqueue("lost");
    // Give the drain a moment to observe the broken pipe and terminate.
    for _ in 0..200 {
        if queue.is_dead() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(queue.is_dead());
    assert!(lines.lock().expect("lock").is_empty());

    // Further enqueues are a silent no-op.
    queue.enqueue("also lost");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(lines.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn transient_error_retries_and_eventually_delivers() {
    let (writer, lines) = fake(1, io::ErrorKind::WouldBlock);
    let queue = MessageQueue::spawn(writer);

    queue.enqueue("retried");
    drain_eventually(&lines, 1).await;
    assert_eq!(*lines.lock().expect("lock"), vec!["retried"]);
    assert!(!queue.is_dead());
}

#[tokio::test]
async fn shared_writer_serializes_clones_onto_one_transport() {
    let (writer, lines) = fake(0, io::ErrorKind::Other);
    let shared = SharedWriter::new(writer);
    let other = shared.clone();

    shared.write_line("first").await.expect("write");
    other.write_line("second").await.expect("write");

    assert_eq!(*lines.lock().expect("lock"), vec!["first", "second"]);
}

#[tokio::test]
async fn shared_writer_clone_can_back_a_message_queue() {
    let (writer, lines) = fake(0, io::ErrorKind::Other);
    let shared = SharedWriter::new(writer);
    let queue = MessageQueue::spawn(Box::new(shared.clone()));

    queue.enqueue("via queue");
    drain_eventually(&lines, 1).await;
    assert_eq!(*lines.lock().expect("lock"), vec!["via queue"]);
}

#[tokio::test]
async fn room_message_writer_frames_every_line() {
    let (writer, lines) = fake(0, io::ErrorKind::Other);
    let queue = MessageQueue::spawn(Box::new(RoomMessageWriter::new(writer)));

    queue.enqueue("alice: hi");
    queue.enqueue("[bob enters the room]");
    drain_eventually(&lines, 2).await;
    assert_eq!(
        *lines.lock().expect("lock"),
        vec!["ROOM_MESSAGE alice: hi", "ROOM_MESSAGE [bob enters the room]"]
    );
}
