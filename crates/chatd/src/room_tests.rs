use super::*;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

struct RecordingWriter {
    lines: Arc<StdMutex<Vec<String>>>,
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let text = String::from_utf8_lossy(buf).trim_end_matches('\n').to_owned();
        self.lines.lock().expect("lock").push(text);
        Poll::Ready(Ok(buf.len()))
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn recording_writer() -> (BoxedWriter, Arc<StdMutex<Vec<String>>>) {
    let lines = Arc::new(StdMutex::new(Vec::new()));
    (Box::new(RecordingWriter { lines: lines.clone() }), lines)
}

async fn wait_for(lines: &Arc<StdMutex<Vec<String>>>, expected: usize) {
    for _ in 0..200 {
        if lines.lock().expect("lock").len() >= expected {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("expected {expected} lines, got {:?}", lines.lock().expect("lock"));
}

#[tokio::test]
async fn broadcast_reaches_all_subscribers_in_order() {
    let room = Room::new("lobby", 1000);
    let (w1, lines1) = recording_writer();
    let (w2, lines2) = recording_writer();
    room.add_user("alice", w1).await;
    room.add_user("bob", w2).await;

    room.user_message("alice", "hi").await;
    room.user_message("bob", "yo").await;

    wait_for(&lines1, 2).await;
    wait_for(&lines2, 2).await;
    assert_eq!(*lines1.lock().expect("lock"), vec!["alice: hi", "bob: yo"]);
    assert_eq!(*lines2.lock().expect("lock"), vec!["alice: hi", "bob: yo"]);
}

#[tokio::test]
async fn history_cap_evicts_oldest() {
    let room = Room::new("tiny", 3);
    for i in 0..5 {
        room.broadcast(format!("msg{i}")).await;
    }
    let snapshot = room.history_snapshot(10).await;
    assert_eq!(snapshot, "msg2\nmsg3\nmsg4");
}

#[tokio::test]
async fn add_user_snapshots_recent_history() {
    let room = Room::new("lobby", 1000);
    room.broadcast("before-join-1").await;
    room.broadcast("before-join-2").await;

    let (w, lines) = recording_writer();
    room.add_user("late", w).await;
    wait_for(&lines, 2).await;
    assert_eq!(*lines.lock().expect("lock"), vec!["before-join-1", "before-join-2"]);
}

#[tokio::test]
async fn rejoin_replaces_prior_queue() {
    let room = Room::new("lobby", 1000);
    let (w1, _lines1) = recording_writer();
    room.add_user("alice", w1).await;
    assert!(room.has_user("alice").await);

    let (w2, lines2) = recording_writer();
    room.add_user("alice", w2).await;
    room.user_message("system", "after rejoin").await;

    wait_for(&lines2, 1).await;
    assert_eq!(*lines2.lock().expect("lock"), vec!["system: after rejoin"]);
}

#[tokio::test]
async fn remove_user_stops_future_broadcasts() {
    let room = Room::new("lobby", 1000);
    let (w, lines) = recording_writer();
    room.add_user("alice", w).await;
    room.remove_user("alice").await;

    room.broadcast("should not arrive").await;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert!(lines.lock().expect("lock").is_empty());
    assert!(!room.has_user("alice").await);
}

#[tokio::test]
async fn empty_bot_reply_becomes_system_error() {
    let room = Room::new("ai-room", 1000);
    let (w, lines) = recording_writer();
    room.add_user("alice", w).await;

    room.bot_message("   ").await;
    wait_for(&lines, 1).await;
    assert_eq!(lines.lock().expect("lock")[0], "[Error: Bot did not generate a valid response]");
}

#[tokio::test]
async fn tell_user_does_not_reach_other_subscribers() {
    let room = Room::new("lobby", 1000);
    let (w1, lines1) = recording_writer();
    let (w2, lines2) = recording_writer();
    room.add_user("alice", w1).await;
    room.add_user("bob", w2).await;

    room.tell_user("alice", "[System: Reconnected to room lobby]").await;
    wait_for(&lines1, 1).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(*lines1.lock().expect("lock"), vec!["[System: Reconnected to room lobby]"]);
    assert!(lines2.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn room_registry_enforces_name_uniqueness() {
    let registry = RoomRegistry::new(1000);
    assert!(registry.create_room("general").await.is_ok());
    let err = registry.create_room("general").await.unwrap_err();
    assert_eq!(err, ChatError::RoomExists);
}

// Runs on the real multi-threaded runtime (unlike the rest of this module's
// single-threaded `#[tokio::test]`s) so that concurrent `broadcast()` calls
// genuinely race across worker threads, not just across task-yield points on
// one thread.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_broadcasts_are_delivered_in_commit_order_to_every_subscriber() {
    let room = Arc::new(Room::new("lobby", 1000));
    let (w1, lines1) = recording_writer();
    let (w2, lines2) = recording_writer();
    room.add_user("alice", w1).await;
    room.add_user("bob", w2).await;

    const N: usize = 200;
    let mut senders = Vec::new();
    for i in 0..N {
        let room = room.clone();
        senders.push(tokio::spawn(async move {
            room.broadcast(format!("msg{i}")).await;
        }));
    }
    for s in senders {
        s.await.expect("sender task");
    }

    wait_for(&lines1, N).await;
    wait_for(&lines2, N).await;
    let history = room.history_snapshot(N).await;
    let committed: Vec<&str> = history.lines().collect();

    // Whatever order the N broadcasts actually committed in, every
    // subscriber must have observed that exact same order — never a
    // different relative order from one another or from history.
    assert_eq!(*lines1.lock().expect("lock"), committed);
    assert_eq!(*lines2.lock().expect("lock"), committed);
}

#[tokio::test]
async fn ai_room_carries_system_prompt() {
    let registry = RoomRegistry::new(1000);
    let room = registry.create_ai_room("ai-doodle", "be terse").await.expect("create");
    assert!(room.is_ai);
    assert_eq!(room.ai_system_prompt, "be terse");
}
