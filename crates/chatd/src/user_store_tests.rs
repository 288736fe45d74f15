use super::*;

#[tokio::test]
async fn register_then_login_succeeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("users.txt");
    let store = UserStore::load(&path).await.expect("load");

    let outcome = store.register("alice", "password1").await.expect("register");
    assert_eq!(outcome, RegisterOutcome::Created);

    let user = store.authenticate("alice", "password1").await;
    assert_eq!(user.map(|u| u.username), Some("alice".to_owned()));
}

#[tokio::test]
async fn duplicate_register_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("users.txt");
    let store = UserStore::load(&path).await.expect("load");

    assert_eq!(store.register("bob", "hunter2").await.expect("first"), RegisterOutcome::Created);
    assert_eq!(store.register("bob", "different").await.expect("second"), RegisterOutcome::Exists);
}

#[tokio::test]
async fn wrong_password_and_missing_user_both_fail_closed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("users.txt");
    let store = UserStore::load(&path).await.expect("load");
    store.register("carol", "correct-horse").await.expect("register");

    assert!(store.authenticate("carol", "wrong").await.is_none());
    assert!(store.authenticate("nobody", "whatever").await.is_none());
}

#[tokio::test]
async fn persists_across_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("users.txt");
    {
        let store = UserStore::load(&path).await.expect("load");
        store.register("dana", "s3cret").await.expect("register");
    }

    let reloaded = UserStore::load(&path).await.expect("reload");
    assert!(reloaded.authenticate("dana", "s3cret").await.is_some());
}

#[tokio::test]
async fn missing_file_behaves_as_empty_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("does-not-exist.txt");
    let store = UserStore::load(&path).await.expect("load should tolerate missing file");
    assert!(store.authenticate("anyone", "anything").await.is_none());
}

#[test]
fn constant_time_eq_rejects_mismatched_lengths() {
    assert!(!constant_time_eq(b"abc", b"abcd"));
    assert!(constant_time_eq(b"abc", b"abc"));
    assert!(!constant_time_eq(b"abc", b"abd"));
}
