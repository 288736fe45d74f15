use super::*;

#[test]
fn fingerprint_is_stable_and_sensitive_to_inputs() {
    let a = fingerprint("prompt", "context");
    let b = fingerprint("prompt", "context");
    let c = fingerprint("prompt", "different");
    let d = fingerprint("different", "context");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_ne!(a, d);
    assert_eq!(a.len(), 64); // 32 bytes, hex-encoded
}

#[test]
fn fingerprint_does_not_collide_across_the_prompt_context_boundary() {
    // Without a separator byte "ab" + "" and "a" + "b" would collide.
    let a = fingerprint("ab", "");
    let b = fingerprint("a", "b");
    assert_ne!(a, b);
}

#[tokio::test]
async fn miss_then_hit_round_trips() {
    let cache = ResponseCache::new(Duration::from_secs(60));
    let key = fingerprint("p", "c");
    assert!(cache.get(&key).await.is_none());

    cache.put(key.clone(), "hello".to_owned()).await;
    assert_eq!(cache.get(&key).await, Some("hello".to_owned()));
}

#[tokio::test]
async fn entries_expire_after_ttl() {
    let cache = ResponseCache::new(Duration::from_millis(1));
    let key = fingerprint("p", "c");
    cache.put(key.clone(), "stale".to_owned()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(cache.get(&key).await.is_none());
}

#[tokio::test]
async fn purge_expired_removes_only_stale_entries() {
    let cache = ResponseCache::new(Duration::from_millis(1));
    cache.put(fingerprint("p", "old"), "old".to_owned()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fresh_cache = ResponseCache::new(Duration::from_secs(60));
    fresh_cache.put(fingerprint("p", "new"), "new".to_owned()).await;

    assert_eq!(cache.purge_expired().await, 1);
    assert_eq!(cache.len().await, 0);
    assert_eq!(fresh_cache.len().await, 1);
}
