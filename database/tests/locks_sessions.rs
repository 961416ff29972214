mod common;

use caw_core::error::Error;
use caw_core::models::NewSession;
use common::*;

async fn register_session(store: &caw_database::Store, pid: i64) -> caw_core::models::Session {
    store
        .sessions()
        .register(NewSession {
            pid,
            is_daemon: false,
            metadata: None,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_lock_takeover_after_deregistration() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "contested").await;
    let s1 = register_session(&store, 100).await;
    let s2 = register_session(&store, 200).await;

    let first = store.locks().lock(&workflow.id, &s1.id).await.unwrap();
    assert!(first.success);

    let denied = store.locks().lock(&workflow.id, &s2.id).await.unwrap();
    assert!(!denied.success);
    assert_eq!(denied.locked_by.as_deref(), Some(s1.id.as_str()));
    assert!(denied.locked_at.is_some());

    store.sessions().deregister(&s1.id).await.unwrap();

    let taken = store.locks().lock(&workflow.id, &s2.id).await.unwrap();
    assert!(taken.success, "dangling holders are taken over");
    assert_eq!(taken.locked_by.as_deref(), Some(s2.id.as_str()));
}

#[tokio::test]
async fn test_lock_idempotent_for_holder_preserves_locked_at() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "relock").await;
    let session = register_session(&store, 300).await;

    let first = store.locks().lock(&workflow.id, &session.id).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let second = store.locks().lock(&workflow.id, &session.id).await.unwrap();
    assert!(first.success && second.success);
    assert_eq!(second.locked_at, first.locked_at);
}

#[tokio::test]
async fn test_unlock_semantics() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "unlockable").await;
    let s1 = register_session(&store, 1).await;
    let s2 = register_session(&store, 2).await;

    // Unlocking an unlocked workflow is fine.
    store.locks().unlock(&workflow.id, &s1.id).await.unwrap();

    store.locks().lock(&workflow.id, &s1.id).await.unwrap();
    let err = store.locks().unlock(&workflow.id, &s2.id).await.unwrap_err();
    assert!(err.is_conflict());

    store.locks().unlock(&workflow.id, &s1.id).await.unwrap();
    let info = store.locks().get_lock_info(&workflow.id).await.unwrap();
    assert!(!info.locked);
    assert!(info.session_id.is_none());
}

#[tokio::test]
async fn test_lock_info_survives_dangling_holder() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "dangling").await;
    let session = register_session(&store, 4242).await;

    store.locks().lock(&workflow.id, &session.id).await.unwrap();
    let info = store.locks().get_lock_info(&workflow.id).await.unwrap();
    assert!(info.locked);
    assert_eq!(info.session_pid, Some(4242));

    store.sessions().deregister(&session.id).await.unwrap();
    let info = store.locks().get_lock_info(&workflow.id).await.unwrap();
    assert!(info.locked, "the holder id dangles until takeover");
    assert_eq!(info.session_id.as_deref(), Some(session.id.as_str()));
    assert_eq!(info.session_pid, None, "pid lookup tolerates the dangle");
}

#[tokio::test]
async fn test_release_stale_locks_by_heartbeat() {
    let store = test_store().await;
    let active_wf = create_workflow(&store, "active").await;
    let stale_wf = create_workflow(&store, "stale").await;
    let active = register_session(&store, 1).await;
    let idle = register_session(&store, 2).await;

    store.locks().lock(&active_wf.id, &active.id).await.unwrap();
    store.locks().lock(&stale_wf.id, &idle.id).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    store.sessions().heartbeat(&active.id).await.unwrap();

    let released = store.locks().release_stale_workflow_locks(20).await.unwrap();
    assert_eq!(released, 1);

    assert!(store.locks().get_lock_info(&active_wf.id).await.unwrap().locked);
    assert!(!store.locks().get_lock_info(&stale_wf.id).await.unwrap().locked);
}

#[tokio::test]
async fn test_lock_requires_existing_rows() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "strict").await;
    let session = register_session(&store, 7).await;

    let err = store
        .locks()
        .lock("wf_000000000000", &session.id)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = store
        .locks()
        .lock(&workflow.id, "ss_000000000000")
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = store.sessions().deregister("ss_000000000000").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
