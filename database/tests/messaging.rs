mod common;

use caw_core::models::{
    AgentStatus, BroadcastInput, MessageFilter, MessagePriority, MessageStatus, NewMessage,
    RecipientFilter,
};
use common::*;

fn message_to(recipient: &str, sender: Option<&str>, body: &str) -> NewMessage {
    NewMessage {
        sender_id: sender.map(str::to_string),
        recipient_id: recipient.to_string(),
        message_type: "info".to_string(),
        subject: Some("subject".to_string()),
        body: body.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_send_and_thread_inheritance() {
    let store = test_store().await;
    let alice = register_agent(&store, "alice").await;
    let bob = register_agent(&store, "bob").await;

    let first = store
        .messages()
        .send(message_to(&bob.id, Some(&alice.id), "hello"))
        .await
        .unwrap();
    assert_eq!(first.status, MessageStatus::Unread);
    assert_eq!(first.priority, MessagePriority::Normal);
    assert!(!first.thread_id.is_empty());

    let reply = store
        .messages()
        .send(NewMessage {
            reply_to_id: Some(first.id.clone()),
            ..message_to(&alice.id, Some(&bob.id), "hi back")
        })
        .await
        .unwrap();
    assert_eq!(reply.thread_id, first.thread_id, "replies inherit the thread");

    let unrelated = store
        .messages()
        .send(message_to(&bob.id, Some(&alice.id), "new topic"))
        .await
        .unwrap();
    assert_ne!(unrelated.thread_id, first.thread_id);

    let thread = store.messages().get_thread(&first.thread_id).await.unwrap();
    assert_eq!(thread.len(), 2);
    assert_eq!(thread[0].body, "hello", "threads read oldest-first");

    // System messages have no sender.
    let system = store
        .messages()
        .send(message_to(&bob.id, None, "maintenance window"))
        .await
        .unwrap();
    assert!(system.sender_id.is_none());

    // Unknown recipients and senders are rejected.
    let err = store
        .messages()
        .send(message_to("ag_000000000000", Some(&alice.id), "x"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_broadcast_shares_one_thread_and_skips_sender() {
    let store = test_store().await;
    let sender = register_agent(&store, "sender").await;
    let receiver_a = register_agent(&store, "ra").await;
    let receiver_b = register_agent(&store, "rb").await;

    let outcome = store
        .messages()
        .broadcast(BroadcastInput {
            sender_id: sender.id.clone(),
            message_type: "announcement".to_string(),
            body: "stand-up in five".to_string(),
            priority: Some(MessagePriority::High),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome.sent_count, 2);
    assert_eq!(outcome.message_ids.len(), 2);

    for receiver in [&receiver_a, &receiver_b] {
        let inbox = store
            .messages()
            .list(&receiver.id, MessageFilter::default())
            .await
            .unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].thread_id, outcome.thread_id);
        assert_eq!(inbox[0].priority, MessagePriority::High);
    }
    let own_inbox = store
        .messages()
        .list(&sender.id, MessageFilter::default())
        .await
        .unwrap();
    assert!(own_inbox.is_empty(), "the sender is excluded");

    // Empty status filter array resolves to zero recipients.
    let empty = store
        .messages()
        .broadcast(BroadcastInput {
            sender_id: sender.id.clone(),
            recipient_filter: RecipientFilter {
                status: Some(vec![]),
                ..Default::default()
            },
            message_type: "announcement".to_string(),
            body: "to nobody".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(empty.sent_count, 0);

    // Status filters bind: only online agents receive.
    store.agents().unregister(&receiver_b.id).await.unwrap();
    let online_only = store
        .messages()
        .broadcast(BroadcastInput {
            sender_id: sender.id.clone(),
            recipient_filter: RecipientFilter {
                status: Some(vec![AgentStatus::Online]),
                ..Default::default()
            },
            message_type: "announcement".to_string(),
            body: "who is left".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(online_only.sent_count, 1);
}

#[tokio::test]
async fn test_mark_read_counts_only_transitions() {
    let store = test_store().await;
    let alice = register_agent(&store, "alice").await;
    let bob = register_agent(&store, "bob").await;

    let m1 = store
        .messages()
        .send(message_to(&bob.id, Some(&alice.id), "one"))
        .await
        .unwrap();
    let m2 = store
        .messages()
        .send(message_to(&bob.id, Some(&alice.id), "two"))
        .await
        .unwrap();

    let ids = vec![m1.id.clone(), m2.id.clone()];
    assert_eq!(store.messages().mark_read(&ids).await.unwrap(), 2);
    assert_eq!(store.messages().mark_read(&ids).await.unwrap(), 0, "idempotent");
    assert_eq!(store.messages().mark_read(&[]).await.unwrap(), 0);

    // get(mark_read) preserves the first read timestamp.
    let read = store.messages().get(&m1.id, true).await.unwrap();
    let first_read_at = read.read_at.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let read_again = store.messages().get(&m1.id, true).await.unwrap();
    assert_eq!(read_again.read_at.unwrap(), first_read_at);

    assert_eq!(store.messages().archive(&ids).await.unwrap(), 2);
    assert_eq!(store.messages().archive(&ids).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unread_counts_by_priority() {
    let store = test_store().await;
    let alice = register_agent(&store, "alice").await;
    let bob = register_agent(&store, "bob").await;

    for (priority, body) in [
        (MessagePriority::Urgent, "now"),
        (MessagePriority::Urgent, "right now"),
        (MessagePriority::Low, "whenever"),
    ] {
        store
            .messages()
            .send(NewMessage {
                priority: Some(priority),
                ..message_to(&bob.id, Some(&alice.id), body)
            })
            .await
            .unwrap();
    }
    let read_one = store
        .messages()
        .send(message_to(&bob.id, Some(&alice.id), "seen"))
        .await
        .unwrap();
    store.messages().get(&read_one.id, true).await.unwrap();

    let counts = store.messages().count_unread(&bob.id, None).await.unwrap();
    assert_eq!(counts.count, 3, "read messages are excluded");
    assert_eq!(counts.by_priority.get("urgent"), Some(&2));
    assert_eq!(counts.by_priority.get("low"), Some(&1));

    let urgent_only = store
        .messages()
        .count_unread(&bob.id, Some(&[MessagePriority::Urgent]))
        .await
        .unwrap();
    assert_eq!(urgent_only.count, 2);

    let none = store
        .messages()
        .count_unread(&bob.id, Some(&[]))
        .await
        .unwrap();
    assert_eq!(none.count, 0);
}

#[tokio::test]
async fn test_list_filters_and_ordering() {
    let store = test_store().await;
    let alice = register_agent(&store, "alice").await;
    let bob = register_agent(&store, "bob").await;

    for i in 0..3 {
        store
            .messages()
            .send(message_to(&bob.id, Some(&alice.id), &format!("m{i}")))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let inbox = store
        .messages()
        .list(&bob.id, MessageFilter::default())
        .await
        .unwrap();
    assert_eq!(inbox.len(), 3);
    assert_eq!(inbox[0].body, "m2", "newest first");

    let limited = store
        .messages()
        .list(
            &bob.id,
            MessageFilter {
                limit: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);

    // Explicit empty filters return nothing.
    let none = store
        .messages()
        .list(
            &bob.id,
            MessageFilter {
                status: Some(vec![]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(none.is_empty());

    let typed = store
        .messages()
        .list(
            &bob.id,
            MessageFilter {
                message_type: Some("nonexistent".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(typed.is_empty());
}
