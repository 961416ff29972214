use std::collections::BTreeMap;

use caw_core::error::Result;
use caw_core::events::{Event, EventType};
use caw_core::models::{
    BroadcastInput, BroadcastOutcome, Message, MessageFilter, MessagePriority, MessageStatus,
    NewMessage, UnreadCount,
};
use caw_core::{ids, IdKind, Validate};
use chrono::Utc;
use serde_json::json;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use crate::common::{
    db_err, fetch_agent, fetch_message, row_to_agent, row_to_message, AGENT_COLUMNS,
    MESSAGE_COLUMNS,
};
use crate::store::Store;

/// Threaded, priority-tagged inter-agent messaging with unread tracking.
#[derive(Clone)]
pub struct MessageService {
    store: Store,
}

impl MessageService {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Send one message. A reply inherits its parent's thread; an
    /// originating message gets a fresh thread id.
    pub async fn send(&self, input: NewMessage) -> Result<Message> {
        Validate::non_empty("message_type", &input.message_type)?;
        Validate::non_empty("body", &input.body)?;

        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        fetch_agent(&mut tx, &input.recipient_id).await?;
        if let Some(sender_id) = &input.sender_id {
            fetch_agent(&mut tx, sender_id).await?;
        }
        let thread_id = match &input.reply_to_id {
            Some(reply_to_id) => fetch_message(&mut tx, reply_to_id).await?.thread_id,
            None => ids::generate(IdKind::Message),
        };

        let message = insert_message_tx(&mut tx, &input, &thread_id).await?;
        tx.commit().await.map_err(db_err)?;

        self.emit_message_new(&message);
        Ok(message)
    }

    /// Fan one message out to every agent matching the filter, excluding
    /// the sender. All copies share a single thread id. An explicit empty
    /// status filter resolves to zero recipients.
    pub async fn broadcast(&self, input: BroadcastInput) -> Result<BroadcastOutcome> {
        Validate::non_empty("message_type", &input.message_type)?;
        Validate::non_empty("body", &input.body)?;

        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        fetch_agent(&mut tx, &input.sender_id).await?;

        let thread_id = ids::generate(IdKind::Message);
        let mut recipients: Vec<String> = Vec::new();
        let empty_filter =
            matches!(&input.recipient_filter.status, Some(statuses) if statuses.is_empty());
        if !empty_filter {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id != "));
            builder.push_bind(input.sender_id.clone());
            if let Some(statuses) = &input.recipient_filter.status {
                builder.push(" AND status IN (");
                let mut separated = builder.separated(", ");
                for status in statuses {
                    separated.push_bind(status.as_str());
                }
                builder.push(")");
            }
            if let Some(role) = input.recipient_filter.role {
                builder.push(" AND role = ");
                builder.push_bind(role.as_str());
            }
            if let Some(runtime) = &input.recipient_filter.runtime {
                builder.push(" AND runtime = ");
                builder.push_bind(runtime.clone());
            }
            builder.push(" ORDER BY created_at, id");
            let rows = builder.build().fetch_all(&mut *tx).await.map_err(db_err)?;
            recipients = rows
                .iter()
                .map(row_to_agent)
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .map(|agent| agent.id)
                .collect();
        }

        let mut messages = Vec::with_capacity(recipients.len());
        for recipient_id in &recipients {
            let message = insert_message_tx(
                &mut tx,
                &NewMessage {
                    sender_id: Some(input.sender_id.clone()),
                    recipient_id: recipient_id.clone(),
                    message_type: input.message_type.clone(),
                    subject: input.subject.clone(),
                    body: input.body.clone(),
                    priority: input.priority,
                    reply_to_id: None,
                    workflow_id: input.workflow_id.clone(),
                    task_id: input.task_id.clone(),
                    expires_at: None,
                },
                &thread_id,
            )
            .await?;
            messages.push(message);
        }
        tx.commit().await.map_err(db_err)?;

        self.store
            .events()
            .emit_all(messages.iter().map(message_new_event).collect());
        tracing::info!(
            sender_id = %input.sender_id,
            sent_count = messages.len(),
            thread_id = %thread_id,
            "broadcast sent"
        );
        Ok(BroadcastOutcome {
            sent_count: messages.len(),
            thread_id,
            message_ids: messages.into_iter().map(|m| m.id).collect(),
        })
    }

    /// A recipient's messages, newest first, id as the tiebreak. Explicit
    /// empty status/priority sets match nothing.
    pub async fn list(&self, agent_id: &str, filter: MessageFilter) -> Result<Vec<Message>> {
        if matches!(&filter.status, Some(statuses) if statuses.is_empty())
            || matches!(&filter.priority, Some(priorities) if priorities.is_empty())
        {
            return Ok(Vec::new());
        }

        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        fetch_agent(&mut conn, agent_id).await?;

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE recipient_id = "
        ));
        builder.push_bind(agent_id);
        if let Some(statuses) = &filter.status {
            builder.push(" AND status IN (");
            let mut separated = builder.separated(", ");
            for status in statuses {
                separated.push_bind(status.as_str());
            }
            builder.push(")");
        }
        if let Some(message_type) = &filter.message_type {
            builder.push(" AND message_type = ");
            builder.push_bind(message_type.clone());
        }
        if let Some(priorities) = &filter.priority {
            builder.push(" AND priority IN (");
            let mut separated = builder.separated(", ");
            for priority in priorities {
                separated.push_bind(priority.as_str());
            }
            builder.push(")");
        }
        if let Some(thread_id) = &filter.thread_id {
            builder.push(" AND thread_id = ");
            builder.push_bind(thread_id.clone());
        }
        if let Some(workflow_id) = &filter.workflow_id {
            builder.push(" AND workflow_id = ");
            builder.push_bind(workflow_id.clone());
        }
        if let Some(since) = filter.since {
            builder.push(" AND created_at >= ");
            builder.push_bind(since);
        }
        builder.push(" ORDER BY created_at DESC, id LIMIT ");
        builder.push_bind(filter.limit.unwrap_or(20).max(0));

        let rows = builder
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_message).collect()
    }

    /// Fetch one message, optionally marking it read. The first read
    /// timestamp is preserved on subsequent reads.
    pub async fn get(&self, message_id: &str, mark_read: bool) -> Result<Message> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let mut message = fetch_message(&mut tx, message_id).await?;
        if mark_read && message.status == MessageStatus::Unread {
            let now = Utc::now();
            sqlx::query("UPDATE messages SET status = ?, read_at = ? WHERE id = ?")
                .bind(MessageStatus::Read.as_str())
                .bind(now)
                .bind(message_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            message.status = MessageStatus::Read;
            message.read_at = Some(now);
        }
        tx.commit().await.map_err(db_err)?;
        Ok(message)
    }

    /// Mark currently-unread messages read; returns how many actually
    /// transitioned.
    pub async fn mark_read(&self, message_ids: &[String]) -> Result<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE messages SET status = 'read', read_at = ");
        builder.push_bind(Utc::now());
        builder.push(" WHERE status = 'unread' AND id IN (");
        let mut separated = builder.separated(", ");
        for id in message_ids {
            separated.push_bind(id.clone());
        }
        builder.push(")");

        let result = builder
            .build()
            .execute(self.store.pool())
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    /// Archive non-archived messages; returns how many transitioned.
    pub async fn archive(&self, message_ids: &[String]) -> Result<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE messages SET status = 'archived' WHERE status != 'archived' AND id IN (");
        let mut separated = builder.separated(", ");
        for id in message_ids {
            separated.push_bind(id.clone());
        }
        builder.push(")");

        let result = builder
            .build()
            .execute(self.store.pool())
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    /// Unread totals for an agent, overall and per priority
    pub async fn count_unread(
        &self,
        agent_id: &str,
        priority_filter: Option<&[MessagePriority]>,
    ) -> Result<UnreadCount> {
        if matches!(priority_filter, Some(priorities) if priorities.is_empty()) {
            return Ok(UnreadCount {
                count: 0,
                by_priority: BTreeMap::new(),
            });
        }

        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        fetch_agent(&mut conn, agent_id).await?;

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT priority, COUNT(*) AS unread_count FROM messages \
             WHERE status = 'unread' AND recipient_id = ",
        );
        builder.push_bind(agent_id);
        if let Some(priorities) = priority_filter {
            builder.push(" AND priority IN (");
            let mut separated = builder.separated(", ");
            for priority in priorities {
                separated.push_bind(priority.as_str());
            }
            builder.push(")");
        }
        builder.push(" GROUP BY priority");

        let rows = builder
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;
        let mut count = 0i64;
        let mut by_priority = BTreeMap::new();
        for row in &rows {
            let priority: String = row.get("priority");
            let unread: i64 = row.get("unread_count");
            count += unread;
            by_priority.insert(priority, unread);
        }
        Ok(UnreadCount { count, by_priority })
    }

    /// A whole thread in chronological order
    pub async fn get_thread(&self, thread_id: &str) -> Result<Vec<Message>> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ? \
             ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(thread_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_message).collect()
    }

    fn emit_message_new(&self, message: &Message) {
        self.store.events().emit(message_new_event(message));
    }
}

fn message_new_event(message: &Message) -> Event {
    Event::new(
        EventType::MessageNew,
        json!({
            "message_id": message.id,
            "agent_id": message.recipient_id,
            "sender_id": message.sender_id,
            "thread_id": message.thread_id,
            "priority": message.priority.as_str(),
            "workflow_id": message.workflow_id,
        }),
    )
}

async fn insert_message_tx(
    conn: &mut SqliteConnection,
    input: &NewMessage,
    thread_id: &str,
) -> Result<Message> {
    let message = Message {
        id: ids::generate(IdKind::Message),
        sender_id: input.sender_id.clone(),
        recipient_id: input.recipient_id.clone(),
        message_type: input.message_type.clone(),
        subject: input.subject.clone(),
        body: input.body.clone(),
        priority: input.priority.unwrap_or(MessagePriority::Normal),
        status: MessageStatus::Unread,
        thread_id: thread_id.to_string(),
        reply_to_id: input.reply_to_id.clone(),
        workflow_id: input.workflow_id.clone(),
        task_id: input.task_id.clone(),
        created_at: Utc::now(),
        read_at: None,
        expires_at: input.expires_at,
    };
    sqlx::query(
        "INSERT INTO messages (id, sender_id, recipient_id, message_type, subject, body, \
         priority, status, thread_id, reply_to_id, workflow_id, task_id, created_at, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(&message.sender_id)
    .bind(&message.recipient_id)
    .bind(&message.message_type)
    .bind(&message.subject)
    .bind(&message.body)
    .bind(message.priority.as_str())
    .bind(message.status.as_str())
    .bind(&message.thread_id)
    .bind(&message.reply_to_id)
    .bind(&message.workflow_id)
    .bind(&message.task_id)
    .bind(message.created_at)
    .bind(message.expires_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(message)
}
