use crate::clock::Clock;
use crate::error::RemoteError;
use crate::models::{ChangeEvent, ChangeKind, IssueStats, IssueStatus};
use crate::realtime::ResourceFamily;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::QueryBuilder;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

// Row selection: field equality, newest first, optional range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub eq: Vec<(String, Value)>,
    pub range: Option<(u32, u32)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.push((column.into(), value.into()));
        self
    }

    pub fn range(mut self, offset: u32, limit: u32) -> Self {
        self.range = Some((offset, limit));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Rows {
    pub data: Vec<Value>,
    // Rows matching the filter, ignoring the range.
    pub count: u64,
}

/// The remote data service, consumed as an opaque collaborator.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Rows, RemoteError>;

    async fn get(&self, table: &str, id: &str) -> Result<Value, RemoteError>;

    async fn insert(&self, table: &str, row: Value) -> Result<Value, RemoteError>;

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value, RemoteError>;

    async fn update_where(&self, table: &str, filter: &Filter, patch: Value) -> Result<u64, RemoteError>;

    async fn delete(&self, table: &str, id: &str) -> Result<Value, RemoteError>;

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, RemoteError>;
}

/// Document-per-row backend on SQLite. Each successful write is published as a
/// `ChangeEvent` on the broadcast channel that feeds realtime subscriptions.
#[derive(Clone)]
pub struct SqliteBackend {
    db: SqlitePool,
    events: broadcast::Sender<Arc<ChangeEvent>>,
    clock: Arc<dyn Clock>,
}

fn known_table(table: &str) -> Result<(), RemoteError> {
    ResourceFamily::from_table(table)
        .map(|_| ())
        .ok_or_else(|| RemoteError::not_found(format!("table '{table}'")))
}

fn as_object(value: Value, what: &str) -> Result<Map<String, Value>, RemoteError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(RemoteError::client(400, format!("{what} must be a JSON object"))),
    }
}

fn string_arg(args: &Value, name: &str) -> Result<String, RemoteError> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RemoteError::client(400, format!("argument '{name}' must be a string")))
}

fn parse_row(raw: &str) -> Result<Value, RemoteError> {
    serde_json::from_str(raw).map_err(|e| RemoteError::Transient(format!("corrupt row: {e}")))
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, table: &str, filter: &Filter) {
    qb.push(" WHERE table_name = ").push_bind(table.to_string());
    for (column, value) in &filter.eq {
        qb.push(" AND json_extract(data, ")
            .push_bind(format!("$.{column}"))
            .push(")");
        match value {
            Value::Null => {
                qb.push(" IS NULL");
            }
            Value::Bool(true) => {
                qb.push(" = 1");
            }
            // An absent flag reads as false.
            Value::Bool(false) => {
                qb.push(" IS NOT 1");
            }
            Value::Number(n) if n.is_i64() => {
                qb.push(" = ").push_bind(n.as_i64().unwrap_or_default());
            }
            Value::Number(n) => {
                qb.push(" = ").push_bind(n.as_f64().unwrap_or_default());
            }
            Value::String(s) => {
                qb.push(" = ").push_bind(s.clone());
            }
            other => {
                qb.push(" = ").push_bind(other.to_string());
            }
        }
    }
}

impl SqliteBackend {
    pub fn new(db: SqlitePool, events: broadcast::Sender<Arc<ChangeEvent>>, clock: Arc<dyn Clock>) -> Self {
        Self { db, events, clock }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn events(&self) -> &broadcast::Sender<Arc<ChangeEvent>> {
        &self.events
    }

    fn publish(&self, event_type: ChangeKind, table: &str, new: Option<Value>, old: Option<Value>) {
        let event = Arc::new(ChangeEvent {
            event_type,
            table: table.to_string(),
            new,
            old,
        });
        // No receivers is fine: nobody is subscribed yet.
        let _ = self.events.send(event);
    }

    // Deletes notifications past their expiry. Returns the number removed.
    pub async fn purge_expired_notifications(&self, now_ms: i64) -> Result<u64, RemoteError> {
        let result = sqlx::query(
            "DELETE FROM records WHERE table_name = 'notifications'
             AND json_extract(data, '$.expires_at') IS NOT NULL
             AND json_extract(data, '$.expires_at') < ?",
        )
        .bind(now_ms)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn issue_stats(&self) -> Result<Value, RemoteError> {
        let rows = sqlx::query_as::<_, (Option<String>, i64)>(
            "SELECT json_extract(data, '$.status'), COUNT(*) FROM records
             WHERE table_name = 'issues' GROUP BY json_extract(data, '$.status')",
        )
        .fetch_all(&self.db)
        .await?;

        let mut stats = IssueStats::aggregate(std::iter::empty());
        for (status, count) in rows {
            let status = status.unwrap_or_else(|| IssueStatus::Open.as_str().to_string());
            stats.total += count as u64;
            *stats.by_status.entry(status).or_default() += count as u64;
        }
        Ok(serde_json::to_value(stats)?)
    }

    /// Inserts a comment and bumps its issue's `comment_count` in one transaction.
    /// The increment happens in SQL, so concurrent comments never lose a count.
    async fn add_comment(&self, args: &Value) -> Result<Value, RemoteError> {
        let issue_id = string_arg(args, "issue_id")?;
        let user_id = string_arg(args, "user_id")?;
        let body = string_arg(args, "body")?;
        let now = self.clock.now_ms();
        let id = Uuid::new_v4().to_string();
        let comment = json!({
            "id": id,
            "issue_id": issue_id,
            "user_id": user_id,
            "body": body,
            "created_at": now,
            "updated_at": now,
        });

        // Writing first takes the database write lock for the whole transaction.
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO records (table_name, id, data, created_at, updated_at) VALUES ('comments', ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(comment.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // Dropping `tx` on a missing issue rolls the insert back.
        let (raw,) = sqlx::query_as::<_, (String,)>("SELECT data FROM records WHERE table_name = 'issues' AND id = ?")
            .bind(&issue_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RemoteError::not_found(format!("issues row {issue_id}")))?;
        let old = parse_row(&raw)?;

        let (raw,) = sqlx::query_as::<_, (String,)>(
            "UPDATE records
             SET data = json_set(data,
                     '$.comment_count', coalesce(json_extract(data, '$.comment_count'), 0) + 1,
                     '$.updated_at', ?),
                 updated_at = ?
             WHERE table_name = 'issues' AND id = ?
             RETURNING data",
        )
        .bind(now)
        .bind(now)
        .bind(&issue_id)
        .fetch_one(&mut *tx)
        .await?;
        let new = parse_row(&raw)?;
        tx.commit().await?;

        debug!(%issue_id, comment = %id, "comment added");
        self.publish(ChangeKind::Insert, "comments", Some(comment.clone()), None);
        self.publish(ChangeKind::Update, "issues", Some(new), Some(old));
        Ok(comment)
    }
}

#[async_trait]
impl RemoteBackend for SqliteBackend {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Rows, RemoteError> {
        known_table(table)?;

        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM records");
        push_filter(&mut count_qb, table, filter);
        let (count,): (i64,) = count_qb.build_query_as().fetch_one(&self.db).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT data FROM records");
        push_filter(&mut qb, table, filter);
        qb.push(" ORDER BY created_at DESC, id");
        if let Some((offset, limit)) = filter.range {
            qb.push(" LIMIT ")
                .push_bind(limit as i64)
                .push(" OFFSET ")
                .push_bind(offset as i64);
        }
        let raw: Vec<(String,)> = qb.build_query_as().fetch_all(&self.db).await?;
        let data = raw
            .iter()
            .map(|(r,)| parse_row(r))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Rows {
            data,
            count: count as u64,
        })
    }

    async fn get(&self, table: &str, id: &str) -> Result<Value, RemoteError> {
        known_table(table)?;
        let row = sqlx::query_as::<_, (String,)>("SELECT data FROM records WHERE table_name = ? AND id = ?")
            .bind(table)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        match row {
            Some((raw,)) => parse_row(&raw),
            None => Err(RemoteError::not_found(format!("{table} row {id}"))),
        }
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, RemoteError> {
        known_table(table)?;
        let mut map = as_object(row, "row")?;
        let now = self.clock.now_ms();
        let id = match map.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        map.insert("id".into(), Value::String(id.clone()));
        map.entry("created_at").or_insert(Value::from(now));
        map.insert("updated_at".into(), Value::from(now));
        let created_at = map.get("created_at").and_then(Value::as_i64).unwrap_or(now);
        let row = Value::Object(map);

        sqlx::query(
            "INSERT INTO records (table_name, id, data, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(table)
        .bind(&id)
        .bind(row.to_string())
        .bind(created_at)
        .bind(now)
        .execute(&self.db)
        .await?;

        debug!(table, %id, "row inserted");
        self.publish(ChangeKind::Insert, table, Some(row.clone()), None);
        Ok(row)
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value, RemoteError> {
        known_table(table)?;
        let patch = as_object(patch, "patch")?;
        let now = self.clock.now_ms();

        let mut tx = self.db.begin().await?;
        let (raw,) = sqlx::query_as::<_, (String,)>("SELECT data FROM records WHERE table_name = ? AND id = ?")
            .bind(table)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RemoteError::not_found(format!("{table} row {id}")))?;
        let old = parse_row(&raw)?;
        let mut map = as_object(old.clone(), "row")?;
        for (k, v) in patch {
            if k != "id" {
                map.insert(k, v);
            }
        }
        map.insert("updated_at".into(), Value::from(now));
        let new = Value::Object(map);

        sqlx::query("UPDATE records SET data = ?, updated_at = ? WHERE table_name = ? AND id = ?")
            .bind(new.to_string())
            .bind(now)
            .bind(table)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.publish(ChangeKind::Update, table, Some(new.clone()), Some(old));
        Ok(new)
    }

    async fn update_where(&self, table: &str, filter: &Filter, patch: Value) -> Result<u64, RemoteError> {
        let unbounded = Filter {
            range: None,
            ..filter.clone()
        };
        let rows = self.select(table, &unbounded).await?;
        let mut updated = 0;
        for row in rows.data {
            let Some(id) = row.get("id").and_then(Value::as_str) else {
                continue;
            };
            self.update(table, id, patch.clone()).await?;
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<Value, RemoteError> {
        let old = self.get(table, id).await?;
        sqlx::query("DELETE FROM records WHERE table_name = ? AND id = ?")
            .bind(table)
            .bind(id)
            .execute(&self.db)
            .await?;
        self.publish(ChangeKind::Delete, table, None, Some(old.clone()));
        Ok(old)
    }

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, RemoteError> {
        match name {
            "get_issue_stats" => self.issue_stats().await,
            "add_comment" => self.add_comment(&args).await,
            other => {
                info!(rpc = other, "unknown rpc requested");
                Err(RemoteError::not_found(format!("rpc '{other}'")))
            }
        }
    }
}
