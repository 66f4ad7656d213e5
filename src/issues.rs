use crate::backend::{Filter, RemoteBackend};
use crate::cache::Patch;
use crate::clock::Clock;
use crate::error::{MutationError, QueryError, RemoteError};
use crate::keys::{self, KeyPart, QueryKey};
use crate::models::{
    Comment, CreateCommentRequest, CreateIssueRequest, Issue, IssueFilter, IssueStats, IssueStatus, Page,
};
use crate::mutation::{temp_id, MutationCoordinator, MutationOptions};
use crate::query::{fetcher, Loaded, QueryCacheManager};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

const ISSUES: &str = "issues";
const COMMENTS: &str = "comments";

fn row_filter(filter: &IssueFilter) -> Filter {
    let mut rows = Filter::new();
    if let Some(status) = filter.status {
        rows = rows.eq("status", status.as_str());
    }
    if let Some(category) = &filter.category {
        rows = rows.eq("category", category.clone());
    }
    rows.range(filter.offset(), filter.page_size)
}

// Copy of `item` with `fields` overwritten; `None` unless `item` is an object.
fn with_fields(item: &Value, fields: &[(&'static str, Value)]) -> Option<Value> {
    let mut next = item.clone();
    let map = next.as_object_mut()?;
    for (name, value) in fields {
        map.insert((*name).to_string(), value.clone());
    }
    Some(next)
}

// Rewrites the items of a cached page. `None` when no item changed.
fn map_page_items(page: &Value, f: impl Fn(&Value) -> Option<Value>) -> Option<Value> {
    let items = page.get("items")?.as_array()?;
    let mut changed = false;
    let next: Vec<Value> = items
        .iter()
        .map(|item| match f(item) {
            Some(v) => {
                changed = true;
                v
            }
            None => item.clone(),
        })
        .collect();
    if !changed {
        return None;
    }
    let mut page = page.clone();
    page["items"] = Value::Array(next);
    Some(page)
}

fn replace_item(page: &Value, id: &str, with: &Value) -> Option<Value> {
    map_page_items(page, |item| (item["id"] == id).then(|| with.clone()))
}

fn part_allows(part: &KeyPart, value: &str) -> bool {
    match part {
        KeyPart::Null => true,
        KeyPart::Str(s) => s == value,
        _ => false,
    }
}

// Page size of a first-page list key whose filter admits the issue.
fn first_page_admitting(key: &QueryKey, status: IssueStatus, category: &str) -> Option<usize> {
    match key.parts() {
        [_, _, s, c, KeyPart::Int(1), KeyPart::Int(size)]
            if part_allows(s, status.as_str()) && part_allows(c, category) =>
        {
            Some(*size as usize)
        }
        _ => None,
    }
}

async fn fetch_stats(backend: Arc<dyn RemoteBackend>) -> Result<Value, RemoteError> {
    match backend.rpc("get_issue_stats", json!({})).await {
        Ok(stats) => Ok(stats),
        Err(e) => {
            warn!(error = %e, "stats rpc failed, aggregating client-side");
            let rows = backend.select(ISSUES, &Filter::new()).await?;
            let issues = rows
                .data
                .into_iter()
                .map(serde_json::from_value::<Issue>)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(serde_json::to_value(IssueStats::aggregate(&issues))?)
        }
    }
}

/// Read and write flows for the issue family.
#[derive(Clone)]
pub struct IssueService {
    backend: Arc<dyn RemoteBackend>,
    mutations: MutationCoordinator,
    clock: Arc<dyn Clock>,
}

impl IssueService {
    pub fn new(backend: Arc<dyn RemoteBackend>, mutations: MutationCoordinator, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            mutations,
            clock,
        }
    }

    pub fn cache(&self) -> &QueryCacheManager {
        self.mutations.cache()
    }

    pub async fn list(&self, filter: &IssueFilter) -> Result<Loaded<Page<Issue>>, QueryError> {
        let backend = self.backend.clone();
        let owned = filter.clone();
        let fetch = fetcher(move || {
            let backend = backend.clone();
            let rows = row_filter(&owned);
            async move {
                let page = backend.select(ISSUES, &rows).await?;
                Ok(json!({ "items": page.data, "total": page.count }))
            }
        });
        self.cache().query(keys::issues::list(filter), fetch).await?.load()
    }

    pub async fn detail(&self, id: &str) -> Result<Loaded<Issue>, QueryError> {
        let backend = self.backend.clone();
        let owned = id.to_string();
        let fetch = fetcher(move || {
            let backend = backend.clone();
            let id = owned.clone();
            async move { backend.get(ISSUES, &id).await }
        });
        self.cache().query(keys::issues::detail(id), fetch).await?.load()
    }

    // Oldest first.
    pub async fn comments(&self, issue_id: &str) -> Result<Loaded<Vec<Comment>>, QueryError> {
        let backend = self.backend.clone();
        let owned = issue_id.to_string();
        let fetch = fetcher(move || {
            let backend = backend.clone();
            let rows = Filter::new().eq("issue_id", owned.clone());
            async move {
                let mut found = backend.select(COMMENTS, &rows).await?.data;
                found.reverse();
                Ok(Value::Array(found))
            }
        });
        self.cache().query(keys::issues::comments(issue_id), fetch).await?.load()
    }

    pub async fn stats(&self) -> Result<Loaded<IssueStats>, QueryError> {
        let backend = self.backend.clone();
        let fetch = fetcher(move || fetch_stats(backend.clone()));
        self.cache().query(keys::issues::stats(), fetch).await?.load()
    }

    /// Shows the issue at the top of every cached first page it belongs to under a
    /// temporary id, then swaps in the server row.
    pub async fn create(&self, request: CreateIssueRequest) -> Result<Issue, MutationError> {
        let now = self.clock.now_ms();
        let temp = temp_id();
        let category = request.category.clone();

        let mut row = json!({
            "title": request.title,
            "description": request.description,
            "category": request.category,
            "status": IssueStatus::Open,
            "reporter_id": request.reporter_id,
            "comment_count": 0,
        });
        if let Some(location) = request.location {
            row["location"] = Value::from(location);
        }
        let mut optimistic = row.clone();
        optimistic["id"] = Value::from(temp.as_str());
        optimistic["created_at"] = Value::from(now);
        optimistic["updated_at"] = Value::from(now);

        let prepend = Patch::prefix(keys::issues::lists(), move |key, current| {
            let size = first_page_admitting(key, IssueStatus::Open, &category)?;
            let mut page = current?.clone();
            let items = page.get_mut("items")?.as_array_mut()?;
            items.insert(0, optimistic.clone());
            items.truncate(size);
            if let Some(total) = page.get("total").and_then(Value::as_u64) {
                page["total"] = Value::from(total + 1);
            }
            Some(page)
        });

        let options = MutationOptions::new("create-issue")
            .patch(prepend)
            .reconcile(move |_, current, server| replace_item(current, &temp, server))
            .invalidates(keys::issues::stats());

        let backend = self.backend.clone();
        let outcome = self
            .mutations
            .mutate(options, async move {
                let created = backend.insert(ISSUES, row).await?;
                Ok::<Issue, RemoteError>(serde_json::from_value(created)?)
            })
            .await?;
        Ok(outcome.value)
    }

    pub async fn update_status(&self, id: &str, status: IssueStatus) -> Result<Issue, MutationError> {
        let fields = vec![
            ("status", json!(status)),
            ("updated_at", Value::from(self.clock.now_ms())),
        ];
        let detail_key = keys::issues::detail(id);

        let detail_fields = fields.clone();
        let list_id = id.to_string();
        let reconciled_key = detail_key.clone();
        let options = MutationOptions::new("update-issue-status")
            .patch(Patch::exact(detail_key, move |_, current| {
                with_fields(current?, &detail_fields)
            }))
            .patch(Patch::prefix(keys::issues::lists(), move |_, current| {
                map_page_items(current?, |item| {
                    if item["id"] == list_id.as_str() {
                        with_fields(item, &fields)
                    } else {
                        None
                    }
                })
            }))
            .reconcile(move |key, _, server| (*key == reconciled_key).then(|| server.clone()))
            // Filtered lists may gain or lose the issue.
            .invalidates(keys::issues::lists())
            .invalidates(keys::issues::stats());

        let backend = self.backend.clone();
        let id = id.to_string();
        let outcome = self
            .mutations
            .mutate(options, async move {
                let updated = backend.update(ISSUES, &id, json!({ "status": status })).await?;
                Ok::<Issue, RemoteError>(serde_json::from_value(updated)?)
            })
            .await?;
        Ok(outcome.value)
    }

    pub async fn add_comment(&self, issue_id: &str, request: CreateCommentRequest) -> Result<Comment, MutationError> {
        let temp = temp_id();
        let optimistic = json!({
            "id": temp,
            "issue_id": issue_id,
            "user_id": request.user_id,
            "body": request.body,
            "created_at": self.clock.now_ms(),
        });
        let comments_key = keys::issues::comments(issue_id);
        let reconciled_key = comments_key.clone();

        let options = MutationOptions::new("add-comment")
            .patch(Patch::exact(comments_key, move |_, current| {
                let mut items = current?.as_array()?.clone();
                items.push(optimistic.clone());
                Some(Value::Array(items))
            }))
            .patch(Patch::exact(keys::issues::detail(issue_id), |_, current| {
                let current = current?;
                let count = current.get("comment_count").and_then(Value::as_u64).unwrap_or(0);
                with_fields(current, &[("comment_count", Value::from(count + 1))])
            }))
            .reconcile(move |key, current, server| {
                if *key != reconciled_key {
                    return None;
                }
                let items = current.as_array()?;
                Some(Value::Array(
                    items
                        .iter()
                        .map(|c| if c["id"] == temp.as_str() { server.clone() } else { c.clone() })
                        .collect(),
                ))
            })
            .invalidates(keys::issues::lists());

        let backend = self.backend.clone();
        let issue_id = issue_id.to_string();
        let outcome = self
            .mutations
            .mutate(options, async move {
                // Insert and count bump commit together on the backend.
                let created = backend
                    .rpc(
                        "add_comment",
                        json!({ "issue_id": issue_id, "user_id": request.user_id, "body": request.body }),
                    )
                    .await?;
                Ok::<Comment, RemoteError>(serde_json::from_value(created)?)
            })
            .await?;
        Ok(outcome.value)
    }
}
