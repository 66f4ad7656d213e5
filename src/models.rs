use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl IssueStatus {
    pub const ALL: [IssueStatus; 4] = [
        IssueStatus::Open,
        IssueStatus::InProgress,
        IssueStatus::Resolved,
        IssueStatus::Closed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Resolved => "resolved",
            IssueStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub status: IssueStatus,
    pub reporter_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub comment_count: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub issue_id: String,
    pub user_id: String,
    pub body: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}

impl IssueStats {
    // Client-side aggregation, used when the stats RPC is unavailable.
    pub fn aggregate<'a>(issues: impl IntoIterator<Item = &'a Issue>) -> Self {
        let mut stats = IssueStats::default();
        for status in IssueStatus::ALL {
            stats.by_status.insert(status.as_str().to_string(), 0);
        }
        for issue in issues {
            stats.total += 1;
            *stats
                .by_status
                .entry(issue.status.as_str().to_string())
                .or_default() += 1;
        }
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssueFilter {
    #[serde(default)]
    pub status: Option<IssueStatus>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

impl Default for IssueFilter {
    fn default() -> Self {
        Self {
            status: None,
            category: None,
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl IssueFilter {
    pub fn offset(&self) -> u32 {
        self.page.saturating_sub(1) * self.page_size
    }

    pub fn accepts(&self, issue: &Issue) -> bool {
        self.status.map_or(true, |s| s == issue.status)
            && self
                .category
                .as_deref()
                .map_or(true, |c| c == issue.category)
    }
}

// One page of a list query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    IssueUpdate,
    Comment,
    Solution,
    VerificationApproved,
    VerificationRejected,
    RoleChanged,
    System,
    #[serde(other)]
    Generic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    #[serde(default)]
    pub priority: Priority,
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub read_at: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub issue_id: Option<String>,
    #[serde(default)]
    pub comment_id: Option<String>,
    #[serde(default)]
    pub solution_id: Option<String>,
    pub created_at: i64,
}

impl NotificationRecord {
    // Past `expires_at` a record is hidden from active views, even while still stored.
    pub fn is_active(&self, now_ms: i64) -> bool {
        self.expires_at.map_or(true, |at| at > now_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

// Row change pushed by the backend's change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    pub table: String,
    #[serde(default)]
    pub new: Option<serde_json::Value>,
    #[serde(default)]
    pub old: Option<serde_json::Value>,
}

impl ChangeEvent {
    // The record the event is about: the new row, or the old one on delete.
    pub fn record(&self) -> Option<&serde_json::Value> {
        self.new.as_ref().or(self.old.as_ref())
    }

    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.record()
            .and_then(|r| r.get(field))
            .and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateIssueRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    pub reporter_id: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: IssueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCommentRequest {
    pub user_id: String,
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitCheckRequest {
    pub action: String,
    pub identifier: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitRecordRequest {
    pub action: String,
    pub identifier: String,
    #[serde(default)]
    pub success: bool,
}

// Read envelope handed to UI collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct QueryEnvelope<T> {
    pub data: Option<T>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeMessage {
    pub family: String,
    #[serde(default)]
    pub filter: Option<crate::realtime::ChannelFilter>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastEvent {
    pub event_type: String,
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn issue(status: IssueStatus) -> Issue {
        Issue {
            id: "i".into(),
            title: "t".into(),
            description: String::new(),
            category: "roads".into(),
            status,
            reporter_id: "u".into(),
            location: None,
            comment_count: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn aggregate_counts_every_status() {
        let issues = [
            issue(IssueStatus::Open),
            issue(IssueStatus::Open),
            issue(IssueStatus::Resolved),
        ];
        let stats = IssueStats::aggregate(&issues);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status["open"], 2);
        assert_eq!(stats.by_status["resolved"], 1);
        assert_eq!(stats.by_status["closed"], 0);
    }

    #[test]
    fn unknown_notification_types_are_generic() {
        let record: NotificationRecord = serde_json::from_value(json!({
            "id": "n1", "user_id": "u1", "type": "mystery", "title": "hi", "created_at": 1
        }))
        .unwrap();
        assert_eq!(record.kind, NotificationType::Generic);
        assert_eq!(record.priority, Priority::Normal);
        assert!(!record.read);
    }

    #[test]
    fn expired_records_are_inactive() {
        let mut record: NotificationRecord = serde_json::from_value(json!({
            "id": "n1", "user_id": "u1", "type": "system", "title": "hi", "created_at": 1
        }))
        .unwrap();
        assert!(record.is_active(10));
        record.expires_at = Some(5);
        assert!(!record.is_active(10));
        assert!(record.is_active(4));
    }

    #[test]
    fn change_event_uses_backend_field_names() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "eventType": "DELETE", "table": "issues", "old": {"id": "i1"}
        }))
        .unwrap();
        assert_eq!(event.event_type, ChangeKind::Delete);
        assert_eq!(event.field_str("id"), Some("i1"));
    }
}
