//! Core types for the change fan-out.

use crate::error::{FanoutError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A database row as delivered by the provider (column name to JSON value).
pub type Row = serde_json::Map<String, Value>;

/// Tables recognized in the default `public` schema.
pub const KNOWN_TABLES: &[&str] = &[
    "profiles",
    "inquiries",
    "messages",
    "projects",
    "system_activities",
    "invoices",
    "team_members",
    "forms",
    "form_submissions",
    "api_keys",
    "integrations",
    "settings",
];

/// Kind of row change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Insert => "INSERT",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row change, in the uniform shape handed to listeners.
///
/// `new` is `None` on DELETE and `old` is `None` on INSERT.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub new: Option<Row>,
    pub old: Option<Row>,
    #[serde(rename = "eventType")]
    pub event_type: EventType,
}

/// Provider payload for one postgres change, as pushed on a channel.
#[derive(Deserialize)]
struct WirePayload {
    #[serde(rename = "eventType")]
    event_type: EventType,
    #[serde(default)]
    new: Option<Row>,
    #[serde(default)]
    old: Option<Row>,
    #[serde(default)]
    errors: Option<Value>,
}

impl ChangeEvent {
    pub fn insert(new: Row) -> Self {
        Self {
            new: Some(new),
            old: None,
            event_type: EventType::Insert,
        }
    }

    pub fn update(new: Row, old: Option<Row>) -> Self {
        Self {
            new: Some(new),
            old,
            event_type: EventType::Update,
        }
    }

    pub fn delete(old: Row) -> Self {
        Self {
            new: None,
            old: Some(old),
            event_type: EventType::Delete,
        }
    }

    /// Decode a provider payload.
    ///
    /// The provider encodes an absent row as `{}`; that is normalized to
    /// `None`. INSERT and UPDATE must carry a `new` row.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let wire = WirePayload::deserialize(payload).map_err(|e| FanoutError::Decode(e.to_string()))?;

        if let Some(errors) = &wire.errors {
            let reported = match errors {
                Value::Null => false,
                Value::Array(items) => !items.is_empty(),
                _ => true,
            };
            if reported {
                return Err(FanoutError::Decode(format!("provider reported errors: {}", errors)));
            }
        }

        let new = wire.new.filter(|row| !row.is_empty());
        let old = wire.old.filter(|row| !row.is_empty());

        match wire.event_type {
            EventType::Insert => {
                let new = new.ok_or_else(|| FanoutError::Decode("INSERT without new row".into()))?;
                Ok(Self::insert(new))
            }
            EventType::Update => {
                let new = new.ok_or_else(|| FanoutError::Decode("UPDATE without new row".into()))?;
                Ok(Self::update(new, old))
            }
            EventType::Delete => Ok(Self {
                new: None,
                old,
                event_type: EventType::Delete,
            }),
        }
    }

    /// Encode into the provider's wire shape for `schema.table`.
    pub fn to_payload(&self, schema: &str, table: &TableName) -> Value {
        json!({
            "schema": schema,
            "table": table.as_str(),
            "commit_timestamp": Value::Null,
            "eventType": self.event_type,
            "new": self.new.clone().unwrap_or_default(),
            "old": self.old.clone().unwrap_or_default(),
            "errors": Value::Null,
        })
    }

    /// The row the change is about: `new` when present, else `old`.
    pub fn row(&self) -> Option<&Row> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// A change re-published on the aggregate dashboard topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DashboardEvent {
    #[serde(rename = "type")]
    pub table: TableName,
    pub data: ChangeEvent,
}

/// Payload delivered to fan-out listeners.
///
/// Table topics carry `Change`; the dashboard topic carries `Dashboard`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FanoutEvent {
    Dashboard(DashboardEvent),
    Change(ChangeEvent),
}

impl FanoutEvent {
    /// The underlying change, whichever topic this arrived on.
    pub fn change(&self) -> &ChangeEvent {
        match self {
            FanoutEvent::Dashboard(event) => &event.data,
            FanoutEvent::Change(change) => change,
        }
    }

    pub fn as_dashboard(&self) -> Option<&DashboardEvent> {
        match self {
            FanoutEvent::Dashboard(event) => Some(event),
            FanoutEvent::Change(_) => None,
        }
    }
}

/// Name of a logical event stream.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Default name of the aggregate topic.
    pub const DASHBOARD: &'static str = "dashboard";

    pub fn new(name: impl Into<String>) -> Self {
        Topic(name.into())
    }

    pub fn dashboard() -> Self {
        Topic(Self::DASHBOARD.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic(name.to_string())
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Topic(name)
    }
}

impl From<&TableName> for Topic {
    fn from(table: &TableName) -> Self {
        Topic(table.0.clone())
    }
}

impl From<TableName> for Topic {
    fn from(table: TableName) -> Self {
        Topic(table.0)
    }
}

/// A table name resolved against a [`Schema`].
///
/// Deserializing checks the name against the default schema; names from a
/// custom schema must come from [`Schema::table`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TableName(String);

impl<'de> Deserialize<'de> for TableName {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Schema::default()
            .table(&name)
            .map_err(serde::de::Error::custom)
    }
}

impl TableName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableName({})", self.0)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for TableName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for TableName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// The set of tables change feeds may be opened on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    name: String,
    tables: BTreeSet<String>,
}

impl Schema {
    pub fn new<I, S>(name: impl Into<String>, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    /// Resolve a table name, rejecting tables outside the schema.
    pub fn table(&self, table: &str) -> Result<TableName> {
        if self.contains(table) {
            Ok(TableName(table.to_string()))
        } else {
            Err(FanoutError::UnknownTable(format!("{}.{}", self.name, table)))
        }
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new("public", KNOWN_TABLES.iter().copied())
    }
}

/// Comparison operator of a [`RowFilter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::In => "in",
        }
    }
}

impl FromStr for FilterOp {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "eq" => Ok(FilterOp::Eq),
            "neq" => Ok(FilterOp::Neq),
            "lt" => Ok(FilterOp::Lt),
            "lte" => Ok(FilterOp::Lte),
            "gt" => Ok(FilterOp::Gt),
            "gte" => Ok(FilterOp::Gte),
            "in" => Ok(FilterOp::In),
            other => Err(FanoutError::InvalidFilter(format!("unknown operator '{}'", other))),
        }
    }
}

/// Narrows a table feed to rows whose `column` satisfies `op value`.
///
/// Renders to the provider's `column=op.value` syntax; `in` takes a
/// parenthesized list such as `(a,b,c)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl RowFilter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Equality filter, the common case.
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }

    /// Parse `column=op.value`.
    pub fn parse(filter: &str) -> Result<Self> {
        let (column, rest) = filter
            .split_once('=')
            .ok_or_else(|| FanoutError::InvalidFilter(format!("missing '=' in '{}'", filter)))?;
        let (op, value) = rest
            .split_once('.')
            .ok_or_else(|| FanoutError::InvalidFilter(format!("missing operator in '{}'", filter)))?;
        let parsed = Self::new(column.trim(), op.parse()?, value);
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.column.is_empty() || self.column.contains('=') {
            return Err(FanoutError::InvalidFilter(format!(
                "invalid column name '{}'",
                self.column
            )));
        }
        if self.op == FilterOp::In {
            let list = self.value.trim();
            if !(list.starts_with('(') && list.ends_with(')')) || self.in_values().is_empty() {
                return Err(FanoutError::InvalidFilter(format!(
                    "'in' expects a list like (a,b), got '{}'",
                    self.value
                )));
            }
        }
        Ok(())
    }

    /// Evaluate the filter against a row. A missing column never matches.
    pub fn matches(&self, row: &Row) -> bool {
        let Some(field) = row.get(&self.column).map(field_text) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => compare(&field, &self.value) == Ordering::Equal,
            FilterOp::Neq => compare(&field, &self.value) != Ordering::Equal,
            FilterOp::In => self
                .in_values()
                .iter()
                .any(|v| compare(&field, v) == Ordering::Equal),
            FilterOp::Lt => compare(&field, &self.value) == Ordering::Less,
            FilterOp::Lte => compare(&field, &self.value) != Ordering::Greater,
            FilterOp::Gt => compare(&field, &self.value) == Ordering::Greater,
            FilterOp::Gte => compare(&field, &self.value) != Ordering::Less,
        }
    }

    fn in_values(&self) -> Vec<&str> {
        self.value
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')')
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect()
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.{}", self.column, self.op.as_str(), self.value)
    }
}

fn field_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric when both sides parse as numbers, lexicographic otherwise.
fn compare(field: &str, value: &str) -> Ordering {
    match (field.parse::<f64>(), value.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or_else(|| field.cmp(value)),
        _ => field.cmp(value),
    }
}

/// What a provider channel is opened on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSpec {
    pub schema: String,
    pub table: TableName,
    /// Event kinds to receive; `*` for all.
    pub event: String,
    pub filter: Option<RowFilter>,
}

impl ChannelSpec {
    pub fn new(schema: impl Into<String>, table: TableName) -> Self {
        Self {
            schema: schema.into(),
            table,
            event: "*".to_string(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Option<RowFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Channel name, unique per table and filter.
    pub fn channel_name(&self) -> String {
        match &self.filter {
            Some(filter) => format!("realtime:{}:{}:{}", self.schema, self.table, filter),
            None => format!("realtime:{}:{}", self.schema, self.table),
        }
    }
}

/// Lifecycle status reported by a provider channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Joining,
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    /// Whether the channel failed to establish or broke.
    pub fn is_failure(&self) -> bool {
        matches!(self, ChannelStatus::ChannelError | ChannelStatus::TimedOut)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelStatus::Joining => "JOINING",
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::ChannelError => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
            ChannelStatus::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

type TeardownFn = Box<dyn FnOnce() + Send>;

/// A dispose action that runs at most once.
///
/// Returned by table subscriptions and listener registrations. Calling
/// [`Teardown::close`] again after the first call does nothing.
pub struct Teardown {
    action: Mutex<Option<TeardownFn>>,
}

impl Teardown {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// A teardown that has nothing to release.
    pub fn noop() -> Self {
        Self {
            action: Mutex::new(None),
        }
    }

    pub fn close(&self) {
        // Taken under the lock, run outside it.
        let action = self.action.lock().take();
        if let Some(action) = action {
            action();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.action.lock().is_none()
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn inquiries() -> TableName {
        Schema::default().table("inquiries").unwrap()
    }

    #[test]
    fn test_decode_insert_normalizes_empty_old() {
        let payload = json!({
            "schema": "public",
            "table": "inquiries",
            "commit_timestamp": "2024-01-01T00:00:00Z",
            "eventType": "INSERT",
            "new": {"id": 1, "status": "open"},
            "old": {},
            "errors": null
        });

        let event = ChangeEvent::from_payload(&payload).unwrap();
        assert_eq!(event.event_type, EventType::Insert);
        assert_eq!(event.new, Some(row(json!({"id": 1, "status": "open"}))));
        assert!(event.old.is_none());
    }

    #[test]
    fn test_decode_delete_drops_new() {
        let payload = json!({
            "eventType": "DELETE",
            "new": {},
            "old": {"id": 7}
        });

        let event = ChangeEvent::from_payload(&payload).unwrap();
        assert_eq!(event.event_type, EventType::Delete);
        assert!(event.new.is_none());
        assert_eq!(event.old, Some(row(json!({"id": 7}))));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let missing_type = json!({"new": {"id": 1}});
        assert!(matches!(
            ChangeEvent::from_payload(&missing_type),
            Err(FanoutError::Decode(_))
        ));

        let bad_type = json!({"eventType": "TRUNCATE", "new": {"id": 1}});
        assert!(ChangeEvent::from_payload(&bad_type).is_err());

        let insert_without_row = json!({"eventType": "INSERT", "new": {}, "old": {}});
        assert!(ChangeEvent::from_payload(&insert_without_row).is_err());

        let with_errors = json!({"eventType": "UPDATE", "new": {"id": 1}, "errors": ["boom"]});
        assert!(ChangeEvent::from_payload(&with_errors).is_err());
    }

    #[test]
    fn test_wire_payload_decodes_back() {
        let event = ChangeEvent::update(row(json!({"id": 2, "n": 3})), Some(row(json!({"id": 2}))));
        let payload = event.to_payload("public", &inquiries());

        assert_eq!(payload["table"], "inquiries");
        assert_eq!(payload["eventType"], "UPDATE");
        assert_eq!(ChangeEvent::from_payload(&payload).unwrap(), event);
    }

    #[test]
    fn test_fanout_event_json_shapes() {
        let change = ChangeEvent::insert(row(json!({"id": "u1"})));
        let as_json = serde_json::to_value(FanoutEvent::Change(change.clone())).unwrap();
        assert_eq!(as_json, json!({"new": {"id": "u1"}, "old": null, "eventType": "INSERT"}));

        let dashboard = FanoutEvent::Dashboard(DashboardEvent {
            table: Schema::default().table("profiles").unwrap(),
            data: change,
        });
        let as_json = serde_json::to_value(&dashboard).unwrap();
        assert_eq!(
            as_json,
            json!({"type": "profiles", "data": {"new": {"id": "u1"}, "old": null, "eventType": "INSERT"}})
        );

        let parsed: FanoutEvent = serde_json::from_value(as_json).unwrap();
        assert_eq!(parsed, dashboard);
    }

    #[test]
    fn test_schema_resolves_known_tables_only() {
        let schema = Schema::default();
        assert_eq!(schema.table("messages").unwrap().as_str(), "messages");
        assert!(matches!(
            schema.table("users"),
            Err(FanoutError::UnknownTable(name)) if name == "public.users"
        ));
    }

    #[test]
    fn test_row_filter_parse_and_display() {
        let filter = RowFilter::parse("owner_id=eq.42").unwrap();
        assert_eq!(filter, RowFilter::eq("owner_id", "42"));
        assert_eq!(filter.to_string(), "owner_id=eq.42");

        let filter = RowFilter::parse("status=in.(open,closed)").unwrap();
        assert_eq!(filter.op, FilterOp::In);

        assert!(RowFilter::parse("status").is_err());
        assert!(RowFilter::parse("status=like.x").is_err());
        assert!(RowFilter::parse("=eq.1").is_err());
        assert!(RowFilter::parse("status=in.open").is_err());
    }

    #[test]
    fn test_row_filter_matches() {
        let r = row(json!({"id": 10, "status": "open", "name": "b"}));

        assert!(RowFilter::eq("id", "10").matches(&r));
        assert!(!RowFilter::eq("id", "11").matches(&r));
        assert!(RowFilter::new("id", FilterOp::Neq, "11").matches(&r));
        assert!(RowFilter::new("id", FilterOp::Gt, "9").matches(&r));
        assert!(!RowFilter::new("id", FilterOp::Lt, "9.5").matches(&r));
        assert!(RowFilter::new("id", FilterOp::Lte, "10").matches(&r));
        assert!(RowFilter::new("name", FilterOp::Gte, "a").matches(&r));
        assert!(RowFilter::new("status", FilterOp::In, "(open, pending)").matches(&r));
        assert!(!RowFilter::eq("missing", "x").matches(&r));
    }

    #[test]
    fn test_row_filter_equality_is_numeric() {
        let r = row(json!({"id": 10.0}));

        assert!(RowFilter::eq("id", "10").matches(&r));
        assert!(!RowFilter::new("id", FilterOp::Neq, "10").matches(&r));
        assert!(RowFilter::new("id", FilterOp::In, "(10,11)").matches(&r));

        // Non-numeric text still compares exactly.
        let r = row(json!({"status": "NaN"}));
        assert!(!RowFilter::eq("status", "5").matches(&r));
        assert!(RowFilter::eq("status", "NaN").matches(&r));
    }

    #[test]
    fn test_table_name_deserialize_validates() {
        let name: TableName = serde_json::from_value(json!("inquiries")).unwrap();
        assert_eq!(name, "inquiries");

        assert!(serde_json::from_value::<TableName>(json!("audit_log")).is_err());
        assert!(serde_json::from_value::<TableName>(json!("")).is_err());

        let forged = json!({"type": "users; drop", "data": {"new": {"id": 1}, "old": null, "eventType": "INSERT"}});
        assert!(serde_json::from_value::<DashboardEvent>(forged).is_err());
    }

    #[test]
    fn test_channel_name_includes_filter() {
        let spec = ChannelSpec::new("public", inquiries());
        assert_eq!(spec.channel_name(), "realtime:public:inquiries");
        assert_eq!(spec.event, "*");

        let spec = spec.with_filter(Some(RowFilter::eq("id", "5")));
        assert_eq!(spec.channel_name(), "realtime:public:inquiries:id=eq.5");
    }

    #[test]
    fn test_teardown_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let teardown = Teardown::new(move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });

        assert!(!teardown.is_closed());
        teardown.close();
        teardown.close();
        assert!(teardown.is_closed());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);

        let noop = Teardown::noop();
        assert!(noop.is_closed());
        noop.close();
    }
}
