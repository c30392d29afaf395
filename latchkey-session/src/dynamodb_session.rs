//! DynamoDB session storage implementation.
//!
//! This module requires the `dynamodb` feature flag.

use crate::error::{StoreError, StoreResult};
use crate::traits::{
    Condition, ExpiredPage, ExpiredSession, LockToken, SessionRecord, SessionStore,
};
use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

const DATA: &str = "data";
const EXPIRES: &str = "expires";
const LOCK_TOKEN: &str = "lock_token";
const LOCK_ACQUIRED: &str = "lock_acquired";
const VERSION: &str = "version";

type Item = HashMap<String, AttributeValue>;

/// Condition expression with its placeholder bindings.
struct Expression {
    text: String,
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

/// DynamoDB-backed session store.
///
/// `expires` is stored as unix seconds, so the attribute can double as the
/// table's TTL attribute.
///
/// # Feature Flag
///
/// ```toml
/// [dependencies]
/// latchkey-session = { version = "0.1", features = ["dynamodb"] }
/// ```
///
/// # Examples
///
/// ```ignore
/// use latchkey_session::{DynamoDbSessionStore, SessionConfig, SessionHandler};
/// use std::sync::Arc;
///
/// let client = aws_sdk_dynamodb::Client::new(&sdk_config);
/// let store = DynamoDbSessionStore::new(client, "sessions");
/// let handler = SessionHandler::new(Arc::new(store), SessionConfig::default())?;
/// ```
pub struct DynamoDbSessionStore {
    client: Client,
    table_name: String,
    hash_key: String,
    consistent_read: bool,
}

impl DynamoDbSessionStore {
    /// Create a store over an existing table keyed by `id`.
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            hash_key: "id".to_string(),
            consistent_read: true,
        }
    }

    /// Set the hash key attribute name.
    pub fn with_hash_key(mut self, hash_key: impl Into<String>) -> Self {
        self.hash_key = hash_key.into();
        self
    }

    /// Enable or disable strongly consistent reads.
    pub fn with_consistent_read(mut self, consistent_read: bool) -> Self {
        self.consistent_read = consistent_read;
        self
    }

    fn to_item(&self, record: &SessionRecord) -> Item {
        let mut item = HashMap::new();
        item.insert(self.hash_key.clone(), key_value(&record.id));
        item.insert(
            DATA.to_string(),
            AttributeValue::B(Blob::new(record.payload.clone())),
        );
        item.insert(
            EXPIRES.to_string(),
            AttributeValue::N(expires_secs(record.expires_at).to_string()),
        );
        item.insert(
            VERSION.to_string(),
            AttributeValue::N(record.version.to_string()),
        );
        if let Some(lock) = &record.lock {
            item.insert(LOCK_TOKEN.to_string(), AttributeValue::S(lock.token.clone()));
            item.insert(
                LOCK_ACQUIRED.to_string(),
                AttributeValue::N(lock.acquired_at.timestamp_millis().to_string()),
            );
        }
        item
    }

    fn from_item(&self, item: &Item) -> StoreResult<SessionRecord> {
        let id = item
            .get(&self.hash_key)
            .and_then(|v| v.as_s().ok())
            .cloned()
            .ok_or_else(|| malformed("missing hash key"))?;

        let payload = item
            .get(DATA)
            .and_then(|v| v.as_b().ok())
            .map(|b| b.as_ref().to_vec())
            .unwrap_or_default();

        let expires_at = number(item, EXPIRES)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| malformed("missing or invalid expires"))?;

        let version = number(item, VERSION).unwrap_or(0).max(0) as u64;

        let lock = match item.get(LOCK_TOKEN).and_then(|v| v.as_s().ok()) {
            Some(token) => Some(LockToken {
                token: token.clone(),
                acquired_at: number(item, LOCK_ACQUIRED)
                    .and_then(DateTime::from_timestamp_millis)
                    .ok_or_else(|| malformed("lock without acquisition time"))?,
            }),
            None => None,
        };

        Ok(SessionRecord {
            id,
            payload,
            expires_at,
            lock,
            version,
        })
    }

    fn expression(&self, condition: &Condition) -> Expression {
        let mut names = HashMap::new();
        let mut values = HashMap::new();

        let text = match condition {
            Condition::NotExists => {
                names.insert("#k".to_string(), self.hash_key.clone());
                "attribute_not_exists(#k)".to_string()
            }
            Condition::VersionEquals(version) => {
                names.insert("#v".to_string(), VERSION.to_string());
                values.insert(":v".to_string(), AttributeValue::N(version.to_string()));
                "#v = :v".to_string()
            }
            Condition::LockHeldBy(token) => {
                names.insert("#lt".to_string(), LOCK_TOKEN.to_string());
                values.insert(":lt".to_string(), AttributeValue::S(token.clone()));
                "#lt = :lt".to_string()
            }
        };

        Expression {
            text,
            names,
            values,
        }
    }
}

/// Expiry in whole seconds, rounded up so a record never reads as expired
/// before its time.
fn expires_secs(expires_at: DateTime<Utc>) -> i64 {
    expires_at.timestamp() + i64::from(expires_at.timestamp_subsec_nanos() > 0)
}

fn key_value(id: &str) -> AttributeValue {
    AttributeValue::S(id.to_string())
}

fn malformed(reason: &str) -> StoreError {
    StoreError::Unavailable(format!("Malformed session item: {}", reason))
}

fn number(item: &Item, name: &str) -> Option<i64> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
}

fn unavailable<E: std::error::Error>(err: E) -> StoreError {
    StoreError::Unavailable(DisplayErrorContext(err).to_string())
}

#[async_trait]
impl SessionStore for DynamoDbSessionStore {
    async fn get(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(&self.hash_key, key_value(id))
            .consistent_read(self.consistent_read)
            .send()
            .await
            .map_err(unavailable)?;

        output.item.as_ref().map(|item| self.from_item(item)).transpose()
    }

    async fn put(&self, record: &SessionRecord, condition: Option<&Condition>) -> StoreResult<()> {
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(self.to_item(record)));

        if let Some(condition) = condition {
            let expr = self.expression(condition);
            request = request
                .condition_expression(expr.text)
                .set_expression_attribute_names(Some(expr.names));
            if !expr.values.is_empty() {
                request = request.set_expression_attribute_values(Some(expr.values));
            }
        }

        match request.send().await {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                debug!("Conditional put rejected for {}", record.id);
                Err(StoreError::ConditionFailed)
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn delete(&self, id: &str, condition: Option<&Condition>) -> StoreResult<()> {
        let mut request = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key(&self.hash_key, key_value(id));

        if let Some(condition) = condition {
            let expr = self.expression(condition);
            request = request
                .condition_expression(expr.text)
                .set_expression_attribute_names(Some(expr.names));
            if !expr.values.is_empty() {
                request = request.set_expression_attribute_values(Some(expr.values));
            }
        }

        match request.send().await {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                debug!("Conditional delete rejected for {}", id);
                Err(StoreError::ConditionFailed)
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn scan_expired(
        &self,
        before: DateTime<Utc>,
        cursor: Option<&str>,
        limit: usize,
    ) -> StoreResult<ExpiredPage> {
        let start_key = cursor.map(|id| HashMap::from([(self.hash_key.clone(), key_value(id))]));

        // `data` is left out of the projection; collection never needs payloads
        let output = self
            .client
            .scan()
            .table_name(&self.table_name)
            .filter_expression("#e < :cutoff")
            .projection_expression("#k, #e, #v, #lt, #la")
            .expression_attribute_names("#k", &self.hash_key)
            .expression_attribute_names("#e", EXPIRES)
            .expression_attribute_names("#v", VERSION)
            .expression_attribute_names("#lt", LOCK_TOKEN)
            .expression_attribute_names("#la", LOCK_ACQUIRED)
            .expression_attribute_values(
                ":cutoff",
                AttributeValue::N(before.timestamp().to_string()),
            )
            .consistent_read(self.consistent_read)
            .limit(i32::try_from(limit.max(1)).unwrap_or(i32::MAX))
            .set_exclusive_start_key(start_key)
            .send()
            .await
            .map_err(unavailable)?;

        let sessions = output
            .items
            .unwrap_or_default()
            .iter()
            .map(|item| self.from_item(item).map(ExpiredSession::from))
            .collect::<StoreResult<Vec<_>>>()?;

        let next = match output.last_evaluated_key {
            Some(key) if !key.is_empty() => Some(
                key.get(&self.hash_key)
                    .and_then(|v| v.as_s().ok())
                    .cloned()
                    .ok_or_else(|| malformed("scan cursor without hash key"))?,
            ),
            _ => None,
        };
        if !sessions.is_empty() {
            debug!("Expiry scan returned {} sessions", sessions.len());
        }

        Ok(ExpiredPage { sessions, next })
    }
}
