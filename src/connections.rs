//! Seams to the credential resolver and the task-completion service.
//!
//! Both are external collaborators of the coordinator; the traits keep the
//! execute driver testable and let deployments plug their own resolution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::{ConnectionAuth, RunConnection, RunId, TaskId};
use crate::store::CoordinatorStore;

#[derive(Debug, thiserror::Error)]
#[error("could not resolve connection {key:?}: {message}")]
pub struct CredentialError {
    pub key: String,
    pub message: String,
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Materialise `{integration key → auth}` for every run connection.
    async fn resolve(
        &self,
        connections: &[RunConnection],
    ) -> Result<HashMap<String, ConnectionAuth>, CredentialError>;
}

/// Resolver that reads the auth payload already stored on the connection
/// row. Connections without a stored credential fail resolution.
pub struct StoredCredentialResolver;

#[async_trait]
impl CredentialResolver for StoredCredentialResolver {
    async fn resolve(
        &self,
        connections: &[RunConnection],
    ) -> Result<HashMap<String, ConnectionAuth>, CredentialError> {
        let mut resolved = HashMap::with_capacity(connections.len());
        for connection in connections {
            let auth = connection.auth.clone().ok_or_else(|| CredentialError {
                key: connection.key.clone(),
                message: "no credential materialised".to_string(),
            })?;
            let auth: ConnectionAuth =
                serde_json::from_value(auth).map_err(|err| CredentialError {
                    key: connection.key.clone(),
                    message: err.to_string(),
                })?;
            resolved.insert(connection.key.clone(), auth);
        }
        Ok(resolved)
    }
}

#[async_trait]
pub trait TaskCompletionService: Send + Sync {
    async fn complete_task(
        &self,
        run_id: RunId,
        task_id: TaskId,
        properties: Option<Value>,
        output: Option<Value>,
    ) -> anyhow::Result<()>;
}

/// Completion service backed directly by the coordinator store.
pub struct StoreTaskCompletionService {
    store: Arc<dyn CoordinatorStore>,
}

impl StoreTaskCompletionService {
    pub fn new(store: Arc<dyn CoordinatorStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskCompletionService for StoreTaskCompletionService {
    async fn complete_task(
        &self,
        _run_id: RunId,
        task_id: TaskId,
        properties: Option<Value>,
        output: Option<Value>,
    ) -> anyhow::Result<()> {
        self.store
            .complete_task(task_id, output, properties)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn connection(key: &str, auth: Option<Value>) -> RunConnection {
        RunConnection {
            id: Uuid::new_v4(),
            key: key.to_string(),
            auth,
        }
    }

    #[tokio::test]
    async fn resolves_stored_credentials_by_key() {
        let connections = vec![
            connection(
                "github",
                Some(json!({"type": "oauth2", "accessToken": "gh-token"})),
            ),
            connection(
                "slack",
                Some(json!({
                    "type": "oauth2",
                    "accessToken": "slack-token",
                    "additionalFields": {"team": "t1"}
                })),
            ),
        ];
        let resolved = StoredCredentialResolver
            .resolve(&connections)
            .await
            .expect("resolve");
        assert_eq!(resolved["github"].access_token, "gh-token");
        assert_eq!(
            resolved["slack"].additional_fields,
            Some(json!({"team": "t1"}))
        );
    }

    #[tokio::test]
    async fn missing_credential_fails_with_the_key() {
        let err = StoredCredentialResolver
            .resolve(&[connection("stripe", None)])
            .await
            .expect_err("should fail");
        assert_eq!(err.key, "stripe");
    }
}
