use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use omniq_core::errors::{OmniqError, OmniqResult};

use crate::task::{ExecutionError, Task, TaskPriority};

/// Declares a task kind: its defaults and retry budget. Submissions for
/// unregistered kinds are rejected at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDefinition {
    pub kind: String,
    pub default_priority: TaskPriority,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
}

impl TaskDefinition {
    pub fn validate(&self) -> OmniqResult<()> {
        if self.kind.is_empty() {
            return Err(OmniqError::validation("task kind cannot be empty"));
        }
        if self.timeout_seconds == 0 {
            return Err(OmniqError::validation(format!(
                "task kind {}: timeout must be positive",
                self.kind
            )));
        }
        if self.max_attempts == 0 {
            return Err(OmniqError::validation(format!(
                "task kind {}: at least one attempt is required",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Per-attempt execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub tenant_id: String,
    pub attempt: u32,
    /// Cancelled when the attempt deadline passes or the pool drains.
    pub cancellation: CancellationToken,
}

/// Executes one attempt of a task. Implementations report failure class
/// through `ExecutionError` so the pool can decide between retry and
/// dead-letter.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(
        &self,
        task: &Task,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, ExecutionError>;
}

struct RegisteredKind {
    definition: TaskDefinition,
    handler: Arc<dyn TaskHandler>,
}

/// Registry of known task kinds. Re-registering an identical definition is
/// a no-op; a conflicting one is rejected.
#[derive(Default)]
pub struct TaskRegistry {
    kinds: RwLock<HashMap<String, RegisteredKind>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        definition: TaskDefinition,
        handler: Arc<dyn TaskHandler>,
    ) -> OmniqResult<()> {
        definition.validate()?;
        let mut kinds = self
            .kinds
            .write()
            .map_err(|_| OmniqError::Internal("task registry lock poisoned".to_string()))?;
        if let Some(existing) = kinds.get(&definition.kind) {
            if existing.definition == definition {
                return Ok(());
            }
            return Err(OmniqError::validation(format!(
                "task kind {} is already registered with a different definition",
                definition.kind
            )));
        }
        kinds.insert(
            definition.kind.clone(),
            RegisteredKind {
                definition,
                handler,
            },
        );
        Ok(())
    }

    pub fn definition(&self, kind: &str) -> OmniqResult<TaskDefinition> {
        let kinds = self
            .kinds
            .read()
            .map_err(|_| OmniqError::Internal("task registry lock poisoned".to_string()))?;
        kinds
            .get(kind)
            .map(|k| k.definition.clone())
            .ok_or_else(|| OmniqError::validation(format!("unregistered task kind: {kind}")))
    }

    pub fn handler(&self, kind: &str) -> OmniqResult<Arc<dyn TaskHandler>> {
        let kinds = self
            .kinds
            .read()
            .map_err(|_| OmniqError::Internal("task registry lock poisoned".to_string()))?;
        kinds
            .get(kind)
            .map(|k| Arc::clone(&k.handler))
            .ok_or_else(|| OmniqError::validation(format!("unregistered task kind: {kind}")))
    }

    pub fn kinds(&self) -> Vec<String> {
        match self.kinds.read() {
            Ok(kinds) => {
                let mut names: Vec<String> = kinds.keys().cloned().collect();
                names.sort();
                names
            }
            Err(_) => Vec::new(),
        }
    }
}
