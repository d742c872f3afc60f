//! Error taxonomy and the bounded error store.
//!
//! Every reliability decision (retry eligibility, recovery plan matching,
//! escalation) keys off [`ErrorType`]. Errors surfaced by foreign code are
//! classified heuristically from their display text.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    Validation,
    Execution,
    Timeout,
    Integration,
    Permission,
    Resource,
    Network,
    Business,
    System,
    Unknown,
}

impl ErrorType {
    /// Default severity when the reporter does not supply one
    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            ErrorType::System | ErrorType::Permission => ErrorSeverity::Critical,
            ErrorType::Execution | ErrorType::Integration => ErrorSeverity::High,
            ErrorType::Timeout | ErrorType::Network => ErrorSeverity::Medium,
            _ => ErrorSeverity::Low,
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorType::Validation => "validation",
            ErrorType::Execution => "execution",
            ErrorType::Timeout => "timeout",
            ErrorType::Integration => "integration",
            ErrorType::Permission => "permission",
            ErrorType::Resource => "resource",
            ErrorType::Network => "network",
            ErrorType::Business => "business",
            ErrorType::System => "system",
            ErrorType::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A classified failure observed during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowError {
    pub id: Uuid,
    pub error_type: ErrorType,
    pub severity: ErrorSeverity,
    pub message: String,
    pub context: Value,
    pub attempt: u32,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            error_type,
            severity: error_type.default_severity(),
            message: message.into(),
            context: Value::Null,
            attempt: 0,
            recoverable: true,
            timestamp: Utc::now(),
        }
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn not_recoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }

    /// Classify a foreign error from its display text
    pub fn classify<E: fmt::Display>(error: &E) -> Self {
        let text = error.to_string();
        Self::new(classify_text(&text), text)
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)
    }
}

impl std::error::Error for WorkflowError {}

fn classify_text(text: &str) -> ErrorType {
    let lower = text.to_lowercase();
    if lower.contains("connection refused")
        || lower.contains("econnrefused")
        || lower.contains("etimedout")
        || lower.contains("dns")
        || lower.contains("socket")
    {
        ErrorType::Network
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ErrorType::Timeout
    } else if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("permission")
    {
        ErrorType::Permission
    } else if lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("bad gateway")
        || lower.contains("upstream")
    {
        ErrorType::Integration
    } else if lower.contains("out of memory")
        || lower.contains("disk full")
        || lower.contains("no space")
        || lower.contains("resource")
    {
        ErrorType::Resource
    } else if lower.contains("invalid") || lower.contains("validation") {
        ErrorType::Validation
    } else {
        ErrorType::Unknown
    }
}

/// Bounded in-memory record of observed errors, oldest evicted first
#[derive(Clone)]
pub struct ErrorStore {
    entries: Arc<RwLock<VecDeque<WorkflowError>>>,
    capacity: usize,
}

impl ErrorStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            capacity,
        }
    }

    pub fn record(&self, error: WorkflowError) {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(error);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn recent(&self, count: usize) -> Vec<WorkflowError> {
        let entries = self.entries.read();
        entries.iter().rev().take(count).cloned().collect()
    }

    pub fn counts_by_type(&self) -> HashMap<ErrorType, usize> {
        let entries = self.entries.read();
        let mut counts = HashMap::new();
        for entry in entries.iter() {
            *counts.entry(entry.error_type).or_insert(0) += 1;
        }
        counts
    }

    /// Drop entries older than the cutoff
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.timestamp >= cutoff);
        before - entries.len()
    }
}

impl Default for ErrorStore {
    fn default() -> Self {
        Self::new(1000)
    }
}
