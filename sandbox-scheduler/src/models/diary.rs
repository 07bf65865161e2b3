use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What happened while one URL of a MassURL block was open
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct URLDiary {
    pub id: Uuid,
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub requested_urls: Vec<Value>,
    #[serde(default)]
    pub javascript: Vec<String>,
    #[serde(default)]
    pub signatures: Vec<Value>,
}

impl URLDiary {
    pub fn new(url: impl Into<String>, sha256: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            sha256,
            timestamp: Utc::now(),
            requested_urls: Vec::new(),
            javascript: Vec::new(),
            signatures: Vec::new(),
        }
    }

    pub fn add_signatures(&mut self, signatures: &[Value]) {
        self.signatures.extend_from_slice(signatures);
    }
}
