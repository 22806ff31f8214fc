//! Request and response envelopes exchanged with embedding workers.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One input record. Only `id` is interpreted; everything else is passed to
/// the worker untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EmbeddingRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Attach an extra field, e.g. `title` or `description`.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub records: Vec<EmbeddingRecord>,
}

impl EmbeddingRequest {
    pub fn new(records: Vec<EmbeddingRecord>) -> Self {
        Self { records }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEmbedding {
    pub id: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub data: Vec<RecordEmbedding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl EmbeddingResponse {
    pub fn success(data: Vec<RecordEmbedding>) -> Self {
        Self {
            status: ResponseStatus::Success,
            data,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            data: Vec::new(),
            message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_flattens_extra_fields() {
        let record = EmbeddingRecord::new("/123/abc")
            .with_field("title", vec!["Mona Lisa"])
            .with_field("creator", vec!["Leonardo"]);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "/123/abc");
        assert_eq!(json["title"][0], "Mona Lisa");
        assert_eq!(json["creator"][0], "Leonardo");
    }

    #[test]
    fn test_request_serializes_on_one_line() {
        let request = EmbeddingRequest::new(vec![
            EmbeddingRecord::new("a").with_field("description", "line one\nline two"),
        ]);
        let line = serde_json::to_string(&request).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.starts_with(r#"{"records":["#));
    }

    #[test]
    fn test_parse_success_response() {
        let line = r#"{"status": "success", "data": [{"id": "a", "embedding": [0.1, 0.2]}, {"id": "b", "embedding": [0.3, 0.4]}]}"#;
        let response: EmbeddingResponse = serde_json::from_str(line).unwrap();
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.data.len(), 2);
        assert_eq!(response.data[0].id, "a");
        assert_eq!(response.data[1].embedding, vec![0.3, 0.4]);
        assert!(response.message.is_none());
    }

    #[test]
    fn test_parse_error_response() {
        let line = r#"{"status": "error", "message": "Too many records (max is 500)"}"#;
        let response: EmbeddingResponse = serde_json::from_str(line).unwrap();
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(response.data.is_empty());
        assert_eq!(
            response.message.as_deref(),
            Some("Too many records (max is 500)")
        );
    }

    #[test]
    fn test_status_is_matched_exactly() {
        let line = r#"{"status": "ERROR: something"}"#;
        assert!(serde_json::from_str::<EmbeddingResponse>(line).is_err());
    }
}
