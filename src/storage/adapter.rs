//! JSON document adapter shared by the built-in backends.

use serde::Serialize;

use super::{AdapterError, Query, StorageAdapter};
use crate::device::Reading;

/// Document stored for one reading.
#[derive(Debug, Serialize)]
struct ReadingDocument<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    measurement: Option<&'a str>,
    device_id: &'a str,
    timestamp: String,
    values: &'a std::collections::HashMap<String, serde_json::Value>,
}

/// Turns a reading into a JSON document query.
#[derive(Debug, Clone, Default)]
pub struct JsonAdapter {
    measurement: Option<String>,
}

impl JsonAdapter {
    /// Tag every document with a measurement name.
    pub fn with_measurement(measurement: impl Into<String>) -> Self {
        Self {
            measurement: Some(measurement.into()),
        }
    }
}

impl StorageAdapter for JsonAdapter {
    fn prepare_query(&self, reading: &Reading) -> Result<Query, AdapterError> {
        if reading.values.is_empty() {
            return Err(AdapterError::UnsupportedReading {
                device_id: reading.device_id.clone(),
                reason: "reading carries no values".to_string(),
            });
        }

        let document = ReadingDocument {
            measurement: self.measurement.as_deref(),
            device_id: &reading.device_id,
            timestamp: reading.timestamp.to_rfc3339(),
            values: &reading.values,
        };

        Ok(Query::new(
            reading.device_id.clone(),
            serde_json::to_value(document)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prepare_query_document_shape() {
        let reading = Reading::new("temp-1").with_value("reading", json!(21.5));
        let query = JsonAdapter::default().prepare_query(&reading).unwrap();

        assert_eq!(query.device_id(), "temp-1");
        let body = query.body();
        assert_eq!(body["device_id"], "temp-1");
        assert_eq!(body["values"]["reading"], 21.5);
        assert!(body.get("measurement").is_none());
        assert!(body["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_prepare_query_with_measurement() {
        let reading = Reading::new("temp-1").with_value("reading", json!(1));
        let query = JsonAdapter::with_measurement("environment")
            .prepare_query(&reading)
            .unwrap();
        assert_eq!(query.body()["measurement"], "environment");
    }

    #[test]
    fn test_prepare_query_rejects_empty_reading() {
        let reading = Reading::new("temp-1");
        let err = JsonAdapter::default().prepare_query(&reading).unwrap_err();
        assert!(err.to_string().contains("no values"));
    }
}
