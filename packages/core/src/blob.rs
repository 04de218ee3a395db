//! Blob references carried in queue message bodies.

use serde::{Deserialize, Serialize};

/// Location of a result file in blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobReference {
    /// Bucket (or container) holding the object.
    pub bucket: String,
    /// Object key within the bucket.
    pub key: String,
}

/// Errors raised while reading a blob reference out of a message body.
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("message body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message body does not reference a blob: {0}")]
    MissingReference(String),
}

/// Accepted body shapes: a plain `{bucket, key}` object, or an S3 event
/// notification whose first record names the object.
#[derive(Deserialize)]
#[serde(untagged)]
enum Body {
    Direct {
        bucket: String,
        key: String,
    },
    Notification {
        #[serde(rename = "Records")]
        records: Vec<NotificationRecord>,
    },
}

#[derive(Deserialize)]
struct NotificationRecord {
    s3: NotificationEntity,
}

#[derive(Deserialize)]
struct NotificationEntity {
    bucket: NamedBucket,
    object: NamedObject,
}

#[derive(Deserialize)]
struct NamedBucket {
    name: String,
}

#[derive(Deserialize)]
struct NamedObject {
    key: String,
}

impl BlobReference {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse the blob reference out of a JSON message body.
    pub fn from_message_body(body: &str) -> Result<Self, BodyError> {
        let reference = match serde_json::from_str::<Body>(body)? {
            Body::Direct { bucket, key } => Self { bucket, key },
            Body::Notification { records } => {
                let record = records.into_iter().next().ok_or_else(|| {
                    BodyError::MissingReference("notification has no records".into())
                })?;
                Self {
                    bucket: record.s3.bucket.name,
                    key: record.s3.object.key,
                }
            }
        };

        if reference.bucket.trim().is_empty() || reference.key.trim().is_empty() {
            return Err(BodyError::MissingReference(
                "bucket and key must not be empty".into(),
            ));
        }

        Ok(reference)
    }

    /// Render this reference as a message body.
    pub fn to_message_body(&self) -> String {
        serde_json::json!({ "bucket": self.bucket, "key": self.key }).to_string()
    }
}

impl std::fmt::Display for BlobReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_direct_body() -> Result<(), BodyError> {
        let reference =
            BlobReference::from_message_body(r#"{"bucket":"results","key":"2024/final.csv"}"#)?;
        assert_eq!(reference, BlobReference::new("results", "2024/final.csv"));
        Ok(())
    }

    #[test]
    fn parses_s3_notification_body() -> Result<(), BodyError> {
        let body = r#"{"Records":[{"eventName":"ObjectCreated:Put","s3":{"bucket":{"name":"scores"},"object":{"key":"week-1.json","size":42}}}]}"#;
        let reference = BlobReference::from_message_body(body)?;
        assert_eq!(reference.bucket, "scores");
        assert_eq!(reference.key, "week-1.json");
        Ok(())
    }

    #[test]
    fn rejects_bodies_without_a_reference() {
        assert!(matches!(
            BlobReference::from_message_body("not json"),
            Err(BodyError::Json(_))
        ));
        assert!(matches!(
            BlobReference::from_message_body(r#"{"Records":[]}"#),
            Err(BodyError::MissingReference(_))
        ));
        assert!(matches!(
            BlobReference::from_message_body(r#"{"bucket":"","key":"a"}"#),
            Err(BodyError::MissingReference(_))
        ));
    }
}
