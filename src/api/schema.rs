use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// RFC 3339 timestamp as it appears in API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = "2024-05-01T08:30:00Z")]
pub struct DateTimeUtc(#[schema(value_type = String)] pub DateTime<Utc>);

impl From<DateTime<Utc>> for DateTimeUtc {
    fn from(dt: DateTime<Utc>) -> Self {
        DateTimeUtc(dt)
    }
}
