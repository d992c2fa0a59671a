use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cached dataset. `source_site` must name an existing [`super::Site`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payload_ref: String,
    pub description: String,
    pub enabled: bool,
    pub kind: String,
    pub source_site: String,
    pub frontend_link: Option<String>,
}
