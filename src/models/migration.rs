//! Migration bookkeeping models.

use serde::{Deserialize, Serialize};

/// One applied migration, as stored in the control table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub app: String,
    pub id: String,
    /// Timestamp as the engine rendered it; `None` if the column could not be decoded.
    pub applied_at: Option<String>,
}
