use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterListRecord {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub serialized_data: String,
    pub is_default: bool,
    /// `None` means the list is shared by everyone.
    pub owner_id: Option<i64>,
}

/// A filter list that has not been assigned an id yet.
#[derive(Debug, Clone)]
pub struct NewFilterList {
    pub name: String,
    pub category: String,
    pub serialized_data: String,
    pub is_default: bool,
    pub owner_id: Option<i64>,
}
