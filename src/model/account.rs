use serde::{Deserialize, Serialize};

/// A linked bank account. The sync cursor lives here, beside the access token it belongs to.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Account {
    pub account_id: String,
    pub user_id: String,
    pub item_id: String,
    pub access_token: String,
    /// The last successfully committed position in the aggregator's change feed. `None` means the
    /// next sync is a full initial sync.
    #[serde(default)]
    pub cursor: Option<String>,
}

/// A person or business the landlord deals with.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Contact {
    pub name: String,
    pub kind: ContactKind,
    /// For vendors: the category their payments usually belong to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_category: Option<crate::model::CategoryLabel>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactKind {
    Tenant,
    Vendor,
}

/// What the resolution tiers know about the owner of a transaction.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct UserContext {
    pub user_id: String,
    pub contacts: Vec<Contact>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, contacts: Vec<Contact>) -> Self {
        Self {
            user_id: user_id.into(),
            contacts,
        }
    }
}
