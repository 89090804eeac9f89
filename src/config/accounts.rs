use serde::{Deserialize, Serialize};

/// A user account. The quota is the initial balance in quota units; with a
/// database configured it only seeds accounts that do not exist yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    pub id: i64,

    pub username: String,

    /// Pricing group (see `pricing.group_ratio`).
    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub quota: i64,

    /// Grants access to the `/api/admin/*` routes.
    #[serde(default)]
    pub admin: bool,
}

/// An API token belonging to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    pub id: i64,

    pub name: String,

    /// Bearer key presented by clients.
    pub key: String,

    pub user_id: i64,

    #[serde(default)]
    pub quota: i64,

    /// Unlimited tokens are never debited; only the owning user is.
    #[serde(default)]
    pub unlimited: bool,
}
