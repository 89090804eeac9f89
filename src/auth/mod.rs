//! Bearer key authentication against the configured tokens.
//!
//! Keys are never kept in memory in the clear: the table is indexed by the
//! SHA-256 of each key, and presented keys are hashed before lookup.

mod error;

use std::collections::HashMap;

pub use error::AuthError;
use http::{HeaderMap, header::AUTHORIZATION};
use sha2::{Digest, Sha256};

use crate::{config::GatewayConfig, relay::Caller};

/// Hex SHA-256 of an API key.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Bearer key from an `Authorization: Bearer <key>` header.
pub fn bearer_key(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingCredentials)?;
    let (scheme, key) = value
        .split_once(' ')
        .ok_or(AuthError::MissingCredentials)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MissingCredentials);
    }
    let key = key.trim();
    if key.is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    Ok(key)
}

/// Identities resolvable from API keys, built once from configuration.
#[derive(Debug, Default)]
pub struct TokenTable {
    by_hash: HashMap<String, Caller>,
}

impl TokenTable {
    /// Tokens whose user is not configured are skipped; config validation
    /// rejects them before this runs.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let users: HashMap<i64, _> = config.users.iter().map(|u| (u.id, u)).collect();

        let by_hash = config
            .tokens
            .iter()
            .filter_map(|token| {
                let user = users.get(&token.user_id)?;
                let caller = Caller {
                    user_id: user.id,
                    username: user.username.clone(),
                    group: config.user_group(user),
                    token_id: token.id,
                    token_name: token.name.clone(),
                    token_unlimited: token.unlimited,
                    admin: user.admin,
                };
                Some((hash_api_key(&token.key), caller))
            })
            .collect();

        Self { by_hash }
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn authenticate(&self, key: &str) -> Result<Caller, AuthError> {
        self.by_hash
            .get(&hash_api_key(key))
            .cloned()
            .ok_or(AuthError::InvalidApiKey)
    }

    /// Resolve the caller behind a request's headers.
    pub fn authenticate_headers(&self, headers: &HeaderMap) -> Result<Caller, AuthError> {
        self.authenticate(bearer_key(headers)?)
    }
}
