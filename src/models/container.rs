//! Container data models.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

use super::blob::new_etag;
use super::lease::Lease;
use crate::error::{ErrorCode, StorageError, StorageResult};

/// Maximum number of stored access policies per container.
pub const MAX_SIGNED_IDENTIFIERS: usize = 5;

/// Public access level for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PublicAccessLevel {
    #[default]
    None,
    Container,
    Blob,
}

impl PublicAccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicAccessLevel::None => "",
            PublicAccessLevel::Container => "container",
            PublicAccessLevel::Blob => "blob",
        }
    }
}

/// Container properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerProperties {
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub created_on: DateTime<Utc>,
    pub public_access: PublicAccessLevel,
}

impl ContainerProperties {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            etag: new_etag(),
            last_modified: now,
            created_on: now,
            public_access: PublicAccessLevel::None,
        }
    }

    /// Updates the ETag and last modified time.
    pub fn update_etag(&mut self, now: DateTime<Utc>) {
        self.etag = new_etag();
        self.last_modified = now;
    }
}

/// Signed identifier for container access policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedIdentifier {
    pub id: String,
    pub access_policy: AccessPolicy,
}

/// Access policy for a signed identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub start: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
    pub permission: String,
}

/// Complete container model stored in metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerModel {
    /// Account name.
    pub account: String,
    /// Container name.
    pub name: String,
    /// Container properties.
    pub properties: ContainerProperties,
    /// User-defined metadata.
    pub metadata: HashMap<String, String>,
    /// Signed identifiers for stored access policies.
    pub signed_identifiers: Vec<SignedIdentifier>,
    /// Lease on the container.
    pub lease: Lease,
}

impl ContainerModel {
    /// Creates a new container model.
    pub fn new(account: String, name: String, now: DateTime<Utc>) -> Self {
        Self {
            account,
            name,
            properties: ContainerProperties::new(now),
            metadata: HashMap::new(),
            signed_identifiers: Vec::new(),
            lease: Lease::default(),
        }
    }
}

fn container_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("valid pattern"))
}

/// Checks the container naming rules: 3-63 characters of lowercase letters,
/// digits and single hyphens, starting and ending with a letter or digit.
pub fn validate_container_name(name: &str) -> StorageResult<()> {
    if !(3..=63).contains(&name.len()) {
        return Err(StorageError::with_message(
            ErrorCode::OutOfRangeInput,
            "The container name must be between 3 and 63 characters long.",
        ));
    }
    if !container_name_pattern().is_match(name) {
        return Err(StorageError::new(ErrorCode::InvalidResourceName));
    }
    Ok(())
}

/// Checks the blob naming rules: 1-1024 characters.
pub fn validate_blob_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.chars().count() > 1024 {
        return Err(StorageError::with_message(
            ErrorCode::OutOfRangeInput,
            "The blob name must be between 1 and 1024 characters long.",
        ));
    }
    Ok(())
}
