//! Parsed request context handed to the engine.

use chrono::{DateTime, Utc};
use http::HeaderMap;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::{BlobId, BlobProperties};

/// HTTP content headers carried by blob writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentHeaders {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_md5: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
}

impl ContentHeaders {
    /// Copies every header onto `props`, clearing the ones that are absent.
    pub fn apply_to(&self, props: &mut BlobProperties) {
        props.content_type = self.content_type.clone();
        props.content_encoding = self.content_encoding.clone();
        props.content_language = self.content_language.clone();
        props.content_md5 = self.content_md5.clone();
        props.content_disposition = self.content_disposition.clone();
        props.cache_control = self.cache_control.clone();
    }

    /// Reads the blob content headers, preferring the `x-ms-blob-*` forms.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let pick = |ms: &str, plain: &str| header(headers, ms).or_else(|| header(headers, plain));
        Self {
            content_type: pick("x-ms-blob-content-type", "content-type"),
            content_encoding: pick("x-ms-blob-content-encoding", "content-encoding"),
            content_language: pick("x-ms-blob-content-language", "content-language"),
            content_md5: pick("x-ms-blob-content-md5", "content-md5"),
            content_disposition: pick("x-ms-blob-content-disposition", "content-disposition"),
            cache_control: pick("x-ms-blob-cache-control", "cache-control"),
        }
    }
}

/// Conditional request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

impl Conditions {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            if_match: header(headers, "if-match"),
            if_none_match: header(headers, "if-none-match"),
            if_modified_since: header(headers, "if-modified-since")
                .as_deref()
                .and_then(parse_http_date),
            if_unmodified_since: header(headers, "if-unmodified-since")
                .as_deref()
                .and_then(parse_http_date),
        }
    }

    /// Checks the conditions against a resource's current ETag and
    /// modification time.
    pub fn check(&self, etag: &str, last_modified: DateTime<Utc>) -> StorageResult<()> {
        if let Some(expected) = &self.if_match {
            if expected != "*" && expected != etag {
                return Err(StorageError::new(ErrorCode::ConditionNotMet));
            }
        }

        if let Some(unexpected) = &self.if_none_match {
            if unexpected == "*" || unexpected == etag {
                return Err(StorageError::new(ErrorCode::ConditionNotMet));
            }
        }

        if let Some(since) = self.if_modified_since {
            if last_modified <= since {
                return Err(StorageError::new(ErrorCode::ConditionNotMet));
            }
        }

        if let Some(since) = self.if_unmodified_since {
            if last_modified > since {
                return Err(StorageError::new(ErrorCode::ConditionNotMet));
            }
        }

        Ok(())
    }

    /// Checks only the conditions a missing resource can satisfy.
    pub fn check_missing(&self) -> StorageResult<()> {
        match &self.if_match {
            Some(_) => Err(StorageError::new(ErrorCode::ConditionNotMet)),
            None => Ok(()),
        }
    }
}

/// Byte range requested by a read: `start` through `end` inclusive, or to
/// the end of the blob when `end` is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }
}

/// Request context containing everything an operation needs besides its
/// own arguments.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique request ID.
    pub request_id: String,
    pub account: String,
    pub container: Option<String>,
    pub blob: Option<String>,
    /// Snapshot timestamp addressing a snapshot instead of the base blob.
    pub snapshot: Option<String>,
    /// Lease id supplied with the request.
    pub lease_id: Option<String>,
    /// Instant the operation is evaluated at.
    pub now: DateTime<Utc>,
    /// User-defined metadata from x-ms-meta-* headers.
    pub metadata: HashMap<String, String>,
    pub content: ContentHeaders,
    pub conditions: Conditions,
    pub range: Option<ByteRange>,
}

impl RequestContext {
    /// Creates a context addressing the account itself.
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            account: account.into(),
            container: None,
            blob: None,
            snapshot: None,
            lease_id: None,
            now: Utc::now(),
            metadata: HashMap::new(),
            content: ContentHeaders::default(),
            conditions: Conditions::default(),
            range: None,
        }
    }

    /// Creates a context addressing a container.
    pub fn for_container(account: impl Into<String>, container: impl Into<String>) -> Self {
        let mut ctx = Self::new(account);
        ctx.container = Some(container.into());
        ctx
    }

    /// Creates a context addressing a blob.
    pub fn for_blob(
        account: impl Into<String>,
        container: impl Into<String>,
        blob: impl Into<String>,
    ) -> Self {
        let mut ctx = Self::for_container(account, container);
        ctx.blob = Some(blob.into());
        ctx
    }

    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }

    pub fn with_lease_id(mut self, lease_id: impl Into<String>) -> Self {
        self.lease_id = Some(lease_id.into());
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_content(mut self, content: ContentHeaders) -> Self {
        self.content = content;
        self
    }

    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_range(mut self, start: u64, end: Option<u64>) -> Self {
        self.range = Some(ByteRange::new(start, end));
        self
    }

    /// Fills lease id, metadata, content headers, conditions and range from
    /// raw HTTP headers.
    pub fn with_headers(mut self, headers: &HeaderMap) -> Self {
        self.lease_id = header(headers, "x-ms-lease-id");
        self.metadata = headers
            .iter()
            .filter_map(|(name, value)| {
                let key = name.as_str().strip_prefix("x-ms-meta-")?;
                value.to_str().ok().map(|v| (key.to_string(), v.to_string()))
            })
            .collect();
        self.content = ContentHeaders::from_headers(headers);
        self.conditions = Conditions::from_headers(headers);
        self.range = header(headers, "x-ms-range")
            .or_else(|| header(headers, "range"))
            .as_deref()
            .and_then(parse_range_header);
        self
    }

    /// Returns the container name, failing when the request names none.
    pub fn container_name(&self) -> StorageResult<&str> {
        self.container
            .as_deref()
            .ok_or_else(|| StorageError::new(ErrorCode::ContainerNotFound))
    }

    /// Returns the identity of the addressed blob, including any snapshot.
    pub fn blob_id(&self) -> StorageResult<BlobId> {
        let container = self.container_name()?;
        let name = self
            .blob
            .as_deref()
            .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))?;
        Ok(BlobId::new(&self.account, container, name)
            .with_snapshot(self.snapshot.clone().unwrap_or_default()))
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Parses a Range header value like "bytes=0-1023" or "bytes=0-".
fn parse_range_header(value: &str) -> Option<ByteRange> {
    let value = value.strip_prefix("bytes=")?;
    let (start, end) = value.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: Option<u64> = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some(ByteRange::new(start, end))
}

/// Parses an HTTP date in RFC 1123 format.
fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .ok()
                .map(|dt| dt.and_utc())
        })
}

/// Formats a DateTime as RFC 1123 format for HTTP headers.
pub fn format_http_date(dt: &DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
