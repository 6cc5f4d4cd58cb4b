//! Azure Blob Storage error types and failure taxonomy.

use http::StatusCode;
use std::fmt::Display;
use thiserror::Error;

/// Azure Storage error codes produced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // General errors
    ConditionNotMet,
    InternalError,
    InvalidHeaderValue,
    InvalidQueryParameterValue,
    InvalidRange,
    InvalidResourceName,
    InvalidXmlDocument,
    Md5Mismatch,
    OutOfRangeInput,
    RequestBodyTooLarge,

    // Blob-specific errors
    AppendPositionConditionNotMet,
    BlobAlreadyExists,
    BlobArchived,
    BlobNotFound,
    BlockCountExceedsLimit,
    ContainerAlreadyExists,
    ContainerNotFound,
    CopyIdMismatch,
    InvalidBlobType,
    InvalidBlockId,
    InvalidBlockList,
    InvalidOperation,
    InvalidPageRange,
    InvalidSourceBlobUrl,
    LeaseAlreadyPresent,
    LeaseIdMismatchWithBlobOperation,
    LeaseIdMismatchWithContainerOperation,
    LeaseIdMismatchWithLeaseOperation,
    LeaseIdMissing,
    LeaseIsBreakingAndCannotBeAcquired,
    LeaseIsBreakingAndCannotBeChanged,
    LeaseIsBrokenAndCannotBeRenewed,
    LeaseNotPresentWithBlobOperation,
    LeaseNotPresentWithContainerOperation,
    LeaseNotPresentWithLeaseOperation,
    MaxBlobSizeConditionNotMet,
    NoPendingCopyOperation,
    PendingCopyOperation,
    SequenceNumberConditionNotMet,
    SnapshotsPresent,
}

/// Coarse failure classes callers map onto their own status handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    PreconditionFailed,
    InvalidInput,
    Internal,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConditionNotMet => "ConditionNotMet",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::InvalidHeaderValue => "InvalidHeaderValue",
            ErrorCode::InvalidQueryParameterValue => "InvalidQueryParameterValue",
            ErrorCode::InvalidRange => "InvalidRange",
            ErrorCode::InvalidResourceName => "InvalidResourceName",
            ErrorCode::InvalidXmlDocument => "InvalidXmlDocument",
            ErrorCode::Md5Mismatch => "Md5Mismatch",
            ErrorCode::OutOfRangeInput => "OutOfRangeInput",
            ErrorCode::RequestBodyTooLarge => "RequestBodyTooLarge",
            ErrorCode::AppendPositionConditionNotMet => "AppendPositionConditionNotMet",
            ErrorCode::BlobAlreadyExists => "BlobAlreadyExists",
            ErrorCode::BlobArchived => "BlobArchived",
            ErrorCode::BlobNotFound => "BlobNotFound",
            ErrorCode::BlockCountExceedsLimit => "BlockCountExceedsLimit",
            ErrorCode::ContainerAlreadyExists => "ContainerAlreadyExists",
            ErrorCode::ContainerNotFound => "ContainerNotFound",
            ErrorCode::CopyIdMismatch => "CopyIdMismatch",
            ErrorCode::InvalidBlobType => "InvalidBlobType",
            ErrorCode::InvalidBlockId => "InvalidBlockId",
            ErrorCode::InvalidBlockList => "InvalidBlockList",
            ErrorCode::InvalidOperation => "InvalidOperation",
            ErrorCode::InvalidPageRange => "InvalidPageRange",
            ErrorCode::InvalidSourceBlobUrl => "InvalidSourceBlobUrl",
            ErrorCode::LeaseAlreadyPresent => "LeaseAlreadyPresent",
            ErrorCode::LeaseIdMismatchWithBlobOperation => "LeaseIdMismatchWithBlobOperation",
            ErrorCode::LeaseIdMismatchWithContainerOperation => {
                "LeaseIdMismatchWithContainerOperation"
            }
            ErrorCode::LeaseIdMismatchWithLeaseOperation => "LeaseIdMismatchWithLeaseOperation",
            ErrorCode::LeaseIdMissing => "LeaseIdMissing",
            ErrorCode::LeaseIsBreakingAndCannotBeAcquired => "LeaseIsBreakingAndCannotBeAcquired",
            ErrorCode::LeaseIsBreakingAndCannotBeChanged => "LeaseIsBreakingAndCannotBeChanged",
            ErrorCode::LeaseIsBrokenAndCannotBeRenewed => "LeaseIsBrokenAndCannotBeRenewed",
            ErrorCode::LeaseNotPresentWithBlobOperation => "LeaseNotPresentWithBlobOperation",
            ErrorCode::LeaseNotPresentWithContainerOperation => {
                "LeaseNotPresentWithContainerOperation"
            }
            ErrorCode::LeaseNotPresentWithLeaseOperation => "LeaseNotPresentWithLeaseOperation",
            ErrorCode::MaxBlobSizeConditionNotMet => "MaxBlobSizeConditionNotMet",
            ErrorCode::NoPendingCopyOperation => "NoPendingCopyOperation",
            ErrorCode::PendingCopyOperation => "PendingCopyOperation",
            ErrorCode::SequenceNumberConditionNotMet => "SequenceNumberConditionNotMet",
            ErrorCode::SnapshotsPresent => "SnapshotsPresent",
        }
    }

    /// Returns the failure class for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::BlobNotFound | ErrorCode::ContainerNotFound => ErrorKind::NotFound,

            ErrorCode::BlobAlreadyExists
            | ErrorCode::BlobArchived
            | ErrorCode::BlockCountExceedsLimit
            | ErrorCode::ContainerAlreadyExists
            | ErrorCode::CopyIdMismatch
            | ErrorCode::NoPendingCopyOperation
            | ErrorCode::PendingCopyOperation
            | ErrorCode::SnapshotsPresent => ErrorKind::Conflict,

            ErrorCode::AppendPositionConditionNotMet
            | ErrorCode::ConditionNotMet
            | ErrorCode::InvalidBlockList
            | ErrorCode::InvalidPageRange
            | ErrorCode::LeaseAlreadyPresent
            | ErrorCode::LeaseIdMismatchWithBlobOperation
            | ErrorCode::LeaseIdMismatchWithContainerOperation
            | ErrorCode::LeaseIdMismatchWithLeaseOperation
            | ErrorCode::LeaseIdMissing
            | ErrorCode::LeaseIsBreakingAndCannotBeAcquired
            | ErrorCode::LeaseIsBreakingAndCannotBeChanged
            | ErrorCode::LeaseIsBrokenAndCannotBeRenewed
            | ErrorCode::LeaseNotPresentWithBlobOperation
            | ErrorCode::LeaseNotPresentWithContainerOperation
            | ErrorCode::LeaseNotPresentWithLeaseOperation
            | ErrorCode::MaxBlobSizeConditionNotMet
            | ErrorCode::SequenceNumberConditionNotMet => ErrorKind::PreconditionFailed,

            ErrorCode::InternalError => ErrorKind::Internal,

            _ => ErrorKind::InvalidInput,
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 404 Not Found
            ErrorCode::BlobNotFound
            | ErrorCode::ContainerNotFound => StatusCode::NOT_FOUND,

            // 409 Conflict
            ErrorCode::BlobAlreadyExists
            | ErrorCode::BlobArchived
            | ErrorCode::BlockCountExceedsLimit
            | ErrorCode::ContainerAlreadyExists
            | ErrorCode::CopyIdMismatch
            | ErrorCode::InvalidBlobType
            | ErrorCode::LeaseAlreadyPresent
            | ErrorCode::LeaseIdMismatchWithLeaseOperation
            | ErrorCode::LeaseIsBreakingAndCannotBeAcquired
            | ErrorCode::LeaseIsBreakingAndCannotBeChanged
            | ErrorCode::LeaseIsBrokenAndCannotBeRenewed
            | ErrorCode::LeaseNotPresentWithLeaseOperation
            | ErrorCode::NoPendingCopyOperation
            | ErrorCode::PendingCopyOperation
            | ErrorCode::SnapshotsPresent => StatusCode::CONFLICT,

            // 412 Precondition Failed
            ErrorCode::AppendPositionConditionNotMet
            | ErrorCode::ConditionNotMet
            | ErrorCode::LeaseIdMismatchWithBlobOperation
            | ErrorCode::LeaseIdMismatchWithContainerOperation
            | ErrorCode::LeaseIdMissing
            | ErrorCode::LeaseNotPresentWithBlobOperation
            | ErrorCode::LeaseNotPresentWithContainerOperation
            | ErrorCode::MaxBlobSizeConditionNotMet
            | ErrorCode::SequenceNumberConditionNotMet => StatusCode::PRECONDITION_FAILED,

            // 413 Payload Too Large
            ErrorCode::RequestBodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,

            // 416 Range Not Satisfiable
            ErrorCode::InvalidRange | ErrorCode::InvalidPageRange => {
                StatusCode::RANGE_NOT_SATISFIABLE
            }

            // 500 Internal Server Error
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,

            // Everything else is a malformed request
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Returns the default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::BlobNotFound => "The specified blob does not exist.",
            ErrorCode::BlobAlreadyExists => "The specified blob already exists.",
            ErrorCode::BlobArchived => "This operation is not permitted on an archived blob.",
            ErrorCode::BlockCountExceedsLimit => {
                "The committed block count cannot exceed the maximum limit of 50,000 blocks."
            }
            ErrorCode::ContainerAlreadyExists => "The specified container already exists.",
            ErrorCode::ContainerNotFound => "The specified container does not exist.",
            ErrorCode::InvalidBlockId => "The specified block ID is invalid.",
            ErrorCode::InvalidBlockList => "The specified block list is invalid.",
            ErrorCode::InvalidHeaderValue => "The value for one of the HTTP headers is not valid.",
            ErrorCode::InvalidPageRange => "The page range specified is invalid.",
            ErrorCode::InvalidRange => {
                "The range specified is invalid for the current size of the resource."
            }
            ErrorCode::InvalidResourceName => {
                "The specified resource name contains invalid characters."
            }
            ErrorCode::LeaseAlreadyPresent => "There is already a lease present.",
            ErrorCode::LeaseIdMissing => {
                "There is currently a lease on the resource and no lease ID was specified in the request."
            }
            ErrorCode::LeaseIdMismatchWithBlobOperation => {
                "The lease ID specified did not match the lease ID for the blob."
            }
            ErrorCode::LeaseIdMismatchWithContainerOperation => {
                "The lease ID specified did not match the lease ID for the container."
            }
            ErrorCode::LeaseIdMismatchWithLeaseOperation => {
                "The lease ID specified did not match the lease ID for the resource with the specified lease operation."
            }
            ErrorCode::LeaseIsBreakingAndCannotBeAcquired => {
                "There is already a breaking lease and it cannot be acquired."
            }
            ErrorCode::LeaseIsBreakingAndCannotBeChanged => {
                "The lease is breaking and cannot be changed."
            }
            ErrorCode::LeaseIsBrokenAndCannotBeRenewed => {
                "The lease ID matched, but the lease has been broken explicitly and cannot be renewed."
            }
            ErrorCode::LeaseNotPresentWithBlobOperation => {
                "There is currently no lease on the blob."
            }
            ErrorCode::LeaseNotPresentWithContainerOperation => {
                "There is currently no lease on the container."
            }
            ErrorCode::LeaseNotPresentWithLeaseOperation => {
                "There is currently no lease on the resource."
            }
            ErrorCode::NoPendingCopyOperation => "There is currently no pending copy operation.",
            ErrorCode::PendingCopyOperation => "There is currently a pending copy operation.",
            ErrorCode::SnapshotsPresent => {
                "This operation is not permitted because the blob has snapshots."
            }
            ErrorCode::InternalError => {
                "The server encountered an internal error. Please retry the request."
            }
            _ => "An error occurred while processing the request.",
        }
    }
}

/// Storage error with code and message.
#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct StorageError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: Option<String>,
}

impl StorageError {
    /// Creates a new storage error with the given code and default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            message: code.default_message().to_string(),
            code,
            request_id: None,
        }
    }

    /// Creates a new storage error with a custom message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
        }
    }

    /// Wraps a persistence-layer failure.
    pub fn internal(context: &str, err: impl Display) -> Self {
        Self::with_message(ErrorCode::InternalError, format!("{}: {}", context, err))
    }

    /// Sets the request ID for this error.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Returns the failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
