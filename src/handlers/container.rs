//! Container-level handlers.

use tracing::{debug, info};

use crate::context::RequestContext;
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::lease::{self, LeaseAccess, LeaseAction, LeaseTarget};
use crate::models::{
    validate_container_name, ContainerModel, PublicAccessLevel, SignedIdentifier,
    MAX_SIGNED_IDENTIFIERS,
};
use crate::router::EngineState;
use crate::storage::{container_lock_key, ListBlobsOptions};

use super::{OperationResult, Payload, ResponseHeaders};

/// Create container.
pub async fn create_container(
    state: &EngineState,
    ctx: &RequestContext,
    public_access: PublicAccessLevel,
) -> StorageResult<OperationResult> {
    let name = ctx.container_name()?;
    validate_container_name(name)?;

    let mut container = ContainerModel::new(ctx.account.clone(), name.to_string(), ctx.now);
    container.properties.public_access = public_access;
    container.metadata = ctx.metadata.clone();

    state.metadata.create_container(container.clone()).await?;
    info!(account = %ctx.account, container = %name, "Created container");

    Ok(OperationResult::created(ResponseHeaders::modified(
        &container.properties.etag,
        container.properties.last_modified,
    )))
}

/// Delete container, with every blob in it.
pub async fn delete_container(
    state: &EngineState,
    ctx: &RequestContext,
) -> StorageResult<OperationResult> {
    let name = ctx.container_name()?;
    let _guard = state.locks.lock(&container_lock_key(&ctx.account, name)).await;

    let container = state.metadata.get_container(&ctx.account, name).await?;
    ctx.conditions
        .check(&container.properties.etag, container.properties.last_modified)?;
    lease::validate(
        &container.lease,
        ctx.lease_id.as_deref(),
        LeaseAccess::Write,
        LeaseTarget::Container,
        ctx.now,
    )?;

    state.metadata.delete_container(&ctx.account, name).await?;
    info!(account = %ctx.account, container = %name, "Deleted container");

    Ok(OperationResult::accepted(ResponseHeaders::default()))
}

/// Get container properties.
pub async fn get_container_properties(
    state: &EngineState,
    ctx: &RequestContext,
) -> StorageResult<OperationResult> {
    let name = ctx.container_name()?;
    let container = state.metadata.get_container(&ctx.account, name).await?;
    lease::validate(
        &container.lease,
        ctx.lease_id.as_deref(),
        LeaseAccess::Read,
        LeaseTarget::Container,
        ctx.now,
    )?;

    Ok(OperationResult::ok(ResponseHeaders::for_container(
        &container, ctx.now,
    )))
}

/// Set container metadata.
pub async fn set_container_metadata(
    state: &EngineState,
    ctx: &RequestContext,
) -> StorageResult<OperationResult> {
    let name = ctx.container_name()?;
    let _guard = state.locks.lock(&container_lock_key(&ctx.account, name)).await;

    let mut container = state.metadata.get_container(&ctx.account, name).await?;
    ctx.conditions
        .check(&container.properties.etag, container.properties.last_modified)?;
    lease::validate(
        &container.lease,
        ctx.lease_id.as_deref(),
        LeaseAccess::Read,
        LeaseTarget::Container,
        ctx.now,
    )?;

    container.metadata = ctx.metadata.clone();
    container.properties.update_etag(ctx.now);
    state.metadata.update_container(container.clone()).await?;

    Ok(OperationResult::ok(ResponseHeaders::modified(
        &container.properties.etag,
        container.properties.last_modified,
    )))
}

/// Get container ACL.
pub async fn get_container_acl(
    state: &EngineState,
    ctx: &RequestContext,
) -> StorageResult<OperationResult> {
    let name = ctx.container_name()?;
    let container = state.metadata.get_container(&ctx.account, name).await?;
    lease::validate(
        &container.lease,
        ctx.lease_id.as_deref(),
        LeaseAccess::Read,
        LeaseTarget::Container,
        ctx.now,
    )?;

    let mut headers = ResponseHeaders::modified(
        &container.properties.etag,
        container.properties.last_modified,
    );
    headers.public_access = Some(container.properties.public_access);

    Ok(OperationResult::ok(headers).with_payload(Payload::Acl(container.signed_identifiers)))
}

/// Set container ACL.
pub async fn set_container_acl(
    state: &EngineState,
    ctx: &RequestContext,
    public_access: PublicAccessLevel,
    identifiers: Vec<SignedIdentifier>,
) -> StorageResult<OperationResult> {
    if identifiers.len() > MAX_SIGNED_IDENTIFIERS {
        return Err(StorageError::with_message(
            ErrorCode::InvalidXmlDocument,
            format!(
                "At most {} signed identifiers are allowed.",
                MAX_SIGNED_IDENTIFIERS
            ),
        ));
    }

    let name = ctx.container_name()?;
    let _guard = state.locks.lock(&container_lock_key(&ctx.account, name)).await;

    let mut container = state.metadata.get_container(&ctx.account, name).await?;
    ctx.conditions
        .check(&container.properties.etag, container.properties.last_modified)?;
    lease::validate(
        &container.lease,
        ctx.lease_id.as_deref(),
        LeaseAccess::Read,
        LeaseTarget::Container,
        ctx.now,
    )?;

    container.properties.public_access = public_access;
    container.signed_identifiers = identifiers;
    container.properties.update_etag(ctx.now);
    state.metadata.update_container(container.clone()).await?;

    Ok(OperationResult::ok(ResponseHeaders::modified(
        &container.properties.etag,
        container.properties.last_modified,
    )))
}

/// List containers in the account.
pub async fn list_containers(
    state: &EngineState,
    ctx: &RequestContext,
    prefix: Option<&str>,
    marker: Option<&str>,
    max_results: Option<u32>,
) -> StorageResult<OperationResult> {
    let (containers, next_marker) = state
        .metadata
        .list_containers(&ctx.account, prefix, marker, max_results)
        .await?;

    Ok(
        OperationResult::ok(ResponseHeaders::default()).with_payload(Payload::Containers {
            containers,
            next_marker,
        }),
    )
}

/// List blobs in a container.
pub async fn list_blobs(
    state: &EngineState,
    ctx: &RequestContext,
    options: &ListBlobsOptions,
) -> StorageResult<OperationResult> {
    let name = ctx.container_name()?;
    let mut listing = state.metadata.list_blobs(&ctx.account, name, options).await?;
    for blob in &mut listing.blobs {
        blob.properties.settle_rehydration(ctx.now);
    }
    debug!(
        container = %name,
        blobs = listing.blobs.len(),
        prefixes = listing.prefixes.len(),
        "Listed blobs"
    );

    Ok(OperationResult::ok(ResponseHeaders::default()).with_payload(Payload::Blobs(listing)))
}

/// Acquire, renew, change, release or break a container lease.
pub async fn container_lease(
    state: &EngineState,
    ctx: &RequestContext,
    action: &LeaseAction,
) -> StorageResult<OperationResult> {
    let name = ctx.container_name()?;
    let _guard = state.locks.lock(&container_lock_key(&ctx.account, name)).await;

    let mut container = state.metadata.get_container(&ctx.account, name).await?;
    ctx.conditions
        .check(&container.properties.etag, container.properties.last_modified)?;

    let (next, outcome) = lease::apply(&container.lease, action, ctx.now, None)?;
    container.lease = next;
    state.metadata.update_container(container.clone()).await?;
    debug!(container = %name, action = action.as_str(), "Container lease updated");

    let mut headers = ResponseHeaders::modified(
        &container.properties.etag,
        container.properties.last_modified,
    );
    headers.lease_id = outcome.lease_id;
    headers.lease_time = outcome.lease_time;

    let result = match action {
        LeaseAction::Acquire { .. } => OperationResult::created(headers),
        LeaseAction::Break { .. } => OperationResult::accepted(headers),
        _ => OperationResult::ok(headers),
    };
    Ok(result)
}
