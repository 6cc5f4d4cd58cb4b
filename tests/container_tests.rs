//! Container operation tests.

mod common;

use chrono::{Duration, Utc};
use http::StatusCode;

use azurite_engine::lease::LeaseAction;
use azurite_engine::models::{AccessPolicy, PublicAccessLevel, SignedIdentifier};
use azurite_engine::storage::ListBlobsOptions;
use azurite_engine::{ErrorCode, Operation, Payload};
use common::TestEngine;

#[tokio::test]
async fn test_create_and_get_container() {
    let engine = TestEngine::new();
    let ctx = engine.container("testcontainer").with_metadata("team", "storage");

    let result = engine
        .exec(
            &ctx,
            Operation::CreateContainer {
                public_access: PublicAccessLevel::Blob,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.status, StatusCode::CREATED);
    assert!(result.headers.etag.is_some());

    let result = engine
        .exec(&engine.container("testcontainer"), Operation::GetContainerProperties)
        .await
        .unwrap();
    assert_eq!(result.status, StatusCode::OK);
    assert_eq!(result.headers.metadata.get("team").map(String::as_str), Some("storage"));
    assert_eq!(result.headers.public_access, Some(PublicAccessLevel::Blob));

    let headers = result.headers.to_header_map();
    assert_eq!(headers["x-ms-blob-public-access"], "blob");
    assert_eq!(headers["x-ms-meta-team"], "storage");
}

#[tokio::test]
async fn test_duplicate_container_conflicts() {
    let engine = TestEngine::new();
    engine.create_container("dupcontainer").await;

    let code = engine
        .exec_err(
            &engine.container("dupcontainer"),
            Operation::CreateContainer {
                public_access: PublicAccessLevel::None,
            },
        )
        .await;
    assert_eq!(code, ErrorCode::ContainerAlreadyExists);
}

#[tokio::test]
async fn test_invalid_container_names() {
    let engine = TestEngine::new();
    for name in ["ab", "Upper", "double--hyphen", "-leading"] {
        let result = engine
            .exec(
                &engine.container(name),
                Operation::CreateContainer {
                    public_access: PublicAccessLevel::None,
                },
            )
            .await;
        assert!(result.is_err(), "{} should be rejected", name);
    }
}

#[tokio::test]
async fn test_delete_container_removes_blobs() {
    let engine = TestEngine::new();
    engine.create_container("delcontainer").await;
    engine.put_block_blob("delcontainer", "a.txt", b"hello").await;

    let result = engine
        .exec(&engine.container("delcontainer"), Operation::DeleteContainer)
        .await
        .unwrap();
    assert_eq!(result.status, StatusCode::ACCEPTED);

    let code = engine
        .exec_err(&engine.container("delcontainer"), Operation::GetContainerProperties)
        .await;
    assert_eq!(code, ErrorCode::ContainerNotFound);

    // Recreating the container must not resurrect its blobs
    engine.create_container("delcontainer").await;
    let code = engine
        .exec_err(&engine.blob("delcontainer", "a.txt"), Operation::GetBlobProperties)
        .await;
    assert_eq!(code, ErrorCode::BlobNotFound);
}

#[tokio::test]
async fn test_set_container_metadata_changes_etag() {
    let engine = TestEngine::new();
    engine.create_container("metacontainer").await;

    let before = engine
        .exec(&engine.container("metacontainer"), Operation::GetContainerProperties)
        .await
        .unwrap();

    let ctx = engine.container("metacontainer").with_metadata("k", "v");
    let after = engine
        .exec(&ctx, Operation::SetContainerMetadata)
        .await
        .unwrap();
    assert_ne!(before.headers.etag, after.headers.etag);

    let props = engine
        .exec(&engine.container("metacontainer"), Operation::GetContainerProperties)
        .await
        .unwrap();
    assert_eq!(props.headers.metadata.len(), 1);
    assert_eq!(props.headers.metadata["k"], "v");
}

fn identifier(id: &str) -> SignedIdentifier {
    SignedIdentifier {
        id: id.to_string(),
        access_policy: AccessPolicy {
            start: Some(Utc::now()),
            expiry: Some(Utc::now() + Duration::hours(1)),
            permission: "rl".to_string(),
        },
    }
}

#[tokio::test]
async fn test_container_acl_round_trip() {
    let engine = TestEngine::new();
    engine.create_container("aclcontainer").await;
    let ctx = engine.container("aclcontainer");

    engine
        .exec(
            &ctx,
            Operation::SetContainerAcl {
                public_access: PublicAccessLevel::Container,
                identifiers: vec![identifier("policy-1"), identifier("policy-2")],
            },
        )
        .await
        .unwrap();

    let result = engine.exec(&ctx, Operation::GetContainerAcl).await.unwrap();
    assert_eq!(result.headers.public_access, Some(PublicAccessLevel::Container));
    match result.payload {
        Payload::Acl(identifiers) => {
            let ids: Vec<_> = identifiers.iter().map(|i| i.id.as_str()).collect();
            assert_eq!(ids, ["policy-1", "policy-2"]);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn test_container_acl_identifier_limit() {
    let engine = TestEngine::new();
    engine.create_container("acllimit").await;

    let identifiers = (0..6).map(|i| identifier(&format!("p{}", i))).collect();
    let code = engine
        .exec_err(
            &engine.container("acllimit"),
            Operation::SetContainerAcl {
                public_access: PublicAccessLevel::None,
                identifiers,
            },
        )
        .await;
    assert_eq!(code, ErrorCode::InvalidXmlDocument);
}

#[tokio::test]
async fn test_list_containers_pages_with_marker() {
    let engine = TestEngine::new();
    for name in ["list-a", "list-b", "list-c", "other"] {
        engine.create_container(name).await;
    }

    let ctx = engine.container("ignored");
    let list = |marker: Option<String>| Operation::ListContainers {
        prefix: Some("list-".to_string()),
        marker,
        max_results: Some(2),
    };

    let first = engine.exec(&ctx, list(None)).await.unwrap();
    let (names, marker) = match first.payload {
        Payload::Containers {
            containers,
            next_marker,
        } => (
            containers.into_iter().map(|c| c.name).collect::<Vec<_>>(),
            next_marker,
        ),
        other => panic!("unexpected payload {:?}", other),
    };
    assert_eq!(names, ["list-a", "list-b"]);
    assert_eq!(marker.as_deref(), Some("list-b"));

    let second = engine.exec(&ctx, list(marker)).await.unwrap();
    match second.payload {
        Payload::Containers {
            containers,
            next_marker,
        } => {
            assert_eq!(containers.len(), 1);
            assert_eq!(containers[0].name, "list-c");
            assert!(next_marker.is_none());
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn test_list_blobs_with_delimiter() {
    let engine = TestEngine::new();
    engine.create_container("listblobs").await;
    for name in ["dir/a.txt", "dir/b.txt", "root.txt"] {
        engine.put_block_blob("listblobs", name, b"x").await;
    }

    let result = engine
        .exec(
            &engine.container("listblobs"),
            Operation::ListBlobs(ListBlobsOptions {
                delimiter: Some("/".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

    match result.payload {
        Payload::Blobs(listing) => {
            assert_eq!(listing.prefixes, ["dir/"]);
            let names: Vec<_> = listing.blobs.iter().map(|b| b.name.as_str()).collect();
            assert_eq!(names, ["root.txt"]);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn test_container_lease_guards_delete() {
    let engine = TestEngine::new();
    engine.create_container("leased").await;
    let ctx = engine.container("leased");

    let result = engine
        .exec(
            &ctx,
            Operation::ContainerLease(LeaseAction::Acquire {
                proposed_id: None,
                duration: -1,
            }),
        )
        .await
        .unwrap();
    assert_eq!(result.status, StatusCode::CREATED);
    let lease_id = result.headers.lease_id.unwrap();

    let code = engine.exec_err(&ctx, Operation::DeleteContainer).await;
    assert_eq!(code, ErrorCode::LeaseIdMissing);

    let code = engine
        .exec_err(
            &engine.container("leased").with_lease_id("not-the-lease"),
            Operation::DeleteContainer,
        )
        .await;
    assert_eq!(code, ErrorCode::LeaseIdMismatchWithContainerOperation);

    engine
        .exec(
            &engine.container("leased").with_lease_id(lease_id),
            Operation::DeleteContainer,
        )
        .await
        .unwrap();
}
