//! Blob operation tests.

mod common;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use http::StatusCode;
use md5::{Digest, Md5};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use azurite_engine::context::{Conditions, ContentHeaders};
use azurite_engine::handlers::DeleteSnapshots;
use azurite_engine::models::AccessTier;
use azurite_engine::storage::ListBlobsOptions;
use azurite_engine::{BlobServer, Config, ErrorCode, MemoryExtentStore, Operation, Payload};
use common::TestEngine;

#[tokio::test]
async fn test_snapshot_and_delete_lifecycle() {
    let engine = TestEngine::new();
    engine.create_container("lifecycle").await;

    let result = engine.put_block_blob("lifecycle", "b1", b"0123456789").await;
    assert_eq!(result.status, StatusCode::CREATED);

    let props = engine
        .exec(&engine.blob("lifecycle", "b1"), Operation::GetBlobProperties)
        .await
        .unwrap();
    assert_eq!(props.headers.content_length, Some(10));
    assert!(engine.stored_blob("lifecycle", "b1").await.committed);

    let result = engine
        .exec(&engine.blob("lifecycle", "b1"), Operation::SnapshotBlob)
        .await
        .unwrap();
    assert_eq!(result.status, StatusCode::CREATED);
    let snapshot = result.headers.snapshot.expect("snapshot timestamp");

    let snap_props = engine
        .exec(
            &engine.blob("lifecycle", "b1").with_snapshot(&snapshot),
            Operation::GetBlobProperties,
        )
        .await
        .unwrap();
    assert_eq!(snap_props.headers.content_length, Some(10));
    assert_eq!(snap_props.headers.content, props.headers.content);
    assert_eq!(snap_props.headers.snapshot.as_deref(), Some(snapshot.as_str()));

    // Snapshots block a plain delete
    let code = engine
        .exec_err(
            &engine.blob("lifecycle", "b1"),
            Operation::DeleteBlob {
                delete_snapshots: None,
            },
        )
        .await;
    assert_eq!(code, ErrorCode::SnapshotsPresent);

    let result = engine
        .exec(
            &engine.blob("lifecycle", "b1"),
            Operation::DeleteBlob {
                delete_snapshots: Some(DeleteSnapshots::Include),
            },
        )
        .await
        .unwrap();
    assert_eq!(result.status, StatusCode::ACCEPTED);

    for ctx in [
        engine.blob("lifecycle", "b1"),
        engine.blob("lifecycle", "b1").with_snapshot(&snapshot),
    ] {
        let code = engine.exec_err(&ctx, Operation::GetBlobProperties).await;
        assert_eq!(code, ErrorCode::BlobNotFound);
    }
}

#[tokio::test]
async fn test_delete_only_snapshots_keeps_base() {
    let engine = TestEngine::new();
    engine.create_container("onlysnaps").await;
    engine.put_block_blob("onlysnaps", "blob", b"data").await;
    engine
        .exec(&engine.blob("onlysnaps", "blob"), Operation::SnapshotBlob)
        .await
        .unwrap();

    engine
        .exec(
            &engine.blob("onlysnaps", "blob"),
            Operation::DeleteBlob {
                delete_snapshots: Some(DeleteSnapshots::Only),
            },
        )
        .await
        .unwrap();

    assert_eq!(engine.read(&engine.blob("onlysnaps", "blob")).await, "data");

    // With the snapshots gone a plain delete succeeds
    engine
        .exec(
            &engine.blob("onlysnaps", "blob"),
            Operation::DeleteBlob {
                delete_snapshots: None,
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_snapshot_keeps_old_content_after_overwrite() {
    let engine = TestEngine::new();
    engine.create_container("snapcontent").await;
    engine.put_block_blob("snapcontent", "blob", b"version one").await;

    let snapshot = engine
        .exec(&engine.blob("snapcontent", "blob"), Operation::SnapshotBlob)
        .await
        .unwrap()
        .headers
        .snapshot
        .unwrap();

    engine.put_block_blob("snapcontent", "blob", b"version two").await;

    let base = engine.read(&engine.blob("snapcontent", "blob")).await;
    let old = engine
        .read(&engine.blob("snapcontent", "blob").with_snapshot(snapshot))
        .await;
    assert_eq!(base, "version two");
    assert_eq!(old, "version one");
}

#[tokio::test]
async fn test_concurrent_snapshots_get_distinct_timestamps() {
    let engine = TestEngine::new();
    engine.create_container("snapconcurrent").await;
    engine.put_block_blob("snapconcurrent", "blob", b"x").await;

    let now = Utc::now();
    let ctx = engine.blob("snapconcurrent", "blob").with_now(now);
    let results = join_all((0..8).map(|_| engine.exec(&ctx, Operation::SnapshotBlob))).await;

    let stamps: HashSet<String> = results
        .into_iter()
        .map(|r| r.unwrap().headers.snapshot.unwrap())
        .collect();
    assert_eq!(stamps.len(), 8);
}

#[tokio::test]
async fn test_restarted_engine_does_not_reuse_snapshot_stamps() {
    let engine = TestEngine::new();
    engine.create_container("snaprestart").await;
    engine.put_block_blob("snaprestart", "blob", b"x").await;

    let now = Utc::now();
    let ctx = engine.blob("snaprestart", "blob").with_now(now);
    let first = engine
        .exec(&ctx, Operation::SnapshotBlob)
        .await
        .unwrap()
        .headers
        .snapshot
        .unwrap();

    // A fresh server over the same stores starts with no allocator state
    let restarted = BlobServer::with_storage(
        Config::default(),
        engine.metadata.clone(),
        engine.extents.clone(),
    );
    let second = restarted
        .execute(&ctx, Operation::SnapshotBlob)
        .await
        .unwrap()
        .headers
        .snapshot
        .unwrap();

    assert_ne!(first, second);
    assert!(second > first);
}

#[tokio::test]
async fn test_snapshot_of_snapshot_is_rejected() {
    let engine = TestEngine::new();
    engine.create_container("snapsnap").await;
    engine.put_block_blob("snapsnap", "blob", b"x").await;
    let snapshot = engine
        .exec(&engine.blob("snapsnap", "blob"), Operation::SnapshotBlob)
        .await
        .unwrap()
        .headers
        .snapshot
        .unwrap();

    let code = engine
        .exec_err(
            &engine.blob("snapsnap", "blob").with_snapshot(snapshot),
            Operation::SnapshotBlob,
        )
        .await;
    assert_eq!(code, ErrorCode::InvalidQueryParameterValue);
}

#[tokio::test]
async fn test_get_blob_range() {
    let engine = TestEngine::new();
    engine.create_container("ranges").await;
    engine.put_block_blob("ranges", "blob", b"Hello, World!").await;

    let result = engine
        .exec(&engine.blob("ranges", "blob").with_range(7, Some(11)), Operation::GetBlob)
        .await
        .unwrap();
    assert_eq!(result.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(result.headers.content_range.as_deref(), Some("bytes 7-11/13"));
    match result.payload {
        Payload::Content(data) => assert_eq!(data, "World"),
        other => panic!("unexpected payload {:?}", other),
    }

    // An open-ended range runs to the end of the blob
    let data = engine
        .read(&engine.blob("ranges", "blob").with_range(7, None))
        .await;
    assert_eq!(data, "World!");

    let code = engine
        .exec_err(&engine.blob("ranges", "blob").with_range(13, None), Operation::GetBlob)
        .await;
    assert_eq!(code, ErrorCode::InvalidRange);
}

#[tokio::test]
async fn test_put_blob_computes_and_checks_md5() {
    let engine = TestEngine::new();
    engine.create_container("md5").await;
    let body = b"checksum me";
    let expected = BASE64.encode(Md5::digest(body));

    let result = engine.put_block_blob("md5", "blob", body).await;
    assert_eq!(result.headers.content.content_md5.as_deref(), Some(expected.as_str()));

    let ctx = engine.blob("md5", "other").with_content(ContentHeaders {
        content_md5: Some(BASE64.encode(Md5::digest(b"something else"))),
        ..Default::default()
    });
    let code = engine
        .exec_err(&ctx, Operation::UploadBlockBlob(Bytes::from_static(body)))
        .await;
    assert_eq!(code, ErrorCode::Md5Mismatch);
}

#[tokio::test]
async fn test_blob_properties_and_metadata() {
    let engine = TestEngine::new();
    engine.create_container("props").await;

    let ctx = engine
        .blob("props", "blob.txt")
        .with_metadata("origin", "test")
        .with_content(ContentHeaders {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        });
    engine
        .exec(&ctx, Operation::UploadBlockBlob(Bytes::from_static(b"hello")))
        .await
        .unwrap();

    let props = engine
        .exec(&engine.blob("props", "blob.txt"), Operation::GetBlobProperties)
        .await
        .unwrap();
    assert_eq!(props.headers.content.content_type.as_deref(), Some("text/plain"));
    assert_eq!(props.headers.metadata["origin"], "test");
    assert_eq!(props.headers.access_tier, Some(AccessTier::Hot));
    assert_eq!(props.headers.access_tier_inferred, Some(true));

    let ctx = engine.blob("props", "blob.txt").with_content(ContentHeaders {
        content_type: Some("application/json".to_string()),
        cache_control: Some("no-cache".to_string()),
        ..Default::default()
    });
    engine.exec(&ctx, Operation::SetBlobProperties).await.unwrap();

    let ctx = engine.blob("props", "blob.txt").with_metadata("replaced", "yes");
    engine.exec(&ctx, Operation::SetBlobMetadata).await.unwrap();

    let props = engine
        .exec(&engine.blob("props", "blob.txt"), Operation::GetBlobProperties)
        .await
        .unwrap();
    assert_eq!(props.headers.content.content_type.as_deref(), Some("application/json"));
    assert_eq!(props.headers.content.cache_control.as_deref(), Some("no-cache"));
    assert!(!props.headers.metadata.contains_key("origin"));
    assert_eq!(props.headers.metadata["replaced"], "yes");
    assert_eq!(engine.read(&engine.blob("props", "blob.txt")).await, "hello");
}

#[tokio::test]
async fn test_conditional_requests() {
    let engine = TestEngine::new();
    engine.create_container("conditions").await;
    let etag = engine
        .put_block_blob("conditions", "blob", b"v1")
        .await
        .headers
        .etag
        .unwrap();

    let stale = engine.blob("conditions", "blob").with_conditions(Conditions {
        if_match: Some("\"stale\"".to_string()),
        ..Default::default()
    });
    let code = engine
        .exec_err(&stale, Operation::UploadBlockBlob(Bytes::from_static(b"v2")))
        .await;
    assert_eq!(code, ErrorCode::ConditionNotMet);

    let current = engine.blob("conditions", "blob").with_conditions(Conditions {
        if_match: Some(etag),
        ..Default::default()
    });
    engine
        .exec(&current, Operation::UploadBlockBlob(Bytes::from_static(b"v2")))
        .await
        .unwrap();

    // If-None-Match: * only creates
    let create_only = engine.blob("conditions", "blob").with_conditions(Conditions {
        if_none_match: Some("*".to_string()),
        ..Default::default()
    });
    let code = engine
        .exec_err(&create_only, Operation::UploadBlockBlob(Bytes::from_static(b"v3")))
        .await;
    assert_eq!(code, ErrorCode::ConditionNotMet);
    assert_eq!(engine.read(&engine.blob("conditions", "blob")).await, "v2");
}

#[tokio::test]
async fn test_missing_blob_and_container() {
    let engine = TestEngine::new();
    let code = engine
        .exec_err(&engine.blob("nocontainer", "blob"), Operation::GetBlob)
        .await;
    assert_eq!(code, ErrorCode::ContainerNotFound);

    engine.create_container("present").await;
    let code = engine
        .exec_err(&engine.blob("present", "missing"), Operation::GetBlob)
        .await;
    assert_eq!(code, ErrorCode::BlobNotFound);
}

#[tokio::test]
async fn test_errors_carry_request_id() {
    let engine = TestEngine::new();
    let ctx = engine.blob("nocontainer", "blob");
    let err = engine.exec(&ctx, Operation::GetBlob).await.unwrap_err();
    assert_eq!(err.request_id.as_deref(), Some(ctx.request_id.as_str()));

    engine.create_container("withid").await;
    let ctx = engine.blob("withid", "blob");
    let result = engine
        .exec(&ctx, Operation::UploadBlockBlob(Bytes::from_static(b"x")))
        .await
        .unwrap();
    assert_eq!(result.headers.request_id.as_deref(), Some(ctx.request_id.as_str()));
}

#[tokio::test]
async fn test_set_tier_and_delayed_rehydration() {
    let config = Config {
        rehydrate_delay: Duration::from_secs(60),
        ..Config::default()
    };
    let engine = TestEngine::with_config(config, Arc::new(MemoryExtentStore::new()));
    engine.create_container("tiers").await;
    engine.put_block_blob("tiers", "blob", b"cold data").await;
    let ctx = engine.blob("tiers", "blob");

    let result = engine
        .exec(&ctx, Operation::SetBlobTier(AccessTier::Archive))
        .await
        .unwrap();
    assert_eq!(result.status, StatusCode::OK);

    let code = engine.exec_err(&ctx, Operation::GetBlob).await;
    assert_eq!(code, ErrorCode::BlobArchived);

    let result = engine
        .exec(&ctx, Operation::SetBlobTier(AccessTier::Hot))
        .await
        .unwrap();
    assert_eq!(result.status, StatusCode::ACCEPTED);

    let props = engine.exec(&ctx, Operation::GetBlobProperties).await.unwrap();
    assert_eq!(props.headers.access_tier, Some(AccessTier::Archive));
    assert_eq!(
        props.headers.archive_status.as_deref(),
        Some("rehydrate-pending-to-hot")
    );

    // Once the delay has passed the blob reads as Hot
    let later = engine
        .blob("tiers", "blob")
        .with_now(Utc::now() + chrono::Duration::seconds(120));
    let props = engine.exec(&later, Operation::GetBlobProperties).await.unwrap();
    assert_eq!(props.headers.access_tier, Some(AccessTier::Hot));
    assert!(props.headers.archive_status.is_none());
    assert_eq!(engine.read(&later).await, "cold data");
}

#[tokio::test]
async fn test_set_tier_rejects_page_blobs() {
    let engine = TestEngine::new();
    engine.create_container("tierpage").await;
    let ctx = engine.blob("tierpage", "disk");
    engine
        .exec(
            &ctx,
            Operation::CreatePageBlob {
                size: 1024,
                sequence_number: None,
            },
        )
        .await
        .unwrap();

    let code = engine
        .exec_err(&ctx, Operation::SetBlobTier(AccessTier::Cool))
        .await;
    assert_eq!(code, ErrorCode::InvalidBlobType);
}

#[tokio::test]
async fn test_list_blobs_includes_snapshots() {
    let engine = TestEngine::new();
    engine.create_container("listsnaps").await;
    engine.put_block_blob("listsnaps", "blob", b"x").await;
    engine
        .exec(&engine.blob("listsnaps", "blob"), Operation::SnapshotBlob)
        .await
        .unwrap();

    let list = |include_snapshots| {
        Operation::ListBlobs(ListBlobsOptions {
            include_snapshots,
            ..Default::default()
        })
    };

    for (include, expected) in [(false, 1), (true, 2)] {
        let result = engine
            .exec(&engine.container("listsnaps"), list(include))
            .await
            .unwrap();
        match result.payload {
            Payload::Blobs(listing) => assert_eq!(listing.blobs.len(), expected),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
