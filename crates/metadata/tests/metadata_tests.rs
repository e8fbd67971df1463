//! Integration tests for MetadataStore implementations.

mod common;

use common::{
    TEST_USER, TestMetadata, address, content, object, postgres_test_metadata,
    run_metadata_test_both,
};
use std::time::Duration;
use strata_core::config::GcConfig;
use strata_core::{ContentAddress, DealStatus};
use strata_metadata::models::*;
use strata_metadata::query::{
    CollectionQuery, ContentQuery, DealQuery, ObjRefQuery, ObjectQuery, SortOrder, UserQuery,
};
use strata_metadata::{MetadataError, bootstrap, gc};
use time::{OffsetDateTime, UtcOffset};
use uuid::Uuid;

// =============================================================================
// Objects and references
// =============================================================================

#[tokio::test]
async fn test_shared_blocks_are_stored_once() {
    run_metadata_test_both(|store| async move {
        let a = store
            .create_content_with_objects(
                &content("a"),
                &[object("block-1", 10), object("block-2", 20)],
            )
            .await
            .expect("ingest a");
        let b = store
            .create_content_with_objects(
                &content("b"),
                &[object("block-2", 20), object("block-3", 30)],
            )
            .await
            .expect("ingest b");

        assert_eq!(a.objects[1].id, b.objects[0].id);
        assert_eq!(store.count_objects(&ObjectQuery::default()).await.unwrap(), 3);
        assert_eq!(
            store
                .count_obj_refs(&ObjRefQuery::by_object(a.objects[1].id))
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .list_obj_refs(&ObjRefQuery::by_pin(b.content.id))
                .await
                .unwrap()
                .len(),
            2
        );
    })
    .await;
}

#[tokio::test]
async fn test_find_or_create_object_is_idempotent() {
    run_metadata_test_both(|store| async move {
        let new = object("same", 42);
        let (first, second) = tokio::join!(
            store.find_or_create_object(new),
            store.find_or_create_object(new)
        );
        let first = first.expect("first upsert");
        let second = second.expect("second upsert");
        assert_eq!(first.id, second.id);
        assert_eq!(first.cid, address("same"));

        // The first recorded size wins.
        let third = store
            .find_or_create_object(object("same", 99))
            .await
            .expect("third upsert");
        assert_eq!(third.id, first.id);
        assert_eq!(third.size, 42);

        let fetched = store
            .get_object(&ObjectQuery::by_cid(address("same")))
            .await
            .expect("get by cid");
        assert_eq!(fetched.id, first.id);
        assert_eq!(store.count_objects(&ObjectQuery::default()).await.unwrap(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_find_or_create_rejects_undefined_address() {
    run_metadata_test_both(|store| async move {
        let err = store
            .find_or_create_object(NewObject {
                cid: ContentAddress::UNDEF,
                size: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::MalformedIdentifier(_)));
        assert!(
            !store
                .object_exists(&ObjectQuery::default())
                .await
                .unwrap()
        );
    })
    .await;
}

#[tokio::test]
async fn test_link_object_dangling_references() {
    run_metadata_test_both(|store| async move {
        let item = store.create_content(&content("item")).await.unwrap();
        let obj = store
            .find_or_create_object(object("blk", 1))
            .await
            .unwrap();

        let err = store
            .link_object(NewObjRef {
                object: obj.id + 1000,
                pin: item.id,
                offloaded: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::DanglingReference(_)));

        let err = store
            .link_object(NewObjRef {
                object: obj.id,
                pin: item.id + 1000,
                offloaded: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::DanglingReference(_)));

        let linked = store
            .link_object(NewObjRef {
                object: obj.id,
                pin: item.id,
                offloaded: true,
            })
            .await
            .expect("link");
        assert!(linked.offloaded);
        assert_eq!(linked.pin, item.id);
    })
    .await;
}

// =============================================================================
// Garbage collection
// =============================================================================

#[tokio::test]
async fn test_shared_object_survives_until_last_reference() {
    run_metadata_test_both(|store| async move {
        let a = store
            .create_content_with_objects(&content("a"), &[object("shared", 5)])
            .await
            .unwrap();
        let b = store
            .create_content_with_objects(&content("b"), &[object("shared", 5)])
            .await
            .unwrap();
        let shared = a.objects[0].id;

        let deleted = gc::release_content(store.as_ref(), a.content.id)
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert!(
            store
                .object_exists(&ObjectQuery::by_id(shared))
                .await
                .unwrap()
        );

        let deleted = gc::release_content(store.as_ref(), b.content.id)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(
            !store
                .object_exists(&ObjectQuery::by_id(shared))
                .await
                .unwrap()
        );
    })
    .await;
}

#[tokio::test]
async fn test_unlink_all_returns_candidates() {
    run_metadata_test_both(|store| async move {
        let ingested = store
            .create_content_with_objects(
                &content("multi"),
                &[object("x", 1), object("y", 2), object("x", 1)],
            )
            .await
            .unwrap();
        assert_eq!(ingested.obj_refs.len(), 3);

        let mut expected: Vec<i64> = ingested.objects.iter().map(|o| o.id).collect();
        expected.sort_unstable();
        expected.dedup();

        let candidates = store.unlink_all(ingested.content.id).await.unwrap();
        assert_eq!(candidates, expected);
        assert_eq!(
            store
                .count_obj_refs(&ObjRefQuery::by_pin(ingested.content.id))
                .await
                .unwrap(),
            0
        );
        assert!(store.unlink_all(ingested.content.id).await.unwrap().is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_sweep_skips_object_relinked_after_selection() {
    run_metadata_test_both(|store| async move {
        let orphan = store
            .find_or_create_object(object("orphan", 7))
            .await
            .unwrap();
        let candidates = store.list_unreferenced_objects(100).await.unwrap();
        assert_eq!(candidates, vec![orphan.id]);

        // A new pin lands between candidate selection and the sweep.
        let late = store.create_content(&content("late")).await.unwrap();
        store
            .link_object(NewObjRef {
                object: orphan.id,
                pin: late.id,
                offloaded: false,
            })
            .await
            .unwrap();

        let deleted = store.sweep_unreferenced(&candidates).await.unwrap();
        assert_eq!(deleted, 0);
        assert!(
            store
                .object_exists(&ObjectQuery::by_id(orphan.id))
                .await
                .unwrap()
        );

        // Sweeping unknown ids is not an error.
        assert_eq!(store.sweep_unreferenced(&[orphan.id + 500]).await.unwrap(), 0);
        assert_eq!(store.sweep_unreferenced(&[]).await.unwrap(), 0);
    })
    .await;
}

/// Insert an object reference inside `tx` without committing it.
async fn link_uncommitted(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    object_id: i64,
    content_id: i64,
) {
    sqlx::query(
        "INSERT INTO obj_refs (object, pin, offloaded, created_at) VALUES ($1, $2, false, now())",
    )
    .bind(object_id)
    .bind(content_id)
    .execute(&mut **tx)
    .await
    .expect("uncommitted link");
}

#[tokio::test]
async fn test_sweep_skips_object_linked_by_open_transaction() {
    let Some(postgres) = postgres_test_metadata().await else {
        return;
    };
    let store = postgres.store();
    let holder = store.create_content(&content("holder")).await.unwrap();
    let block = store
        .find_or_create_object(object("contended", 5))
        .await
        .unwrap();
    let candidates = store.list_unreferenced_objects(10).await.unwrap();
    assert_eq!(candidates, vec![block.id]);

    // The sweep's delete waits on the row lock taken by the open link and
    // trips the foreign key once the link commits.
    let mut tx = postgres.pool().begin().await.unwrap();
    link_uncommitted(&mut tx, block.id, holder.id).await;
    let commit_later = async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.commit().await
    };
    let (deleted, committed) =
        tokio::join!(store.sweep_unreferenced(&candidates), commit_later);
    committed.expect("commit link");

    assert_eq!(deleted.expect("sweep"), 0);
    assert!(
        store
            .object_exists(&ObjectQuery::by_id(block.id))
            .await
            .unwrap()
    );
    assert_eq!(
        store
            .count_obj_refs(&ObjRefQuery::by_object(block.id))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_gc_driver_sweeps_in_batches() {
    run_metadata_test_both(|store| async move {
        let kept = store
            .create_content_with_objects(&content("kept"), &[object("live", 1)])
            .await
            .unwrap();
        for i in 0..5 {
            store
                .find_or_create_object(object(&format!("dead-{i}"), 1))
                .await
                .unwrap();
        }

        let config = GcConfig {
            batch_size: 2,
            max_batches: 0,
        };
        let stats = gc::sweep_unreferenced_objects(store.as_ref(), &config)
            .await
            .unwrap();
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.items_processed, 5);
        assert_eq!(stats.items_deleted, 5);

        let remaining = store.list_objects(&ObjectQuery::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, kept.objects[0].id);
    })
    .await;
}

#[tokio::test]
async fn test_gc_driver_respects_batch_limit() {
    run_metadata_test_both(|store| async move {
        for i in 0..4 {
            store
                .find_or_create_object(object(&format!("dead-{i}"), 1))
                .await
                .unwrap();
        }
        let config = GcConfig {
            batch_size: 1,
            max_batches: 2,
        };
        let stats = gc::sweep_unreferenced_objects(store.as_ref(), &config)
            .await
            .unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.items_deleted, 2);
        assert_eq!(store.count_objects(&ObjectQuery::default()).await.unwrap(), 2);
    })
    .await;
}

// =============================================================================
// Contents
// =============================================================================

#[tokio::test]
async fn test_hard_delete_guard() {
    run_metadata_test_both(|store| async move {
        let ingested = store
            .create_content_with_objects(&content("guarded"), &[object("g", 3)])
            .await
            .unwrap();
        let id = ingested.content.id;
        let deal = store
            .create_deal(&NewDeal::proposed(id, "f01234"))
            .await
            .unwrap();

        match store.hard_delete_content(id).await.unwrap_err() {
            MetadataError::ContentInUse {
                content_id,
                deals,
                obj_refs,
                children,
            } => {
                assert_eq!(content_id, id);
                assert_eq!(deals, 1);
                assert_eq!(obj_refs, 1);
                assert_eq!(children, 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        store.unlink_all(id).await.unwrap();
        let err = store.hard_delete_content(id).await.unwrap_err();
        assert!(matches!(
            err,
            MetadataError::ContentInUse {
                deals: 1,
                obj_refs: 0,
                ..
            }
        ));

        // Failed deals no longer block and are removed with the content.
        store
            .set_deal_status(deal.id, DealStatus::Failed)
            .await
            .unwrap();
        store.hard_delete_content(id).await.expect("hard delete");

        assert!(
            !store
                .content_exists(&ContentQuery::by_id(id))
                .await
                .unwrap()
        );
        assert_eq!(store.count_deals(&DealQuery::by_content(id)).await.unwrap(), 0);

        let err = store.hard_delete_content(id).await.unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)));
    })
    .await;
}

#[tokio::test]
async fn test_hard_delete_refused_when_open_transaction_links_content() {
    let Some(postgres) = postgres_test_metadata().await else {
        return;
    };
    let store = postgres.store();
    let target = store.create_content(&content("target")).await.unwrap();
    let block = store
        .find_or_create_object(object("pinned-late", 5))
        .await
        .unwrap();

    let mut tx = postgres.pool().begin().await.unwrap();
    link_uncommitted(&mut tx, block.id, target.id).await;
    let commit_later = async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.commit().await
    };
    let (result, committed) =
        tokio::join!(store.hard_delete_content(target.id), commit_later);
    committed.expect("commit link");

    match result.unwrap_err() {
        MetadataError::ContentInUse {
            content_id,
            deals,
            obj_refs,
            children,
        } => {
            assert_eq!(content_id, target.id);
            assert_eq!(deals, 0);
            assert_eq!(obj_refs, 1);
            assert_eq!(children, 0);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(
        store
            .content_exists(&ContentQuery::by_id(target.id))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_hard_delete_blocked_by_aggregated_children() {
    run_metadata_test_both(|store| async move {
        let bundle = store
            .create_content(&NewContent::aggregate(TEST_USER, "bundle"))
            .await
            .unwrap();
        let child = store
            .create_content(&content("child").in_aggregate(bundle.id))
            .await
            .unwrap();

        let err = store.hard_delete_content(bundle.id).await.unwrap_err();
        assert!(matches!(
            err,
            MetadataError::ContentInUse { children: 1, .. }
        ));

        store.hard_delete_content(child.id).await.unwrap();
        store.hard_delete_content(bundle.id).await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_aggregates_cannot_own_objects() {
    run_metadata_test_both(|store| async move {
        let err = store
            .create_content_with_objects(
                &NewContent::aggregate(TEST_USER, "bundle"),
                &[object("o", 1)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::InvalidAggregate(_)));
        assert_eq!(store.count_contents(&ContentQuery::all()).await.unwrap(), 0);
        assert_eq!(store.count_objects(&ObjectQuery::default()).await.unwrap(), 0);

        let bundle = store
            .create_content(&NewContent::aggregate(TEST_USER, "bundle"))
            .await
            .unwrap();
        assert!(bundle.aggregate);
        assert!(!bundle.cid.is_defined());

        let obj = store.find_or_create_object(object("o", 1)).await.unwrap();
        let err = store
            .link_object(NewObjRef {
                object: obj.id,
                pin: bundle.id,
                offloaded: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::InvalidAggregate(_)));
    })
    .await;
}

#[tokio::test]
async fn test_aggregated_in_must_name_an_aggregate() {
    run_metadata_test_both(|store| async move {
        let leaf = store.create_content(&content("leaf")).await.unwrap();

        let err = store
            .create_content(&content("child").in_aggregate(leaf.id))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::DanglingReference(_)));

        let err = store
            .create_content(&content("child").in_aggregate(leaf.id + 100))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::DanglingReference(_)));

        assert_eq!(store.count_contents(&ContentQuery::all()).await.unwrap(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_batch_create_is_all_or_nothing() {
    run_metadata_test_both(|store| async move {
        let bundle = NewContent::aggregate(TEST_USER, "bundle");
        let created = store
            .create_contents(&[content("one"), bundle, content("two")])
            .await
            .expect("batch create");
        assert_eq!(created.len(), 3);
        assert_eq!(created[0].name, "one");
        assert_eq!(created[2].name, "two");

        let err = store
            .create_contents(&[
                content("three"),
                content("four").in_aggregate(created[0].id),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::DanglingReference(_)));
        assert_eq!(store.count_contents(&ContentQuery::all()).await.unwrap(), 3);

        let members = store
            .create_contents(&[
                content("five").in_aggregate(created[1].id),
                content("six").in_aggregate(created[1].id),
            ])
            .await
            .unwrap();
        assert!(members.iter().all(|m| m.aggregated_in == Some(created[1].id)));
    })
    .await;
}

#[tokio::test]
async fn test_aggregate_children_ordering_and_paging() {
    run_metadata_test_both(|store| async move {
        let bundle = store
            .create_content(&NewContent::aggregate(TEST_USER, "bundle"))
            .await
            .unwrap();

        let base = OffsetDateTime::now_utc().replace_nanosecond(0).unwrap();
        let mut ids = Vec::new();
        for i in 0..4 {
            let mut child = content(&format!("child-{i}")).in_aggregate(bundle.id);
            child.created_at = base + time::Duration::seconds(i);
            ids.push(store.create_content(&child).await.unwrap().id);
        }

        let newest_first = store
            .list_contents(
                &ContentQuery::children_of(bundle.id)
                    .order_by_creation_date(SortOrder::Descending),
            )
            .await
            .unwrap();
        let listed: Vec<i64> = newest_first.iter().map(|c| c.id).collect();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(listed, expected);

        let page = store
            .list_contents(
                &ContentQuery::children_of(bundle.id)
                    .order_by_creation_date(SortOrder::Ascending)
                    .limit(2)
                    .offset(1),
            )
            .await
            .unwrap();
        let paged: Vec<i64> = page.iter().map(|c| c.id).collect();
        assert_eq!(paged, ids[1..3].to_vec());

        let first = store
            .get_content(
                &ContentQuery::children_of(bundle.id).order_by_id(SortOrder::Descending),
            )
            .await
            .unwrap();
        assert_eq!(first.id, ids[3]);

        assert_eq!(
            store
                .count_contents(&ContentQuery::children_of(bundle.id).limit(1))
                .await
                .unwrap(),
            4
        );
    })
    .await;
}

#[tokio::test]
async fn test_creation_order_follows_instant_not_text() {
    run_metadata_test_both(|store| async move {
        let bundle = store
            .create_content(&NewContent::aggregate(TEST_USER, "bundle"))
            .await
            .unwrap();

        // Whole seconds, a fractional second, and a later instant written
        // with a negative offset.
        let base = OffsetDateTime::now_utc().replace_nanosecond(0).unwrap();
        let eastern = UtcOffset::from_hms(-5, 0, 0).unwrap();
        let stamps = [
            base,
            base + time::Duration::milliseconds(100),
            (base + time::Duration::seconds(10)).to_offset(eastern),
        ];

        let mut ids = Vec::new();
        for (i, created_at) in stamps.iter().enumerate() {
            let mut child = content(&format!("timed-{i}")).in_aggregate(bundle.id);
            child.created_at = *created_at;
            let row = store.create_content(&child).await.unwrap();
            assert_eq!(row.created_at, *created_at);
            ids.push(row.id);
        }

        let oldest_first: Vec<i64> = store
            .list_contents(
                &ContentQuery::children_of(bundle.id)
                    .order_by_creation_date(SortOrder::Ascending),
            )
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(oldest_first, ids);

        let newest = store
            .get_content(
                &ContentQuery::children_of(bundle.id)
                    .order_by_creation_date(SortOrder::Descending),
            )
            .await
            .unwrap();
        assert_eq!(newest.id, ids[2]);
    })
    .await;
}

#[tokio::test]
async fn test_soft_delete_cascades_to_children() {
    run_metadata_test_both(|store| async move {
        let bundle = store
            .create_content(&NewContent::aggregate(TEST_USER, "bundle"))
            .await
            .unwrap();
        for i in 0..2 {
            store
                .create_content(&content(&format!("member-{i}")).in_aggregate(bundle.id))
                .await
                .unwrap();
        }
        let other = store.create_content(&content("other")).await.unwrap();

        let deactivated = store.soft_delete_content(bundle.id).await.unwrap();
        assert_eq!(deactivated, 3);

        let active = store
            .list_contents(&ContentQuery::all().with_active(true))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, other.id);

        let err = store.soft_delete_content(other.id + 100).await.unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)));
    })
    .await;
}

#[tokio::test]
async fn test_soft_delete_reaches_nested_members() {
    run_metadata_test_both(|store| async move {
        let outer = store
            .create_content(&NewContent::aggregate(TEST_USER, "outer"))
            .await
            .unwrap();
        let inner = store
            .create_content(&NewContent::aggregate(TEST_USER, "inner").in_aggregate(outer.id))
            .await
            .unwrap();
        let leaf = store
            .create_content(&content("leaf").in_aggregate(inner.id))
            .await
            .unwrap();

        assert_eq!(store.soft_delete_content(outer.id).await.unwrap(), 3);
        let leaf = store
            .get_content(&ContentQuery::by_id(leaf.id))
            .await
            .unwrap();
        assert!(!leaf.active);

        // Deactivating an inner aggregate leaves its parent alone.
        let parent = store
            .create_content(&NewContent::aggregate(TEST_USER, "parent"))
            .await
            .unwrap();
        let nested = store
            .create_content(&NewContent::aggregate(TEST_USER, "nested").in_aggregate(parent.id))
            .await
            .unwrap();
        assert_eq!(store.soft_delete_content(nested.id).await.unwrap(), 1);
        assert!(
            store
                .get_content(&ContentQuery::by_id(parent.id))
                .await
                .unwrap()
                .active
        );
    })
    .await;
}

#[tokio::test]
async fn test_content_query_filters() {
    run_metadata_test_both(|store| async move {
        let a = store.create_content(&content("a")).await.unwrap();
        let b = store.create_content(&content("b")).await.unwrap();
        store
            .create_content(&NewContent::new(2, "c", address("c")))
            .await
            .unwrap();

        let by_cid = store
            .get_content(&ContentQuery::all().with_cid(address("b")))
            .await
            .unwrap();
        assert_eq!(by_cid.id, b.id);

        let by_cids = store
            .list_contents(
                &ContentQuery::all()
                    .with_cids(vec![address("a"), address("c"), address("missing")])
                    .order_by_id(SortOrder::Ascending),
            )
            .await
            .unwrap();
        assert_eq!(by_cids.len(), 2);
        assert_eq!(by_cids[0].id, a.id);

        assert!(
            store
                .list_contents(&ContentQuery::all().with_cids(vec![]))
                .await
                .unwrap()
                .is_empty()
        );

        assert_eq!(
            store
                .count_contents(&ContentQuery::all().with_user_id(TEST_USER))
                .await
                .unwrap(),
            2
        );
        assert!(
            store
                .content_exists(&ContentQuery::all().with_user_id(2).with_aggregate(false))
                .await
                .unwrap()
        );
        assert!(
            !store
                .content_exists(&ContentQuery::all().with_user_id(2).with_aggregate(true))
                .await
                .unwrap()
        );

        let err = store
            .get_content(&ContentQuery::by_id(b.id + 100))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)));
    })
    .await;
}

#[tokio::test]
async fn test_query_by_undefined_address() {
    run_metadata_test_both(|store| async move {
        let pending = store
            .create_content(&NewContent::new(TEST_USER, "pending", ContentAddress::UNDEF))
            .await
            .unwrap();
        let ready = store.create_content(&content("ready")).await.unwrap();

        let found = store
            .list_contents(&ContentQuery::all().with_cid(ContentAddress::UNDEF))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, pending.id);
        assert!(!found[0].cid.is_defined());

        let both = store
            .list_contents(
                &ContentQuery::all()
                    .with_cids(vec![address("ready"), ContentAddress::UNDEF])
                    .order_by_id(SortOrder::Ascending),
            )
            .await
            .unwrap();
        let ids: Vec<i64> = both.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![pending.id, ready.id]);

        assert!(
            !store
                .object_exists(&ObjectQuery::by_cid(ContentAddress::UNDEF))
                .await
                .unwrap()
        );
    })
    .await;
}

#[tokio::test]
async fn test_malformed_stored_address_is_reported() {
    let metadata = TestMetadata::new()
        .await
        .expect("Failed to create metadata");
    let store = metadata.store();
    let now = OffsetDateTime::now_utc();

    sqlx::query(
        "INSERT INTO contents (cid, name, user_id, created_at, updated_at) VALUES (X'DEADBEEF', 'bad', 1, ?, ?)",
    )
    .bind(now)
    .bind(now)
    .execute(metadata.pool())
    .await
    .expect("raw insert");

    let err = store.list_contents(&ContentQuery::all()).await.unwrap_err();
    assert!(
        matches!(err, MetadataError::MalformedIdentifier(_)),
        "unexpected error: {err:?}"
    );
}

// =============================================================================
// Deals
// =============================================================================

#[tokio::test]
async fn test_deal_lifecycle() {
    run_metadata_test_both(|store| async move {
        let a = store.create_content(&content("a")).await.unwrap();
        let b = store.create_content(&content("b")).await.unwrap();

        let mut on_chain = NewDeal::proposed(a.id, "f01000");
        on_chain.deal_id = Some(77);
        on_chain.proposal_cid = address("proposal");
        let d1 = store.create_deal(&on_chain).await.unwrap();
        assert_eq!(d1.status, DealStatus::Proposed);
        assert_eq!(d1.deal_id, Some(77));
        assert_eq!(d1.proposal_cid, address("proposal"));
        assert!(d1.failed_at.is_none());

        let d2 = store
            .create_deal(&NewDeal::proposed(b.id, "f02000"))
            .await
            .unwrap();
        assert!(!d2.proposal_cid.is_defined());

        let both = store
            .list_deals(&DealQuery::by_contents(vec![a.id, b.id]))
            .await
            .unwrap();
        assert_eq!(both.len(), 2);
        assert!(
            store
                .list_deals(&DealQuery::by_contents(vec![]))
                .await
                .unwrap()
                .is_empty()
        );

        let active = store
            .set_deal_status(d1.id, DealStatus::Active)
            .await
            .unwrap();
        assert_eq!(active.status, DealStatus::Active);
        assert!(active.failed_at.is_none());

        let failed = store
            .set_deal_status(d2.id, DealStatus::Failed)
            .await
            .unwrap();
        assert!(failed.failed_at.is_some());

        let err = store
            .set_deal_status(d2.id + 100, DealStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)));

        let err = store
            .create_deal(&NewDeal::proposed(b.id + 100, "f03000"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::DanglingReference(_)));

        let removed = store
            .delete_deals(&DealQuery::by_content(a.id))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            store
                .count_deals(&DealQuery::by_contents(vec![a.id, b.id]))
                .await
                .unwrap(),
            1
        );
    })
    .await;
}

#[tokio::test]
async fn test_unfiltered_deletes_are_refused() {
    run_metadata_test_both(|store| async move {
        for name in ["alice", "bob"] {
            store
                .create_user(&NewUser {
                    username: name.to_string(),
                    perm: 0,
                })
                .await
                .unwrap();
        }
        let ingested = store
            .create_content_with_objects(&content("kept"), &[object("kept-block", 1)])
            .await
            .unwrap();
        store
            .create_deal(&NewDeal::proposed(ingested.content.id, "f01000"))
            .await
            .unwrap();
        store
            .create_collection(&NewCollection::new(TEST_USER, "kept"))
            .await
            .unwrap();

        let err = store.delete_deals(&DealQuery::default()).await.unwrap_err();
        assert!(matches!(err, MetadataError::Constraint(_)));
        let err = store
            .expect_delete_users(&UserQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Constraint(_)));
        let err = store
            .delete_obj_refs(&ObjRefQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Constraint(_)));
        let err = store
            .expect_delete_collections(&CollectionQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Constraint(_)));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.users, 2);
        assert_eq!(stats.deals, 1);
        assert_eq!(stats.obj_refs, 1);
        assert_eq!(stats.collections, 1);

        // An empty id list is a filter that matches nothing.
        assert_eq!(
            store
                .delete_deals(&DealQuery::by_contents(vec![]))
                .await
                .unwrap(),
            0
        );
    })
    .await;
}

// =============================================================================
// Collections
// =============================================================================

#[tokio::test]
async fn test_collection_refs() {
    run_metadata_test_both(|store| async move {
        let item = store.create_content(&content("item")).await.unwrap();
        let mut new = NewCollection::new(TEST_USER, "photos");
        new.description = Some("holiday".to_string());
        let coll = store.create_collection(&new).await.unwrap();
        assert_eq!(coll.uuid, new.uuid);

        let fetched = store
            .get_collection(&CollectionQuery::by_uuid(new.uuid).with_user_id(TEST_USER))
            .await
            .unwrap();
        assert_eq!(fetched.id, coll.id);
        let err = store
            .get_collection(&CollectionQuery::by_uuid(new.uuid).with_user_id(TEST_USER + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)));

        let entry = NewCollectionRef {
            collection: coll.id,
            content: item.id,
            path: Some("/2024/beach.jpg".to_string()),
        };
        store.create_collection_ref(&entry).await.unwrap();
        store.create_collection_ref(&entry).await.unwrap();
        assert_eq!(store.list_collection_refs(coll.id).await.unwrap().len(), 2);

        let err = store
            .create_collection_ref(&NewCollectionRef {
                collection: coll.id,
                content: item.id + 100,
                path: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::DanglingReference(_)));

        let err = store
            .create_collection_ref(&NewCollectionRef {
                collection: coll.id + 100,
                content: item.id,
                path: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::DanglingReference(_)));

        // Deleting the collection drops its refs but keeps the content.
        let deleted = store
            .expect_delete_collections(&CollectionQuery::by_uuid(new.uuid))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.list_collection_refs(coll.id).await.unwrap().is_empty());
        assert!(
            store
                .content_exists(&ContentQuery::by_id(item.id))
                .await
                .unwrap()
        );

        let err = store
            .expect_delete_collections(&CollectionQuery::by_uuid(new.uuid))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)));
    })
    .await;
}

#[tokio::test]
async fn test_hard_delete_content_keeps_collection() {
    run_metadata_test_both(|store| async move {
        let item = store.create_content(&content("item")).await.unwrap();
        let coll = store
            .create_collection(&NewCollection::new(TEST_USER, "docs"))
            .await
            .unwrap();
        store
            .create_collection_ref(&NewCollectionRef {
                collection: coll.id,
                content: item.id,
                path: None,
            })
            .await
            .unwrap();

        store.hard_delete_content(item.id).await.unwrap();
        assert!(store.list_collection_refs(coll.id).await.unwrap().is_empty());
        assert_eq!(
            store
                .list_collections(&CollectionQuery::by_user(TEST_USER))
                .await
                .unwrap()
                .len(),
            1
        );
    })
    .await;
}

// =============================================================================
// Identity records
// =============================================================================

#[tokio::test]
async fn test_users_and_tokens() {
    run_metadata_test_both(|store| async move {
        let user = store
            .create_user(&NewUser {
                username: "alice".to_string(),
                perm: 2,
            })
            .await
            .unwrap();

        let err = store
            .create_user(&NewUser {
                username: "alice".to_string(),
                perm: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Constraint(_)));

        let fetched = store
            .get_user(&UserQuery::by_username("alice"))
            .await
            .unwrap();
        assert_eq!(fetched.id, user.id);
        assert_eq!(fetched.perm, 2);
        assert_eq!(store.count_users(&UserQuery::default()).await.unwrap(), 1);

        let secret = Uuid::new_v4().to_string();
        let expiry = OffsetDateTime::now_utc() + time::Duration::days(30);
        store
            .create_auth_token(&NewAuthToken {
                token: secret.clone(),
                user_id: user.id,
                expiry,
            })
            .await
            .unwrap();
        let token = store
            .get_auth_token(&secret)
            .await
            .unwrap()
            .expect("token stored");
        assert_eq!(token.user_id, user.id);
        assert!(store.get_auth_token("nope").await.unwrap().is_none());

        let err = store
            .create_auth_token(&NewAuthToken {
                token: "orphan".to_string(),
                user_id: user.id + 100,
                expiry,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::DanglingReference(_)));

        store
            .expect_delete_users(&UserQuery::by_id(user.id))
            .await
            .unwrap();
        assert!(!store.user_exists(&UserQuery::by_id(user.id)).await.unwrap());
        assert!(store.get_auth_token(&secret).await.unwrap().is_none());

        let err = store
            .expect_delete_users(&UserQuery::by_id(user.id))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)));
    })
    .await;
}

// =============================================================================
// Providers and bootstrap
// =============================================================================

#[tokio::test]
async fn test_default_providers_seeded_once() {
    run_metadata_test_both(|store| async move {
        let added = bootstrap::ensure_default_providers(store.as_ref())
            .await
            .unwrap();
        assert_eq!(added, strata_core::DEFAULT_PROVIDERS.len() as u64);

        let again = bootstrap::ensure_default_providers(store.as_ref())
            .await
            .unwrap();
        assert_eq!(again, 0);

        let providers = store.list_providers().await.unwrap();
        assert_eq!(providers.len(), strata_core::DEFAULT_PROVIDERS.len());
        assert_eq!(providers[0].address, strata_core::DEFAULT_PROVIDERS[0]);
    })
    .await;
}

#[tokio::test]
async fn test_add_provider() {
    run_metadata_test_both(|store| async move {
        let first = store.add_provider("f0127896").await.unwrap();
        let again = store.add_provider("f0127896").await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(store.count_providers().await.unwrap(), 1);

        let err = store.add_provider("not-an-address").await.unwrap_err();
        assert!(matches!(err, MetadataError::Constraint(_)));

        // A populated registry is left alone by the seeder.
        assert_eq!(
            bootstrap::ensure_default_providers(store.as_ref())
                .await
                .unwrap(),
            0
        );
    })
    .await;
}

#[tokio::test]
async fn test_stats() {
    run_metadata_test_both(|store| async move {
        let ingested = store
            .create_content_with_objects(&content("s"), &[object("s1", 1), object("s2", 2)])
            .await
            .unwrap();
        store
            .create_deal(&NewDeal::proposed(ingested.content.id, "f01000"))
            .await
            .unwrap();
        store.soft_delete_content(ingested.content.id).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.contents, 1);
        assert_eq!(stats.active_contents, 0);
        assert_eq!(stats.objects, 2);
        assert_eq!(stats.obj_refs, 2);
        assert_eq!(stats.deals, 1);
        assert_eq!(stats.users, 0);
    })
    .await;
}
