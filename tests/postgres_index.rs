//! `PostgresCacheIndex` against a scratch database.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use pagecache::cache::{
    CacheConfig, CacheIndex, ContentUnitId, MemoryBodyStore, PageCache, RenderedPage,
    RequestContext, RequestIdentity, SiteId,
};
use pagecache::infra::db::PostgresCacheIndex;
use sqlx::PgPool;

fn units(ids: &[&str]) -> HashSet<ContentUnitId> {
    ids.iter().map(|id| ContentUnitId::new(*id)).collect()
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn create_find_and_replace_entries(pool: PgPool) {
    let index = PostgresCacheIndex::new(pool);
    let identity = RequestIdentity::new("/blog/post-1", SiteId(1));

    assert!(index.find_entry(&identity).await.expect("find").is_none());

    let first = index
        .create_entry(&identity, &units(&["1", "2"]))
        .await
        .expect("create");
    let found = index
        .find_entry(&identity)
        .await
        .expect("find")
        .expect("entry exists");
    assert_eq!(found.uid, first.uid);
    assert_eq!(found.identity, identity);

    let second = index
        .create_entry(&identity, &units(&["3"]))
        .await
        .expect("replace");
    assert_ne!(first.uid, second.uid);
    assert_eq!(index.entry_count().await.expect("count"), 1);

    assert!(
        index
            .entries_depending_on(&ContentUnitId::new("1"))
            .await
            .expect("dependents")
            .is_empty(),
        "old links are replaced"
    );
    let dependents = index
        .entries_depending_on(&ContentUnitId::new("3"))
        .await
        .expect("dependents");
    assert_eq!(dependents.len(), 1);
    assert_eq!(dependents[0].uid, second.uid);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn identities_are_scoped_by_site(pool: PgPool) {
    let index = PostgresCacheIndex::new(pool);
    let one = RequestIdentity::new("/a", SiteId(1));
    let two = RequestIdentity::new("/a", SiteId(2));

    let a = index.create_entry(&one, &units(&["1"])).await.expect("create");
    let b = index.create_entry(&two, &units(&["1"])).await.expect("create");

    assert_ne!(a.id, b.id);
    assert_eq!(index.entry_count().await.expect("count"), 2);
    assert_eq!(
        index.entry_uids().await.expect("uids"),
        HashSet::from([a.uid, b.uid])
    );
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn delete_and_clear_drop_links(pool: PgPool) {
    let index = PostgresCacheIndex::new(pool);
    let a = index
        .create_entry(&RequestIdentity::new("/a", SiteId(1)), &units(&["1", "2"]))
        .await
        .expect("create");
    index
        .create_entry(&RequestIdentity::new("/b", SiteId(1)), &units(&["2", "3"]))
        .await
        .expect("create");

    index
        .delete_entries(&HashSet::from([a.id]))
        .await
        .expect("delete");
    assert_eq!(
        index
            .entries_depending_on(&ContentUnitId::new("2"))
            .await
            .expect("dependents")
            .len(),
        1
    );

    index.clear_all().await.expect("clear");
    assert_eq!(index.entry_count().await.expect("count"), 0);
    assert!(
        index
            .entries_depending_on(&ContentUnitId::new("3"))
            .await
            .expect("dependents")
            .is_empty()
    );
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn page_cache_round_trip_over_postgres(pool: PgPool) {
    let index = Arc::new(PostgresCacheIndex::new(pool));
    let cache = PageCache::new(
        CacheConfig::default(),
        Arc::new(MemoryBodyStore::new()),
        index.clone(),
    );
    let request = RequestContext::get(RequestIdentity::new("/blog/post-1", SiteId(1)));

    let first = cache
        .serve(&request, |recorder| async move {
            recorder.record("42");
            RenderedPage::ok("<html>A</html>")
        })
        .await;
    assert!(!first.is_cached());

    let second = cache
        .serve(&request, |_| async { RenderedPage::ok("<html>B</html>") })
        .await;
    assert!(second.is_cached());
    assert_eq!(second.body(), &Bytes::from_static(b"<html>A</html>"));

    let report = cache
        .invalidator()
        .on_content_unit_changed(&ContentUnitId::new("42"))
        .await
        .expect("invalidate");
    assert_eq!(report.entries_removed, 1);
    assert_eq!(index.entry_count().await.expect("count"), 0);
}
