//! Expiry behaviour of links created through the service.

mod common;

use std::{sync::Arc, time::Duration as StdDuration};

use common::{FakeProvider, MemoryStore};
use shortio_relay::{
    kv_store::KvStore,
    link_params::to_epoch_millis,
    link_service::{LinkService, LinkServiceOptions, new_link_service},
    provider::LinkProvider,
};
use time::{Duration, OffsetDateTime};

fn service(store: &Arc<MemoryStore>, provider: &Arc<FakeProvider>) -> Arc<dyn LinkService> {
    new_link_service(
        Arc::clone(store) as Arc<dyn KvStore>,
        Arc::clone(provider) as Arc<dyn LinkProvider>,
        LinkServiceOptions {
            domain: "pwbtw.com".to_owned(),
            store_ttl_grace: StdDuration::from_secs(7 * 24 * 3600),
        },
    )
}

#[tokio::test]
async fn test_short_term_link_is_swept_after_expiry() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(FakeProvider::default());
    let links = service(&store, &provider);

    let exp = to_epoch_millis(OffsetDateTime::now_utc() + Duration::days(1));
    let created = links
        .create_link(&format!("https://example.com/?exp={exp}"))
        .await
        .unwrap();
    assert_eq!(created.duration.map(|class| class.label()), Some("short-term"));

    let report = links
        .sweep_expired(OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert_eq!(report.removed, 0);
    assert!(store.raw(&created.record.id).is_some());

    let later = OffsetDateTime::now_utc() + Duration::days(2);
    let report = links.sweep_expired(later).await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(store.raw(&created.record.id), None);
    assert!(provider.live().is_empty());

    let report = links.sweep_expired(later).await.unwrap();
    assert_eq!(report.removed, 0);
    assert_eq!(report.scanned, 0);
}

#[tokio::test]
async fn test_permanent_link_is_never_swept() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(FakeProvider::default());
    let links = service(&store, &provider);

    let exp = to_epoch_millis(OffsetDateTime::now_utc() + Duration::days(40_000));
    let created = links
        .create_link(&format!("https://example.com/?exp={exp}"))
        .await
        .unwrap();
    assert_eq!(created.duration.map(|class| class.label()), Some("permanent"));
    assert_eq!(created.record.exp, None);

    let far_future = OffsetDateTime::now_utc() + Duration::days(50_000);
    let report = links.sweep_expired(far_future).await.unwrap();
    assert_eq!(report.removed, 0);
    assert!(store.raw(&created.record.id).is_some());
    assert_eq!(provider.live().len(), 1);
}

#[tokio::test]
async fn test_sweep_walks_every_page() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(FakeProvider::default());
    let links = service(&store, &provider);

    let past = to_epoch_millis(OffsetDateTime::now_utc() - Duration::minutes(1));
    for n in 0..250 {
        let record = serde_json::json!({
            "id": format!("id{}", 10_000 + n),
            "longURL": "https://example.com/",
            "shortURL": format!("https://pwbtw.com/id{}", 10_000 + n),
            "uid": null,
            "exp": past,
            "created": past,
            "title": "OTT link",
        });
        store
            .put(&format!("id{}", 10_000 + n), record.to_string(), None)
            .await
            .unwrap();
    }

    let report = links
        .sweep_expired(OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert_eq!(report.scanned, 250);
    assert_eq!(report.removed, 250);
    assert_eq!(store.len(), 0);
    // legacy records carry no provider id
    assert!(provider.deleted().is_empty());
}

#[tokio::test]
async fn test_link_created_already_expired_is_swept() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(FakeProvider::default());
    let links = new_link_service(
        Arc::clone(&store) as Arc<dyn KvStore>,
        Arc::clone(&provider) as Arc<dyn LinkProvider>,
        LinkServiceOptions {
            domain: "pwbtw.com".to_owned(),
            store_ttl_grace: StdDuration::from_secs(3600),
        },
    );

    let now = OffsetDateTime::now_utc();
    let exp = to_epoch_millis(now - Duration::days(2));
    let created = links
        .create_link(&format!("https://example.com/?exp={exp}"))
        .await
        .unwrap();
    assert_eq!(created.duration.map(|class| class.label()), Some("short-term"));
    assert!(store.expiry(&created.record.id).is_some_and(|at| at > now));

    let report = links
        .sweep_expired(OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(store.len(), 0);
    assert!(provider.live().is_empty());
    assert_eq!(
        provider.deleted(),
        vec![created.record.provider_link_id.unwrap()]
    );
}

#[tokio::test]
async fn test_record_past_store_lifetime_still_reaches_provider() {
    let store = Arc::new(MemoryStore::default());
    let provider = Arc::new(FakeProvider::default());
    let links = service(&store, &provider);

    let now = OffsetDateTime::now_utc();
    let exp = to_epoch_millis(now + Duration::days(1));
    let created = links
        .create_link(&format!("https://example.com/?exp={exp}"))
        .await
        .unwrap();

    // the store lifetime ran out before any sweep got to the record
    let value = store.raw(&created.record.id).unwrap();
    store
        .put(&created.record.id, value, Some(now - Duration::minutes(1)))
        .await
        .unwrap();
    assert_eq!(store.get(&created.record.id).await.unwrap(), None);

    let report = links.sweep_expired(now + Duration::days(2)).await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(store.len(), 0);
    assert!(provider.live().is_empty());
}
