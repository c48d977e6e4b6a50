//! In-memory stand-ins for the key-value store and the link provider.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use shortio_relay::{
    kv_store::{KeyPage, KvStore},
    link_service::{LinkServiceOptions, new_link_service},
    provider::{CreateProviderLink, LinkProvider, ProviderError, ProviderLink},
    routes::{AppState, router},
};
use time::OffsetDateTime;

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, (String, Option<OffsetDateTime>)>>,
}

#[allow(dead_code)]
impl MemoryStore {
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|(value, _)| value.clone())
    }

    pub fn expiry(&self, key: &str) -> Option<OffsetDateTime> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .and_then(|(_, expires_at)| *expires_at)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn insert_raw(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), (value.to_owned(), None));
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(key)
            .filter(|(_, expires_at)| expires_at.is_none_or(|at| at > now))
            .map(|(value, _)| value.clone()))
    }

    async fn get_including_expired(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.raw(key))
    }

    async fn put(
        &self,
        key: &str,
        value: String,
        expires_at: Option<OffsetDateTime>,
    ) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_keys(&self, cursor: Option<String>, limit: u64) -> anyhow::Result<KeyPage> {
        let entries = self.entries.lock().unwrap();
        let limit = usize::try_from(limit).unwrap();
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| cursor.as_ref().is_none_or(|cursor| *key > cursor))
            .take(limit + 1)
            .cloned()
            .collect();
        let cursor = if keys.len() > limit {
            keys.truncate(limit);
            keys.last().cloned()
        } else {
            None
        };
        Ok(KeyPage { keys, cursor })
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> anyhow::Result<u64> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| expires_at.is_none_or(|at| at >= now));
        Ok((before - entries.len()) as u64)
    }
}

/// Answers the first `collisions` creations with "already exists".
#[derive(Default)]
pub struct FakeProvider {
    collisions: Mutex<usize>,
    created: Mutex<Vec<CreateProviderLink>>,
    live: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl FakeProvider {
    pub fn with_collisions(collisions: usize) -> Self {
        Self {
            collisions: Mutex::new(collisions),
            ..Self::default()
        }
    }

    pub fn created(&self) -> Vec<CreateProviderLink> {
        self.created.lock().unwrap().clone()
    }

    pub fn live(&self) -> Vec<String> {
        self.live.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl LinkProvider for FakeProvider {
    async fn create_link(
        &self,
        request: &CreateProviderLink,
    ) -> Result<ProviderLink, ProviderError> {
        self.created.lock().unwrap().push(request.clone());
        let mut collisions = self.collisions.lock().unwrap();
        if *collisions > 0 {
            *collisions -= 1;
            return Err(ProviderError::PathTaken);
        }
        let provider_link_id = format!("lnk_{}", request.path);
        self.live.lock().unwrap().push(provider_link_id.clone());
        Ok(ProviderLink {
            short_url: format!("https://{}/{}", request.domain, request.path),
            provider_link_id: Some(provider_link_id),
        })
    }

    async fn delete_link(&self, provider_link_id: &str) -> Result<(), ProviderError> {
        // NOTE: unknown ids succeed, like the provider's 404 handling
        self.live.lock().unwrap().retain(|id| id != provider_link_id);
        self.deleted
            .lock()
            .unwrap()
            .push(provider_link_id.to_owned());
        Ok(())
    }
}

#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<FakeProvider>,
}

#[allow(dead_code)]
impl TestServer {
    pub fn new() -> Self {
        Self::build(FakeProvider::default(), None)
    }

    pub fn build(provider: FakeProvider, sweep_token: Option<&str>) -> Self {
        let store = Arc::new(MemoryStore::default());
        let provider = Arc::new(provider);
        let links = new_link_service(
            Arc::clone(&store) as Arc<dyn KvStore>,
            Arc::clone(&provider) as Arc<dyn LinkProvider>,
            LinkServiceOptions {
                domain: "pwbtw.com".to_owned(),
                store_ttl_grace: Duration::from_secs(3600),
            },
        );
        let router = router(AppState {
            links,
            sweep_token: sweep_token.map(Arc::from),
        });
        Self {
            router,
            store,
            provider,
        }
    }
}
