use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rearch::CapsuleHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info, instrument, warn};

use crate::{
    config::{provider_config_capsule, sweep_config_capsule},
    kv_store::{KvStore, kv_store_capsule},
    link_params::{
        Expiry, ExpiryClass, LinkParams, from_epoch_millis, generate_link_id, synthesize_title,
        to_epoch_millis,
    },
    provider::{CreateProviderLink, LinkProvider, ProviderError, link_provider_capsule},
};

/// Provider paths tried before giving up on a creation request.
pub const CREATE_ATTEMPTS: usize = 5;

/// Keys fetched per listing call during a sweep.
pub const SWEEP_PAGE_SIZE: u64 = 100;

/// The value stored under each link id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    /// Older records only carry their id as the store key.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "longURL")]
    pub long_url: String,
    #[serde(rename = "shortURL")]
    pub short_url: String,
    /// Absent on records written before provider cleanup existed.
    #[serde(rename = "providerLinkId", default)]
    pub provider_link_id: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
    /// Epoch milliseconds; `None` means the link is permanent.
    #[serde(default)]
    pub exp: Option<i64>,
    pub created: i64,
    pub title: String,
}

impl LinkRecord {
    #[must_use]
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.exp.is_some_and(|exp| exp < now_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedLink {
    pub record: LinkRecord,
    pub duration: Option<ExpiryClass>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: u64,
    pub removed: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Clone, Debug)]
pub struct LinkServiceOptions {
    /// Short domain links are created under at the provider.
    pub domain: String,
    /// How long a store entry outlives its link's expiry, so the sweep sees it first.
    pub store_ttl_grace: Duration,
}

pub fn link_service_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn LinkService> {
    let store = Arc::clone(get.as_ref(kv_store_capsule));
    let provider = Arc::clone(get.as_ref(link_provider_capsule));
    let options = LinkServiceOptions {
        domain: get.as_ref(provider_config_capsule).domain.clone(),
        store_ttl_grace: get.as_ref(sweep_config_capsule).store_ttl_grace,
    };
    new_link_service(store, provider, options)
}

#[must_use]
pub fn new_link_service(
    store: Arc<dyn KvStore>,
    provider: Arc<dyn LinkProvider>,
    options: LinkServiceOptions,
) -> Arc<dyn LinkService> {
    Arc::new(LinkServiceImpl {
        store,
        provider,
        options,
    })
}

#[async_trait]
pub trait LinkService: Send + Sync {
    async fn create_link(&self, long_url: &str) -> Result<CreatedLink, CreateLinkError>;

    /// Removes every record whose expiry is before `now`, here and at the provider.
    async fn sweep_expired(&self, now: OffsetDateTime) -> Result<SweepReport, SweepError>;
}

#[derive(Debug, Error)]
pub enum CreateLinkError {
    #[error("Missing longURL")]
    MissingLongUrl,
    #[error("invalid longURL: {0}")]
    InvalidLongUrl(#[from] url::ParseError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("could not generate short link after {attempts} attempts, retry later")]
    Exhausted { attempts: usize },
    #[error("failed to encode link record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to store link record: {0}")]
    Store(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

impl CreateLinkError {
    /// Whether the caller sent a bad request, as opposed to a failure on our side.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::MissingLongUrl | Self::InvalidLongUrl(_))
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("failed to list stored links: {0}")]
    List(anyhow::Error),
}

#[derive(Debug, Error)]
enum RecordSweepError {
    #[error("store error: {0}")]
    Store(anyhow::Error),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

#[derive(Debug, PartialEq, Eq)]
enum RecordOutcome {
    Removed,
    Kept,
    Skipped,
}

struct LinkServiceImpl {
    store: Arc<dyn KvStore>,
    provider: Arc<dyn LinkProvider>,
    options: LinkServiceOptions,
}

impl LinkServiceImpl {
    #[instrument(skip(self))]
    async fn sweep_record(&self, key: &str, now_ms: i64) -> Result<RecordOutcome, RecordSweepError> {
        // NOTE: records past their store lifetime still hold the provider id we need
        let Some(value) = self
            .store
            .get_including_expired(key)
            .await
            .map_err(RecordSweepError::Store)?
        else {
            return Ok(RecordOutcome::Skipped);
        };
        let record: LinkRecord = match serde_json::from_str(&value) {
            Ok(record) => record,
            Err(err) => {
                warn!(?err, "Skipping stored value that is not a link record");
                return Ok(RecordOutcome::Skipped);
            }
        };
        if !record.is_expired_at(now_ms) {
            return Ok(RecordOutcome::Kept);
        }

        if let Some(provider_link_id) = &record.provider_link_id {
            self.provider.delete_link(provider_link_id).await?;
        }
        self.store.delete(key).await.map_err(RecordSweepError::Store)?;
        info!(exp = ?record.exp, short_url = %record.short_url, "Removed expired link");
        Ok(RecordOutcome::Removed)
    }

    async fn discard_orphan(&self, provider_link_id: Option<&str>) {
        let Some(provider_link_id) = provider_link_id else {
            return;
        };
        if let Err(err) = self.provider.delete_link(provider_link_id).await {
            error!(?err, provider_link_id, "Failed to delete provider link left without a record");
        }
    }
}

#[async_trait]
impl LinkService for LinkServiceImpl {
    #[instrument(skip(self))]
    async fn create_link(&self, long_url: &str) -> Result<CreatedLink, CreateLinkError> {
        if long_url.trim().is_empty() {
            return Err(CreateLinkError::MissingLongUrl);
        }
        let LinkParams { uid, exp } = LinkParams::from_long_url(long_url)?;
        let now = OffsetDateTime::now_utc();
        let expiry = exp.and_then(|exp| Expiry::resolve(exp, now));
        let title = synthesize_title(uid.as_deref(), expiry.as_ref(), now);

        let mut created = None;
        for attempt in 1..=CREATE_ATTEMPTS {
            let request = CreateProviderLink {
                domain: self.options.domain.clone(),
                original_url: long_url.to_owned(),
                path: generate_link_id(),
                title: title.clone(),
            };
            match self.provider.create_link(&request).await {
                Ok(link) => {
                    created = Some((request.path, link));
                    break;
                }
                // NOTE: only a taken path is worth another attempt
                Err(ProviderError::PathTaken) => {
                    warn!(
                        attempt,
                        attempt_id = %request.path,
                        "Generated path that was already taken"
                    );
                }
                Err(err) => {
                    error!(?err, attempt, "Provider refused to create link");
                    return Err(err.into());
                }
            }
        }
        let Some((id, link)) = created else {
            return Err(CreateLinkError::Exhausted {
                attempts: CREATE_ATTEMPTS,
            });
        };

        let record = LinkRecord {
            id,
            long_url: long_url.to_owned(),
            short_url: link.short_url,
            provider_link_id: link.provider_link_id,
            uid,
            exp: expiry.as_ref().and_then(Expiry::stored_millis),
            created: to_epoch_millis(now),
            title,
        };
        let expires_at = record.exp.and_then(from_epoch_millis).and_then(|exp| {
            let at = store_expiry(exp, now, self.options.store_ttl_grace);
            if at.is_none() {
                warn!(?exp, "Store lifetime out of range, keeping record until swept");
            }
            at
        });

        let stored = match serde_json::to_string(&record) {
            Ok(value) => self
                .store
                .put(&record.id, value, expires_at)
                .await
                .map_err(CreateLinkError::Store),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = stored {
            self.discard_orphan(record.provider_link_id.as_deref()).await;
            return Err(err);
        }

        info!(
            id = %record.id,
            short_url = %record.short_url,
            exp = ?record.exp,
            "Created short link"
        );
        Ok(CreatedLink {
            record,
            duration: expiry.map(|expiry| expiry.class),
        })
    }

    #[instrument(skip(self))]
    async fn sweep_expired(&self, now: OffsetDateTime) -> Result<SweepReport, SweepError> {
        let now_ms = to_epoch_millis(now);
        let mut report = SweepReport::default();
        let mut cursor = None;

        loop {
            let page = self
                .store
                .list_keys(cursor, SWEEP_PAGE_SIZE)
                .await
                .map_err(SweepError::List)?;

            for key in &page.keys {
                report.scanned += 1;
                match self.sweep_record(key, now_ms).await {
                    Ok(RecordOutcome::Removed) => report.removed += 1,
                    Ok(RecordOutcome::Kept) => {}
                    Ok(RecordOutcome::Skipped) => report.skipped += 1,
                    Err(err) => {
                        // NOTE: one bad record must not stop the rest of the pass
                        error!(?err, key, "Failed to sweep link");
                        report.failed += 1;
                    }
                }
            }

            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        // NOTE: a failed record may still own a live provider link, so keep everything
        if report.failed > 0 {
            warn!(failed = report.failed, "Skipping purge after failed records");
        } else {
            match self.store.purge_expired(now).await {
                Ok(purged) if purged > 0 => {
                    info!(purged, "Purged store entries past their lifetime");
                }
                Ok(_) => {}
                Err(err) => warn!(?err, "Failed to purge store entries past their lifetime"),
            }
        }

        info!(
            scanned = report.scanned,
            removed = report.removed,
            skipped = report.skipped,
            failed = report.failed,
            "Sweep finished"
        );
        Ok(report)
    }
}

/// When the store may drop a record by itself: `grace` after the later of its expiry
/// and `now`. `None` when that instant is out of range.
fn store_expiry(exp: OffsetDateTime, now: OffsetDateTime, grace: Duration) -> Option<OffsetDateTime> {
    let grace = time::Duration::try_from(grace).ok()?;
    exp.max(now).checked_add(grace)
}

/// Runs [`LinkService::sweep_expired`] every `period` until the runtime shuts down.
pub fn spawn_periodic_sweep(links: Arc<dyn LinkService>, period: Duration) -> JoinHandle<()> {
    info!(?period, "Scheduling periodic sweep");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = links.sweep_expired(OffsetDateTime::now_utc()).await {
                error!(?err, "Scheduled sweep failed");
            }
        }
    })
}
