//! Extraction producer: walks an offset plan against the listing/detail API and
//! yields normalized [`Record`]s lazily.
//!
//! - [`client`] - link parsing, payload types, and the [`FetchClient`] seam
//! - [`normalize`] - detail payload to [`Record`]
//! - [`cache`] - on-disk detail payload cache
//!
//! Failure semantics: a failed profile summary fetch is fatal
//! ([`Error::ProfileUnavailable`]); a failed listing page or detail fetch is logged
//! and its items are skipped.

mod cache;
mod client;
mod normalize;

pub use cache::DetailCache;
pub use client::{
    Attachment, DetailPost, FavoriteAccount, FetchClient, HttpFetchClient, ListingItem,
    PostDetail, ProfileSummary, SourceLink,
};
pub use normalize::normalize;

use crate::config::ExtractionConfig;
use crate::error::{Error, Result};
use crate::planner::{BoundaryTracker, IdFilter, OffsetPlan, OffsetPlanner};
use crate::types::Record;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A resolved profile and the plan for crawling it
#[derive(Clone, Debug)]
pub struct ProfileScan {
    /// Profile link
    pub link: SourceLink,
    /// Profile summary
    pub profile: ProfileSummary,
    /// Offsets to visit
    pub plan: OffsetPlan,
}

/// Produces records for profiles and single posts
#[derive(Clone)]
pub struct Extractor {
    client: Arc<dyn FetchClient>,
    cache: Option<DetailCache>,
    planner: OffsetPlanner,
    save_empty_posts: bool,
    page_delay: Duration,
    favorites_page_size: usize,
    favorites_limit: Option<usize>,
    favorites_delay: Duration,
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("cache", &self.cache)
            .field("planner", &self.planner)
            .field("save_empty_posts", &self.save_empty_posts)
            .finish_non_exhaustive()
    }
}

impl Extractor {
    /// Create an extractor using the extraction settings
    pub fn new(client: Arc<dyn FetchClient>, config: &ExtractionConfig) -> Self {
        Self {
            client,
            cache: config.detail_cache_dir.clone().map(DetailCache::new),
            planner: OffsetPlanner::from_config(config),
            save_empty_posts: config.save_empty_posts,
            page_delay: config.page_delay,
            favorites_page_size: config.favorites_page_size.max(1),
            favorites_limit: config.favorites_limit,
            favorites_delay: config.favorites_delay,
        }
    }

    /// Replace (or disable) the detail cache
    pub fn with_cache(mut self, cache: Option<DetailCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Fetch the profile summary and plan the crawl
    ///
    /// This is the only fatal step of extraction: without the total post count no
    /// offsets can be planned.
    pub async fn open(&self, link: &SourceLink, fetch_mode: &str) -> Result<ProfileScan> {
        let profile = self
            .client
            .fetch_profile(link)
            .await
            .map_err(|e| Error::ProfileUnavailable {
                link: link.to_string(),
                reason: e.to_string(),
            })?;
        let plan = self.planner.plan(fetch_mode, profile.post_count)?;
        tracing::info!(
            link = %link,
            name = %profile.name,
            post_count = profile.post_count,
            pages = plan.offsets.len(),
            id_filter = plan.filter.is_some(),
            "Profile resolved"
        );
        Ok(ProfileScan {
            link: link.clone(),
            profile,
            plan,
        })
    }

    /// Lazy, finite stream of the records of `scan`
    ///
    /// Pages are fetched only as the stream is polled. With an ID filter, the scan
    /// stops after the page on which every boundary ID has been seen.
    pub fn records(&self, scan: ProfileScan) -> BoxStream<'static, Record> {
        Box::pin(self.pages(scan).flat_map(futures::stream::iter))
    }

    /// Lazy stream of the records of `scan`, one batch per listing page with records
    pub fn pages(&self, scan: ProfileScan) -> BoxStream<'static, Vec<Record>> {
        let state = ScanState {
            extractor: self.clone(),
            tracker: scan.plan.filter.as_ref().map(BoundaryTracker::new),
            filter: scan.plan.filter,
            offsets: scan.plan.offsets.into(),
            link: scan.link,
            first: true,
        };
        Box::pin(futures::stream::unfold(state, |mut state| async move {
            loop {
                if state.tracker.as_ref().is_some_and(BoundaryTracker::is_complete) {
                    tracing::info!(link = %state.link, "All boundary IDs found, stopping scan");
                    return None;
                }
                let offset = state.offsets.pop_front()?;
                if !state.first && !state.extractor.page_delay.is_zero() {
                    tokio::time::sleep(state.extractor.page_delay).await;
                }
                state.first = false;

                let records = state.scan_page(offset).await;
                if !records.is_empty() {
                    return Some((records, state));
                }
            }
        }))
    }

    /// Profile links of every favorite account of the session on `site`
    ///
    /// Pages through the favorites listing until a page comes back empty or short,
    /// or `favorites_limit` accounts have been seen. Accounts without a usable ID
    /// are skipped with a warning. A failed page fails the whole listing.
    pub async fn favorites(&self, site: &str) -> Result<Vec<SourceLink>> {
        let mut accounts = Vec::new();
        let mut page = 1;
        loop {
            let batch = self
                .client
                .fetch_favorites(site, page, self.favorites_page_size)
                .await?;
            let short = batch.len() < self.favorites_page_size;
            if batch.is_empty() {
                break;
            }
            accounts.extend(batch);
            if let Some(limit) = self.favorites_limit
                && accounts.len() >= limit
            {
                accounts.truncate(limit);
                break;
            }
            if short {
                break;
            }
            page += 1;
            if !self.favorites_delay.is_zero() {
                tokio::time::sleep(self.favorites_delay).await;
            }
        }
        tracing::info!(site = %site, accounts = accounts.len(), "Favorites listed");

        Ok(accounts
            .iter()
            .filter_map(|account| {
                let link = account.source_link(site);
                if link.is_none() {
                    tracing::warn!(
                        id = %account.id,
                        name = %account.name,
                        service = %account.service,
                        "Skipping favorite account without a usable ID"
                    );
                }
                link
            })
            .collect())
    }

    /// Fetch and normalize the single post named by a post link
    pub async fn fetch_post(&self, link: &SourceLink) -> Result<Record> {
        let post_id = link
            .post_id
            .as_deref()
            .ok_or_else(|| Error::UnsupportedSource(format!("{link} is not a post link")))?;
        let detail = self.detail(link, post_id).await?;
        Ok(normalize(&detail, link, 0, 0))
    }

    async fn detail(&self, link: &SourceLink, post_id: &str) -> Result<PostDetail> {
        if let Some(cache) = &self.cache
            && let Some(detail) = cache.load(&link.user, post_id).await
        {
            return Ok(detail);
        }
        let detail = self.client.fetch_detail(link, post_id).await?;
        if let Some(cache) = &self.cache
            && let Err(e) = cache.store(&link.user, post_id, &detail).await
        {
            tracing::warn!(post_id = %post_id, error = %e, "Failed to cache post detail");
        }
        Ok(detail)
    }
}

struct ScanState {
    extractor: Extractor,
    link: SourceLink,
    offsets: VecDeque<u64>,
    filter: Option<IdFilter>,
    tracker: Option<BoundaryTracker>,
    first: bool,
}

impl ScanState {
    async fn scan_page(&mut self, offset: u64) -> Vec<Record> {
        let extractor = &self.extractor;
        let page_number = extractor.planner.page_number(offset);
        let items = match extractor.client.fetch_page(&self.link, offset).await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(link = %self.link, offset, error = %e, "Listing page failed, skipping");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for item in items {
            if let Some(filter) = &self.filter
                && !filter.matches(&item.id)
            {
                continue;
            }

            let item_link = if item.user.is_empty() || item.user == self.link.user {
                self.link.clone()
            } else {
                self.link.with_user(&item.user)
            };
            let detail = match extractor.detail(&item_link, &item.id).await {
                Ok(detail) => detail,
                Err(e) => {
                    tracing::warn!(post_id = %item.id, error = %e, "Post detail failed, skipping");
                    skipped += 1;
                    continue;
                }
            };

            let record = normalize(&detail, &item_link, page_number, offset);
            let boundaries_done = self
                .tracker
                .as_mut()
                .is_some_and(|tracker| tracker.observe(&record.id));

            if extractor.save_empty_posts || !record.files.is_empty() {
                records.push(record);
            }
            if boundaries_done {
                break;
            }
        }

        if skipped > 0 {
            tracing::warn!(offset, skipped, processed = records.len(), "Some posts were skipped");
        }
        records
    }
}
