use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_storage::MessageLog;

use crate::history::{HistoryError, HistoryPage, HistoryResult, HistorySource};

/// One outstanding page fetch. The epoch ties it to the log it was issued against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub before: DateTime<Utc>,
    pub limit: u32,
    epoch: u64,
}

/// What a finished page did to the log.
#[derive(Debug)]
pub enum PageOutcome {
    Merged {
        inserted: usize,
        duplicates: usize,
        has_more: bool,
    },
    /// The log was cleared while the page was in flight; the page was dropped.
    Stale,
    Failed(HistoryError),
}

/// Cursor, exhaustion flag and in-flight guard for backwards history loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationState {
    cursor: DateTime<Utc>,
    has_more: bool,
    loading: bool,
    epoch: u64,
}

impl PaginationState {
    pub fn new(cursor: DateTime<Utc>) -> Self {
        Self {
            cursor,
            has_more: true,
            loading: false,
            epoch: 0,
        }
    }

    /// Starts from the oldest loaded turn, or `now` for an empty log.
    pub fn for_log(log: &MessageLog, now: DateTime<Utc>) -> Self {
        Self::new(log.oldest_timestamp().unwrap_or(now))
    }

    pub fn cursor(&self) -> DateTime<Utc> {
        self.cursor
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Claims the next page, or `None` while a load is running or once history is exhausted.
    pub fn begin(&mut self, limit: u32) -> Option<PageRequest> {
        if self.loading || !self.has_more {
            return None;
        }

        self.loading = true;
        Some(PageRequest {
            before: self.cursor,
            limit,
            epoch: self.epoch,
        })
    }

    /// Applies a fetched page. Failures leave `has_more` untouched.
    pub fn finish(
        &mut self,
        request: PageRequest,
        result: HistoryResult<HistoryPage>,
        log: &mut MessageLog,
    ) -> PageOutcome {
        if request.epoch != self.epoch {
            return PageOutcome::Stale;
        }
        self.loading = false;

        let page = match result {
            Ok(page) => page,
            Err(error) => return PageOutcome::Failed(error),
        };

        if page.messages.is_empty() {
            self.has_more = false;
            return PageOutcome::Merged {
                inserted: 0,
                duplicates: 0,
                has_more: false,
            };
        }

        let page_oldest = page.messages.iter().map(|turn| turn.timestamp).min();
        let report = log.prepend_batch(page.messages);

        let oldest = [page_oldest, log.oldest_timestamp(), Some(self.cursor)]
            .into_iter()
            .flatten()
            .min();
        if let Some(oldest) = oldest {
            self.cursor = oldest;
        }
        self.has_more = page.has_more;

        PageOutcome::Merged {
            inserted: report.inserted,
            duplicates: report.duplicates,
            has_more: self.has_more,
        }
    }

    /// Forgets everything loaded so far; pages still in flight become stale.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.cursor = now;
        self.has_more = true;
        self.loading = false;
        self.epoch += 1;
    }
}

/// Fetches pages of older turns from the history endpoint.
#[derive(Clone)]
pub struct HistoryPaginator {
    source: Arc<dyn HistorySource>,
    page_size: u32,
}

impl HistoryPaginator {
    pub fn new(source: Arc<dyn HistorySource>, page_size: u32) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub async fn fetch(&self, request: PageRequest) -> HistoryResult<HistoryPage> {
        self.source
            .fetch_before(request.before, request.limit)
            .await
    }
}
