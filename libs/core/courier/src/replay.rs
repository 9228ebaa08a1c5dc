//! Paged catch-up over a transport's history.

use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;
use tracing::{debug, warn};

/// Items requested per history page.
pub const HISTORY_PAGE_SIZE: usize = 100;

/// A history that can be read forward in pages.
#[async_trait]
pub trait HistorySource: Send + Sync {
    type Item: Send;

    /// Up to `count` items strictly after `start`, oldest first.
    async fn fetch_page(&self, start: i64, count: usize) -> Result<Vec<Self::Item>>;

    /// Ordering position of an item; the next page starts after the last one.
    fn position(&self, item: &Self::Item) -> i64;
}

/// Read pages from `start` until one comes back short, handing each item to
/// `sink` in order. `sink` returns `false` to stop early.
///
/// Returns the number of items handed over.
pub async fn drain_history<S, F, Fut>(
    source: &S,
    start: i64,
    page_size: usize,
    mut sink: F,
) -> Result<usize>
where
    S: HistorySource + ?Sized,
    F: FnMut(S::Item) -> Fut + Send,
    Fut: Future<Output = bool> + Send,
{
    let mut cursor = start;
    let mut total = 0;

    loop {
        let page = source.fetch_page(cursor, page_size).await?;
        let short = page.len() < page_size;
        let before = cursor;

        for item in page {
            cursor = source.position(&item);
            total += 1;
            if !sink(item).await {
                debug!(total, "Replay stopped by consumer");
                return Ok(total);
            }
        }

        if short {
            break;
        }
        if cursor <= before {
            warn!(cursor, "History page did not advance, stopping replay");
            break;
        }
    }

    debug!(total, start, "Replay drained");
    Ok(total)
}
