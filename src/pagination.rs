//! Cursor-based page cache
//!
//! Pages are 1-based and cached by index. A page is always fetched with the
//! cursor of the page before it (its last item), so pages can only be filled
//! forward from the highest contiguous cached index. Asking for page 5 with
//! pages 1-2 cached fetches 3, 4 and 5 in order.
//!
//! After every forward fetch a few following pages are prefetched in the
//! background. Prefetch failures are logged and dropped; the same page is
//! simply fetched again when it is actually requested.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::{KartwallError, Result};

/// An append-ordered collection that can be read after a cursor.
#[async_trait]
pub trait PageSource: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;

    /// Up to `limit` items strictly after `after` (from the start if `None`).
    async fn fetch(&self, after: Option<&Self::Item>, limit: usize) -> Result<Vec<Self::Item>>;
}

/// One page of results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub index: usize,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    fn empty(index: usize) -> Self {
        Self { index, items: Vec::new() }
    }

    /// Cursor for the following page.
    pub fn cursor(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

struct PageCache<T> {
    pages: BTreeMap<usize, Arc<Page<T>>>,
    /// Index of the last page that has items, once the source ran dry.
    last_page: Option<usize>,
}

impl<T> PageCache<T> {
    fn contiguous(&self) -> usize {
        let mut index = 0;
        while self.pages.contains_key(&(index + 1)) {
            index += 1;
        }
        index
    }
}

struct Inner<S: PageSource> {
    source: S,
    page_size: usize,
    prefetch_pages: usize,
    cache: Mutex<PageCache<S::Item>>,
}

/// Paged, cached reader over a [`PageSource`].
pub struct PagedFetcher<S: PageSource> {
    inner: Arc<Inner<S>>,
}

impl<S: PageSource> Clone for PagedFetcher<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S: PageSource> PagedFetcher<S> {
    pub fn new(source: S, page_size: usize, prefetch_pages: usize) -> Self {
        let cache = Mutex::new(PageCache { pages: BTreeMap::new(), last_page: None });
        Self { inner: Arc::new(Inner { source, page_size: page_size.max(1), prefetch_pages, cache }) }
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Page `index` (1-based), fetching any missing pages before it.
    pub async fn get_page(&self, index: usize) -> Result<Arc<Page<S::Item>>> {
        if index == 0 {
            return Err(KartwallError::InvalidPage { page: index });
        }

        let mut cache = self.inner.cache.lock().await;
        if let Some(page) = cache.pages.get(&index) {
            trace!(page = index, "Page cache hit");
            return Ok(page.clone());
        }

        let page = self.inner.fill_to(&mut cache, index).await?;
        let prefetch_from = index + 1;
        let prefetch_to = index + self.inner.prefetch_pages;
        let worth_prefetching = cache.last_page.is_none_or(|last| prefetch_from <= last);
        drop(cache);

        if self.inner.prefetch_pages > 0 && worth_prefetching {
            self.spawn_prefetch(prefetch_to);
        }
        Ok(page)
    }

    fn spawn_prefetch(&self, up_to: usize) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut cache = inner.cache.lock().await;
            if let Err(e) = inner.fill_to(&mut cache, up_to).await {
                warn!(up_to, error = %e, "Page prefetch failed");
            }
        });
    }

    /// Whether page `index` is cached.
    pub async fn is_cached(&self, index: usize) -> bool {
        self.inner.cache.lock().await.pages.contains_key(&index)
    }

    /// Indices of every cached page, ascending.
    pub async fn cached_pages(&self) -> Vec<usize> {
        self.inner.cache.lock().await.pages.keys().copied().collect()
    }

    /// Whether the source has been read to its end.
    pub async fn is_exhausted(&self) -> bool {
        self.inner.cache.lock().await.last_page.is_some()
    }

    /// Drop every cached page and cursor.
    pub async fn reset(&self) {
        let mut cache = self.inner.cache.lock().await;
        let dropped = cache.pages.len();
        cache.pages.clear();
        cache.last_page = None;
        debug!(dropped, "Page cache reset");
    }
}

impl<S: PageSource> Inner<S> {
    /// Fetch forward until page `target` is cached or the source runs dry.
    async fn fill_to(&self, cache: &mut PageCache<S::Item>, target: usize) -> Result<Arc<Page<S::Item>>> {
        loop {
            if let Some(page) = cache.pages.get(&target) {
                return Ok(page.clone());
            }
            if cache.last_page.is_some_and(|last| target > last) {
                return Ok(Arc::new(Page::empty(target)));
            }

            let index = cache.contiguous() + 1;
            let cursor = match index {
                1 => None,
                _ => cache.pages.get(&(index - 1)).and_then(|page| page.cursor()).cloned(),
            };
            let items = self.source.fetch(cursor.as_ref(), self.page_size).await?;
            debug!(page = index, items = items.len(), "Fetched page");

            if items.len() < self.page_size {
                cache.last_page = Some(if items.is_empty() { index - 1 } else { index });
            }
            if !items.is_empty() {
                cache.pages.insert(index, Arc::new(Page { index, items }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    /// Numbers `1..=total`, recording the cursor of every fetch.
    struct Numbers {
        total: u32,
        fetches: Arc<SyncMutex<Vec<Option<u32>>>>,
        fail_after: Option<usize>,
    }

    impl Numbers {
        fn new(total: u32) -> (Self, Arc<SyncMutex<Vec<Option<u32>>>>) {
            let fetches = Arc::new(SyncMutex::new(Vec::new()));
            (Self { total, fetches: fetches.clone(), fail_after: None }, fetches)
        }
    }

    #[async_trait]
    impl PageSource for Numbers {
        type Item = u32;

        async fn fetch(&self, after: Option<&u32>, limit: usize) -> Result<Vec<u32>> {
            let mut fetches = self.fetches.lock();
            if self.fail_after.is_some_and(|n| fetches.len() >= n) {
                return Err(KartwallError::store_unavailable("numbers", "offline"));
            }
            fetches.push(after.copied());
            let start = after.copied().unwrap_or(0) + 1;
            Ok((start..=self.total).take(limit).collect())
        }
    }

    async fn settle<S: PageSource>(fetcher: &PagedFetcher<S>, pages: usize) {
        for _ in 0..100 {
            if fetcher.cached_pages().await.len() >= pages {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn pages_concatenate_in_order() {
        let (source, _) = Numbers::new(100);
        let fetcher = PagedFetcher::new(source, 10, 0);

        let mut all = Vec::new();
        for n in 1..=4 {
            let page = fetcher.get_page(n).await.unwrap();
            assert_eq!(page.index, n);
            all.extend(page.items.iter().copied());
        }
        assert_eq!(all, (1..=40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn distant_page_fetches_every_missing_page_in_order() {
        let (source, fetches) = Numbers::new(100);
        let fetcher = PagedFetcher::new(source, 10, 0);

        fetcher.get_page(1).await.unwrap();
        let page = fetcher.get_page(4).await.unwrap();
        assert_eq!(page.items.first(), Some(&31));
        assert_eq!(*fetches.lock(), vec![None, Some(10), Some(20), Some(30)]);

        fetcher.get_page(3).await.unwrap();
        assert_eq!(fetches.lock().len(), 4, "cached pages are not refetched");
    }

    #[tokio::test]
    async fn forward_fetch_prefetches_following_pages() {
        let (source, fetches) = Numbers::new(100);
        let fetcher = PagedFetcher::new(source, 10, 2);

        fetcher.get_page(1).await.unwrap();
        settle(&fetcher, 3).await;
        assert_eq!(fetcher.cached_pages().await, vec![1, 2, 3]);

        fetcher.get_page(2).await.unwrap();
        assert_eq!(fetches.lock().len(), 3);
    }

    #[tokio::test]
    async fn prefetch_failures_are_swallowed() {
        let (mut source, _) = Numbers::new(100);
        source.fail_after = Some(1);
        let fetcher = PagedFetcher::new(source, 10, 2);

        let page = fetcher.get_page(1).await.unwrap();
        assert_eq!(page.items.len(), 10);
        tokio::task::yield_now().await;
        assert_eq!(fetcher.cached_pages().await, vec![1]);

        let err = fetcher.get_page(2).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn short_page_marks_exhaustion() {
        let (source, fetches) = Numbers::new(25);
        let fetcher = PagedFetcher::new(source, 10, 0);

        let third = fetcher.get_page(3).await.unwrap();
        assert_eq!(third.items, (21..=25).collect::<Vec<_>>());
        assert!(fetcher.is_exhausted().await);

        let fourth = fetcher.get_page(4).await.unwrap();
        assert!(fourth.is_empty());
        assert!(!fetcher.is_cached(4).await);
        assert_eq!(fetches.lock().len(), 3);
    }

    #[tokio::test]
    async fn empty_collection_and_exact_multiple() {
        let (source, _) = Numbers::new(0);
        let fetcher = PagedFetcher::new(source, 10, 0);
        assert!(fetcher.get_page(1).await.unwrap().is_empty());
        assert!(fetcher.cached_pages().await.is_empty());

        let (source, fetches) = Numbers::new(20);
        let fetcher = PagedFetcher::new(source, 10, 0);
        assert_eq!(fetcher.get_page(2).await.unwrap().items.len(), 10);
        assert!(fetcher.get_page(3).await.unwrap().is_empty());
        assert!(fetcher.get_page(5).await.unwrap().is_empty());
        assert_eq!(fetches.lock().len(), 3);
    }

    #[tokio::test]
    async fn reset_drops_pages_and_cursors() {
        let (source, fetches) = Numbers::new(25);
        let fetcher = PagedFetcher::new(source, 10, 0);
        fetcher.get_page(3).await.unwrap();

        fetcher.reset().await;
        assert!(fetcher.cached_pages().await.is_empty());
        assert!(!fetcher.is_exhausted().await);

        fetcher.get_page(1).await.unwrap();
        assert_eq!(fetches.lock().last(), Some(&None));
    }

    #[tokio::test]
    async fn page_zero_is_rejected() {
        let (source, _) = Numbers::new(10);
        let fetcher = PagedFetcher::new(source, 10, 0);
        assert!(matches!(fetcher.get_page(0).await, Err(KartwallError::InvalidPage { page: 0 })));
    }
}
