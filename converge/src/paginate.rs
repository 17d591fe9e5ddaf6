//! Paginator for list endpoints.
//!
//! Two cursor protocols are supported:
//! - page index (1-based): the listing ends at the first page holding fewer
//!   raw items than requested, or once a reported total count is reached
//! - opaque token: the listing ends when the server returns no next token
//!
//! Termination is always judged on the raw page, before any filter runs, so
//! a final page whose items are all filtered out still ends the listing.
//! Pages are fetched strictly one after another; retrying a page fetch is up
//! to the `fetch` closure (wrap it in a [`crate::Retrier`]).

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::Stream;
use tracing::debug;

use crate::error::{ConfigError, Error};
use crate::observe::{Event, Observer, default_observer};

/// Position in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    /// 1-based page number.
    Index(u32),
    /// Server-issued token; `None` requests the first page.
    Token(Option<String>),
}

impl PageCursor {
    pub fn first_index() -> Self {
        PageCursor::Index(1)
    }

    pub fn first_token() -> Self {
        PageCursor::Token(None)
    }

    pub fn page_number(&self) -> Option<u32> {
        match self {
            PageCursor::Index(n) => Some(*n),
            PageCursor::Token(_) => None,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            PageCursor::Token(token) => token.as_deref(),
            PageCursor::Index(_) => None,
        }
    }
}

/// One page as returned by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the following page (token protocol only).
    pub next_token: Option<String>,
    /// Total number of items across all pages, when the server reports it.
    pub total_count: Option<u64>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
            total_count: None,
        }
    }

    pub fn with_next_token(mut self, token: impl Into<String>) -> Self {
        self.next_token = Some(token.into());
        self
    }

    pub fn with_total_count(mut self, total: u64) -> Self {
        self.total_count = Some(total);
        self
    }
}

type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Walks a listing page by page.
///
/// A paginator is single-use: it owns its cursor and cannot be rewound.
/// After the last page, or after a failed fetch, it yields nothing more.
pub struct Paginator<T, F> {
    page_size: u32,
    cursor: Option<PageCursor>,
    fetch: F,
    filter: Option<Filter<T>>,
    consumed: HashSet<String>,
    pages: u32,
    raw_items: u64,
    observer: Arc<dyn Observer>,
}

impl<T, F> fmt::Debug for Paginator<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Paginator")
            .field("page_size", &self.page_size)
            .field("cursor", &self.cursor)
            .field("pages", &self.pages)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl<T, E, F, Fut> Paginator<T, F>
where
    F: FnMut(PageCursor, u32) -> Fut,
    Fut: Future<Output = Result<Page<T>, Error<E>>>,
{
    pub fn new(page_size: u32, start: PageCursor, fetch: F) -> Result<Self, ConfigError> {
        if page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        Ok(Self {
            page_size,
            cursor: Some(start),
            fetch,
            filter: None,
            consumed: HashSet::new(),
            pages: 0,
            raw_items: 0,
            observer: default_observer(),
        })
    }

    /// Keep only items matching `predicate`.
    pub fn with_filter(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(predicate));
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.is_none()
    }

    /// Fetch the next page and return its (filtered) items.
    ///
    /// Returns `Ok(None)` once the listing is exhausted. A failed fetch
    /// exhausts the paginator; nothing from the failed page is returned.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>, Error<E>> {
        let Some(cursor) = self.cursor.take() else {
            return Ok(None);
        };

        if let PageCursor::Token(Some(token)) = &cursor {
            if !self.consumed.insert(token.clone()) {
                return Err(Error::CursorRepeated {
                    token: token.clone(),
                });
            }
        }

        let page = (self.fetch)(cursor.clone(), self.page_size).await?;
        self.pages += 1;
        let raw = page.items.len();
        self.raw_items += raw as u64;
        self.cursor = self.advance(cursor, &page);

        let items: Vec<T> = match &self.filter {
            Some(keep) => page.items.into_iter().filter(|item| keep(item)).collect(),
            None => page.items,
        };

        self.observer.observe(&Event::PageFetched {
            page: self.pages,
            raw,
            kept: items.len(),
            last: self.cursor.is_none(),
        });
        Ok(Some(items))
    }

    fn advance(&self, cursor: PageCursor, page: &Page<T>) -> Option<PageCursor> {
        match cursor {
            PageCursor::Index(n) => {
                if page.items.len() < self.page_size as usize {
                    return None;
                }
                if page.total_count.is_some_and(|total| self.raw_items >= total) {
                    return None;
                }
                n.checked_add(1).map(PageCursor::Index)
            }
            PageCursor::Token(_) => match page.next_token.as_deref() {
                Some(next) if !next.is_empty() => Some(PageCursor::Token(Some(next.to_string()))),
                _ => None,
            },
        }
    }

    /// Append every remaining item to `out`, page by page.
    ///
    /// On error, items from pages fetched before the failure stay in `out`.
    pub async fn drain_into(mut self, out: &mut Vec<T>) -> Result<(), Error<E>> {
        while let Some(items) = self.next_page().await? {
            out.extend(items);
        }
        debug!(pages = self.pages, items = out.len(), "Listing complete");
        Ok(())
    }

    /// Collect every remaining item.
    pub async fn collect(self) -> Result<Vec<T>, Error<E>> {
        let mut items = Vec::new();
        self.drain_into(&mut items).await?;
        Ok(items)
    }

    /// Lazily yield items one by one, fetching pages on demand.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<T, Error<E>>> {
        async_stream::try_stream! {
            while let Some(items) = self.next_page().await? {
                for item in items {
                    yield item;
                }
            }
        }
    }
}
