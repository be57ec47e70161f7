use anyhow::Result;
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::{
    collections::HashSet,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{client::FhirClient, fhir::Bundle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStop {
    Exhausted,
    PageLimit,
    Interrupted,
    RepeatedLink,
}

/// Walks a search result set by following each page's `next` link.
pub struct Paginator<'a, R> {
    client: &'a FhirClient,
    next_url: Option<String>,
    next_suffix: Option<String>,
    max_pages: Option<usize>,
    shutdown: Option<Arc<AtomicBool>>,
    pages_fetched: usize,
    seen: HashSet<String>,
    total: Option<u64>,
    stop: Option<PageStop>,
    _resource: PhantomData<R>,
}

impl<'a, R: DeserializeOwned> Paginator<'a, R> {
    pub fn new(client: &'a FhirClient, start_url: Url) -> Self {
        Self {
            client,
            next_url: Some(start_url.to_string()),
            next_suffix: None,
            max_pages: None,
            shutdown: None,
            pages_fetched: 0,
            seen: HashSet::new(),
            total: None,
            stop: None,
            _resource: PhantomData,
        }
    }

    pub fn with_max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Text appended to every followed `next` link that does not already contain it.
    pub fn with_next_suffix(mut self, suffix: Option<String>) -> Self {
        self.next_suffix = suffix;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// `total` reported by the first page.
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn stop_reason(&self) -> Option<PageStop> {
        self.stop
    }

    pub async fn next_page(&mut self) -> Result<Option<Bundle<R>>> {
        if self.stop.is_some() {
            return Ok(None);
        }
        if self
            .shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            return Ok(self.finish(PageStop::Interrupted));
        }
        if self
            .max_pages
            .is_some_and(|max| self.pages_fetched >= max)
        {
            return Ok(self.finish(PageStop::PageLimit));
        }
        let Some(url) = self.next_url.take() else {
            return Ok(self.finish(PageStop::Exhausted));
        };
        if !self.seen.insert(url.clone()) {
            tracing::warn!(url, "next link repeats an earlier page; stopping");
            return Ok(self.finish(PageStop::RepeatedLink));
        }

        let bundle: Bundle<R> = self.client.get_json(&url).await?;
        self.pages_fetched += 1;
        if self.pages_fetched == 1 {
            self.total = bundle.total;
        }
        self.next_url = bundle.next_link().map(|link| self.with_suffix(link));
        Ok(Some(bundle))
    }

    fn with_suffix(&self, link: &str) -> String {
        match self.next_suffix.as_deref() {
            Some(suffix) if !link.contains(suffix.trim_start_matches('&')) => {
                format!("{link}{suffix}")
            }
            _ => link.to_string(),
        }
    }

    fn finish(&mut self, stop: PageStop) -> Option<Bundle<R>> {
        self.stop = Some(stop);
        None
    }
}
