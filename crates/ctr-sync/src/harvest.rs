//! Paginated search-result walker.

use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use ctr_adapters::SearchResultParser;
use ctr_core::HarvestedPage;
use ctr_storage::{FetchError, HttpFetcher};
use futures::stream::{self, Stream};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestRequest {
    pub start_page: u32,
    pub max_pages: u32,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl Default for HarvestRequest {
    fn default() -> Self {
        Self {
            start_page: 1,
            max_pages: 1,
            date_from: None,
            date_to: None,
        }
    }
}

pub struct Harvester {
    http: HttpFetcher,
    parser: SearchResultParser,
    base_url: String,
    politeness: Duration,
}

impl Harvester {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, politeness: Duration) -> anyhow::Result<Self> {
        let parser = SearchResultParser::new().context("compiling search result patterns")?;
        Ok(Self {
            http,
            parser,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            politeness,
        })
    }

    pub fn search_url(&self, page: u32, date_from: Option<NaiveDate>, date_to: Option<NaiveDate>) -> String {
        let mut url = format!("{}/search?query=&page={page}", self.base_url);
        if let Some(from) = date_from {
            url.push_str(&format!("&dateFrom={}", from.format("%Y-%m-%d")));
        }
        if let Some(to) = date_to {
            url.push_str(&format!("&dateTo={}", to.format("%Y-%m-%d")));
        }
        url
    }

    /// Lazily walk result pages in increasing order.
    ///
    /// A page is yielded only once its identifiers are extracted. The stream ends after
    /// `max_pages` pages, at the first page without identifiers (not yielded), or right
    /// after yielding a fetch error.
    pub fn harvest(
        &self,
        request: HarvestRequest,
    ) -> impl Stream<Item = Result<HarvestedPage, FetchError>> + '_ {
        let first = request.start_page.max(1);
        stream::try_unfold((first, request.max_pages), move |(page, remaining)| async move {
            if remaining == 0 {
                return Ok(None);
            }
            let next = (page.saturating_add(1), remaining - 1);
            self.fetch_page(page, &request)
                .await
                .map(|found| found.map(|harvested| (harvested, next)))
        })
    }

    /// `None` when the page lists no identifiers.
    async fn fetch_page(
        &self,
        page: u32,
        request: &HarvestRequest,
    ) -> Result<Option<HarvestedPage>, FetchError> {
        tokio::time::sleep(self.politeness).await;
        let url = self.search_url(page, request.date_from, request.date_to);
        info!(page, %url, "fetching search page");
        let html = self.http.get_text(&url).await?;

        let identifiers = self.parser.extract(&html);
        if identifiers.is_empty() {
            info!(page, "search page has no identifiers; end of result set");
            return Ok(None);
        }
        debug!(page, count = identifiers.len(), "harvested identifiers");
        Ok(Some(HarvestedPage { page, identifiers }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctr_storage::HttpClientConfig;

    fn harvester(base: &str) -> Harvester {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        Harvester::new(http, base, Duration::ZERO).expect("harvester")
    }

    #[test]
    fn search_url_carries_page_and_optional_dates() {
        let h = harvester("https://example.test/ctr-search/");
        assert_eq!(
            h.search_url(3, None, None),
            "https://example.test/ctr-search/search?query=&page=3"
        );
        assert_eq!(
            h.search_url(
                1,
                NaiveDate::from_ymd_opt(2023, 1, 1),
                NaiveDate::from_ymd_opt(2023, 2, 1)
            ),
            "https://example.test/ctr-search/search?query=&page=1&dateFrom=2023-01-01&dateTo=2023-02-01"
        );
    }
}
