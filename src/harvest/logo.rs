//! Organization logo lookup from a landing page.

use std::sync::Arc;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::fetch::RemoteFetcher;
use crate::traits::LogoResolver;

/// Tried in order; the first match wins.
const LOGO_SELECTORS: &[&str] = &[
    "img.organization-logo",
    "img[class*='logo']",
    "img[id*='logo']",
    "meta[property='og:image']",
];

fn absolutize(page_url: &str, href: &str) -> Option<String> {
    if let Ok(url) = Url::parse(href) {
        return Some(url.into());
    }
    Url::parse(page_url).ok()?.join(href).ok().map(String::from)
}

/// Finds a logo URL in an HTML page, resolved against `page_url`.
pub fn extract_logo(html: &str, page_url: &str) -> Option<String> {
    let document = Html::parse_document(html);

    for css in LOGO_SELECTORS {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        for element in document.select(&selector) {
            let attr = if element.value().name() == "meta" {
                "content"
            } else {
                "src"
            };
            let Some(href) = element.value().attr(attr).map(str::trim) else {
                continue;
            };
            if href.is_empty() {
                continue;
            }
            if let Some(url) = absolutize(page_url, href) {
                return Some(url);
            }
        }
    }
    None
}

/// [`LogoResolver`] scraping the landing page through a [`RemoteFetcher`].
pub struct HtmlLogoResolver {
    fetcher: Arc<dyn RemoteFetcher>,
}

impl HtmlLogoResolver {
    pub fn new(fetcher: Arc<dyn RemoteFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl LogoResolver for HtmlLogoResolver {
    async fn resolve_logo(&self, page_url: &str) -> Option<String> {
        let body = match self.fetcher.fetch(page_url, None).await {
            Ok(body) => body,
            Err(e) => {
                debug!(page = page_url, error = %e, "Logo page unavailable");
                return None;
            }
        };
        let html = String::from_utf8_lossy(&body);
        extract_logo(&html, page_url)
    }
}
