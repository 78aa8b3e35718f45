//! Browser capability boundary: the handful of page-level primitives the
//! scrape pipeline needs, plus a CDP-backed implementation.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

pub const CRATE_NAME: &str = "morada-browser";

const FIND_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error(transparent)]
    Cdp(#[from] chromiumoxide::error::CdpError),
}

/// Everything an adapter is allowed to ask of a rendered page. Selector
/// misses report `false` rather than erroring so callers can treat "not
/// there" as data, not failure.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    async fn wait_for_load(&self) -> Result<(), BrowserError>;

    /// Current rendered markup, after whatever scripts have run so far.
    async fn content(&self) -> Result<String, BrowserError>;

    /// Poll for an element until `timeout`; `false` on miss.
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool, BrowserError>;

    /// Click the first match; `false` if nothing matched.
    async fn click(&self, selector: &str) -> Result<bool, BrowserError>;

    /// Scroll the first match into the viewport; `false` if nothing matched.
    async fn scroll_into_view(&self, selector: &str) -> Result<bool, BrowserError>;

    /// Invoke a JS function (with `this` bound to the element) on the first
    /// match; `false` if nothing matched.
    async fn run_script_on(&self, selector: &str, script: &str) -> Result<bool, BrowserError>;
}

/// Owns the Chromium process and the CDP event loop.
pub struct ChromeSession {
    browser: Browser,
    event_loop: JoinHandle<()>,
}

impl ChromeSession {
    pub async fn launch(headless: bool) -> Result<Self, BrowserError> {
        let mut builder = BrowserConfig::builder();
        if !headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config).await?;
        let event_loop = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser event loop error");
                }
            }
        });

        Ok(Self {
            browser,
            event_loop,
        })
    }

    pub async fn open_page(&self) -> Result<ChromePage, BrowserError> {
        let page = self.browser.new_page("about:blank").await?;
        Ok(ChromePage { page })
    }

    pub async fn close(mut self) {
        let _ = self.browser.close().await;
        let _ = self.browser.wait().await;
        self.event_loop.abort();
    }
}

pub struct ChromePage {
    page: Page,
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn wait_for_load(&self) -> Result<(), BrowserError> {
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn content(&self) -> Result<String, BrowserError> {
        Ok(self.page.content().await?)
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool, BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(FIND_POLL_INTERVAL).await;
        }
    }

    async fn click(&self, selector: &str) -> Result<bool, BrowserError> {
        match self.page.find_element(selector).await {
            Ok(element) => {
                element.click().await?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn scroll_into_view(&self, selector: &str) -> Result<bool, BrowserError> {
        match self.page.find_element(selector).await {
            Ok(element) => {
                element.scroll_into_view().await?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn run_script_on(&self, selector: &str, script: &str) -> Result<bool, BrowserError> {
        match self.page.find_element(selector).await {
            Ok(element) => {
                element.call_js_fn(script, false).await?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}
