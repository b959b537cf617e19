use anyhow::Result;
use async_trait::async_trait;

/// Browser integration invoked once the server is ready.
///
/// The supervisor only ever calls [`notify_ready`](BrowserNotifier::notify_ready),
/// bounded by a timeout, and ignores its outcome beyond logging.
#[async_trait]
pub trait BrowserNotifier: Send + Sync {
    /// Focus an existing tab whose URL contains `url_substring`.
    /// Returns false when no such tab exists.
    async fn find_tab(&self, url_substring: &str) -> Result<bool>;

    /// Reload the focused tab
    async fn refresh_tab(&self) -> Result<()>;

    async fn open_tab(&self, url: &str) -> Result<()>;

    /// Reuse a tab already pointing at the server, else open a new one
    async fn notify_ready(&self, url: &str) -> Result<()> {
        let needle = url.split_once("://").map_or(url, |(_, rest)| rest);
        if self.find_tab(needle).await? {
            self.refresh_tab().await
        } else {
            self.open_tab(url).await
        }
    }
}

/// Does nothing; used with `--no-browser` and in tests
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl BrowserNotifier for NoopNotifier {
    async fn find_tab(&self, _url_substring: &str) -> Result<bool> {
        Ok(false)
    }

    async fn refresh_tab(&self) -> Result<()> {
        Ok(())
    }

    async fn open_tab(&self, _url: &str) -> Result<()> {
        Ok(())
    }

    async fn notify_ready(&self, _url: &str) -> Result<()> {
        Ok(())
    }
}
