//! Reclaiming background resources

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReclaimError {
    #[error("SIGNAL FAILED: {0}")]
    Signal(String),

    #[error("CLOSE FAILED: {0}")]
    Close(String),

    #[error("RECLAIM PANICKED: {0}")]
    Panicked(String),
}

/// A tracked resource that cleanup can tear down
#[async_trait]
pub trait Reclaimable: Send + Sync {
    async fn reclaim(&self) -> Result<(), ReclaimError>;

    /// Synchronous best-effort teardown, used when the process is exiting and
    /// nothing can be awaited any more.
    fn force_kill(&self) {}

    /// Whether the resource is still held after its record went terminal.
    /// A process that ignored a terminating signal stays reclaimable.
    fn is_alive(&self) -> bool {
        false
    }
}

/// Sub-agents are reclaimed by cancelling the token their run loop races on
pub struct CancelReclaimer {
    token: CancellationToken,
}

impl CancelReclaimer {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Reclaimable for CancelReclaimer {
    async fn reclaim(&self) -> Result<(), ReclaimError> {
        debug!("reclaim: cancelling sub-agent");
        self.token.cancel();
        Ok(())
    }

    fn force_kill(&self) {
        self.token.cancel();
    }
}

/// Browser session as seen by cleanup. Page-level behaviour lives with the
/// browser tools; only teardown is needed here.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn close_context(&self) -> Result<(), String>;
    async fn close_browser(&self) -> Result<(), String>;
}

pub struct BrowserReclaimer {
    handle: Arc<dyn BrowserHandle>,
}

impl BrowserReclaimer {
    pub fn new(handle: Arc<dyn BrowserHandle>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Reclaimable for BrowserReclaimer {
    async fn reclaim(&self) -> Result<(), ReclaimError> {
        let mut failures = Vec::new();

        if let Err(e) = self.handle.close_context().await {
            warn!("◆ BROWSER CONTEXT CLOSE FAILED: {}", e);
            failures.push(format!("context: {}", e));
        }
        // the browser is closed even when the context refused to close
        if let Err(e) = self.handle.close_browser().await {
            warn!("◆ BROWSER CLOSE FAILED: {}", e);
            failures.push(format!("browser: {}", e));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReclaimError::Close(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBrowser {
        calls: Mutex<Vec<&'static str>>,
        fail_context: bool,
    }

    #[async_trait]
    impl BrowserHandle for FakeBrowser {
        async fn close_context(&self) -> Result<(), String> {
            self.calls.lock().unwrap().push("context");
            if self.fail_context {
                Err("context gone".to_string())
            } else {
                Ok(())
            }
        }

        async fn close_browser(&self) -> Result<(), String> {
            self.calls.lock().unwrap().push("browser");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_browser_closes_context_then_browser() {
        let browser = Arc::new(FakeBrowser::default());
        let reclaimer = BrowserReclaimer::new(browser.clone());

        reclaimer.reclaim().await.unwrap();
        assert_eq!(*browser.calls.lock().unwrap(), vec!["context", "browser"]);
    }

    #[tokio::test]
    async fn test_browser_context_failure_still_closes_browser() {
        let browser = Arc::new(FakeBrowser {
            fail_context: true,
            ..Default::default()
        });
        let reclaimer = BrowserReclaimer::new(browser.clone());

        let err = reclaimer.reclaim().await.unwrap_err();
        assert!(matches!(err, ReclaimError::Close(ref msg) if msg.contains("context gone")));
        assert_eq!(*browser.calls.lock().unwrap(), vec!["context", "browser"]);
    }

    #[tokio::test]
    async fn test_cancel_reclaimer_cancels_token() {
        let token = CancellationToken::new();
        let reclaimer = CancelReclaimer::new(token.clone());

        reclaimer.reclaim().await.unwrap();
        assert!(token.is_cancelled());
    }
}
