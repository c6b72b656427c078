//! Navigation detection
//!
//! Single-page-app route changes reach the engine as [`NavigationEvent`]s:
//! the host adapter wraps the history-mutation APIs and forwards pushState,
//! replaceState, back/forward and hash changes. The observer dedupes
//! same-URL events so a route change is observed as exactly one page view
//! without a full reload.

/// How the host observed the navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationKind {
    Push,
    Replace,
    Pop,
    Hash,
}

/// A host-reported navigation.
#[derive(Debug, Clone)]
pub struct NavigationEvent {
    pub url: String,
    pub title: String,
    pub kind: NavigationKind,
}

/// A deduplicated page change ready to be tracked.
#[derive(Debug, Clone, PartialEq)]
pub struct PageChange {
    pub url: String,
    pub title: String,
}

/// Tracks the current URL and filters out redundant navigations.
#[derive(Debug)]
pub struct NavigationObserver {
    current_url: String,
}

impl NavigationObserver {
    pub fn new(entry_url: impl Into<String>) -> Self {
        Self {
            current_url: entry_url.into(),
        }
    }

    /// Process a navigation event. Returns the page change when the URL
    /// actually moved, `None` when it is a same-URL rewrite.
    pub fn observe(&mut self, event: NavigationEvent) -> Option<PageChange> {
        if event.url == self.current_url {
            return None;
        }
        self.current_url = event.url.clone();
        Some(PageChange {
            url: event.url,
            title: event.title,
        })
    }

    pub fn current_url(&self) -> &str {
        &self.current_url
    }
}
