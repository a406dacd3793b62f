// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Page registry of a recording session.
//!
//! Maps driver page ids to local page ids, tracks the initial page and keeps
//! exactly one active page while any page is open.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    #[error("page '{0}' not found")]
    NotFound(String),
    #[error("the initial page cannot be closed")]
    InitialPage,
    #[error("page '{0}' is closed")]
    Closed(String),
}

/// A page known to a recording session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedPage {
    pub page_id: String,
    pub driver_page_id: String,
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opener_page_id: Option<String>,
    pub is_initial: bool,
    pub is_closed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    seq: u64,
}

/// Result of closing a page.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPage {
    pub page: TrackedPage,
    /// Newly elected active page when the closed page was active.
    pub switched_to: Option<TrackedPage>,
}

#[derive(Debug, Default)]
pub struct PageRegistry {
    pages: Vec<TrackedPage>,
    active: Option<String>,
    seq: u64,
}

impl PageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint(&mut self, driver_page_id: &str, url: &str, opener: Option<String>) -> TrackedPage {
        self.seq += 1;
        TrackedPage {
            page_id: Uuid::new_v4().to_string(),
            driver_page_id: driver_page_id.to_string(),
            url: url.to_string(),
            title: String::new(),
            opener_page_id: opener,
            is_initial: false,
            is_closed: false,
            created_at: Utc::now(),
            seq: self.seq,
        }
    }

    /// Register the session's first page and make it active.
    ///
    /// Idempotent for an already known driver page.
    pub fn register_initial(&mut self, driver_page_id: &str, url: &str) -> TrackedPage {
        if let Some(existing) = self.by_driver_id(driver_page_id) {
            return existing.clone();
        }
        let mut page = self.mint(driver_page_id, url, None);
        page.is_initial = !self.pages.iter().any(|p| p.is_initial);
        self.active = Some(page.page_id.clone());
        self.pages.push(page.clone());
        page
    }

    /// Register a page opened by the browser. It does not become active.
    pub fn register_created(
        &mut self,
        driver_page_id: &str,
        url: &str,
        opener_driver_page_id: Option<&str>,
    ) -> TrackedPage {
        if let Some(existing) = self.by_driver_id(driver_page_id) {
            return existing.clone();
        }
        let opener = opener_driver_page_id
            .and_then(|id| self.by_driver_id(id))
            .map(|p| p.page_id.clone());
        let page = self.mint(driver_page_id, url, opener);
        if self.active.is_none() {
            self.active = Some(page.page_id.clone());
        }
        self.pages.push(page.clone());
        page
    }

    pub fn navigated(&mut self, driver_page_id: &str, url: &str, title: Option<&str>) -> Option<TrackedPage> {
        let page = self
            .pages
            .iter_mut()
            .find(|p| p.driver_page_id == driver_page_id && !p.is_closed)?;
        page.url = url.to_string();
        if let Some(title) = title {
            page.title = title.to_string();
        }
        Some(page.clone())
    }

    /// Make an open page active.
    pub fn activate(&mut self, page_id: &str) -> Result<TrackedPage, PageError> {
        let page = self.get(page_id)?;
        if page.is_closed {
            return Err(PageError::Closed(page_id.to_string()));
        }
        let page = page.clone();
        self.active = Some(page.page_id.clone());
        Ok(page)
    }

    /// Close a page. User-initiated closes may not target the initial page.
    pub fn close(&mut self, page_id: &str, user_initiated: bool) -> Result<ClosedPage, PageError> {
        let page = self.get(page_id)?;
        if page.is_closed {
            return Err(PageError::Closed(page_id.to_string()));
        }
        if user_initiated && page.is_initial {
            return Err(PageError::InitialPage);
        }
        let page_id = page.page_id.clone();
        let Some(closed) = self.pages.iter_mut().find(|p| p.page_id == page_id) else {
            return Err(PageError::NotFound(page_id));
        };
        closed.is_closed = true;
        let closed = closed.clone();

        let mut switched_to = None;
        if self.active.as_deref() == Some(page_id.as_str()) {
            let elected = self
                .pages
                .iter()
                .filter(|p| !p.is_closed)
                .max_by_key(|p| p.seq)
                .cloned();
            self.active = elected.as_ref().map(|p| p.page_id.clone());
            switched_to = elected;
        }
        Ok(ClosedPage {
            page: closed,
            switched_to,
        })
    }

    pub fn close_by_driver_id(&mut self, driver_page_id: &str) -> Result<ClosedPage, PageError> {
        let page_id = self
            .pages
            .iter()
            .find(|p| p.driver_page_id == driver_page_id && !p.is_closed)
            .map(|p| p.page_id.clone())
            .ok_or_else(|| PageError::NotFound(driver_page_id.to_string()))?;
        self.close(&page_id, false)
    }

    pub fn get(&self, page_id: &str) -> Result<&TrackedPage, PageError> {
        self.pages
            .iter()
            .find(|p| p.page_id == page_id)
            .ok_or_else(|| PageError::NotFound(page_id.to_string()))
    }

    /// Open page for a driver page id.
    pub fn by_driver_id(&self, driver_page_id: &str) -> Option<&TrackedPage> {
        self.pages
            .iter()
            .find(|p| p.driver_page_id == driver_page_id && !p.is_closed)
    }

    pub fn active(&self) -> Option<&TrackedPage> {
        let id = self.active.as_deref()?;
        self.pages.iter().find(|p| p.page_id == id)
    }

    pub fn active_page_id(&self) -> Option<String> {
        self.active.clone()
    }

    /// Open pages in creation order.
    pub fn open_pages(&self) -> Vec<TrackedPage> {
        self.pages.iter().filter(|p| !p.is_closed).cloned().collect()
    }

    /// Every page ever seen, closed ones included.
    pub fn all_pages(&self) -> &[TrackedPage] {
        &self.pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_page_is_not_activated() {
        let mut registry = PageRegistry::new();
        let p0 = registry.register_initial("d0", "about:blank");
        let p1 = registry.register_created("d1", "https://example.com", Some("d0"));

        assert!(p0.is_initial);
        assert_eq!(p1.opener_page_id.as_deref(), Some(p0.page_id.as_str()));
        assert_eq!(registry.active_page_id(), Some(p0.page_id.clone()));

        registry.activate(&p1.page_id).unwrap();
        assert_eq!(registry.active_page_id(), Some(p1.page_id));
    }

    #[test]
    fn test_closing_active_page_elects_most_recent() {
        let mut registry = PageRegistry::new();
        let p0 = registry.register_initial("d0", "about:blank");
        let p1 = registry.register_created("d1", "about:blank", Some("d0"));
        let p2 = registry.register_created("d2", "about:blank", Some("d0"));
        registry.activate(&p1.page_id).unwrap();

        let closed = registry.close_by_driver_id("d1").unwrap();
        assert_eq!(closed.switched_to.map(|p| p.page_id), Some(p2.page_id.clone()));

        let closed = registry.close(&p2.page_id, true).unwrap();
        assert_eq!(closed.switched_to.map(|p| p.page_id), Some(p0.page_id.clone()));
        assert_eq!(registry.open_pages().len(), 1);
    }

    #[test]
    fn test_initial_page_protected_from_user_close() {
        let mut registry = PageRegistry::new();
        let p0 = registry.register_initial("d0", "about:blank");
        assert_eq!(registry.close(&p0.page_id, true), Err(PageError::InitialPage));

        let p1 = registry.register_created("d1", "about:blank", None);
        registry.close(&p1.page_id, true).unwrap();
        assert_eq!(
            registry.activate(&p1.page_id),
            Err(PageError::Closed(p1.page_id.clone()))
        );
    }

    #[test]
    fn test_closing_inactive_page_keeps_active() {
        let mut registry = PageRegistry::new();
        let p0 = registry.register_initial("d0", "about:blank");
        registry.register_created("d1", "about:blank", None);
        let closed = registry.close_by_driver_id("d1").unwrap();
        assert!(closed.switched_to.is_none());
        assert_eq!(registry.active_page_id(), Some(p0.page_id));
    }
}
