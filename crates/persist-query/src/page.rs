//! Page requests and page results.

use crate::clause::{OrderBy, Window};
use persist_core::Result;
use serde::{Deserialize, Serialize};

/// Which page to fetch, how large, and in what order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Zero-based page number
    pub page: u64,
    pub size: u64,
    #[serde(default)]
    pub sort: Vec<OrderBy>,
}

impl PageRequest {
    /// Page size used when a caller does not choose one.
    pub const DEFAULT_SIZE: u64 = 5;

    pub fn of(page: u64, size: u64) -> Self {
        Self {
            page,
            size,
            sort: Vec::new(),
        }
    }

    /// First page of the default size ordered by `column` ascending.
    pub fn default_sorted_by(column: impl Into<String>) -> Self {
        Self::of(0, Self::DEFAULT_SIZE).with_sort(OrderBy::asc(column))
    }

    /// Append a sort term.
    pub fn with_sort(mut self, order: OrderBy) -> Self {
        self.sort.push(order);
        self
    }

    pub fn offset(&self) -> u64 {
        self.page.saturating_mul(self.size)
    }

    /// The content window for this page.
    pub fn window(&self) -> Window {
        Window::new(self.offset(), self.size)
    }

    /// Window one row wider than the page, so a next slice can be detected.
    pub fn lookahead_window(&self) -> Window {
        Window::new(self.offset(), self.size.saturating_add(1))
    }

    pub fn next(&self) -> Self {
        Self {
            page: self.page + 1,
            ..self.clone()
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::of(0, Self::DEFAULT_SIZE)
    }
}

/// Whether a paginated fetch also counts the full result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pagination {
    /// Content window plus an independent count fetch.
    Paged(PageRequest),
    /// Content window only; `has_next` comes from fetching one extra row.
    Sliced(PageRequest),
}

impl Pagination {
    pub fn request(&self) -> &PageRequest {
        match self {
            Pagination::Paged(r) | Pagination::Sliced(r) => r,
        }
    }

    pub fn counts_total(&self) -> bool {
        matches!(self, Pagination::Paged(_))
    }
}

/// One page of results.
///
/// Serializes as `{content, totalElements?, number, size, totalPages?,
/// first, hasNext}`; the totals are present only for counted pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_elements: Option<u64>,
    pub number: u64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u64>,
    pub first: bool,
    pub has_next: bool,
}

impl<T> Page<T> {
    /// A page whose total row count is known.
    pub fn counted(content: Vec<T>, request: &PageRequest, total: u64) -> Self {
        let total_pages = if request.size == 0 {
            0
        } else {
            total.div_ceil(request.size)
        };
        Self {
            content,
            total_elements: Some(total),
            number: request.page,
            size: request.size,
            total_pages: Some(total_pages),
            first: request.page == 0,
            has_next: request.page.saturating_add(1).saturating_mul(request.size) < total,
        }
    }

    /// A page that only knows whether another one follows.
    pub fn sliced(content: Vec<T>, request: &PageRequest, has_next: bool) -> Self {
        Self {
            content,
            total_elements: None,
            number: request.page,
            size: request.size,
            total_pages: None,
            first: request.page == 0,
            has_next,
        }
    }

    pub fn number_of_elements(&self) -> usize {
        self.content.len()
    }

    pub fn is_last(&self) -> bool {
        !self.has_next
    }

    /// Convert the content, keeping the paging metadata.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            total_elements: self.total_elements,
            number: self.number,
            size: self.size,
            total_pages: self.total_pages,
            first: self.first,
            has_next: self.has_next,
        }
    }
}

impl<T: Serialize> Page<T> {
    #[allow(clippy::result_large_err)]
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
