//! Query parameters shared by the list endpoints: page-based pagination,
//! case-insensitive name search and `watch=true` streaming.

use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;

const DEFAULT_PER_PAGE: u32 = 100;
const MAX_PER_PAGE: u32 = 1000;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    /// 1-based page number.
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    /// Substring matched against the resource name, ignoring case.
    pub search: Option<String>,
    /// Stream changes as server-sent events instead of returning a page.
    #[serde(default)]
    pub watch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub total: usize,
    pub total_page: usize,
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

impl ListParams {
    pub fn validate(&self, request_id: &str) -> Result<(), ApiError> {
        if self.page == Some(0) {
            return Err(ApiError::bad_request("invalid_page", "page starts at 1")
                .with_request_id(request_id));
        }
        if self.per_page == Some(0) {
            return Err(
                ApiError::bad_request("invalid_per_page", "perPage must be at least 1")
                    .with_request_id(request_id),
            );
        }
        Ok(())
    }

    pub fn matches(&self, name: &str) -> bool {
        name_matches(self.search.as_deref(), name)
    }

    /// Filters by `search` and cuts out the requested page. A page past the
    /// end is empty, not an error.
    pub fn paginate<T>(&self, items: Vec<T>, name: impl Fn(&T) -> &str) -> Page<T> {
        let page = self.page.unwrap_or(1).max(1);
        let per_page = self
            .per_page
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE);

        let matching: Vec<T> = items.into_iter().filter(|i| self.matches(name(i))).collect();
        let total = matching.len();
        let skip = (page as usize - 1).saturating_mul(per_page as usize);
        let items = matching
            .into_iter()
            .skip(skip)
            .take(per_page as usize)
            .collect();
        Page {
            items,
            pagination: Pagination {
                page,
                per_page,
                total,
                total_page: total.div_ceil(per_page as usize),
            },
        }
    }
}

/// Case-insensitive substring match; an empty search matches everything.
pub fn name_matches(search: Option<&str>, name: &str) -> bool {
    match search.map(str::trim) {
        None | Some("") => true,
        Some(needle) => name.to_lowercase().contains(&needle.to_lowercase()),
    }
}
