//! Paginated listing of a whole collection
use tracing::{debug, warn};

use crate::{
    client::{ListParams, ObjectClient},
    config::ListConfig,
    error::{Error, Result},
    resource::{ClusterObject, ResourceKind},
};

/// The full current collection of one kind
#[derive(Clone, Debug)]
pub struct Listing {
    /// Every object, in the order the pages returned them
    pub items: Vec<ClusterObject>,
    /// `resourceVersion` of the final page, the point to resume watching from
    pub resource_version: String,
    /// Number of List requests it took
    pub pages: usize,
}

fn first_page(config: &ListConfig) -> ListParams {
    match config.first_page_size.or(config.page_size) {
        Some(limit) => ListParams::default().limit(limit),
        None => ListParams::default(),
    }
}

fn next_page(config: &ListConfig, token: &str) -> ListParams {
    let params = ListParams::default().continue_token(token);
    match config.page_size {
        Some(limit) => params.limit(limit),
        None => params,
    }
}

/// List every object of `kind`, following continue tokens until exhausted
///
/// Pages are requested with `limit = first_page_size` and then
/// `limit = page_size` plus the `continue` token of the previous response.
///
/// # Errors
///
/// Any failed List aborts the whole sequence and nothing collected so far is
/// returned. The one exception is an expired continue token (`410 Gone` on a
/// follow-up page): the listing then starts over from the first page, up to
/// `max_restarts` times, before giving up with [`Error::ContinueExpired`].
pub async fn list_all<C>(client: &C, kind: ResourceKind, config: &ListConfig) -> Result<Listing>
where
    C: ObjectClient + ?Sized,
{
    let mut restarts = 0;
    'listing: loop {
        let mut items = Vec::new();
        let mut pages = 0;
        let mut params = first_page(config);
        loop {
            let page = match client.list(kind, &params).await {
                Ok(page) => page,
                Err(err) if pages > 0 && err.is_gone() => {
                    if restarts >= config.max_restarts {
                        return Err(Error::ContinueExpired { kind, restarts });
                    }
                    restarts += 1;
                    warn!(%kind, pages, restarts, "continue token expired, restarting listing");
                    continue 'listing;
                }
                Err(source) => return Err(Error::List { kind, source }),
            };
            pages += 1;
            items.extend(page.items);
            match page.continue_token.filter(|token| !token.is_empty()) {
                Some(token) => params = next_page(config, &token),
                None => {
                    let resource_version = page
                        .resource_version
                        .filter(|rv| !rv.is_empty())
                        .ok_or(Error::MissingResourceVersion { kind })?;
                    debug!(%kind, items = items.len(), pages, %resource_version, "listing complete");
                    return Ok(Listing {
                        items,
                        resource_version,
                        pages,
                    });
                }
            }
        }
    }
}
