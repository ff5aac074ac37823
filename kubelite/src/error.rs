//! Error handling in [`kubelite`][crate]
use thiserror::Error;

use crate::{client::ClientError, config::ConfigError, resource::ResourceKind};

/// Possible errors from listing and bootstrapping
///
/// Steady-state watch failures never surface here; the watch loops recover
/// from them on their own.
#[derive(Error, Debug)]
pub enum Error {
    /// A List request failed
    #[error("failed to list {kind}: {source}")]
    List {
        /// Kind being listed
        kind: ResourceKind,
        /// Failure reported by the client
        #[source]
        source: ClientError,
    },

    /// The continue token kept expiring while paging through a large collection
    #[error("continue token for {kind} listing expired {restarts} times")]
    ContinueExpired {
        /// Kind being listed
        kind: ResourceKind,
        /// Restarts attempted before giving up
        restarts: u32,
    },

    /// A list response carried no resourceVersion to resume watching from
    #[error("{kind} listing did not report a resourceVersion")]
    MissingResourceVersion {
        /// Kind being listed
        kind: ResourceKind,
    },

    /// The initial synchronization of a kind failed
    #[error("initial sync of {kind} failed: {source}")]
    Bootstrap {
        /// Kind whose listing failed
        kind: ResourceKind,
        /// What went wrong
        #[source]
        source: Box<Error>,
    },

    /// The operation was cancelled before it completed
    #[error("cancelled")]
    Cancelled,

    /// The configuration was rejected
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
