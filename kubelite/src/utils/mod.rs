//! Helpers shared by the watch loops

mod backoff;

pub use backoff::WatchBackoff;
