use chrono::{DateTime, Utc};

/// Time source for request handling.
///
/// Services take `now` explicitly; adapters at the edge read it from here.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}
