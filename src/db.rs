pub mod memory;
pub mod store;

#[cfg(feature = "postgres")]
pub mod bindings;
#[cfg(feature = "postgres")]
pub mod connector;

pub use memory::MemoryStore;
pub use store::{FingerprintStore, LookupResult, NewTrack, StoreStats, Track, TrackId, with_deadline};

#[cfg(feature = "postgres")]
pub use connector::PgStore;
