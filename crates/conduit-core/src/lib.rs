pub mod events;
pub mod memstore;
pub mod models;
pub mod params;
pub mod runtimeconfig;
pub mod store;

pub use memstore::{MemStore, now};
pub use store::{Store, StoreError, StoreResult};
