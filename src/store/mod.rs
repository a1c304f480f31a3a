//! Persistence layer: the libSQL tracking database and the result datastore.

pub mod migrations;
pub mod pool;
pub mod results;
pub mod tracking;

pub use pool::{PoolTarget, PooledResource};
pub use results::{MemoryResultStore, RestResultStore, ResultStore, save_best_effort};
pub use tracking::{OrderRecord, TrackingQueryResult, TrackingStore};
