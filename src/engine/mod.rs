//! Mutation pipeline: versioned store, edge day resolution, and the change
//! engine that ties them together.

pub mod apply;
pub mod resolver;
pub mod store;

pub use apply::{ChangeEngine, EngineError};
pub use resolver::{EdgeResolver, EndpointPreference, Unresolved};
pub use store::{GraphStore, JsonDirPersistence, NullPersistence, Persistence, StoreError};
