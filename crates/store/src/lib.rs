pub mod memory_store;
pub mod sync;
pub mod traits;

pub use memory_store::MemoryStore;
pub use sync::PersistenceSync;
pub use traits::{DurableStore, StoreError};
