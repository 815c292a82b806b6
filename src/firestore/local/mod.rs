pub mod memory;
pub mod sync_engine;

#[doc(inline)]
pub use memory::{
    LocalStorePersistence, MemoryLocalStore, QueryListenerRegistration, TargetMetadataSnapshot,
};
#[doc(inline)]
pub use sync_engine::SyncEngine;
