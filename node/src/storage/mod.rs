pub mod coordinator;
pub mod store;
pub mod wire;

pub use coordinator::{StorageConfig, StorageCoordinator, REPLICA_COUNT};
pub use store::{LocalStore, ReplicaRole, StoredEntry};
