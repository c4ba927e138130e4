pub mod InMemory;
pub mod SharedStorage;
pub mod pool;

pub use InMemory::{MemoryChannel, WriteRecord};
pub use SharedStorage::{AlignedBuffer, DirectFileChannel, SharedChannel};
pub use pool::{Job, WorkerPool};
