pub mod memory;
pub mod shm;
pub mod traits;

pub use memory::{MemoryFile, MemoryVfs};
pub use shm::ShmRegion;
pub use traits::{FileControl, FileControlOutcome, Vfs, VfsFile, SHM_NLOCK, SHM_REGION_SIZE};
