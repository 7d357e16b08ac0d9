pub mod decoder;
pub mod dedup;
pub mod line_reader;
pub mod state;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use decoder::{Camera, DecodeTrampoline, FacingMode};
pub use dedup::ScanDeduplicator;
pub use line_reader::LineCamera;
pub use state::ScannerState;
pub use supervisor::{ScannerNotice, ScannerSupervisor, SupervisorConfig};
