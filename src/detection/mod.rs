pub mod orchestrator;
pub mod scanners;
pub mod signal_store;

pub use orchestrator::DetectionOrchestrator;
pub use signal_store::ListingSignalStore;
