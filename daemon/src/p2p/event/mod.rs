pub mod processor;
pub mod sync;

pub use processor::{BatchEventProcessor, ProcessorConfig, SubmitOutcome};
pub use sync::{EventSync, EventSyncConfig};
