pub mod event;
pub mod snapshot;
pub mod sync;

pub use event::{
    EventEnvelope, EventPriority, EventStatus, EventType, HeartbeatPayload, HEADER_EVENT_ID,
    HEADER_EVENT_PRIORITY, HEADER_EVENT_TYPE, HEADER_SOURCE_NODE,
};
pub use snapshot::{
    AccountState, SnapshotCounts, SnapshotDocument, SnapshotMetadata, SnapshotState,
    SNAPSHOT_FORMAT_VERSION,
};
pub use sync::{
    BlockHeadersResponse, BlockPayload, BlocksRangeResponse, Checkpoint, HasSnapshotResponse,
};
