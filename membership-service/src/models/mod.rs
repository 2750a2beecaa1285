pub mod event;
pub mod group;
pub mod operation;
pub mod retry_record;

pub use event::{MembershipEvent, MembershipEventType};
pub use group::{NormalizedGroup, NormalizedMember};
pub use operation::{error_codes, OperationData, OperationResult, OperationStatus};
pub use retry_record::{
    AttemptOutcome, MembershipAction, OperationType, RecordState, RetryPayload, RetryRecord,
    RetryStats,
};
