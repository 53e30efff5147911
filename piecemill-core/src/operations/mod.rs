pub mod clear_archives;
pub mod generate_archive;
pub mod import_deals;
pub mod poll_deals;
pub mod regenerate_archive;
pub mod send_deals;

pub use clear_archives::{
    ClearArchivesOperation, ClearArchivesOperationRequest, ClearArchivesOperationResult,
};
pub use generate_archive::{
    GenerateArchiveOperation, GenerateArchiveOperationOutcome, GenerateArchiveOperationRequest,
};
pub use import_deals::{
    ImportDealsOperation, ImportDealsOperationRequest, ImportDealsOperationResult,
};
pub use poll_deals::{PollDealsOperation, PollDealsOperationRequest, PollDealsOperationResult};
pub use regenerate_archive::{
    RegenerateArchiveOperation, RegenerateArchiveOperationRequest,
    RegenerateArchiveOperationResult, RegenerateArchivesOperation,
    RegenerateArchivesOperationRequest, RegenerateArchivesOperationResult, RegenerateItem,
    RegenerateSelection,
};
pub use send_deals::{
    DealSelection, ParseFailurePolicy, SendDealsOperation, SendDealsOperationRequest,
    SendDealsOperationResult,
};
