//! Piecemill Core - content-addressed deal archives and deal lifecycle tracking
//!
//! Two coupled halves:
//! - an archive generator that streams a random file selection into a tar
//!   archive while computing its piece commitment, and can rebuild and verify
//!   that archive later from the persisted manifest
//! - a deal lifecycle coordinator that drives each archive through proposal,
//!   import and on-chain confirmation with external deal tools
//!
//! Metadata lives in SQLite.

pub mod archive;
pub mod chain;
pub mod cid;
pub mod commp;
pub mod deal_tool;
pub mod error;
pub mod operations;
pub mod storage;

pub use archive::{
    ARCHIVE_EXTENSION, ArchiveBuilder, ArchiveEntry, BuiltArchive, ManifestEntry,
    PieceSizeTarget, SourceFile, WRITE_BUFFER_SIZE, archive_file_name, build_manifest,
    index_directory, resolve_manifest, select_files,
};
pub use cid::{parse_piece_cid, payload_cid, piece_cid};
pub use commp::{Commitment, CommpDigest, CommpWriter, MIN_PIECE_SIZE, pad_commp};
pub use deal_tool::{
    BoostDealTool, BoostPaths, DealStatusQuery, DealTool, DealToolCall, MemoryDealTool,
    ProcessRunner, ProposeDealRequest, ProposedDeal, StatusSignal, StatusSignals,
    parse_deal_response,
};
pub use error::{PieceError, Result};
pub use storage::{
    ContentRecord, ContentStore, DealRecord, DealSendStatus, DealState, DealStore,
    RegenerateStatus,
};
