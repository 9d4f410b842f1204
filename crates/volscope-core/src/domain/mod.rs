//! Domain model (IDs, job status, batches, result sets, service records).

pub mod ids;
pub mod job;
pub mod process_tree;
pub mod records;
pub mod result;
pub mod status;
pub mod timeline;

pub use ids::{AnalysisId, AttemptId, Pid, PluginName, SymbolId, SymbolJobId};
pub use job::{BatchMember, BatchProgress, BatchState, JobKey};
pub use process_tree::{TreeEntry, flatten_process_tree};
pub use records::{
    BatchRunRequest, Correlation, ExportFormat, NewTrackedPid, OsDetection, PluginInfo, Project,
    ProjectUpdate, RegistryHive, RunRequest, SymbolFile, SymbolJob, TrackedPid, TrackedPidUpdate,
    UploadReceipt,
};
pub use result::{ResultSchema, ResultSet, Row, render_cell};
pub use status::{BatchStatusReport, JobStatus, MemberStatus, StatusReport};
pub use timeline::{TIME_COLUMNS, Timeline, TimelineEntry, build_timeline, detect_time_column};
