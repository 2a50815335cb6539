pub mod attachments;
pub mod composer;
pub mod config;
pub mod error;
pub mod host;
pub mod read_receipts;
pub mod synchronizer;
pub mod thread;
pub mod timeline;
pub mod transport;
pub mod types;

pub use composer::{Composer, ComposerState, Draft, SendIntent};
pub use config::{load_settings, load_settings_from, ClientSettings, ComposerLimits};
pub use error::{ComposerError, FileRejection, FileRejectionReason, HostError, SyncError};
pub use host::ConversationHost;
pub use synchronizer::{SyncSettings, TimelineSynchronizer};
pub use thread::ParentSummary;
pub use timeline::ConversationTimeline;
pub use transport::{ChatBackend, HttpChatBackend, MissingRealtimeChannel, RealtimeChannel};
pub use types::{
    LoadOlderOutcome, Notice, ReadState, SearchHit, SendReport, SendStatus, TimelineEntry,
    TimelineEvent, TimelineSnapshot, UploadFile,
};
