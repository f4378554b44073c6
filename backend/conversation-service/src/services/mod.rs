pub mod directory;
pub mod ledger;
pub mod locks;
pub mod membership;
pub mod moderation;
pub mod orchestrator;
pub mod read_tracker;
pub mod retry;

// Re-export key types for convenience
pub use ledger::{MessagePage, MessagesAfter};
pub use moderation::{HttpModerationClient, ModerationClient, NoopModeration};
pub use orchestrator::{
    ConversationOrchestrator, LeaveOutcome, OrchestratorSettings, OutgoingMessage,
};
pub use read_tracker::ReadState;
