pub mod conversation;
pub mod member;
pub mod message;

pub use conversation::{Conversation, ConversationSummary, MetadataPatch, Participant};
pub use member::{Member, MemberRole};
pub use message::{MediaInput, MediaItem, MediaKind, Message, MessageKind, ModerationState, NewMessage};
