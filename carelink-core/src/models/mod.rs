pub mod id;

pub use id::{generate_id, ConversationId, MessageId, TenantId, UserId};
