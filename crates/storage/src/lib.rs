//! Persistence contract for the mesh messaging core.
//!
//! The router only ever talks to the narrow DAO traits in
//! [`contract`]; the database engine behind them is an external
//! collaborator. [`memory`] ships an in-memory reference implementation
//! used by tests and by embedders that have no database.

pub mod contract;
pub mod error;
pub mod memory;
pub mod models;

pub use contract::{ConversationStore, MessageStore, PeerStore};
pub use error::{StorageError, StorageResult};
pub use memory::{MemoryConversationStore, MemoryMessageStore, MemoryPeerStore};
pub use models::{
    message_preview, ConnectionState, Conversation, MeshMessage, MessageStatus, Peer,
    BROADCAST_CONVERSATION_ID,
};
