pub mod chat;
pub mod event;
pub mod message;

pub use chat::Chat;
pub use event::{ChatEvent, EventKind};
pub use message::{Media, Message, MessageInput, MessagePatch, MessageType, Reaction};
