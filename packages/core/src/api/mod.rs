// Публичный API для хоста: события и политики

pub mod events;
pub mod policy;

pub use events::{
    ErrorCode, ErrorMessageHandler, MessageEvent, MessageEventHandler, ReceivedKeyHandler, SecurityEvent,
    SecurityEventHandler, SmpEvent, SmpEventHandler,
};
pub use policy::Policies;
