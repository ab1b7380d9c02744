// Состояние OTR разговора: AKE, ключи, SMP, переотправка

pub mod ake;
pub mod conversation;
mod data;
pub mod keys;
mod receive;
pub mod resend;
pub mod smp;

pub use conversation::{Conversation, MessageState, Received};
pub use resend::{PendingMessage, ResendQueue, RetransmitMode};
