// OTR Core
// Off-the-Record messaging engine: AKE, DH ratchet, data messages, SMP

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

// Модули
pub mod api;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod state;
pub mod utils;
pub mod error;

// Re-exports для удобства
pub use api::{ErrorCode, MessageEvent, Policies, SecurityEvent, SmpEvent};
pub use config::Config;
pub use crypto::{DsaPrivateKey, DsaPublicKey, MemoryLock, MlockMemoryLock, NoMemoryLock, PrivateKey, PublicKey, Secret};
pub use error::{OtrError, Result};
pub use state::{Conversation, MessageState, Received, ResendQueue};
