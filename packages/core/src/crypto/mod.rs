//! Криптографический модуль
//!
//! # Архитектура
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Conversation (state module)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                ┌─────────────┴─────────────┐
//!                ▼                           ▼
//! ┌───────────────────────────┐  ┌──────────────────────────┐
//! │   keys                    │  │  math                    │
//! │  - PrivateKey / PublicKey │  │  - DH group (1536 bit)   │
//! │  - DSA sign / verify      │  │  - mod_exp, inverse      │
//! │  - fingerprints           │  │  - group element checks  │
//! └───────────────────────────┘  └──────────────────────────┘
//!                │                           │
//!                └─────────────┬─────────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  primitives: SHA-1, SHA-256, HMAC, AES-128-CTR, ct_eq       │
//! │  secure_memory: Secret, MemoryLock (mlock)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Модули
//!
//! - [`keys`]: долгосрочные ключи (DSA)
//! - [`math`]: арифметика в DH группе
//! - [`primitives`]: хеши, MAC и шифр
//! - [`secure_memory`]: секреты, затираемые при drop

pub mod keys;
pub mod math;
pub mod primitives;
pub mod secure_memory;

pub use keys::{DsaPrivateKey, DsaPublicKey, PrivateKey, PublicKey};
pub use secure_memory::{MemoryLock, MlockMemoryLock, NoMemoryLock, Secret};
