// Формат сообщений OTR: wire-примитивы, заголовки, фрагментация, TLV

pub mod envelope;
pub mod fragmentation;
pub mod messages;
pub mod tlv;
pub mod version;
pub mod wire;

pub use version::Version;
