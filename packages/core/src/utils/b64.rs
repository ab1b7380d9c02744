// Base64 утилиты

use crate::error::Result;
use base64::{engine::general_purpose, Engine};

pub fn encode(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

pub fn decode(data: impl AsRef<[u8]>) -> Result<Vec<u8>> {
    Ok(general_purpose::STANDARD.decode(data)?)
}
