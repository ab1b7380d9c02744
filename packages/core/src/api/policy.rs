// Политики OTR сессии (независимые биты)

use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Policies(u32);

impl Policies {
    pub const ALLOW_V2: Policies = Policies(0x01);
    pub const ALLOW_V3: Policies = Policies(0x02);
    pub const REQUIRE_ENCRYPTION: Policies = Policies(0x04);
    pub const SEND_WHITESPACE_TAG: Policies = Policies(0x08);
    pub const WHITESPACE_START_AKE: Policies = Policies(0x10);
    pub const ERROR_START_AKE: Policies = Policies(0x20);

    pub const fn empty() -> Self {
        Policies(0)
    }

    /// v3 only, nothing else.
    pub fn otr_v3() -> Self {
        Self::ALLOW_V3
    }

    /// Both versions, opportunistic start on whitespace tags and errors.
    pub fn default_policy() -> Self {
        Self::ALLOW_V2 | Self::ALLOW_V3 | Self::WHITESPACE_START_AKE | Self::ERROR_START_AKE
    }

    pub fn always() -> Self {
        Self::default_policy() | Self::REQUIRE_ENCRYPTION
    }

    pub fn has(&self, other: Policies) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn add(&mut self, other: Policies) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Policies) {
        self.0 &= !other.0;
    }

    pub fn is_otr_enabled(&self) -> bool {
        self.has(Self::ALLOW_V2) || self.has(Self::ALLOW_V3)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for Policies {
    type Output = Policies;

    fn bitor(self, rhs: Policies) -> Policies {
        Policies(self.0 | rhs.0)
    }
}

impl BitOrAssign for Policies {
    fn bitor_assign(&mut self, rhs: Policies) {
        self.0 |= rhs.0;
    }
}
