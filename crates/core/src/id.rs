//! Strongly-typed identifiers used across the engine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Identity of a job record. Globally unique, assigned at enqueue time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

/// Proof that the holder currently owns a job record's lock.
///
/// A fresh token is minted for every successful claim, so a stale lease from an
/// earlier claim of the same record can never release a newer one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

/// Identity of the process holding leases (the record's lock-owner marker).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Mint a new identifier.
            ///
            /// Uses UUIDv7 so identifiers sort by creation time.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| ConfigError::invalid_value($name, format!("{s}: {e}")))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(JobId, "JobId");
impl_uuid_newtype!(LeaseToken, "LeaseToken");
impl_uuid_newtype!(ProcessId, "ProcessId");
