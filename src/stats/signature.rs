//! Request signature: the five parameters that identify a FizzBuzz request
//! shape, and its canonical string form.

use serde::{Deserialize, Serialize};

use crate::error::StatsError;

/// Five-tuple identifying a distinct `/fizzbuzz` request.
///
/// Equal field values mean the same key regardless of how the values were
/// obtained. Fields are private so a signature cannot change after it has been
/// used as a key.
///
/// Field declaration order is load-bearing: it fixes the order of the
/// canonical JSON form shared by every backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Signature {
    int1: u64,
    int2: u64,
    limit: u64,
    str1: String,
    str2: String,
}

impl Signature {
    pub fn new(
        int1: u64,
        int2: u64,
        limit: u64,
        str1: impl Into<String>,
        str2: impl Into<String>,
    ) -> Self {
        Self {
            int1,
            int2,
            limit,
            str1: str1.into(),
            str2: str2.into(),
        }
    }

    pub fn int1(&self) -> u64 {
        self.int1
    }

    pub fn int2(&self) -> u64 {
        self.int2
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn str1(&self) -> &str {
        &self.str1
    }

    pub fn str2(&self) -> &str {
        &self.str2
    }

    /// Canonical serialization used as the sorted-set member and as the
    /// tie-break ordering key.
    ///
    /// Compact JSON, fields in declaration order, strings JSON-escaped, e.g.
    /// `{"int1":3,"int2":5,"limit":16,"str1":"fizz","str2":"buzz"}`.
    pub fn canonical(&self) -> Result<String, StatsError> {
        serde_json::to_string(self).map_err(|e| StatsError::Encode(e.to_string()))
    }

    /// Decode a member previously produced by [`canonical`](Self::canonical).
    pub fn from_canonical(member: &str) -> Result<Self, StatsError> {
        serde_json::from_str(member).map_err(|e| StatsError::CorruptMember {
            member: member.to_string(),
            detail: e.to_string(),
        })
    }
}
