//! Instance naming: the bijection between a port and its instance id.
//!
//! An id is `{prefix}-{port}`. The same string is the pm2 process name and the
//! basic-auth username of the instance, so both directions of the mapping must
//! agree exactly. [`Naming::parse`] fails closed instead of guessing a port.

use std::fmt;

use serde::{Serialize, Serializer};

/// Lowest port an instance may bind (no privileged ports).
pub const MIN_PORT: u16 = 1024;
/// Highest port an instance may bind.
pub const MAX_PORT: u16 = 65535;

/// Why a string is not a valid instance id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed instance id {id:?}: {reason}")]
pub struct InvalidId {
    pub id: String,
    pub reason: &'static str,
}

/// Identity of one instance. Always constructed through [`Naming`], so the
/// name and port can never disagree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    name: String,
    port: u16,
}

impl InstanceId {
    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

/// Whether `port` may be assigned to an instance.
pub fn port_in_range(port: u16) -> bool {
    (MIN_PORT..=MAX_PORT).contains(&port)
}

/// Maps ports to instance ids and back for one name prefix.
#[derive(Debug, Clone)]
pub struct Naming {
    prefix: String,
}

impl Naming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Id of the instance bound to `port`. The port must already be validated.
    pub fn id_for(&self, port: u16) -> InstanceId {
        debug_assert!(port_in_range(port));
        InstanceId {
            name: format!("{}-{}", self.prefix, port),
            port,
        }
    }

    /// Parse an id back into its port. Rejects anything [`Naming::id_for`]
    /// would not have produced: foreign prefixes, signs, leading zeros,
    /// trailing garbage and out-of-range ports.
    pub fn parse(&self, raw: &str) -> Result<InstanceId, InvalidId> {
        let invalid = |reason| InvalidId {
            id: raw.to_string(),
            reason,
        };

        let digits = raw
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .ok_or_else(|| invalid("unknown prefix"))?;

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("port is not a decimal number"));
        }
        if digits.len() > 1 && digits.starts_with('0') {
            return Err(invalid("port has leading zeros"));
        }

        let port: u16 = digits.parse().map_err(|_| invalid("port out of range"))?;
        if !port_in_range(port) {
            return Err(invalid("port out of range"));
        }

        Ok(self.id_for(port))
    }
}
