use serde::{Serialize, Serializer};
use uuid::Uuid;

/// A basic-auth password issued to an instance.
///
/// Serializes to the plain secret so it can be returned to the caller once,
/// but `Debug` is redacted so it never ends up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Generate a fresh password: a random v4 UUID (122 bits from the OS RNG).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}
