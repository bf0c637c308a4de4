//! Identity validation and broker key naming.
//!
//! An identity is the logical address of an end user. The same string names
//! the user's hub room, broker queue and broker channel; a [`Keyspace`]
//! optionally namespaces the broker side so several deployments can share
//! one broker.

/// Maximum identity length in bytes.
pub const MAX_IDENTITY_LENGTH: usize = 256;

/// Validate an identity.
///
/// # Errors
///
/// Returns an error message if the identity is empty, too long, or contains
/// control characters.
pub fn validate_identity(identity: &str) -> Result<(), &'static str> {
    if identity.is_empty() {
        return Err("Identity cannot be empty");
    }
    if identity.len() > MAX_IDENTITY_LENGTH {
        return Err("Identity too long");
    }
    if identity.chars().any(char::is_control) {
        return Err("Identity contains control characters");
    }
    Ok(())
}

/// Maps identities to broker queue keys and channel names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    /// Create a keyspace with the given prefix. An empty prefix uses
    /// identities verbatim.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Broker list key holding the identity's queue.
    #[must_use]
    pub fn queue_key(&self, identity: &str) -> String {
        format!("{}{}", self.prefix, identity)
    }

    /// Broker channel carrying the identity's signals.
    #[must_use]
    pub fn channel(&self, identity: &str) -> String {
        format!("{}{}", self.prefix, identity)
    }

    /// Recover the identity from a channel name, if it belongs to this keyspace.
    #[must_use]
    pub fn identity_of<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel
            .strip_prefix(self.prefix.as_str())
            .filter(|identity| !identity.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_validation() {
        assert!(validate_identity("t100n").is_ok());
        assert!(validate_identity("user@example.com").is_ok());
        assert!(validate_identity("").is_err());
        assert!(validate_identity("bad\nname").is_err());

        let long = "a".repeat(MAX_IDENTITY_LENGTH + 1);
        assert!(validate_identity(&long).is_err());
    }

    #[test]
    fn test_default_keyspace_is_verbatim() {
        let keys = Keyspace::default();
        assert_eq!(keys.queue_key("t100n"), "t100n");
        assert_eq!(keys.channel("t100n"), "t100n");
        assert_eq!(keys.identity_of("t100n"), Some("t100n"));
    }

    #[test]
    fn test_prefixed_keyspace() {
        let keys = Keyspace::new("courier:");
        assert_eq!(keys.channel("t100n"), "courier:t100n");
        assert_eq!(keys.identity_of("courier:t100n"), Some("t100n"));
        assert_eq!(keys.identity_of("other:t100n"), None);
        assert_eq!(keys.identity_of("courier:"), None);
    }
}
