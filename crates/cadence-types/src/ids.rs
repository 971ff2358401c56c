//! Prefixed identifier generation.
//!
//! Identifiers are opaque strings of the form `<prefix>_<uuid-simple>`. The
//! prefix makes log lines and wire payloads readable at a glance; nothing in
//! the workspace parses it.

use uuid::Uuid;

/// Prefix for conversation identifiers. Doubles as the transport room name.
pub const CONVERSATION: &str = "conv";
/// Prefix for message identifiers.
pub const MESSAGE: &str = "msg";
/// Prefix for sentence identifiers.
pub const SENTENCE: &str = "sent";
/// Prefix for tool-use identifiers.
pub const TOOL_USE: &str = "tool";
/// Prefix for memory identifiers.
pub const MEMORY: &str = "mem";
/// Prefix for protocol-level identifiers (errors, traces, transcriptions).
pub const EVENT: &str = "evt";

/// Generates a fresh identifier with the given prefix.
pub fn generate(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix_and_are_unique() {
        let a = generate(MESSAGE);
        let b = generate(MESSAGE);
        assert!(a.starts_with("msg_"));
        assert_ne!(a, b);
        assert_eq!(a.len(), "msg_".len() + 32);
    }
}
