//! Tunables for the constants the session engine otherwise fixes as
//! defaults. A host application overrides these per `SessionBuilder`/
//! `SessionCipher` pair without forking the crate.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetConfig {
    /// Largest counter gap `fill_message_keys` will cross in one call.
    pub max_message_keys_gap: u32,
    /// Closed sessions kept per record after pruning.
    pub closed_sessions_max: usize,
    /// Per-peer queue job backlog before lazy compaction.
    pub gc_limit: usize,
    /// Protocol version advertised in the version byte.
    pub version: u8,
    /// Verify the signed pre-key signature during the handshake. Disabling
    /// this is a test-only escape hatch — never set `false` in production.
    pub verify_signed_prekey_signature: bool,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        RatchetConfig {
            max_message_keys_gap: 2000,
            closed_sessions_max: 40,
            gc_limit: 10_000,
            version: 3,
            verify_signed_prekey_signature: true,
        }
    }
}
