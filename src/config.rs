//! Caller-tunable limits threaded through [`crate::archive::Archive::open`].

/// What to do when a decompressed entry's CRC-32 doesn't match its declared
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrcPolicy {
    /// Report [`crate::error::Error::BadCrc`] after extraction; the caller
    /// still has the bytes already written to its buffer. This is the
    /// default, resolving the specification's "warn or abort?" open
    /// question in favor of strictness.
    #[default]
    Strict,
    /// Log the mismatch via `tracing::warn!` and return success, matching
    /// the reference implementation's original behavior.
    WarnOnly,
}

/// Options controlling how an archive is opened and decoded.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Maximum number of RAR-VM instructions a single filter execution may
    /// run before failing with `BadVmProgram`. May only be lowered from the
    /// reference default, never raised, since the default is itself already
    /// generous enough to terminate any legitimate filter.
    pub vm_instruction_budget: u64,
    /// How CRC-32 mismatches are reported.
    pub crc_policy: CrcPolicy,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            vm_instruction_budget: crate::rarvm::program::DEFAULT_INSTRUCTION_BUDGET,
            crc_policy: CrcPolicy::default(),
        }
    }
}

impl OpenOptions {
    /// Start building options from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower the VM instruction budget. Panics if `budget` exceeds the
    /// reference default, since raising it would allow filters to run
    /// indefinitely longer than any known-legitimate program needs.
    pub fn vm_instruction_budget(mut self, budget: u64) -> Self {
        assert!(
            budget <= crate::rarvm::program::DEFAULT_INSTRUCTION_BUDGET,
            "vm_instruction_budget may only be lowered"
        );
        self.vm_instruction_budget = budget;
        self
    }

    /// Set the CRC mismatch policy.
    pub fn crc_policy(mut self, policy: CrcPolicy) -> Self {
        self.crc_policy = policy;
        self
    }
}
