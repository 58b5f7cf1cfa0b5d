//! Builder and interpreter configuration.

use std::ops::RangeInclusive;

use tracing::warn;

use crate::error::VmError;

/// Largest trailing padding a [`BuilderConfig`] may ask for.
pub const MAX_PADDING: usize = 4096;

/// Controls how much noise the [`Builder`](crate::vm::builder::Builder)
/// mixes into a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderConfig {
    /// Chance (percent) that a morphable instruction is replaced by an
    /// equivalent multi-instruction sequence.
    pub morph_percent: u8,
    /// Chance (percent) that a single decoy byte is prepended.
    pub junk_percent: u8,
    /// Chance (percent) that an instruction is wrapped as junk+real+junk.
    pub triple_percent: u8,
    /// Chance (percent), per instruction boundary, that a byte from the
    /// shadow stream is interleaved.
    pub interleave_percent: u8,
    /// Number of random bytes appended after the executable part.
    pub padding: RangeInclusive<usize>,
    /// Store a mask key next to each immediate and XOR the payload with it.
    pub mask_immediates: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            morph_percent: 25,
            junk_percent: 20,
            triple_percent: 15,
            interleave_percent: 6,
            padding: 8..=32,
            mask_immediates: true,
        }
    }
}

impl BuilderConfig {
    /// No morphs, junk, interleave or masking. Padding is still applied.
    pub fn plain() -> Self {
        BuilderConfig {
            morph_percent: 0,
            junk_percent: 0,
            triple_percent: 0,
            interleave_percent: 0,
            mask_immediates: false,
            ..Self::default()
        }
    }

    pub fn with_morph_percent(mut self, percent: u8) -> Self {
        self.morph_percent = percent.min(100);
        self
    }

    pub fn with_junk_percent(mut self, percent: u8) -> Self {
        self.junk_percent = percent.min(100);
        self
    }

    pub fn with_triple_percent(mut self, percent: u8) -> Self {
        self.triple_percent = percent.min(100);
        self
    }

    pub fn with_interleave_percent(mut self, percent: u8) -> Self {
        self.interleave_percent = percent.min(100);
        self
    }

    pub fn with_padding(mut self, padding: RangeInclusive<usize>) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_mask_immediates(mut self, mask: bool) -> Self {
        self.mask_immediates = mask;
        self
    }

    pub fn validate(&self) -> Result<(), VmError> {
        if self.padding.is_empty() || *self.padding.end() > MAX_PADDING {
            return Err(VmError::InvalidConfig(format!(
                "padding {:?} must be a non-empty range within 0..={MAX_PADDING}",
                self.padding
            )));
        }
        Ok(())
    }

    /// `self` when valid, otherwise `self` with the default padding.
    pub fn sanitized(&self) -> BuilderConfig {
        match self.validate() {
            Ok(()) => self.clone(),
            Err(err) => {
                warn!(%err, "falling back to default padding");
                BuilderConfig {
                    padding: BuilderConfig::default().padding,
                    ..self.clone()
                }
            }
        }
    }
}

/// Interpreter limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Base instruction ceiling for one run.
    pub max_instructions: u64,
    /// Random extra instructions added to the ceiling, drawn from
    /// `0..budget_jitter` per run.
    pub budget_jitter: u64,
    /// Real operand stack depth.
    pub stack_capacity: usize,
    /// Decoy stack depth. Must not exceed `stack_capacity`.
    pub decoy_stack_capacity: usize,
    /// Range the per-run analysis probe interval is drawn from.
    pub check_interval: RangeInclusive<u32>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_instructions: 100_000,
            budget_jitter: 4_096,
            stack_capacity: 256,
            decoy_stack_capacity: 192,
            check_interval: 64..=512,
        }
    }
}

impl VmConfig {
    pub fn with_max_instructions(mut self, max: u64) -> Self {
        self.max_instructions = max;
        self
    }

    pub fn with_budget_jitter(mut self, jitter: u64) -> Self {
        self.budget_jitter = jitter;
        self
    }

    /// Sets the real stack depth, shrinking the decoy stack if needed.
    pub fn with_stack_capacity(mut self, capacity: usize) -> Self {
        self.stack_capacity = capacity;
        self.decoy_stack_capacity = self.decoy_stack_capacity.min(capacity);
        self
    }

    pub fn with_decoy_stack_capacity(mut self, capacity: usize) -> Self {
        self.decoy_stack_capacity = capacity;
        self
    }

    pub fn with_check_interval(mut self, interval: RangeInclusive<u32>) -> Self {
        self.check_interval = interval;
        self
    }

    /// Checks the invariants the interpreter relies on.
    pub fn validate(&self) -> Result<(), VmError> {
        if self.max_instructions == 0 {
            return Err(VmError::InvalidConfig("max_instructions must be non-zero".into()));
        }
        if self.stack_capacity == 0 {
            return Err(VmError::InvalidConfig("stack_capacity must be non-zero".into()));
        }
        if self.decoy_stack_capacity > self.stack_capacity {
            return Err(VmError::InvalidConfig(format!(
                "decoy_stack_capacity ({}) exceeds stack_capacity ({})",
                self.decoy_stack_capacity, self.stack_capacity
            )));
        }
        if self.check_interval.is_empty() || *self.check_interval.start() == 0 {
            return Err(VmError::InvalidConfig(format!(
                "check_interval {:?} must be a non-empty range above zero",
                self.check_interval
            )));
        }
        Ok(())
    }

    /// `self` when valid, the defaults otherwise.
    pub fn sanitized(&self) -> VmConfig {
        match self.validate() {
            Ok(()) => self.clone(),
            Err(err) => {
                warn!(%err, "falling back to default VM configuration");
                VmConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_vm_config_is_valid() {
        assert!(VmConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let cfg = VmConfig::default().with_max_instructions(0);
        assert!(matches!(cfg.validate(), Err(VmError::InvalidConfig(_))));
    }

    #[test]
    fn test_decoy_larger_than_real_rejected() {
        let cfg = VmConfig::default().with_decoy_stack_capacity(1024);
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.sanitized(), VmConfig::default());
    }

    #[test]
    fn test_stack_capacity_shrinks_decoy() {
        let cfg = VmConfig::default().with_stack_capacity(16);
        assert_eq!(cfg.decoy_stack_capacity, 16);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_check_interval_rejected() {
        #[allow(clippy::reversed_empty_ranges)]
        let cfg = VmConfig::default().with_check_interval(10..=5);
        assert!(cfg.validate().is_err());
        let cfg = VmConfig::default().with_check_interval(0..=5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_builder_padding_bounds() {
        assert!(BuilderConfig::default().validate().is_ok());
        assert!(BuilderConfig::default().with_padding(0..=0).validate().is_ok());

        let huge = BuilderConfig::plain().with_padding(8..=usize::MAX);
        assert!(matches!(huge.validate(), Err(VmError::InvalidConfig(_))));
        let fixed = huge.sanitized();
        assert_eq!(fixed.padding, 8..=32);
        assert_eq!(fixed.morph_percent, 0);

        #[allow(clippy::reversed_empty_ranges)]
        let reversed = BuilderConfig::default().with_padding(40..=10);
        assert!(reversed.validate().is_err());
    }

    #[test]
    fn test_builder_config_clamps_percent() {
        let cfg = BuilderConfig::default().with_junk_percent(250);
        assert_eq!(cfg.junk_percent, 100);
    }
}
