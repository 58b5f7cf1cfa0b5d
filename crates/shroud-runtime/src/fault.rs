//! Per-run fault tally.

use shroud_core::error::Fault;

const FAULT_KINDS: usize = 5;

fn slot(fault: Fault) -> usize {
    match fault {
        Fault::StackUnderflow => 0,
        Fault::StackOverflow => 1,
        Fault::DivisionByZero => 2,
        Fault::ModuloByZero => 3,
        Fault::UnrecognizedOpcode => 4,
    }
}

/// How often each [`Fault`] was absorbed during one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounts {
    counts: [u64; FAULT_KINDS],
}

impl FaultCounts {
    pub fn record(&mut self, fault: Fault) {
        let n = &mut self.counts[slot(fault)];
        *n = n.saturating_add(1);
    }

    pub fn count(&self, fault: Fault) -> u64 {
        self.counts[slot(fault)]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().fold(0u64, |acc, n| acc.saturating_add(*n))
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_total() {
        let mut counts = FaultCounts::default();
        assert!(counts.is_empty());
        counts.record(Fault::StackUnderflow);
        counts.record(Fault::StackUnderflow);
        counts.record(Fault::DivisionByZero);
        assert_eq!(counts.count(Fault::StackUnderflow), 2);
        assert_eq!(counts.count(Fault::ModuloByZero), 0);
        assert_eq!(counts.total(), 3);
    }
}
