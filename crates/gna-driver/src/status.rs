//! Hardware status decoding.

use gna_chip::status;

/// Successful completion kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Scores are valid.
    Success,
    /// Scores are valid but at least one output saturated.
    Saturated,
}

/// Fatal hardware conditions. Each one leaves the device needing recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareFault {
    /// MMU translation fault
    MmuError,
    /// DMA engine fault
    DmaError,
    /// Completion without an active request
    UnexpectedCompletion,
    /// Virtual address outside the mapped range
    VirtualAddressOutOfRange,
    /// Descriptor parameter outside its legal range
    ParameterOutOfRange,
    /// Wait returned without the completion bit
    Incomplete,
}

/// Raw status word returned by the wait call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareStatus(pub u32);

impl HardwareStatus {
    /// Decode into the closed outcome taxonomy.
    ///
    /// Faults take precedence over saturation; the first fault bit in
    /// register order wins. A word without fault bits must carry
    /// `COMPLETED` to count as a result.
    ///
    /// # Errors
    ///
    /// Returns the [`HardwareFault`] if any fault bit is set or the
    /// completion bit is missing.
    pub const fn outcome(self) -> std::result::Result<Completion, HardwareFault> {
        let bits = self.0;
        if bits & status::MMU_ERROR != 0 {
            Err(HardwareFault::MmuError)
        } else if bits & status::DMA_ERROR != 0 {
            Err(HardwareFault::DmaError)
        } else if bits & status::UNEXPECTED_COMPLETION != 0 {
            Err(HardwareFault::UnexpectedCompletion)
        } else if bits & status::VA_OUT_OF_RANGE != 0 {
            Err(HardwareFault::VirtualAddressOutOfRange)
        } else if bits & status::PARAM_OUT_OF_RANGE != 0 {
            Err(HardwareFault::ParameterOutOfRange)
        } else if bits & status::COMPLETED == 0 {
            Err(HardwareFault::Incomplete)
        } else if bits & status::SATURATION != 0 {
            Ok(Completion::Saturated)
        } else {
            Ok(Completion::Success)
        }
    }

    /// Whether the performance counters accompanying this status are valid.
    #[must_use]
    pub const fn statistics_valid(self) -> bool {
        self.0 & status::STATISTICS_VALID != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturation_is_not_a_fault() {
        let word = HardwareStatus(status::COMPLETED | status::SATURATION);
        assert_eq!(word.outcome(), Ok(Completion::Saturated));
    }

    #[test]
    fn faults_win_over_saturation() {
        let word = HardwareStatus(status::SATURATION | status::DMA_ERROR);
        assert_eq!(word.outcome(), Err(HardwareFault::DmaError));
    }

    #[test]
    fn every_fault_bit_decodes() {
        let cases = [
            (status::MMU_ERROR, HardwareFault::MmuError),
            (status::DMA_ERROR, HardwareFault::DmaError),
            (status::UNEXPECTED_COMPLETION, HardwareFault::UnexpectedCompletion),
            (status::VA_OUT_OF_RANGE, HardwareFault::VirtualAddressOutOfRange),
            (status::PARAM_OUT_OF_RANGE, HardwareFault::ParameterOutOfRange),
        ];
        for (bit, fault) in cases {
            assert_eq!(HardwareStatus(bit).outcome(), Err(fault));
        }
        assert_eq!(HardwareStatus(status::COMPLETED).outcome(), Ok(Completion::Success));
    }

    #[test]
    fn missing_completion_bit_is_a_fault() {
        assert_eq!(HardwareStatus(0).outcome(), Err(HardwareFault::Incomplete));
        assert_eq!(
            HardwareStatus(status::SATURATION | status::STATISTICS_VALID).outcome(),
            Err(HardwareFault::Incomplete)
        );
    }
}
