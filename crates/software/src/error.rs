//! Failures which end a calibration session.

/// Fatal conditions detected while measuring the attached VCO. Either one moves the session into its terminal error
/// stage; only a restart recovers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationError {
    /// No edge arrived from the VCO within the signal timeout.
    SignalLost,
    /// The measured note skipped a semitone or went backwards relative to what was already recorded.
    NonMonotonicResponse {
        /// The last note written to (or tracked for) the table.
        previous: u8,
        /// The note which broke the sequence.
        next: u8,
    },
}
