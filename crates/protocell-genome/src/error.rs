//! Error types for the `protocell-genome` crate.

/// Errors raised while configuring token execution.
///
/// Running out of energy or instruction budget is not an error: the
/// interpreter reports those as a [`HaltReason`](crate::HaltReason).
#[derive(Debug, thiserror::Error)]
pub enum GenomeError {
    /// No instruction table is registered for the requested version.
    #[error("unknown instruction set version {version}")]
    UnknownInstructionSet {
        /// The requested version.
        version: u32,
    },
}
