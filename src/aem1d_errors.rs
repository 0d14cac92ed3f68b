use thiserror::Error;

/// Crate-wide error type.
///
/// The variants follow the error taxonomy of the inversion core:
///
/// * **Configuration errors** are fatal – they are surfaced to the caller
///   before any inversion starts (missing required field, illegal enum
///   value, inconsistent earth shapes, inverted min/max bounds).
/// * **Record errors** are recoverable – the offending bunch is skipped
///   with a descriptive reason and processing continues.
/// * **Solver stalls** and **numerical faults** terminate a bunch but the
///   best iterate found so far is still emitted.
#[derive(Error, Debug)]
pub enum Aem1dError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Missing required control field: {0}")]
    MissingField(String),

    #[error("Unknown {kind} value: {value}")]
    UnknownEnumValue { kind: &'static str, value: String },

    #[error("Earth model error: {0}")]
    EarthModelError(String),

    #[error("Unknown geometry element: {0}")]
    UnknownGeometryElement(String),

    #[error("Record error: {0}")]
    RecordError(String),

    #[error("Solver stall: {0}")]
    SolverStall(String),

    #[error("Numerical fault: {0}")]
    NumericalFault(String),

    #[error("Forward model error: {0}")]
    ForwardModelError(String),

    #[error("Control file parse error: {0}")]
    ControlParseError(String),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),
}
