use thiserror::Error;

#[derive(Error, Debug)]
/// Slicer error
pub enum SlicerError {
    #[error("invalid delimiter pattern: {0}")]
    InvalidPattern(String),

    #[error("delimiter pattern can match an empty span")]
    EmptyMatchPattern,

    #[error("delimiter pattern matched an empty span at offset {0}")]
    EmptyMatch(usize),

    #[error("malformed fragment: {0}")]
    MalformedFragment(String),

    #[error("invalid query expression `{expression}`: {message}")]
    InvalidExpression { expression: String, message: String },

    #[error("lookup resource {path}: {message}")]
    LookupResource { path: String, message: String },

    #[error("output write {path}: {message}")]
    OutputWrite { path: String, message: String },

    #[error("source read: {0}")]
    SourceRead(String),
}
