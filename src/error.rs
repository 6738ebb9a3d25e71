use std::fmt;

/// Errors that can occur when constructing engine-owned objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  /// A transaction was requested with a mode carrying neither the READ nor
  /// the WRITE bit. Such a transaction could never be admitted as anything
  /// but a reader by accident, so it is rejected up front.
  InvalidTransactionMode,
}

impl fmt::Display for BuildError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildError::InvalidTransactionMode => {
        write!(f, "transaction mode must include READ or WRITE")
      }
    }
  }
}

impl std::error::Error for BuildError {}
