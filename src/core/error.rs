// Copyright 2025 Stoolap Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types for the execution engine
//!
//! Every layer below the execution driver reports failures through [`Error`].
//! Retry decisions are not errors: they travel as
//! [`RetryReason`](crate::executor::RetryReason) values and are resolved by the
//! driver before anything reaches the caller.

use std::fmt;

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the execution engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Plan shape errors
    // =========================================================================
    /// The query plan has a shape the engine does not execute
    #[error("{0}")]
    QueryNotSupported(String),

    /// A node id referenced by the plan does not exist
    #[error("relational algebra node {0} not found")]
    NodeNotFound(u32),

    /// A node was given the wrong number of inputs
    #[error("node {node} ({kind}) expects {expected} input(s), got {got}")]
    InputCountMismatch {
        node: u32,
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    /// Target expression count disagrees with the node's declared output arity
    #[error("node {node} declares {expected} output column(s), work unit has {got}")]
    TargetArityMismatch { node: u32, expected: usize, got: usize },

    // =========================================================================
    // Temporary table errors
    // =========================================================================
    /// A step result was registered twice under the same key
    #[error("temporary table {0} already registered")]
    TemporaryTableExists(i32),

    /// A step referenced a temporary table that was never produced
    #[error("temporary table {0} not found")]
    TemporaryTableNotFound(i32),

    // =========================================================================
    // Execution errors
    // =========================================================================
    /// The compiled engine reported a non-recoverable error code
    #[error("{message}")]
    QueryExecution { code: i32, message: String },

    /// GPU memory was exhausted and CPU retry is not allowed
    #[error("Query ran out of GPU memory, unable to automatically retry on CPU")]
    OutOfGpuMemory,

    /// Output buffer growth gave up
    #[error("Query ran out of output slots in the result")]
    OutOfOutputSlots,

    /// Retry was requested on a path that cannot honour it
    #[error("{0}")]
    RetryNotAllowed(String),

    /// Speculative top-N could not prove its result exact
    #[error("speculative top-n failed: {0}")]
    SpeculativeTopNFailed(String),

    /// The watchdog refused an operation that would be too slow
    #[error("{0}")]
    Watchdog(String),

    /// The query was interrupted by its owner
    #[error("Query execution has been interrupted")]
    Interrupted,

    /// The query exceeded its time limit
    #[error("Query execution has exceeded the time limit")]
    Timeout,

    // =========================================================================
    // Result set errors
    // =========================================================================
    /// Sorting refused for a result set of this size
    #[error("{0}")]
    RowSort(String),

    /// Two result sets with different layouts cannot be combined
    #[error("result set layout mismatch: {0}")]
    LayoutMismatch(String),

    /// Zero-copy columnar access is not possible for this column
    #[error("zero-copy columnar conversion not possible for column {0}")]
    ColumnarConversionNotPossible(usize),

    /// Column index out of bounds
    #[error("column index {index} out of bounds")]
    ColumnIndexOutOfBounds { index: usize },

    // =========================================================================
    // Other errors
    // =========================================================================
    /// Invalid argument for an operation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Type error in an expression
    #[error("type error: {0}")]
    Type(String),

    /// Internal error for unexpected conditions
    #[error("{message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new QueryNotSupported error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::QueryNotSupported(message.into())
    }

    /// Create a new QueryExecution error from an engine error code
    pub fn query_execution(code: i32) -> Self {
        Error::QueryExecution {
            code,
            message: error_message_from_code(code),
        }
    }

    /// Create a new Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Create a new InvalidArgument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Create a new Type error
    pub fn type_error(message: impl Into<String>) -> Self {
        Error::Type(message.into())
    }

    /// Check if this is an unsupported-query error
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::QueryNotSupported(_))
    }

    /// Check if this error reports exhausted memory or output slots
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            Error::OutOfGpuMemory | Error::OutOfOutputSlots => true,
            Error::QueryExecution { code, .. } => {
                *code < 0
                    || *code == ErrorCode::OutOfGpuMem.code()
                    || *code == ErrorCode::OutOfCpuMem.code()
            }
            _ => false,
        }
    }

    /// Check if this error was raised by an interrupt or time limit
    pub fn is_interrupt(&self) -> bool {
        match self {
            Error::Interrupted | Error::Timeout => true,
            Error::QueryExecution { code, .. } => {
                *code == ErrorCode::Interrupted.code() || *code == ErrorCode::OutOfTime.code()
            }
            _ => false,
        }
    }
}

/// Numeric error codes reported by the compiled execution engine
///
/// Negative codes are not listed here: any negative code means the output
/// buffer ran out of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    DivByZero = 1,
    OutOfGpuMem = 2,
    OutOfSlots = 3,
    UnsupportedSelfJoin = 4,
    OutOfCpuMem = 6,
    OverflowOrUnderflow = 7,
    OutOfTime = 9,
    Interrupted = 10,
    ColumnarConversionNotSupported = 11,
    TooManyLiterals = 12,
    StringConstInResultSet = 13,
    SingleValueFoundMultipleValues = 15,
    WidthBucketInvalidArgument = 17,
}

impl ErrorCode {
    /// All codes with a registered description
    pub const ALL: [ErrorCode; 13] = [
        ErrorCode::DivByZero,
        ErrorCode::OutOfGpuMem,
        ErrorCode::OutOfSlots,
        ErrorCode::UnsupportedSelfJoin,
        ErrorCode::OutOfCpuMem,
        ErrorCode::OverflowOrUnderflow,
        ErrorCode::OutOfTime,
        ErrorCode::Interrupted,
        ErrorCode::ColumnarConversionNotSupported,
        ErrorCode::TooManyLiterals,
        ErrorCode::StringConstInResultSet,
        ErrorCode::SingleValueFoundMultipleValues,
        ErrorCode::WidthBucketInvalidArgument,
    ];

    /// The raw integer code
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a known code
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Symbolic name, as shown in user-facing messages
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::DivByZero => "ERR_DIV_BY_ZERO",
            ErrorCode::OutOfGpuMem => "ERR_OUT_OF_GPU_MEM",
            ErrorCode::OutOfSlots => "ERR_OUT_OF_SLOTS",
            ErrorCode::UnsupportedSelfJoin => "ERR_UNSUPPORTED_SELF_JOIN",
            ErrorCode::OutOfCpuMem => "ERR_OUT_OF_CPU_MEM",
            ErrorCode::OverflowOrUnderflow => "ERR_OVERFLOW_OR_UNDERFLOW",
            ErrorCode::OutOfTime => "ERR_OUT_OF_TIME",
            ErrorCode::Interrupted => "ERR_INTERRUPTED",
            ErrorCode::ColumnarConversionNotSupported => "ERR_COLUMNAR_CONVERSION_NOT_SUPPORTED",
            ErrorCode::TooManyLiterals => "ERR_TOO_MANY_LITERALS",
            ErrorCode::StringConstInResultSet => "ERR_STRING_CONST_IN_RESULTSET",
            ErrorCode::SingleValueFoundMultipleValues => "ERR_SINGLE_VALUE_FOUND_MULTIPLE_VALUES",
            ErrorCode::WidthBucketInvalidArgument => "ERR_WIDTH_BUCKET_INVALID_ARGUMENT",
        }
    }

    /// Human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::DivByZero => "Division by zero",
            ErrorCode::OutOfGpuMem => {
                "Query couldn't keep the entire working set of columns in GPU memory"
            }
            ErrorCode::OutOfSlots => "Ran out of slots in the query output buffer",
            ErrorCode::UnsupportedSelfJoin => "Self joins not supported yet",
            ErrorCode::OutOfCpuMem => "Not enough host memory to execute the query",
            ErrorCode::OverflowOrUnderflow => "Overflow or underflow",
            ErrorCode::OutOfTime => "Query execution has exceeded the time limit",
            ErrorCode::Interrupted => "Query execution has been interrupted",
            ErrorCode::ColumnarConversionNotSupported => {
                "Columnar conversion not supported for variable length types"
            }
            ErrorCode::TooManyLiterals => "Too many literals in the query",
            ErrorCode::StringConstInResultSet => {
                "NONE ENCODED String types are not supported as input result set."
            }
            ErrorCode::SingleValueFoundMultipleValues => "Multiple distinct values encountered",
            ErrorCode::WidthBucketInvalidArgument => {
                "Arguments of WIDTH_BUCKET function does not satisfy the condition"
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.description())
    }
}

/// Render an engine error code as a user-facing message
pub fn error_message_from_code(code: i32) -> String {
    if code < 0 {
        return "Ran out of slots in the query output buffer".to_string();
    }
    match ErrorCode::from_code(code) {
        Some(known) => known.to_string(),
        None => format!("Other error: code {}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::unsupported("Standalone sort not supported yet").to_string(),
            "Standalone sort not supported yet"
        );
        assert_eq!(
            Error::NodeNotFound(7).to_string(),
            "relational algebra node 7 not found"
        );
        assert_eq!(
            Error::OutOfGpuMemory.to_string(),
            "Query ran out of GPU memory, unable to automatically retry on CPU"
        );
        assert_eq!(
            Error::TemporaryTableExists(-3).to_string(),
            "temporary table -3 already registered"
        );
    }

    #[test]
    fn test_error_code_messages() {
        assert_eq!(error_message_from_code(1), "ERR_DIV_BY_ZERO: Division by zero");
        assert_eq!(
            error_message_from_code(10),
            "ERR_INTERRUPTED: Query execution has been interrupted"
        );
        assert_eq!(
            error_message_from_code(-1),
            "Ran out of slots in the query output buffer"
        );
        assert_eq!(error_message_from_code(99), "Other error: code 99");
        // 5 and 8 are not registered
        assert_eq!(error_message_from_code(5), "Other error: code 5");
    }

    #[test]
    fn test_error_code_round_trip() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(0), None);
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::unsupported("x").is_unsupported());
        assert!(Error::OutOfOutputSlots.is_resource_exhaustion());
        assert!(Error::query_execution(-4).is_resource_exhaustion());
        assert!(Error::query_execution(ErrorCode::OutOfCpuMem.code()).is_resource_exhaustion());
        assert!(!Error::query_execution(ErrorCode::DivByZero.code()).is_resource_exhaustion());
        assert!(Error::Interrupted.is_interrupt());
        assert!(Error::query_execution(ErrorCode::OutOfTime.code()).is_interrupt());
        assert!(!Error::internal("boom").is_interrupt());
    }

    #[test]
    fn test_query_execution_message() {
        let err = Error::query_execution(ErrorCode::OverflowOrUnderflow.code());
        assert_eq!(err.to_string(), "ERR_OVERFLOW_OR_UNDERFLOW: Overflow or underflow");
    }
}
