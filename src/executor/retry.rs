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

//! Retry signalling between the backend and the driver
//!
//! A backend call returns [`Attempt<T>`]. Every variant of [`RetryReason`]
//! except [`RetryReason::Fatal`] may be recovered by the driver; fatal errors
//! propagate to the caller unchanged.

use thiserror::Error;

use crate::core::{error_message_from_code, Error, ErrorCode};

/// Why an attempt did not produce a result
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryReason {
    /// The step cannot run on the GPU
    #[error("Query must run in cpu mode.")]
    QueryMustRunOnCpu,

    /// Native code generation failed
    #[error("native execution failed: {0}")]
    NativeExecutionError(String),

    /// The engine stopped with an error code
    #[error("{}", error_message_from_code(*code))]
    ExecutionError {
        code: i32,
        /// The failed launch processed several fragments per kernel
        was_multifrag_kernel_launch: bool,
    },

    /// The output buffer was too small and the group count must be estimated
    #[error("cardinality estimation required (range {range})")]
    CardinalityEstimationRequired { range: i64 },

    #[error(transparent)]
    Fatal(#[from] Error),
}

/// Outcome of one backend call
pub type Attempt<T> = std::result::Result<T, RetryReason>;

impl RetryReason {
    pub fn execution_error(code: i32) -> Self {
        RetryReason::ExecutionError {
            code,
            was_multifrag_kernel_launch: false,
        }
    }

    /// Negative codes mean the output buffer ran out of slots
    pub fn is_out_of_slots(&self) -> bool {
        matches!(self, RetryReason::ExecutionError { code, .. } if *code < 0)
    }

    pub fn is_out_of_gpu_memory(&self) -> bool {
        matches!(
            self,
            RetryReason::ExecutionError { code, .. } if *code == ErrorCode::OutOfGpuMem.code()
        )
    }

    /// The error surfaced to the caller when the driver gives up
    pub fn into_error(self) -> Error {
        match self {
            RetryReason::QueryMustRunOnCpu => {
                Error::RetryNotAllowed("Query must run in cpu mode.".to_string())
            }
            RetryReason::NativeExecutionError(message) => Error::RetryNotAllowed(message),
            RetryReason::ExecutionError { code, .. } => Error::query_execution(code),
            RetryReason::CardinalityEstimationRequired { .. } => Error::OutOfOutputSlots,
            RetryReason::Fatal(err) => err,
        }
    }
}

impl From<RetryReason> for Error {
    fn from(reason: RetryReason) -> Self {
        reason.into_error()
    }
}
