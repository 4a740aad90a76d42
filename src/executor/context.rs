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

//! Query context
//!
//! Holds the interrupt flag and the optional deadline of a running query.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{Error, Result};

/// Per-query state shared with whoever may interrupt the query
#[derive(Debug, Clone)]
pub struct QueryContext {
    interrupted: Arc<AtomicBool>,
    timeout_ms: u64,
    deadline: Option<Instant>,
    submitted: Instant,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryContext {
    pub fn new() -> Self {
        Self {
            interrupted: Arc::new(AtomicBool::new(false)),
            timeout_ms: 0,
            deadline: None,
            submitted: Instant::now(),
        }
    }

    /// Context that times out `timeout_ms` after creation; 0 disables it
    pub fn with_timeout_ms(timeout_ms: u64) -> Self {
        let mut ctx = Self::new();
        ctx.set_timeout_ms(timeout_ms);
        ctx
    }

    pub fn set_timeout_ms(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
        self.deadline = if timeout_ms > 0 {
            Some(Instant::now() + Duration::from_millis(timeout_ms))
        } else {
            None
        };
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Handle for interrupting the query from another thread
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            interrupted: Arc::clone(&self.interrupted),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    /// Fail when the query was interrupted or ran past its deadline
    pub fn check_interrupted(&self) -> Result<()> {
        if self.is_interrupted() {
            return Err(Error::Interrupted);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::Timeout),
            _ => Ok(()),
        }
    }

    /// Re-arm the flag and the deadline for a new run
    pub fn reset_interrupt(&mut self) {
        self.interrupted.store(false, Ordering::Relaxed);
        self.set_timeout_ms(self.timeout_ms);
    }

    /// Milliseconds between creation and now
    pub fn queue_time_ms(&self) -> i64 {
        self.submitted.elapsed().as_millis() as i64
    }

    /// Start the queue timer over
    pub fn mark_submitted(&mut self) {
        self.submitted = Instant::now();
    }
}

/// Interrupts a query from another thread
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    interrupted: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }
}
