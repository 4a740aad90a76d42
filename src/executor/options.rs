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

//! Per-query compilation and execution options

use crate::core::ExecutorDeviceType;

use super::config::ExecutorConfig;

/// How the backend compiles a work unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilationOptions {
    pub device_type: ExecutorDeviceType,
    pub hoist_literals: bool,
    pub allow_lazy_fetch: bool,
    pub with_dynamic_watchdog: bool,
}

impl CompilationOptions {
    pub fn default_for(device_type: ExecutorDeviceType) -> Self {
        Self {
            device_type,
            hoist_literals: true,
            allow_lazy_fetch: true,
            with_dynamic_watchdog: false,
        }
    }

    /// Same options, pinned to the CPU
    pub fn make_cpu_only(&self) -> Self {
        Self {
            device_type: ExecutorDeviceType::Cpu,
            ..*self
        }
    }
}

impl Default for CompilationOptions {
    fn default() -> Self {
        Self::default_for(ExecutorDeviceType::Gpu)
    }
}

/// Code path used by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorType {
    #[default]
    Native,
    /// Interop path used when native codegen fails
    Extern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExplainType {
    /// Explain the generated code of the first step
    #[default]
    Default,
    /// Render the step list without executing anything
    Plan,
}

/// How the driver runs a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub output_columnar_hint: bool,
    pub allow_multifrag: bool,
    pub just_explain: bool,
    pub explain_type: ExplainType,
    pub with_watchdog: bool,
    /// Compile and validate only, return an empty result
    pub just_validate: bool,
    pub with_dynamic_watchdog: bool,
    pub dynamic_watchdog_time_limit_ms: u64,
    /// Return filter push-down candidates instead of executing
    pub find_push_down_candidates: bool,
    pub executor_type: ExecutorType,
    /// Restrict the outer table to these fragments (first step only)
    pub outer_fragment_indices: Vec<usize>,
    /// Keep per-fragment results unreduced
    pub multifrag_result: bool,
    pub preserve_order: bool,
    pub allow_runtime_query_interrupt: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            output_columnar_hint: false,
            allow_multifrag: true,
            just_explain: false,
            explain_type: ExplainType::Default,
            with_watchdog: false,
            just_validate: false,
            with_dynamic_watchdog: false,
            dynamic_watchdog_time_limit_ms: 0,
            find_push_down_candidates: false,
            executor_type: ExecutorType::Native,
            outer_fragment_indices: Vec::new(),
            multifrag_result: false,
            preserve_order: false,
            allow_runtime_query_interrupt: true,
        }
    }
}

impl ExecutionOptions {
    /// Per-query defaults derived from the executor configuration
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            with_watchdog: config.watchdog_enabled,
            ..Self::default()
        }
    }

    pub fn with_multifrag_result(mut self, multifrag_result: bool) -> Self {
        self.multifrag_result = multifrag_result;
        self
    }

    pub fn with_preserve_order(mut self, preserve_order: bool) -> Self {
        self.preserve_order = preserve_order;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_cpu_only_keeps_other_flags() {
        let co = CompilationOptions {
            hoist_literals: false,
            ..CompilationOptions::default()
        };
        assert_eq!(co.device_type, ExecutorDeviceType::Gpu);
        let cpu = co.make_cpu_only();
        assert_eq!(cpu.device_type, ExecutorDeviceType::Cpu);
        assert!(!cpu.hoist_literals);
    }

    #[test]
    fn test_from_config() {
        let config = ExecutorConfig {
            watchdog_enabled: true,
            ..ExecutorConfig::default()
        };
        let eo = ExecutionOptions::from_config(&config);
        assert!(eo.with_watchdog);
        assert!(eo.allow_multifrag);
        let eo = eo.with_multifrag_result(true).with_preserve_order(true);
        assert!(eo.multifrag_result && eo.preserve_order);
    }
}
