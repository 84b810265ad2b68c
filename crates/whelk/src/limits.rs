//! Execution limits forwarded to the shell engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Sparse set of positive caps enforced inside the engine.
///
/// Only strictly-positive values are forwarded; everything else is omitted so
/// the engine's own defaults apply. The engine expects a flat JSON map of
/// decimal strings (see [`ExecutionLimits::encode_json`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionLimits {
    /// Maximum function/script call depth.
    pub max_call_depth: Option<u64>,
    /// Maximum number of commands executed per script.
    pub max_command_count: Option<u64>,
    /// Maximum loop iterations.
    pub max_loop_iterations: Option<u64>,
    /// Maximum length of a single string value.
    pub max_string_length: Option<u64>,
    /// Maximum number of array elements.
    pub max_array_elements: Option<u64>,
    /// Maximum heredoc size in bytes.
    pub max_heredoc_size: Option<u64>,
    /// Maximum nesting depth of substitutions.
    pub max_substitution_depth: Option<u64>,
    /// Maximum glob expansion operations.
    pub max_glob_operations: Option<u64>,
    /// Maximum awk iterations.
    pub max_awk_iterations: Option<u64>,
    /// Maximum sed iterations.
    pub max_sed_iterations: Option<u64>,
    /// Maximum jq iterations.
    pub max_jq_iterations: Option<u64>,
}

impl ExecutionLimits {
    /// Encode the limits as the engine's wire format: a JSON object mapping
    /// snake_case cap names to decimal strings, with unset or non-positive
    /// caps omitted.
    pub fn encode_json(&self) -> String {
        let mut out: BTreeMap<&str, String> = BTreeMap::new();
        let mut set = |key: &'static str, value: Option<u64>| {
            if let Some(value) = value
                && value > 0
            {
                out.insert(key, value.to_string());
            }
        };
        set("max_call_depth", self.max_call_depth);
        set("max_command_count", self.max_command_count);
        set("max_loop_iterations", self.max_loop_iterations);
        set("max_string_length", self.max_string_length);
        set("max_array_elements", self.max_array_elements);
        set("max_heredoc_size", self.max_heredoc_size);
        set("max_substitution_depth", self.max_substitution_depth);
        set("max_glob_operations", self.max_glob_operations);
        set("max_awk_iterations", self.max_awk_iterations);
        set("max_sed_iterations", self.max_sed_iterations);
        set("max_jq_iterations", self.max_jq_iterations);
        serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
    }
}
