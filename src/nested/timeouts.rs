//! Default timeouts for nested executions.

use crate::config::NestedConfig;

/// Timeout for a child of `type_key`.
///
/// Looks up the type itself, then each ancestor in `chain` (nearest first),
/// then the fallback. `None` means the child's type could not be resolved.
pub fn resolve_timeout(config: &NestedConfig, type_key: Option<&str>, chain: &[String]) -> u64 {
    let Some(key) = type_key else {
        return config.unknown_type_timeout_secs;
    };
    std::iter::once(key)
        .chain(chain.iter().map(String::as_str))
        .find_map(|k| config.timeouts.get(k).copied())
        .unwrap_or(config.fallback_timeout_secs)
}
