use std::env;
use std::sync::OnceLock;

use crate::backend::spec::ExecutionPreference;

static BNORM_EXECUTION_PREFERENCE: OnceLock<ExecutionPreference> = OnceLock::new();
static BNORM_ALLOW_HALF_PRECISION: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_preference(value: &str) -> Option<ExecutionPreference> {
    match value.trim().to_ascii_lowercase().as_str() {
        "performance" | "favor_performance" | "fast" => Some(ExecutionPreference::FavorPerformance),
        "memory" | "conserve_memory" | "low_memory" => Some(ExecutionPreference::ConserveMemory),
        _ => None,
    }
}

pub(crate) fn execution_preference() -> ExecutionPreference {
    *BNORM_EXECUTION_PREFERENCE.get_or_init(|| match env::var("BNORM_EXECUTION_PREFERENCE") {
        Ok(value) if !value.trim().is_empty() => parse_preference(&value).unwrap_or_else(|| {
            tracing::warn!(
                value = %value,
                "ignoring unrecognised BNORM_EXECUTION_PREFERENCE"
            );
            ExecutionPreference::default()
        }),
        _ => ExecutionPreference::default(),
    })
}

pub(crate) fn allow_half_precision() -> bool {
    *BNORM_ALLOW_HALF_PRECISION.get_or_init(|| match env::var("BNORM_ALLOW_HALF_PRECISION") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_truthy_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value:?} should parse as true");
        }
        for value in ["0", "false", "off", ""] {
            assert!(!parse_bool(value), "{value:?} should parse as false");
        }
    }

    #[test]
    fn parse_preference_maps_aliases() {
        assert_eq!(
            parse_preference("Memory"),
            Some(ExecutionPreference::ConserveMemory)
        );
        assert_eq!(
            parse_preference("favor_performance"),
            Some(ExecutionPreference::FavorPerformance)
        );
        assert_eq!(parse_preference("turbo"), None);
    }
}
