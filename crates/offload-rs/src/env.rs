use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

pub const HW_APP_DIR_VAR: &str = "OFFLOAD_HW_APP_DIR";
pub const MAKE_VAR: &str = "OFFLOAD_MAKE";
pub const PROFILE_VAR: &str = "OFFLOAD_PROFILE";

static OFFLOAD_PROFILE: OnceLock<Option<bool>> = OnceLock::new();

pub fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Directory holding the hardware Makefile, if overridden.
pub fn hw_app_dir() -> Option<PathBuf> {
    non_empty(HW_APP_DIR_VAR).map(PathBuf::from)
}

/// Build tool used by [`MakeRunner`](crate::hardware::MakeRunner).
pub fn make_program() -> String {
    non_empty(MAKE_VAR).unwrap_or_else(|| "make".to_string())
}

/// Explicit cycle profiling choice for the process, `None` when unset. Read once.
pub fn profile_override() -> Option<bool> {
    *OFFLOAD_PROFILE.get_or_init(|| non_empty(PROFILE_VAR).map(|value| parse_bool(&value)))
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "", "2"] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}
