//! Small environment-variable helpers used by the logging setup.

/// Read a boolean environment variable.
///
/// `1`, `true`, `yes`, and `on` (case-insensitive) count as true;
/// anything else, including an unset variable, yields `default`.
pub fn env_get_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(val) => matches!(
            val.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Read an unsigned integer environment variable, falling back to `default`
/// when unset or unparsable.
pub fn env_get_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_default() {
        assert!(!env_get_bool("TASKPOOL_TEST_UNSET_VAR", false));
        assert!(env_get_bool("TASKPOOL_TEST_UNSET_VAR", true));
    }

    #[test]
    fn test_bool_values() {
        std::env::set_var("TASKPOOL_TEST_BOOL_VAR", "yes");
        assert!(env_get_bool("TASKPOOL_TEST_BOOL_VAR", false));
        std::env::set_var("TASKPOOL_TEST_BOOL_VAR", "0");
        assert!(!env_get_bool("TASKPOOL_TEST_BOOL_VAR", true));
        std::env::remove_var("TASKPOOL_TEST_BOOL_VAR");
    }

    #[test]
    fn test_u32() {
        std::env::set_var("TASKPOOL_TEST_U32_VAR", "42");
        assert_eq!(env_get_u32("TASKPOOL_TEST_U32_VAR", 7), 42);
        std::env::set_var("TASKPOOL_TEST_U32_VAR", "junk");
        assert_eq!(env_get_u32("TASKPOOL_TEST_U32_VAR", 7), 7);
        std::env::remove_var("TASKPOOL_TEST_U32_VAR");
    }
}
