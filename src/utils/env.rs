/// Get environment variable with CLASSWIRE_ prefix, falling back to unprefixed version
///
/// This helper function checks for `CLASSWIRE_{key}` first, then falls back to `{key}`
/// for compatibility with standard environment variable naming.
///
/// # Examples
///
/// ```rust
/// use classwire::utils::get_env_with_prefix;
///
/// // Checks CLASSWIRE_TYPING_EXPIRY_MS first, then TYPING_EXPIRY_MS
/// let expiry = get_env_with_prefix("TYPING_EXPIRY_MS");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("CLASSWIRE_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_with_prefix() {
        // Test with CLASSWIRE_ prefix
        unsafe {
            std::env::set_var("CLASSWIRE_TEST_VAR", "prefixed_value");
        }
        assert_eq!(get_env_with_prefix("TEST_VAR"), Some("prefixed_value".to_string()));
        unsafe {
            std::env::remove_var("CLASSWIRE_TEST_VAR");
        }

        // Test with unprefixed fallback
        unsafe {
            std::env::set_var("FALLBACK_VAR", "unprefixed_value");
        }
        assert_eq!(get_env_with_prefix("FALLBACK_VAR"), Some("unprefixed_value".to_string()));
        unsafe {
            std::env::remove_var("FALLBACK_VAR");
        }

        // Test non-existent variable
        assert_eq!(get_env_with_prefix("NON_EXISTENT_VAR"), None);
    }
}
