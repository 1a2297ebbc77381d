use regex::Regex;
use std::env;
use std::sync::OnceLock;

use crate::ConfigError;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid placeholder regex")
    })
}

/// Interpolate environment variables in a string.
///
/// `${VAR}` is replaced with the value of `VAR`; `${VAR:-fallback}` uses
/// `fallback` when `VAR` is unset. Every unresolved variable is reported.
pub fn interpolate_env(input: &str) -> Result<String, ConfigError> {
    let mut missing = Vec::new();

    let result = placeholder().replace_all(input, |cap: &regex::Captures<'_>| {
        let var_name = &cap[1];
        match (env::var(var_name), cap.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(fallback)) => fallback.as_str().to_string(),
            (Err(_), None) => {
                if !missing.iter().any(|m: &String| m == var_name) {
                    missing.push(var_name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::MissingEnvVars(missing));
    }

    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env() {
        env::set_var("XP_TEST_HOST", "sim-vm-1");
        env::set_var("XP_TEST_PORT", "8080");

        let input = "endpoint: http://${XP_TEST_HOST}:${XP_TEST_PORT}";
        let result = interpolate_env(input).unwrap();
        assert_eq!(result, "endpoint: http://sim-vm-1:8080");
    }

    #[test]
    fn test_interpolate_env_missing() {
        let input = "path: ${XP_MISSING_12345}";
        match interpolate_env(input) {
            Err(ConfigError::MissingEnvVars(vars)) => {
                assert_eq!(vars, vec!["XP_MISSING_12345"]);
            }
            other => panic!("Expected MissingEnvVars error, got {:?}", other),
        }
    }

    #[test]
    fn test_interpolate_env_default_used_when_unset() {
        let input = "hostname: ${XP_UNSET_HOST_12345:-worker-1}";
        assert_eq!(interpolate_env(input).unwrap(), "hostname: worker-1");
    }

    #[test]
    fn test_interpolate_env_default_ignored_when_set() {
        env::set_var("XP_TEST_SET_HOST", "vm-7");
        let input = "${XP_TEST_SET_HOST:-worker-1}";
        assert_eq!(interpolate_env(input).unwrap(), "vm-7");
    }

    #[test]
    fn test_interpolate_env_empty_default() {
        let input = "[${XP_UNSET_EMPTY_12345:-}]";
        assert_eq!(interpolate_env(input).unwrap(), "[]");
    }

    #[test]
    fn test_interpolate_env_repeated_missing_reported_once() {
        let input = "${XP_MISSING_A_12345} ${XP_MISSING_A_12345} ${XP_MISSING_B_12345}";
        match interpolate_env(input) {
            Err(ConfigError::MissingEnvVars(vars)) => {
                assert_eq!(vars, vec!["XP_MISSING_A_12345", "XP_MISSING_B_12345"]);
            }
            other => panic!("Expected MissingEnvVars error, got {:?}", other),
        }
    }

    #[test]
    fn test_interpolate_env_partial_syntax_not_matched() {
        let input = "not a $VAR or ${VAR variable";
        assert_eq!(interpolate_env(input).unwrap(), input);
    }
}
