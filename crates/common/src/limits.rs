//! Environment overrides for numeric and boolean limits.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value '{value}' for {name}: {reason}")]
pub struct LimitError {
    pub name: String,
    pub value: String,
    pub reason: String,
}

impl LimitError {
    fn new(name: &str, value: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

pub fn env_u64(name: &str) -> Result<Option<u64>, LimitError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| LimitError::new(name, &raw, e.to_string())),
        Err(_) => Ok(None),
    }
}

pub fn env_bool(name: &str) -> Result<Option<bool>, LimitError> {
    let raw = match std::env::var(name) {
        Ok(raw) => raw,
        Err(_) => return Ok(None),
    };
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "allow" => Ok(Some(true)),
        "0" | "false" | "no" | "off" | "deny" => Ok(Some(false)),
        _ => Err(LimitError::new(name, &raw, "expected allow/deny or true/false")),
    }
}

pub fn clamp(v: u64, min: u64, max: u64) -> u64 {
    if v < min {
        return min;
    }
    if v > max {
        return max;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variables_are_none() {
        assert_eq!(env_u64("EDITGATE_TEST_UNSET_LIMIT").unwrap(), None);
        assert_eq!(env_bool("EDITGATE_TEST_UNSET_FLAG").unwrap(), None);
    }

    #[test]
    fn parses_values_and_reports_bad_ones() {
        std::env::set_var("EDITGATE_TEST_LIMIT_OK", " 7 ");
        assert_eq!(env_u64("EDITGATE_TEST_LIMIT_OK").unwrap(), Some(7));

        std::env::set_var("EDITGATE_TEST_LIMIT_BAD", "soon");
        let err = env_u64("EDITGATE_TEST_LIMIT_BAD").unwrap_err();
        assert_eq!(err.name, "EDITGATE_TEST_LIMIT_BAD");

        std::env::set_var("EDITGATE_TEST_NET", "allow");
        assert_eq!(env_bool("EDITGATE_TEST_NET").unwrap(), Some(true));
        std::env::set_var("EDITGATE_TEST_NET_BAD", "maybe");
        assert!(env_bool("EDITGATE_TEST_NET_BAD").is_err());
    }

    #[test]
    fn clamp_bounds_both_ends() {
        assert_eq!(clamp(0, 1, 10), 1);
        assert_eq!(clamp(50, 1, 10), 10);
        assert_eq!(clamp(5, 1, 10), 5);
    }
}
