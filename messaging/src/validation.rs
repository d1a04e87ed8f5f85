//! Early request checks performed before any storage mutation. Failures
//! map to the 400 class at the service boundary.
use std::fmt;

pub(crate) const MAX_NAME_LENGTH: usize = 64;
pub(crate) const MAX_MESSAGES_PER_CLAIM: usize = 20;

#[derive(Debug)]
pub(crate) struct ValidationFailed(pub String);

impl fmt::Display for ValidationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Queue and topic names: non-empty, bounded, URL- and key-safe.
pub(crate) fn resource_name(name: &str) -> Result<(), ValidationFailed> {
    if name.is_empty() {
        return Err(ValidationFailed("resource name may not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(ValidationFailed(format!(
            "resource name may not exceed {} characters",
            MAX_NAME_LENGTH
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationFailed(format!(
            "resource name {:?} contains forbidden characters",
            name
        )));
    }
    Ok(())
}

pub(crate) fn claim_limit(limit: usize) -> Result<(), ValidationFailed> {
    if limit == 0 || limit > MAX_MESSAGES_PER_CLAIM {
        return Err(ValidationFailed(format!(
            "claim limit must be between 1 and {}",
            MAX_MESSAGES_PER_CLAIM
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_bounded_and_charset_checked() {
        assert!(resource_name("jobs-2024_a").is_ok());
        assert!(resource_name("").is_err());
        assert!(resource_name(&"x".repeat(65)).is_err());
        assert!(resource_name("bad/name").is_err());
        assert!(resource_name("spaced name").is_err());
    }

    #[test]
    fn claim_limits_are_bounded() {
        assert!(claim_limit(1).is_ok());
        assert!(claim_limit(20).is_ok());
        assert!(claim_limit(0).is_err());
        assert!(claim_limit(21).is_err());
    }
}
