// bluetrace-config/src/validation.rs
//! Custom validation functions for configuration.
//!
//! Provides shared validation logic used across multiple configuration modules.

use lazy_static::lazy_static;
use regex::Regex;
use validator::ValidationError;

use crate::capture::CommandConfig;
use crate::{INTERFACE_PLACEHOLDER, OUTPUT_PLACEHOLDER};

lazy_static! {
    static ref LOG_LEVEL: Regex =
        Regex::new("^(trace|debug|info|warn|error)$").expect("log level pattern is valid");
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{[a-z_]+\}").expect("placeholder pattern is valid");
}

/// Validate that a command names a program to run.
pub fn validate_program(program: &str) -> Result<(), ValidationError> {
    if program.trim().is_empty() {
        return Err(ValidationError::new("empty_program"));
    }
    if program.chars().any(char::is_whitespace) {
        return Err(ValidationError::new("program_contains_whitespace"));
    }
    Ok(())
}

/// Validate that every `{...}` token in the arguments is a known placeholder.
pub fn validate_placeholders(args: &[String]) -> Result<(), ValidationError> {
    let known = [INTERFACE_PLACEHOLDER, OUTPUT_PLACEHOLDER];
    for arg in args {
        for found in PLACEHOLDER.find_iter(arg) {
            if !known.contains(&found.as_str()) {
                return Err(ValidationError::new("unknown_placeholder"));
            }
        }
    }
    Ok(())
}

/// Validate a command bound to an interface: it must reference `{interface}`.
pub fn validate_interface_scoped(command: &CommandConfig) -> Result<(), ValidationError> {
    if command.mentions(INTERFACE_PLACEHOLDER) {
        Ok(())
    } else {
        Err(ValidationError::new("missing_interface_placeholder"))
    }
}

/// Validate a command that runs for the whole session: it has no interface to substitute.
pub fn validate_session_scoped(command: &CommandConfig) -> Result<(), ValidationError> {
    if command.mentions(INTERFACE_PLACEHOLDER) {
        Err(ValidationError::new("unexpected_interface_placeholder"))
    } else {
        Ok(())
    }
}

/// Validate an interface bring-up command.
pub fn validate_bring_up(command: &CommandConfig) -> Result<(), ValidationError> {
    if command.mentions(OUTPUT_PLACEHOLDER) {
        return Err(ValidationError::new("unexpected_output_placeholder"));
    }
    validate_interface_scoped(command)
}

/// Validate log level.
pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    if LOG_LEVEL.is_match(&level.to_lowercase()) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_placeholders() {
        let args = vec!["-i".to_string(), "{iface}".to_string()];
        assert!(validate_placeholders(&args).is_err());
        let args = vec!["-w".to_string(), "{output}".to_string()];
        assert!(validate_placeholders(&args).is_ok());
    }

    #[test]
    fn program_must_be_a_single_word() {
        assert!(validate_program("hcidump").is_ok());
        assert!(validate_program("  ").is_err());
        assert!(validate_program("hcidump -i").is_err());
    }

    #[test]
    fn log_levels_are_case_insensitive() {
        assert!(validate_log_level("DEBUG").is_ok());
        assert!(validate_log_level("verbose").is_err());
    }
}
