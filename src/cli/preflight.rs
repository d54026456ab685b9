//! Pre-flight checks before starting an agent run.
//!
//! Catches missing credentials and malformed endpoints up front instead of
//! failing halfway through a streamed answer.

use crate::config::Settings;
use crate::error::{QuillError, Result};
use url::Url;

/// Commands with requirements to check.
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    /// One question from the command line.
    Ask,
    /// The HTTP server.
    Serve,
}

/// Run pre-flight checks for the given operation.
pub fn check(operation: Operation, settings: &Settings) -> Result<()> {
    match operation {
        Operation::Ask | Operation::Serve => {
            check_api_key()?;
            check_endpoint("retrieval.endpoint", &settings.retrieval.endpoint)?;
            if !settings.workflows.endpoint.is_empty() {
                check_endpoint("workflows.endpoint", &settings.workflows.endpoint)?;
            }
        }
    }
    Ok(())
}

/// Check if OpenAI API key is configured.
fn check_api_key() -> Result<()> {
    match std::env::var("OPENAI_API_KEY") {
        Ok(key) if !key.is_empty() => Ok(()),
        Ok(_) => Err(QuillError::Config(
            "OPENAI_API_KEY is empty. Set it with: export OPENAI_API_KEY='sk-...'".to_string(),
        )),
        Err(_) => Err(QuillError::Config(
            "OPENAI_API_KEY not set. Set it with: export OPENAI_API_KEY='sk-...'".to_string(),
        )),
    }
}

/// Check that an endpoint setting is an absolute http(s) URL.
fn check_endpoint(key: &str, value: &str) -> Result<()> {
    let url = Url::parse(value)
        .map_err(|e| QuillError::Config(format!("{} is not a valid URL ({}): {}", key, value, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(QuillError::Config(format!(
            "{} must use http or https, not {}",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_validation() {
        assert!(check_endpoint("retrieval.endpoint", "http://127.0.0.1:8000").is_ok());
        assert!(check_endpoint("retrieval.endpoint", "https://search.example.edu/api").is_ok());
        assert!(check_endpoint("retrieval.endpoint", "localhost:8000").is_err());
        assert!(check_endpoint("retrieval.endpoint", "ftp://files.example.edu").is_err());
    }
}
