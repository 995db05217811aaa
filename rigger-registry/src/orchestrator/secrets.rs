//! Shared secrets of the in-cluster registry services

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const HTTP_SECRET_LENGTH: usize = 25;

/// Random alphanumeric string of `len` characters
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Signing secret of the distribution HTTP endpoint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http: String,
}

impl State {
    /// Generate missing secrets, keep existing ones.
    pub fn process(&mut self) {
        if self.http.is_empty() {
            self.http = random_string(HTTP_SECRET_LENGTH);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_secret_is_generated_once() {
        let mut state = State::default();
        state.process();
        assert_eq!(state.http.len(), HTTP_SECRET_LENGTH);
        assert!(state.http.chars().all(|c| c.is_ascii_alphanumeric()));

        let first = state.http.clone();
        state.process();
        assert_eq!(state.http, first);
    }
}
