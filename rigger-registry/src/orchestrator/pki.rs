//! Registry CA and auth-token keypair

use rigger_core::error::RiggerResult;
use rigger_core::pki::{self, CertKey, CertModel};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const CA_COMMON_NAME: &str = "registry-ca";
pub const TOKEN_COMMON_NAME: &str = "registry-auth-token";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<CertModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<CertModel>,
}

/// Keys found in the `registry-pki` secret, used when the state has none
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inputs {
    pub ca: Option<CertModel>,
    pub token: Option<CertModel>,
}

#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub ca: CertKey,
    pub token: CertKey,
}

impl State {
    pub fn is_empty(&self) -> bool {
        self.ca.is_none() && self.token.is_none()
    }

    /// Decode the CA and token, regenerating whatever is missing or invalid.
    /// A token not signed by the current CA is reissued.
    pub fn process(&mut self, inputs: &Inputs) -> RiggerResult<ProcessResult> {
        let ca_model = self.ca.clone().or_else(|| inputs.ca.clone());
        let ca = match ca_model.as_ref().map(CertModel::to_pki) {
            Some(Ok(ca)) => ca,
            Some(Err(e)) => {
                warn!(error = %e, "Registry CA is invalid, generating a new one");
                pki::generate_ca(CA_COMMON_NAME)?
            }
            None => {
                info!("Generating registry CA");
                pki::generate_ca(CA_COMMON_NAME)?
            }
        };

        let token_model = self.token.clone().or_else(|| inputs.token.clone());
        let token = match token_model.as_ref().map(CertModel::to_pki) {
            Some(Ok(token)) => match pki::verify_signature(&token, &ca) {
                Ok(()) => token,
                Err(e) => {
                    warn!(error = %e, "Auth token is not signed by the registry CA, reissuing");
                    pki::generate_cert(&ca, TOKEN_COMMON_NAME, &[])?
                }
            },
            Some(Err(e)) => {
                warn!(error = %e, "Auth token is invalid, reissuing");
                pki::generate_cert(&ca, TOKEN_COMMON_NAME, &[])?
            }
            None => pki::generate_cert(&ca, TOKEN_COMMON_NAME, &[])?,
        };

        self.ca = Some(ca.to_model());
        self.token = Some(token.to_model());
        Ok(ProcessResult { ca, token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_is_stable() {
        let mut state = State::default();
        let first = state.process(&Inputs::default()).unwrap();
        let saved = state.clone();

        let second = state.process(&Inputs::default()).unwrap();
        assert_eq!(first.ca, second.ca);
        assert_eq!(first.token, second.token);
        assert_eq!(state, saved);
    }

    #[test]
    fn test_token_from_foreign_ca_is_reissued() {
        let foreign = pki::generate_ca("other").unwrap();
        let token = pki::generate_cert(&foreign, TOKEN_COMMON_NAME, &[]).unwrap();
        let ca = pki::generate_ca(CA_COMMON_NAME).unwrap();

        let mut state = State {
            ca: Some(ca.to_model()),
            token: Some(token.to_model()),
        };
        let result = state.process(&Inputs::default()).unwrap();

        assert_eq!(result.ca, ca);
        assert_ne!(result.token, token);
        pki::verify_signature(&result.token, &ca).unwrap();
    }

    #[test]
    fn test_inputs_seed_empty_state() {
        let ca = pki::generate_ca(CA_COMMON_NAME).unwrap();
        let inputs = Inputs {
            ca: Some(ca.to_model()),
            token: None,
        };
        let mut state = State::default();
        let result = state.process(&inputs).unwrap();
        assert_eq!(result.ca, ca);
    }
}
