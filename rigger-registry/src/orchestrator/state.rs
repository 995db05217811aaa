//! Registry orchestrator state machine
//!
//! [`State::process`] walks the phases of the transition towards the target
//! mode. Every phase records a condition; the first phase that is not done
//! yet marks the state as not ready and ends the reconcile. The next
//! reconcile starts over from the first phase, finished phases being cheap
//! no-ops, so a restored or partially lost state converges the same way.

use super::bashible::{self, ModeParams, ProxyParams};
use super::incluster_proxy;
use super::inputs::Inputs;
use super::mode::{Mode, RegistryService};
use super::params::UpstreamParams;
use super::pki;
use super::registry_switcher;
use super::secrets;
use super::users::{self, User};
use crate::checker::{self, RegistryParams, Scheme, INITIALIZING_MESSAGE};
use rigger_core::conditions::{Condition, ConditionStatus, Conditions};
use rigger_core::error::{RiggerError, RiggerResult};
use rigger_core::hashing::compute_hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const CONDITION_CONTAINS_REQUIRED_IMAGES: &str = "RegistryContainsRequiredImages";
pub const CONDITION_BASHIBLE_PREFLIGHT_CHECK: &str = "BashiblePreflightCheck";
pub const CONDITION_BASHIBLE_TRANSITION_STAGE: &str = "BashibleTransitionStage";
pub const CONDITION_IN_CLUSTER_PROXY: &str = "InClusterProxy";
pub const CONDITION_DECKHOUSE_REGISTRY_SWITCH: &str = "DeckhouseRegistrySwitch";
pub const CONDITION_BASHIBLE_FINAL_STAGE: &str = "BashibleFinalStage";
pub const CONDITION_IN_CLUSTER_PROXY_CLEANUP: &str = "InClusterProxyCleanup";
pub const CONDITION_READY: &str = "Ready";

pub const REASON_PROCESSING: &str = "Processing";
pub const REASON_READY: &str = "Ready";

const SUPPORTED_CONDITIONS: &[&str] = &[
    CONDITION_CONTAINS_REQUIRED_IMAGES,
    CONDITION_BASHIBLE_PREFLIGHT_CHECK,
    CONDITION_BASHIBLE_TRANSITION_STAGE,
    CONDITION_IN_CLUSTER_PROXY,
    CONDITION_DECKHOUSE_REGISTRY_SWITCH,
    CONDITION_BASHIBLE_FINAL_STAGE,
    CONDITION_IN_CLUSTER_PROXY_CLEANUP,
    CONDITION_READY,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub target_mode: Mode,
    #[serde(default)]
    pub pki: pki::State,
    #[serde(default)]
    pub secrets: secrets::State,
    #[serde(default)]
    pub users: users::State,
    #[serde(default)]
    pub in_cluster_proxy: incluster_proxy::State,
    #[serde(default)]
    pub ingress_enabled: bool,
    #[serde(default)]
    pub registry_service: RegistryService,
    #[serde(default)]
    pub bashible: bashible::State,
    /// Rebuilt on every reconcile
    #[serde(skip)]
    pub registry_secret: registry_switcher::State,
    /// Rebuilt on every reconcile
    #[serde(skip)]
    pub checker_params: checker::Params,
    #[serde(default)]
    pub conditions: Conditions,
}

impl State {
    /// Seed a state that was never persisted from what the cluster already
    /// runs, so the first transition does not reissue the CA or forget the
    /// upstream nodes use.
    pub fn initialize(&mut self, inputs: &Inputs) {
        if self.pki.ca.is_none() {
            self.pki.ca = inputs.pki.ca.clone();
        }

        let params = &inputs.params;
        let upstream = params.upstream();
        let actual = match params.mode {
            Mode::Direct => Some(ModeParams::Direct(upstream.clone())),
            Mode::Unmanaged if params.is_configurable_unmanaged() => {
                Some(ModeParams::Unmanaged(upstream.clone()))
            }
            _ => None,
        };
        if actual.is_some() {
            self.bashible.actual_params = actual;
            self.bashible.unmanaged_params = Some(upstream);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.conditions.is_true(CONDITION_READY)
    }

    /// Run one reconcile towards `inputs.params.mode`.
    pub fn process(&mut self, inputs: &Inputs) -> RiggerResult<()> {
        inputs.params.validate()?;

        if self.target_mode != inputs.params.mode {
            self.target_mode = inputs.params.mode;
            warn!(mode = %self.mode, target_mode = %self.target_mode, "Mode change");
            self.conditions.clear();
        }

        match self.target_mode {
            Mode::Direct => self.transition_to_direct(inputs),
            Mode::Proxy => self.transition_to_proxy(inputs),
            Mode::Unmanaged if inputs.params.is_configurable_unmanaged() => {
                self.transition_to_configurable_unmanaged(inputs)
            }
            Mode::Unmanaged => self.transition_to_unmanaged(inputs),
        }
    }

    fn transition_to_direct(&mut self, inputs: &Inputs) -> RiggerResult<()> {
        self.refuse_from(Mode::Proxy)?;

        let upstream = inputs.params.upstream();
        if !self.process_checker_upstream(&upstream, inputs)? || !self.bashible_preflight_check(inputs) {
            return self.not_ready(inputs);
        }

        let pki = self
            .pki
            .process(&inputs.pki)
            .map_err(|e| RiggerError::context("cannot process PKI", e))?;
        self.secrets.process();

        let proxy_users = if upstream.username.is_empty() {
            Vec::new()
        } else {
            vec![User::new(&upstream.username, &upstream.password)]
        };
        let proxy_params = incluster_proxy::Params {
            ca: pki.ca.clone(),
            token: pki.token,
            http_secret: self.secrets.http.clone(),
            upstream: upstream.clone(),
            ttl: String::new(),
            users: proxy_users,
        };
        let bashible_params = bashible::Params {
            mode_params: ModeParams::Direct(upstream.clone()),
            registry_secret: inputs.registry_secret.clone(),
        };
        let switcher_params = registry_switcher::Params::Managed {
            ca: pki.ca.cert_pem().to_string(),
            username: upstream.username.clone(),
            password: upstream.password.clone(),
        };

        if !self.process_bashible_transition(&bashible_params, inputs)? {
            return self.not_ready(inputs);
        }

        // The previous proxy config keeps serving nodes until they all run
        // the transition config.
        if !self.process_in_cluster_proxy(&proxy_params, inputs)? {
            return self.not_ready(inputs);
        }

        self.registry_service = RegistryService::InClusterProxy;

        if !self.process_registry_switcher(&switcher_params, inputs)?
            || !self.process_bashible_finalize(&bashible_params, inputs)?
        {
            return self.not_ready(inputs);
        }

        self.ingress_enabled = false;
        self.users = users::State::default();

        self.mode = self.target_mode;
        self.bashible.unmanaged_params = Some(upstream);
        self.set_ready_condition(true, inputs);
        Ok(())
    }

    fn transition_to_proxy(&mut self, inputs: &Inputs) -> RiggerResult<()> {
        self.refuse_from(Mode::Direct)?;

        let upstream = inputs.params.upstream();
        if !self.process_checker_upstream(&upstream, inputs)? || !self.bashible_preflight_check(inputs) {
            return self.not_ready(inputs);
        }

        let pki = self
            .pki
            .process(&inputs.pki)
            .map_err(|e| RiggerError::context("cannot process PKI", e))?;
        self.secrets.process();

        let users_params = users::Params {
            ro: true,
            ..self.users.params()
        };
        self.users
            .process(users_params, &inputs.users)
            .map_err(|e| RiggerError::context("cannot process Users", e))?;
        let ro = self
            .users
            .ro
            .clone()
            .ok_or_else(|| RiggerError::internal("read-only user was not created"))?;

        let ca_pem = pki.ca.cert_pem().to_string();
        let proxy_params = incluster_proxy::Params {
            ca: pki.ca.clone(),
            token: pki.token,
            http_secret: self.secrets.http.clone(),
            upstream: upstream.clone(),
            ttl: inputs.params.ttl.clone(),
            users: vec![ro.clone()],
        };
        let bashible_params = bashible::Params {
            mode_params: ModeParams::Proxy(ProxyParams {
                ca: ca_pem.clone(),
                username: ro.user_name.clone(),
                password: ro.password.clone(),
            }),
            registry_secret: inputs.registry_secret.clone(),
        };
        let switcher_params = registry_switcher::Params::Managed {
            ca: ca_pem,
            username: ro.user_name.clone(),
            password: ro.password.clone(),
        };

        // Nodes pull through the proxy, so it has to serve before they switch.
        if !self.process_in_cluster_proxy(&proxy_params, inputs)?
            || !self.process_bashible_transition(&bashible_params, inputs)?
        {
            return self.not_ready(inputs);
        }

        self.registry_service = RegistryService::InClusterProxy;

        if !self.process_registry_switcher(&switcher_params, inputs)?
            || !self.process_bashible_finalize(&bashible_params, inputs)?
        {
            return self.not_ready(inputs);
        }

        self.ingress_enabled = false;
        self.users
            .process(
                users::Params {
                    ro: true,
                    ..Default::default()
                },
                &inputs.users,
            )
            .map_err(|e| RiggerError::context("cannot process Users", e))?;

        self.mode = self.target_mode;
        self.bashible.unmanaged_params = Some(upstream);
        self.set_ready_condition(true, inputs);
        Ok(())
    }

    fn transition_to_configurable_unmanaged(&mut self, inputs: &Inputs) -> RiggerResult<()> {
        let upstream = inputs.params.upstream();
        if !self.process_checker_upstream(&upstream, inputs)? || !self.bashible_preflight_check(inputs) {
            return self.not_ready(inputs);
        }

        let bashible_params = bashible::Params {
            mode_params: ModeParams::Unmanaged(upstream.clone()),
            registry_secret: inputs.registry_secret.clone(),
        };
        let switcher_params = registry_switcher::Params::Unmanaged(upstream.clone());

        if !self.process_bashible_transition(&bashible_params, inputs)?
            || !self.process_registry_switcher(&switcher_params, inputs)?
            || !self.process_bashible_finalize(&bashible_params, inputs)?
        {
            return self.not_ready(inputs);
        }

        let proxy_removed = self.cleanup_in_cluster_proxy(inputs);
        self.registry_service = RegistryService::Disabled;
        self.ingress_enabled = false;
        if !proxy_removed {
            return self.not_ready(inputs);
        }

        self.pki = pki::State::default();
        self.secrets = secrets::State::default();
        self.users = users::State::default();

        self.mode = self.target_mode;
        self.bashible.unmanaged_params = Some(upstream);
        self.set_ready_condition(true, inputs);
        Ok(())
    }

    fn transition_to_unmanaged(&mut self, inputs: &Inputs) -> RiggerResult<()> {
        self.checker_params = checker::Params::default();

        // Point nodes and deckhouse back at the upstream used before the
        // managed mode, then let the bashible config go.
        if let Some(upstream) = self.bashible.unmanaged_params.clone() {
            let bashible_params = bashible::Params {
                mode_params: ModeParams::Unmanaged(upstream.clone()),
                registry_secret: inputs.registry_secret.clone(),
            };
            let switcher_params = registry_switcher::Params::Unmanaged(upstream.clone());

            if !self.process_checker_upstream(&upstream, inputs)?
                || !self.process_bashible_transition(&bashible_params, inputs)?
                || !self.process_registry_switcher(&switcher_params, inputs)?
            {
                return self.not_ready(inputs);
            }

            self.bashible.unmanaged_params = None;
        }

        if !self.process_bashible_unmanaged_finalize(inputs)? {
            return self.not_ready(inputs);
        }

        let proxy_removed = self.cleanup_in_cluster_proxy(inputs);
        self.registry_service = RegistryService::Disabled;
        self.ingress_enabled = false;
        if !proxy_removed {
            return self.not_ready(inputs);
        }

        self.pki = pki::State::default();
        self.secrets = secrets::State::default();
        self.users = users::State::default();

        self.bashible.unmanaged_params = None;
        self.mode = self.target_mode;
        self.set_ready_condition(true, inputs);
        Ok(())
    }

    fn refuse_from(&self, from: Mode) -> RiggerResult<()> {
        if self.mode == from {
            return Err(RiggerError::TransitionNotSupported {
                from: self.mode.to_string(),
                to: self.target_mode.to_string(),
            });
        }
        Ok(())
    }

    fn not_ready(&mut self, inputs: &Inputs) -> RiggerResult<()> {
        self.set_ready_condition(false, inputs);
        Ok(())
    }

    /// Record a phase outcome and pass `ready` through.
    fn set_phase(&mut self, type_: &str, ready: bool, message: &str, inputs: &Inputs) -> bool {
        let condition = if ready {
            Condition::new(type_, ConditionStatus::True, "", "")
        } else {
            Condition::new(type_, ConditionStatus::False, REASON_PROCESSING, message)
        };
        self.conditions
            .set(condition.with_generation(inputs.params.generation));
        ready
    }

    fn set_ready_condition(&mut self, ready: bool, inputs: &Inputs) {
        self.conditions.cleanup_unsupported(SUPPORTED_CONDITIONS);
        let message = format!("Transitioning to {}", self.target_mode);
        self.set_phase(CONDITION_READY, ready, &message, inputs);
    }

    fn process_checker_upstream(&mut self, upstream: &UpstreamParams, inputs: &Inputs) -> RiggerResult<bool> {
        let registry = RegistryParams {
            address: upstream.images_repo.clone(),
            scheme: Scheme::parse_lossy(&upstream.scheme),
            ca: upstream.ca.clone(),
            username: upstream.username.clone(),
            password: upstream.password.clone(),
        };
        let check_mode = inputs.params.check_mode;
        let version = compute_hash(&(&registry, self.target_mode, check_mode))
            .map_err(|e| RiggerError::context("cannot compute checker params hash", e))?;

        let (host, _) = upstream.host_and_path();
        self.checker_params = checker::Params {
            registries: BTreeMap::from([(host, registry)]),
            check_mode,
            version,
        };
        Ok(self.set_checker_condition(inputs))
    }

    fn set_checker_condition(&mut self, inputs: &Inputs) -> bool {
        let status = &inputs.checker_status;
        let condition = if status.version != self.checker_params.version {
            Condition::new(
                CONDITION_CONTAINS_REQUIRED_IMAGES,
                ConditionStatus::False,
                REASON_PROCESSING,
                INITIALIZING_MESSAGE,
            )
        } else if !status.ready {
            Condition::new(
                CONDITION_CONTAINS_REQUIRED_IMAGES,
                ConditionStatus::False,
                REASON_PROCESSING,
                status.message.as_str(),
            )
        } else {
            Condition::new(
                CONDITION_CONTAINS_REQUIRED_IMAGES,
                ConditionStatus::True,
                REASON_READY,
                status.message.as_str(),
            )
        };
        let ready = condition.is_true();
        self.conditions
            .set(condition.with_generation(inputs.params.generation));
        ready
    }

    fn bashible_preflight_check(&mut self, inputs: &Inputs) -> bool {
        let result = bashible::preflight_check(&inputs.bashible);
        self.set_phase(CONDITION_BASHIBLE_PREFLIGHT_CHECK, result.ready, &result.message, inputs)
    }

    fn bashible_phase(
        &mut self,
        type_: &str,
        stage: &str,
        result: RiggerResult<bashible::ProcessResult>,
        inputs: &Inputs,
    ) -> RiggerResult<bool> {
        match result {
            Ok(result) => Ok(self.set_phase(type_, result.ready, &result.message, inputs)),
            Err(e) => {
                let failed = bashible::ProcessResult::failed(stage);
                self.set_phase(type_, false, &failed.message, inputs);
                Err(RiggerError::context("cannot process Bashible", e))
            }
        }
    }

    fn process_bashible_transition(&mut self, params: &bashible::Params, inputs: &Inputs) -> RiggerResult<bool> {
        let result = self.bashible.process_transition(params, &inputs.bashible);
        self.bashible_phase(
            CONDITION_BASHIBLE_TRANSITION_STAGE,
            bashible::STAGE_PROCESS_FIRST,
            result,
            inputs,
        )
    }

    fn process_bashible_finalize(&mut self, params: &bashible::Params, inputs: &Inputs) -> RiggerResult<bool> {
        let result = self.bashible.finalize_transition(params, &inputs.bashible);
        self.bashible_phase(
            CONDITION_BASHIBLE_FINAL_STAGE,
            bashible::STAGE_PROCESS_SECOND,
            result,
            inputs,
        )
    }

    fn process_bashible_unmanaged_finalize(&mut self, inputs: &Inputs) -> RiggerResult<bool> {
        let result = self
            .bashible
            .finalize_unmanaged(&inputs.registry_secret, &inputs.bashible);
        self.bashible_phase(
            CONDITION_BASHIBLE_FINAL_STAGE,
            bashible::STAGE_CLEANUP_FIRST,
            result,
            inputs,
        )
    }

    fn process_in_cluster_proxy(&mut self, params: &incluster_proxy::Params, inputs: &Inputs) -> RiggerResult<bool> {
        let result = self
            .in_cluster_proxy
            .process(params, &inputs.in_cluster_proxy)
            .map_err(|e| RiggerError::context("cannot process in-cluster proxy", e))?;
        Ok(self.set_phase(CONDITION_IN_CLUSTER_PROXY, result.ready, &result.message, inputs))
    }

    fn cleanup_in_cluster_proxy(&mut self, inputs: &Inputs) -> bool {
        let result = self.in_cluster_proxy.stop(&inputs.in_cluster_proxy);
        self.set_phase(CONDITION_IN_CLUSTER_PROXY_CLEANUP, result.ready, &result.message, inputs)
    }

    fn process_registry_switcher(
        &mut self,
        params: &registry_switcher::Params,
        inputs: &Inputs,
    ) -> RiggerResult<bool> {
        let result = self
            .registry_secret
            .process(params, &inputs.registry_switcher)
            .map_err(|e| RiggerError::context("cannot process deckhouse-registry secret", e))?;
        debug!(ready = result.ready, "Registry switcher processed");
        Ok(self.set_phase(CONDITION_DECKHOUSE_REGISTRY_SWITCH, result.ready, &result.message, inputs))
    }
}
