//! Cluster check: plans every infrastructure state without applying and
//! reports how far the cloud has drifted from the configuration.

use super::state::{
    cluster_state_from_cluster, nodes_state_for_commander, nodes_state_from_cluster,
    ClusterStateSaver, NodeGroupState, NodeStateSaver, NodesState,
};
use super::statistics::{
    CheckStatus, ClusterCheckResult, NodeCheckResult, NodeGroupCheckResult, Statistics,
};
use crate::context::{
    BaseInfraRunnerOptions, InfrastructureContext, NodeDeleteRunnerOptions, NodeRunnerOptions,
};
use crate::meta::{index_from_node_name, MetaConfig, MASTER_NODE_GROUP};
use crate::pipeline::{check_base_infrastructure_pipeline, check_pipeline, CheckResult};
use crate::plan::PlanClass;
use crate::runner::cache::StateCache;
use crate::state_saver::SaveDestination;
use crate::types::Step;
use rigger_core::error::{RiggerError, RiggerResult};
use rigger_core::k8s::KubeClient;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const CLUSTER_PIPELINE_NAME: &str = "Kubernetes cluster";

#[derive(Clone, Default)]
pub struct CheckOptions {
    pub commander_mode: bool,
    pub state_cache: Option<Arc<dyn StateCache>>,
    /// Skip rendering node plans
    pub no_output: bool,
}

/// Statistics are filled even when some checks failed.
#[derive(Debug, Default)]
pub struct CheckStateResult {
    pub statistics: Statistics,
    pub errors: Vec<RiggerError>,
}

impl CheckStateResult {
    pub fn into_result(self) -> RiggerResult<Statistics> {
        RiggerError::collect("cluster check", self.errors)?;
        Ok(self.statistics)
    }
}

pub fn step_for_node_group(name: &str) -> Step {
    if name == MASTER_NODE_GROUP {
        Step::MasterNode
    } else {
        Step::StaticNode
    }
}

fn status_for(changes: PlanClass) -> CheckStatus {
    match changes {
        PlanClass::NoChanges => CheckStatus::Ok,
        PlanClass::HasChanges => CheckStatus::Changed,
        PlanClass::HasDestructiveChanges => CheckStatus::DestructivelyChanged,
    }
}

struct Checker<'a> {
    kube: Arc<dyn KubeClient>,
    meta: &'a MetaConfig,
    context: &'a InfrastructureContext,
    opts: &'a CheckOptions,
    statistics: Statistics,
    errors: Vec<RiggerError>,
}

#[instrument(skip_all, fields(prefix = %meta.cluster_prefix, commander = opts.commander_mode))]
pub async fn check_state(
    kube: Arc<dyn KubeClient>,
    meta: &MetaConfig,
    context: &InfrastructureContext,
    opts: &CheckOptions,
) -> CheckStateResult {
    let mut checker = Checker {
        kube,
        meta,
        context,
        opts,
        statistics: Statistics::default(),
        errors: Vec::new(),
    };

    checker.check_cluster().await;

    let mut nodes_state = checker.load_nodes_state().await;
    let with_state = checker.check_node_templates(&nodes_state).await;

    for group in sort_node_groups(&nodes_state, &with_state) {
        if let Some(state) = nodes_state.remove(&group) {
            checker.check_node_group(&group, state).await;
        }
    }

    info!(
        cluster = %checker.statistics.cluster.status,
        nodes = checker.statistics.node.len(),
        errors = checker.errors.len(),
        "Cluster check finished"
    );

    CheckStateResult {
        statistics: checker.statistics,
        errors: checker.errors,
    }
}

impl Checker<'_> {
    async fn check_cluster(&mut self) {
        self.statistics.cluster = ClusterCheckResult::default();
        match self.check_cluster_state().await {
            Ok(result) => {
                self.statistics.cluster.status = status_for(result.changes);
                if result.changes == PlanClass::HasDestructiveChanges {
                    self.statistics.cluster.destructive_changes = result.destructive_changes;
                }
                if let Some(plan) = result.plan {
                    self.statistics.infrastructure_plan.push(plan);
                }
            }
            Err(e) => {
                self.statistics.cluster.status = CheckStatus::Error;
                self.errors.push(e);
            }
        }
    }

    async fn check_cluster_state(&self) -> RiggerResult<CheckResult> {
        // The cluster secret holds the state by default. In commander mode it
        // lives in the local cache.
        let mut cluster_state = None;
        let mut destinations: Vec<Arc<dyn SaveDestination>> = Vec::new();

        if self.opts.commander_mode {
            destinations.push(Arc::new(ClusterStateSaver::new(self.kube.clone())));
        } else {
            let state = cluster_state_from_cluster(self.kube.as_ref())
                .await
                .map_err(|e| {
                    RiggerError::context(
                        "infrastructure cluster state in Kubernetes cluster not found",
                        e,
                    )
                })?
                .ok_or_else(|| RiggerError::not_found("kubernetes cluster has no state"))?;
            cluster_state = Some(state);
        }

        let runner = self.context.check_base_infra_runner(
            self.meta,
            BaseInfraRunnerOptions {
                commander_mode: self.opts.commander_mode,
                state_cache: self.opts.state_cache.clone(),
                cluster_state,
                destinations,
                ..Default::default()
            },
        )?;

        check_base_infrastructure_pipeline(&runner, CLUSTER_PIPELINE_NAME).await
    }

    async fn load_nodes_state(&mut self) -> NodesState {
        let loaded = if self.opts.commander_mode {
            match &self.opts.state_cache {
                Some(cache) => nodes_state_for_commander(cache.as_ref(), self.kube.as_ref())
                    .await
                    .map_err(|e| RiggerError::context("unable to load nodes state", e)),
                None => Ok(NodesState::new()),
            }
        } else {
            nodes_state_from_cluster(self.kube.as_ref()).await.map_err(|e| {
                RiggerError::context("infrastructure cluster state in Kubernetes cluster not found", e)
            })
        };

        loaded.unwrap_or_else(|e| {
            self.errors.push(e);
            NodesState::new()
        })
    }

    /// Compare node templates and report nodes of groups without any state.
    /// Returns the declared groups that have state.
    async fn check_node_templates(&mut self, nodes_state: &NodesState) -> Vec<String> {
        // Masters have no node template.
        self.statistics.node_templates.push(NodeGroupCheckResult {
            name: MASTER_NODE_GROUP.to_string(),
            status: CheckStatus::Ok,
        });

        let meta = self.meta;
        let mut with_state = Vec::new();
        for group in &meta.terra_node_groups {
            let status = match self.kube.get_node_group_template(&group.name).await {
                Ok(Some(template)) => {
                    let template: Map<String, Value> = template.into_iter().collect();
                    if Some(&template) == group.node_template.as_ref() {
                        CheckStatus::Ok
                    } else {
                        CheckStatus::Changed
                    }
                }
                Ok(None) => CheckStatus::Absent,
                Err(e) => {
                    self.errors
                        .push(RiggerError::context("node groups in Kubernetes cluster not found", e));
                    CheckStatus::Absent
                }
            };
            self.statistics.node_templates.push(NodeGroupCheckResult {
                name: group.name.clone(),
                status,
            });

            if nodes_state.contains_key(&group.name) {
                with_state.push(group.name.clone());
                continue;
            }

            for index in 0..group.replicas {
                let name = meta.node_name(&group.name, index);
                let result = self.missed_node(&group.name, &name).await;
                self.statistics.node.push(result);
            }
        }
        with_state
    }

    /// A node the configuration expects but no state describes. It must not
    /// exist in the cluster either.
    async fn missed_node(&mut self, group: &str, name: &str) -> NodeCheckResult {
        let status = match self.kube.get_node(name).await {
            Ok(Some(_)) => CheckStatus::Error,
            Ok(None) => CheckStatus::Absent,
            Err(e) => {
                self.errors.push(e);
                CheckStatus::Error
            }
        };
        NodeCheckResult {
            group: group.to_string(),
            name: name.to_string(),
            status,
            destructive_changes: None,
        }
    }

    async fn check_node_group(&mut self, group: &str, mut state: NodeGroupState) {
        let replicas = self.meta.replicas_by_node_group(group);
        let step = step_for_node_group(group);
        debug!(group, replicas, in_state = state.state.len(), "Checking node group");

        if replicas > state.state.len() {
            let insufficient = replicas - state.state.len();
            let missed: Vec<String> = (0..replicas)
                .map(|i| self.meta.node_name(group, i))
                .filter(|name| !state.state.contains_key(name))
                .take(insufficient)
                .collect();
            for name in missed {
                let result = self.missed_node(group, &name).await;
                self.statistics.node.push(result);
            }
        } else if replicas < state.state.len() {
            let mut sorted = match sort_nodes_by_index(&state.state) {
                Ok(sorted) => sorted,
                Err(e) => {
                    self.errors.push(e);
                    return;
                }
            };

            while sorted.len() > replicas {
                let Some(name) = sorted.pop() else {
                    break;
                };
                let mut result = NodeCheckResult {
                    group: group.to_string(),
                    name: name.clone(),
                    status: CheckStatus::Abandoned,
                    destructive_changes: None,
                };

                match self.check_abandoned_node(group, step, &state, &name).await {
                    Ok(checked) => {
                        result.destructive_changes = checked.destructive_changes;
                        if let Some(plan) = checked.plan {
                            self.statistics.infrastructure_plan.push(plan);
                        }
                    }
                    Err(e) => {
                        result.status = CheckStatus::Error;
                        self.errors.push(RiggerError::context(format!("node {}", name), e));
                    }
                }
                self.statistics.node.push(result);
                state.state.remove(&name);
            }
        }

        for name in remaining_in_order(&state.state) {
            let mut result = NodeCheckResult {
                group: group.to_string(),
                name: name.clone(),
                status: CheckStatus::Ok,
                destructive_changes: None,
            };

            match self.check_node(group, step, &state, &name).await {
                Ok(checked) => {
                    result.status = status_for(checked.changes);
                    if checked.changes == PlanClass::HasDestructiveChanges {
                        result.destructive_changes = checked.destructive_changes;
                    }
                    if let Some(plan) = checked.plan {
                        self.statistics.infrastructure_plan.push(plan);
                    }
                }
                Err(e) => {
                    result.status = CheckStatus::Error;
                    self.errors.push(RiggerError::context(format!("node {}", name), e));
                }
            }
            self.statistics.node.push(result);
        }
    }

    fn node_index(name: &str) -> RiggerResult<usize> {
        index_from_node_name(name).map_err(|e| {
            RiggerError::parse(
                "node index",
                format!(
                    "can't extract index from infrastructure state secret ({}), skip {}",
                    e, name
                ),
            )
        })
    }

    fn group_for_saver(group: &str, step: Step) -> String {
        if step == Step::MasterNode {
            MASTER_NODE_GROUP.to_string()
        } else {
            group.to_string()
        }
    }

    /// Plan the destruction of a node above the desired replicas.
    async fn check_abandoned_node(
        &self,
        group: &str,
        step: Step,
        state: &NodeGroupState,
        name: &str,
    ) -> RiggerResult<CheckResult> {
        let index = Self::node_index(name)?;

        let meta = match &state.settings {
            Some(settings) => self.meta.with_single_node_group(settings.clone()),
            None => self.meta.clone(),
        };

        let mut destinations: Vec<Arc<dyn SaveDestination>> = Vec::new();
        if self.opts.commander_mode {
            destinations.push(Arc::new(NodeStateSaver::new(
                self.kube.clone(),
                name,
                Self::group_for_saver(group, step),
                None,
            )));
        }

        let runner = self.context.check_node_delete_runner(
            &meta,
            NodeDeleteRunnerOptions {
                auto_dismiss_destructive: false,
                auto_approve: false,
                node_name: name.to_string(),
                node_group_name: group.to_string(),
                layout_step: step,
                node_index: index,
                node_state: state.state.get(name).cloned(),
                node_cloud_config: String::new(),
                commander_mode: self.opts.commander_mode,
                state_cache: self.opts.state_cache.clone(),
                destinations,
                hook: None,
            },
        )?;

        check_pipeline(&runner, name, true, false).await
    }

    async fn check_node(
        &self,
        group: &str,
        step: Step,
        state: &NodeGroupState,
        name: &str,
    ) -> RiggerResult<CheckResult> {
        let index = Self::node_index(name)?;

        // Group settings are stored for static nodes only.
        let settings = if step == Step::MasterNode {
            None
        } else {
            self.meta.find_terra_node_group(group)
        };

        let mut destinations: Vec<Arc<dyn SaveDestination>> = Vec::new();
        if self.opts.commander_mode {
            destinations.push(Arc::new(NodeStateSaver::new(
                self.kube.clone(),
                name,
                Self::group_for_saver(group, step),
                settings,
            )));
        }

        let runner = self.context.check_node_runner(
            self.meta,
            NodeRunnerOptions {
                auto_dismiss_destructive: false,
                auto_approve: false,
                node_name: name.to_string(),
                node_group_name: group.to_string(),
                node_group_step: step,
                node_index: index,
                node_state: state.state.get(name).cloned(),
                node_cloud_config: String::new(),
                commander_mode: self.opts.commander_mode,
                state_cache: self.opts.state_cache.clone(),
                destinations,
                hook: None,
            },
        )?;

        check_pipeline(&runner, name, false, self.opts.no_output).await
    }
}

/// Master first, then declared groups with state in declaration order, then
/// every other group with state by name.
pub fn sort_node_groups(nodes_state: &NodesState, declared_with_state: &[String]) -> Vec<String> {
    let mut order = Vec::with_capacity(nodes_state.len());
    if nodes_state.contains_key(MASTER_NODE_GROUP) {
        order.push(MASTER_NODE_GROUP.to_string());
    }
    for group in declared_with_state {
        if group != MASTER_NODE_GROUP && !order.contains(group) {
            order.push(group.clone());
        }
    }
    for group in nodes_state.keys() {
        if !order.contains(group) {
            order.push(group.clone());
        }
    }
    order
}

/// Node names ordered by their numeric index.
pub fn sort_nodes_by_index(state: &BTreeMap<String, Vec<u8>>) -> RiggerResult<Vec<String>> {
    let mut indexed = Vec::with_capacity(state.len());
    for name in state.keys() {
        let index = index_from_node_name(name).map_err(|e| {
            RiggerError::parse(
                "node index",
                format!("cannot get index from node name {}: {}", name, e),
            )
        })?;
        indexed.push((index, name.clone()));
    }
    indexed.sort();
    Ok(indexed.into_iter().map(|(_, name)| name).collect())
}

fn remaining_in_order(state: &BTreeMap<String, Vec<u8>>) -> Vec<String> {
    sort_nodes_by_index(state).unwrap_or_else(|e| {
        warn!("{}", e);
        state.keys().cloned().collect()
    })
}
