use anyhow::Context;
use rigger_core::config::RiggerConfig;
use rigger_core::k8s::{ClusterClient, KubeClient};
use rigger_core::shutdown;
use rigger_infra::check::engine::step_for_node_group;
use rigger_infra::check::{check_state, CheckOptions};
use rigger_infra::context::{DestroyBaseInfraRunnerOptions, DestroyNodeRunnerOptions};
use rigger_infra::meta::MASTER_NODE_GROUP;
use rigger_infra::pipeline::destroy_pipeline;
use rigger_infra::runner::cache::{FileStateCache, StateCache};
use rigger_infra::runner::confirm::{Confirm, DialoguerConfirm, StaticConfirm};
use rigger_infra::runner::LockDirs;
use rigger_infra::{CliBackendFactory, InfrastructureContext, MetaConfig};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn context(config: &RiggerConfig, confirm: Arc<dyn Confirm>) -> InfrastructureContext {
    let infra = &config.infrastructure;
    InfrastructureContext::new(
        Arc::new(CliBackendFactory::new(infra.clone())),
        confirm,
        shutdown::global(),
    )
    .with_lock_dirs(LockDirs {
        dhctl_dir: infra.data_dir(),
        modules_dir: infra.modules_dir(),
    })
    .with_use_state_cache(infra.use_state_cache)
}

fn state_cache(config: &RiggerConfig, meta: &MetaConfig) -> anyhow::Result<Arc<dyn StateCache>> {
    let dir = config.infrastructure.cache_dir.join(&meta.cluster_prefix);
    let cache = FileStateCache::new(&dir)
        .with_context(|| format!("cannot open state cache {}", dir.display()))?;
    Ok(Arc::new(cache))
}

pub async fn check(
    config: &RiggerConfig,
    meta_config: &Path,
    commander: bool,
    format: &str,
) -> anyhow::Result<()> {
    let meta = MetaConfig::from_file(meta_config)?;
    let ctx = context(config, Arc::new(DialoguerConfirm));
    let kube: Arc<dyn KubeClient> = Arc::new(ClusterClient::try_default().await?);

    let opts = CheckOptions {
        commander_mode: commander,
        state_cache: if commander {
            Some(state_cache(config, &meta)?)
        } else {
            None
        },
        no_output: false,
    };

    let statistics = check_state(kube, &meta, &ctx, &opts).await.into_result()?;
    let rendered = statistics.format(format)?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&rendered)?;
    stdout.write_all(b"\n")?;
    Ok(())
}

/// Nodes go first, highest index first, then the base infrastructure.
pub async fn destroy(config: &RiggerConfig, meta_config: &Path, yes: bool) -> anyhow::Result<()> {
    let meta = MetaConfig::from_file(meta_config)?;
    let confirm: Arc<dyn Confirm> = if yes {
        Arc::new(StaticConfirm::new(true))
    } else {
        Arc::new(DialoguerConfirm)
    };
    let ctx = context(config, confirm);
    let cache = state_cache(config, &meta)?;

    let mut groups: Vec<(String, usize)> = meta
        .terra_node_groups
        .iter()
        .map(|g| (g.name.clone(), g.replicas))
        .collect();
    groups.push((MASTER_NODE_GROUP.to_string(), meta.master_node_group.replicas));

    for (group, replicas) in groups {
        for index in (0..replicas).rev() {
            let node_name = meta.node_name(&group, index);
            let runner = ctx.destroy_node_runner(
                &meta,
                cache.clone(),
                DestroyNodeRunnerOptions {
                    auto_approve: yes,
                    node_name: node_name.clone(),
                    node_group_name: group.clone(),
                    node_group_step: step_for_node_group(&group),
                    node_index: index,
                },
            )?;
            destroy_pipeline(&runner, &node_name)
                .await
                .with_context(|| format!("cannot destroy node {}", node_name))?;
        }
    }

    let runner = ctx.destroy_base_infra_runner(
        &meta,
        cache,
        DestroyBaseInfraRunnerOptions { auto_approve: yes },
    )?;
    destroy_pipeline(&runner, "Kubernetes cluster").await?;

    info!(prefix = %meta.cluster_prefix, "Infrastructure destroyed");
    Ok(())
}
