//! Shared infrastructure types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Which layout module a runner drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    BaseInfrastructure,
    MasterNode,
    StaticNode,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::BaseInfrastructure => "base-infrastructure",
            Step::MasterNode => "master-node",
            Step::StaticNode => "static-node",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Step {
    type Err = rigger_core::RiggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base-infrastructure" => Ok(Step::BaseInfrastructure),
            "master-node" => Ok(Step::MasterNode),
            "static-node" => Ok(Step::StaticNode),
            other => Err(rigger_core::RiggerError::validation(
                "step",
                format!("unknown step {:?}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOpts {
    pub state_path: PathBuf,
    /// When set, the saved plan is applied and variables are not passed
    pub plan_path: Option<PathBuf>,
    pub variables_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct PlanOpts {
    pub destroy: bool,
    pub state_path: PathBuf,
    pub variables_path: PathBuf,
    pub out_path: Option<PathBuf>,
    pub detailed_exit_code: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DestroyOpts {
    pub state_path: PathBuf,
    pub variables_path: PathBuf,
}
