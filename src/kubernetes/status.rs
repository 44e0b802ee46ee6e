//! Pod observations expressed in docker terms

use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus as PodContainerStatus, Pod};

use super::manifest::MAIN_CONTAINER;

/// Waiting reasons that will not resolve by waiting longer
const FATAL_WAITING_REASONS: &[&str] = &[
    "InvalidImageName",
    "ErrImageNeverPull",
    "CreateContainerConfigError",
];

/// Lifecycle phase of a pod as seen by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Deletion requested, pod still present
    Terminating,
    Unknown,
}

impl PodPhase {
    pub fn of(pod: &Pod) -> Self {
        if pod.metadata.deletion_timestamp.is_some() {
            return PodPhase::Terminating;
        }
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            None | Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            Some(_) => PodPhase::Unknown,
        }
    }

    /// The pod will never run again
    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// Docker's `State.Status` vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Running,
    Exited,
    Removing,
    Dead,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Created => "created",
            RunState::Running => "running",
            RunState::Exited => "exited",
            RunState::Removing => "removing",
            RunState::Dead => "dead",
        }
    }
}

impl From<PodPhase> for RunState {
    fn from(phase: PodPhase) -> Self {
        match phase {
            PodPhase::Pending => RunState::Created,
            PodPhase::Running => RunState::Running,
            PodPhase::Succeeded | PodPhase::Failed => RunState::Exited,
            PodPhase::Terminating => RunState::Removing,
            PodPhase::Unknown => RunState::Dead,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Docker's `State.Health.Status` vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
    Starting,
    None,
}

impl Health {
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Unhealthy => "unhealthy",
            Health::Starting => "starting",
            Health::None => "none",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live status of a container, derived from one observation of its pod
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStatus {
    pub phase: PodPhase,
    pub state: RunState,
    pub health: Health,
    pub exit_code: Option<i32>,
    /// Why the pod is not running, when the cluster says
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ContainerStatus {
    pub fn from_pod(pod: &Pod) -> Self {
        let phase = PodPhase::of(pod);
        let health = match phase {
            PodPhase::Running if is_ready(pod) => Health::Healthy,
            PodPhase::Running => Health::Starting,
            PodPhase::Failed => Health::Unhealthy,
            _ => Health::None,
        };

        let mut status = Self {
            phase,
            state: phase.into(),
            health,
            exit_code: None,
            reason: waiting_reason(pod),
            started_at: None,
            finished_at: None,
        };

        if let Some(state) = main_container(pod).and_then(|c| c.state.as_ref()) {
            if let Some(running) = &state.running {
                status.started_at = running.started_at.as_ref().map(|t| t.0);
            }
            if let Some(terminated) = &state.terminated {
                status.exit_code = Some(terminated.exit_code);
                status.started_at = terminated.started_at.as_ref().map(|t| t.0);
                status.finished_at = terminated.finished_at.as_ref().map(|t| t.0);
                if status.reason.is_none() {
                    status.reason = terminated.reason.clone();
                }
            }
        }
        if status.reason.is_none() && phase == PodPhase::Failed {
            status.reason = pod.status.as_ref().and_then(|s| s.reason.clone());
        }
        status
    }

    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running
    }
}

fn main_container(pod: &Pod) -> Option<&PodContainerStatus> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    statuses
        .iter()
        .find(|c| c.name == MAIN_CONTAINER)
        .or_else(|| statuses.first())
}

/// The pod's `Ready` condition is true
pub fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Why a pod is not (yet) running: the container's waiting reason, else an
/// unschedulable condition
pub fn waiting_reason(pod: &Pod) -> Option<String> {
    if let Some(waiting) = main_container(pod)
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.waiting.as_ref())
    {
        if let Some(reason) = &waiting.reason {
            return Some(match &waiting.message {
                Some(msg) if !msg.is_empty() => format!("{}: {}", reason, msg),
                _ => reason.clone(),
            });
        }
    }

    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| {
            conds
                .iter()
                .find(|c| c.type_ == "PodScheduled" && c.status == "False")
        })
        .map(|c| match (&c.reason, &c.message) {
            (Some(r), Some(m)) => format!("{}: {}", r, m),
            (Some(r), None) => r.clone(),
            (None, Some(m)) => m.clone(),
            (None, None) => "Unschedulable".to_string(),
        })
}

/// A reason the pod can never reach `Running`, if there is one
pub fn fatal_reason(pod: &Pod) -> Option<String> {
    let phase = PodPhase::of(pod);
    if phase.is_terminal() {
        let status = ContainerStatus::from_pod(pod);
        return Some(
            status
                .reason
                .unwrap_or_else(|| format!("pod {:?} before running", phase)),
        );
    }

    let waiting = main_container(pod)?.state.as_ref()?.waiting.as_ref()?;
    let reason = waiting.reason.as_deref()?;
    FATAL_WAITING_REASONS
        .contains(&reason)
        .then(|| waiting_reason(pod).unwrap_or_else(|| reason.to_string()))
}
