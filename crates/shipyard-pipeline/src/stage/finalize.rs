//! Finalize stage: release everything a run acquired.
//!
//! Runs on every exit path. Each cleanup action is attempted up to the
//! finalize policy's limit; whatever still fails is reported in
//! [`FinalizeReport::cleanup_errors`] and never replaces the run's failure.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::sync::StorageTransfer;
use crate::error::{ErrorKind, FaultClass, ProviderError};
use crate::provisioner::{SandboxHandle, SandboxProvider};
use crate::quota::QuotaPermit;
use crate::retry::RetryPolicy;

/// What finalize has to release.
#[derive(Debug, Default)]
pub struct CleanupPlan {
    /// Sandbox to destroy, if one was created.
    pub sandbox: Option<SandboxHandle>,
    /// Storage prefix to discard, if the run did not succeed.
    pub discard_prefix: Option<String>,
    /// Quota slot to give back.
    pub permit: Option<QuotaPermit>,
}

/// Summary of the cleanup actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeReport {
    /// A sandbox existed and is now gone.
    pub sandbox_destroyed: bool,
    /// Partial uploads were removed.
    pub partial_state_discarded: bool,
    /// The quota slot was returned.
    pub quota_released: bool,
    /// Cleanup actions that could not be completed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_errors: Vec<String>,
}

impl FinalizeReport {
    /// Whether every cleanup action succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.cleanup_errors.is_empty()
    }
}

async fn with_retries<F, Fut>(policy: &RetryPolicy, action: &str, mut op: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ProviderError>>,
{
    let attempts = policy.attempts();
    let mut made = 0;
    let mut last = String::new();

    while made < attempts {
        made += 1;
        match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                last = e.to_string();
                if !e.is_transient() {
                    break;
                }
            }
            Err(_) => last = format!("timed out after {:?}", policy.timeout),
        }
        warn!(action, attempt = made, error = %last, "cleanup attempt failed");
        if made < attempts {
            tokio::time::sleep(policy.delay_after(made)).await;
        }
    }

    Err(format!(
        "{}: {action} failed after {made} attempt(s): {last}",
        ErrorKind::CleanupError
    ))
}

/// Run the finalize stage.
#[instrument(skip_all, fields(
    has_sandbox = plan.sandbox.is_some(),
    discard = plan.discard_prefix.is_some(),
))]
pub async fn finalize(
    provider: &dyn SandboxProvider,
    transfer: &dyn StorageTransfer,
    plan: CleanupPlan,
    policy: &RetryPolicy,
) -> (FinalizeReport, Option<QuotaPermit>) {
    let CleanupPlan {
        sandbox,
        discard_prefix,
        permit,
    } = plan;
    let mut report = FinalizeReport::default();

    if let Some(handle) = sandbox.as_ref() {
        let destroyed = with_retries(policy, "destroy sandbox", move || async move {
            match provider.destroy(handle).await {
                Err(e) if e.class == FaultClass::NotFound => {
                    debug!(sandbox_id = %handle.id, "sandbox already gone");
                    Ok(())
                }
                other => other,
            }
        })
        .await;
        match destroyed {
            Ok(()) => report.sandbox_destroyed = true,
            Err(e) => report.cleanup_errors.push(e),
        }
    }

    if let Some(prefix) = discard_prefix.as_deref() {
        let discarded = with_retries(policy, "discard partial uploads", move || async move {
            transfer.discard(prefix).await.map(|removed| {
                debug!(prefix, removed, "partial uploads removed");
            })
        })
        .await;
        match discarded {
            Ok(()) => report.partial_state_discarded = true,
            Err(e) => report.cleanup_errors.push(e),
        }
    }

    let permit = match permit {
        Some(permit) => release_quota(permit, policy, &mut report).await,
        None => None,
    };

    if report.is_clean() {
        info!(
            sandbox_destroyed = report.sandbox_destroyed,
            partial_state_discarded = report.partial_state_discarded,
            quota_released = report.quota_released,
            "finalize complete"
        );
    } else {
        warn!(errors = report.cleanup_errors.len(), "finalize completed with cleanup errors");
    }
    (report, permit)
}

async fn release_quota(
    mut permit: QuotaPermit,
    policy: &RetryPolicy,
    report: &mut FinalizeReport,
) -> Option<QuotaPermit> {
    let attempts = policy.attempts();
    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.timeout, permit.try_release()).await {
            Ok(Ok(())) => {
                report.quota_released = true;
                return None;
            }
            Ok(Err(e)) => {
                warn!(org = %permit.org(), attempt, error = %e, "quota release failed");
                if attempt == attempts {
                    report.cleanup_errors.push(format!(
                        "{}: release quota failed after {attempt} attempt(s): {e}",
                        ErrorKind::CleanupError
                    ));
                }
            }
            Err(_) => {
                warn!(org = %permit.org(), attempt, "quota release timed out");
                if attempt == attempts {
                    report.cleanup_errors.push(format!(
                        "{}: release quota timed out after {attempt} attempt(s)",
                        ErrorKind::CleanupError
                    ));
                }
            }
        }
        if attempt < attempts {
            tokio::time::sleep(policy.delay_after(attempt)).await;
        }
    }
    // Still armed. Dropping it defers the release to the runtime.
    Some(permit)
}
