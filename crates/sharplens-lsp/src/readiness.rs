use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, trace};

use crate::error::Error;
use crate::protocol::LspLocation;

/// Policy for deciding when the workspace has left its transient placeholder
/// project. There is no authoritative "loading complete" signal; readiness is
/// inferred from repeated results of the caller's own query.
#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    /// Give up with [`Error::ReadinessTimeout`] after this many probes.
    pub max_attempts: u32,
    /// Never settle on empty results before this many probes.
    pub min_attempts: u32,
    /// Consecutive non-placeholder probes required to settle on "the target
    /// simply has no definition".
    pub settle_threshold: u32,
    pub poll_interval: Duration,
    /// Substring (matched case-insensitively against result uris) that marks
    /// a result as still scoped to the placeholder project. Brittle and
    /// server-version-dependent; overridable through configuration.
    pub placeholder_fingerprint: String,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 40,
            min_attempts: 5,
            settle_threshold: 3,
            poll_interval: Duration::from_millis(500),
            placeholder_fingerprint: "miscellaneousfiles".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Result still resolves inside the placeholder project.
    Placeholder,
    /// Non-empty result outside the placeholder project.
    Real,
    /// No location. Ambiguous: still loading, or nothing to resolve.
    Empty,
}

impl ReadinessPolicy {
    pub fn classify(&self, locations: &[LspLocation]) -> Classification {
        if locations.is_empty() {
            return Classification::Empty;
        }
        let fingerprint = self.placeholder_fingerprint.to_ascii_lowercase();
        if !fingerprint.is_empty()
            && locations
                .iter()
                .any(|loc| loc.uri.to_ascii_lowercase().contains(&fingerprint))
        {
            return Classification::Placeholder;
        }
        Classification::Real
    }
}

/// Outcome of a settled readiness wait. `locations` holds the final probe's
/// results so the caller does not have to re-issue the query; it is empty
/// when the detector concluded the target has no resolvable definition.
#[derive(Debug, Clone)]
pub struct Settled {
    pub locations: Vec<LspLocation>,
    pub attempts: u32,
}

/// Polls `probe` (the caller's actual target query) until the workspace looks
/// loaded. A REAL result settles immediately; a run of EMPTY results settles
/// once `settle_threshold` is reached after `min_attempts`; any PLACEHOLDER
/// result resets the run.
pub async fn wait_for_project_load<F, Fut>(policy: &ReadinessPolicy, mut probe: F) -> Result<Settled>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<LspLocation>>>,
{
    let mut settled_streak = 0u32;
    for attempt in 1..=policy.max_attempts {
        let locations = probe().await?;
        match policy.classify(&locations) {
            Classification::Real => {
                debug!("workspace ready after {attempt} attempt(s)");
                return Ok(Settled { locations, attempts: attempt });
            }
            Classification::Placeholder => {
                trace!("attempt {attempt}: still in placeholder project");
                settled_streak = 0;
            }
            Classification::Empty => {
                settled_streak += 1;
                if attempt >= policy.min_attempts && settled_streak >= policy.settle_threshold {
                    // No placeholder hits for a while: the target most likely
                    // has no resolvable definition rather than a project that
                    // never loads.
                    debug!("settled on empty resolution after {attempt} attempt(s)");
                    return Ok(Settled { locations, attempts: attempt });
                }
            }
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    Err(Error::ReadinessTimeout {
        attempts: policy.max_attempts,
    }
    .into())
}
