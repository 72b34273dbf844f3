//! The boundary to whatever actually provisions a stack.
//!
//! An engine takes a validated [`StackSpec`] and either reaches the described state or
//! reports how far it got.

use std::{
    fmt::{Display, Formatter},
    future::Future,
};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{docker::ResolvedImages, spec::StackSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceId {
    pub kind: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Resources known to be in place, in the order they were applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveState {
    pub applied: Vec<ResourceId>,
}

#[derive(Error, Debug)]
#[error("failed to apply {failed} after {} resources: {cause:#}", .partial.applied.len())]
pub struct ApplyError {
    /// What was in place when the failure happened.
    pub partial: LiveState,
    pub failed: ResourceId,
    pub cause: anyhow::Error,
}

#[async_trait]
pub trait ProvisioningEngine {
    async fn apply(
        &self,
        stack: &StackSpec,
        images: &ResolvedImages,
    ) -> Result<LiveState, ApplyError>;
}

/// Apply `resources` one at a time, stopping at the first failure.
pub async fn apply_in_order<R, F, Fut>(
    resources: &[R],
    id: impl Fn(&R) -> ResourceId,
    mut apply: F,
) -> Result<LiveState, ApplyError>
where
    F: FnMut(&R) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut live = LiveState::default();
    for resource in resources {
        let rid = id(resource);
        if let Err(cause) = apply(resource).await {
            warn!(resource = %rid, applied = live.applied.len(), "apply failed");
            return Err(ApplyError {
                partial: live,
                failed: rid,
                cause,
            });
        }
        info!(resource = %rid, "applied");
        live.applied.push(rid);
    }
    Ok(live)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_applied() {
        let live = apply_in_order(
            &["a", "b", "c"],
            |r| ResourceId::new("Thing", *r),
            |_| async { Ok(()) },
        )
        .await
        .unwrap();
        assert_eq!(
            live.applied,
            vec![
                ResourceId::new("Thing", "a"),
                ResourceId::new("Thing", "b"),
                ResourceId::new("Thing", "c"),
            ]
        );
    }

    #[tokio::test]
    async fn failure_keeps_partial_state() {
        let mut attempts = Vec::new();
        let err = apply_in_order(
            &["a", "b", "c"],
            |r| ResourceId::new("Thing", *r),
            |r| {
                attempts.push(*r);
                let fail = *r == "b";
                async move {
                    anyhow::ensure!(!fail, "quota exceeded");
                    Ok(())
                }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(attempts, vec!["a", "b"]);
        assert_eq!(err.partial.applied, vec![ResourceId::new("Thing", "a")]);
        assert_eq!(err.failed, ResourceId::new("Thing", "b"));
        let msg = err.to_string();
        assert!(msg.contains("Thing/b"), "{msg}");
        assert!(msg.contains("quota exceeded"), "{msg}");
    }
}
