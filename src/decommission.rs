//! Fleet teardown: force stop, undefine with storage, drop the state record.

use crate::backend::Backend;
use crate::error::HerdError;
use crate::observer::Observer;
use crate::retry::{self, RetryPolicy};
use crate::state::StateStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyKind {
    Destroyed,
    /// No such domain; nothing to do.
    NotFound,
    Failed { error: String },
}

impl DestroyKind {
    pub fn label(&self) -> &'static str {
        match self {
            DestroyKind::Destroyed => "destroyed",
            DestroyKind::NotFound => "not-found",
            DestroyKind::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyOutcome {
    pub name: String,
    pub kind: DestroyKind,
}

#[derive(Debug, Clone, Default)]
pub struct DestroyReport {
    pub outcomes: Vec<DestroyOutcome>,
}

impl DestroyReport {
    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.kind, DestroyKind::Failed { .. }))
            .count()
    }

    pub fn count(&self, label: &str) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.kind.label() == label)
            .count()
    }

    pub fn into_result(self) -> Result<Self, HerdError> {
        match self.failed_count() {
            0 => Ok(self),
            failed => Err(HerdError::FleetFailed {
                failed,
                total: self.outcomes.len(),
            }),
        }
    }
}

pub struct Decommissioner<'a, B> {
    backend: &'a B,
    store: &'a StateStore,
    observer: &'a dyn Observer,
    retry: RetryPolicy,
}

impl<'a, B: Backend> Decommissioner<'a, B> {
    pub fn new(
        backend: &'a B,
        store: &'a StateStore,
        observer: &'a dyn Observer,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            store,
            observer,
            retry,
        }
    }

    /// Destroy each named VM in order. One VM failing or missing never stops
    /// the rest.
    pub async fn run(&self, names: &[String]) -> DestroyReport {
        self.observer.destroy_started(names);
        let mut report = DestroyReport::default();
        for name in names {
            let kind = match self.destroy_vm(name).await {
                Ok(kind) => kind,
                Err(e) => {
                    tracing::error!(vm = %name, "destroy failed: {e}");
                    DestroyKind::Failed {
                        error: e.to_string(),
                    }
                }
            };
            let outcome = DestroyOutcome {
                name: name.clone(),
                kind,
            };
            self.observer.destroy_finished(&outcome);
            report.outcomes.push(outcome);
        }
        self.observer.destroy_summary(&report);
        report
    }

    async fn destroy_vm(&self, name: &str) -> Result<DestroyKind, HerdError> {
        let backend = self.backend;
        if !backend.domain_exists(name).await? {
            tracing::info!(vm = name, "does not exist, nothing to destroy");
            self.forget(name).await;
            return Ok(DestroyKind::NotFound);
        }

        retry::with_backoff(&self.retry, name, move || backend.force_stop(name)).await?;
        match retry::with_backoff(&self.retry, name, move || {
            backend.undefine_with_storage(name)
        })
        .await
        {
            Ok(()) => {}
            // Removed by someone else between the lookup and here.
            Err(HerdError::VmNotFound { .. }) => {
                self.forget(name).await;
                return Ok(DestroyKind::NotFound);
            }
            Err(e) => return Err(e),
        }

        tracing::info!(vm = name, "destroyed");
        self.forget(name).await;
        Ok(DestroyKind::Destroyed)
    }

    /// Drop the state record. A stale record is not worth failing over.
    async fn forget(&self, name: &str) {
        match self.store.remove(name).await {
            Ok(true) => tracing::debug!(vm = name, "state record removed"),
            Ok(false) => {}
            Err(e) => tracing::warn!(vm = name, "could not remove state record: {e}"),
        }
    }
}
