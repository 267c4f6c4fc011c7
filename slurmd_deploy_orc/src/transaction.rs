// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use crate::scheduler::Step;

#[derive(Debug, Clone)]
pub struct TransactionEntry {
    pub step: Step,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

/// Log of the steps completed on the platform, used to undo a partially
/// applied deployment.
#[derive(Debug, Clone, Default)]
pub struct TransactionLog {
    entries: Vec<TransactionEntry>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: Step) {
        log::debug!("completed: {}", step);
        self.entries.push(TransactionEntry {
            step,
            completed_at: chrono::Utc::now(),
        });
    }

    pub fn entries(&self) -> &[TransactionEntry] {
        &self.entries
    }

    pub fn steps(&self) -> Vec<Step> {
        self.entries.iter().map(|x| x.step.clone()).collect()
    }

    /// Undo the completed steps in reverse order. Relations are removed and
    /// services are destroyed; other steps have nothing to undo.
    ///
    /// Undoing is best-effort: failures are logged and the next step is
    /// undone anyway. Returns the steps undone successfully.
    pub async fn rollback(&mut self, platform: &dyn slurmd_deploy_api::platform::PlatformAPI) -> Vec<Step> {
        let mut undone = vec![];
        while let Some(entry) = self.entries.pop() {
            let res = match &entry.step {
                Step::Relate(edge) => platform.remove_relation(edge).await,
                Step::Deploy(service) => platform.remove_service(service).await,
                Step::Attach(..) | Step::Converge(..) => continue,
            };
            match res {
                Ok(_) => {
                    log::info!("rolled back: {} (completed at {})", entry.step, entry.completed_at.to_rfc3339());
                    undone.push(entry.step);
                }
                Err(err) => log::error!("could not roll back {}: {}", entry.step, err),
            }
        }
        undone
    }
}
