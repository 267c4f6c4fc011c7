// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

/// Client of the orchestration platform managing the model.
///
/// Every call returns as soon as the platform has accepted the request:
/// the effect of a deploy or a relation is observed only through
/// [`PlatformAPI::status`]. Implementations must be usable concurrently
/// through shared references, since independent requests are issued
/// together.
#[async_trait::async_trait]
pub trait PlatformAPI: Sync + Send {
    /// Build the charm in the given directory, returning the path of the package.
    async fn build_charm(&self, path: &str) -> anyhow::Result<String>;

    /// Request the creation of a service.
    async fn deploy(&self, service: &crate::service::ServiceDescriptor) -> anyhow::Result<()>;

    /// Bind a local file to a resource of an existing service.
    async fn attach_resource(&self, service: &str, resource: &str, path: &str) -> anyhow::Result<()>;

    /// Request an integration between two services.
    async fn add_relation(&self, edge: &crate::relation::RelationEdge) -> anyhow::Result<()>;

    /// Remove an integration between two services.
    async fn remove_relation(&self, edge: &crate::relation::RelationEdge) -> anyhow::Result<()>;

    /// Remove a service and all its units.
    async fn remove_service(&self, service: &str) -> anyhow::Result<()>;

    /// Current status of the model.
    async fn status(&self) -> anyhow::Result<crate::status::StatusSnapshot>;

    /// Run an action on a unit and wait for its completion.
    async fn run_action(&self, unit: &str, action: &str) -> anyhow::Result<crate::action::ActionResult>;

    /// Run a shell command on a unit, returning its standard output.
    /// A non-zero exit status is an error.
    async fn ssh(&self, unit: &str, command: &str) -> anyhow::Result<String>;

    /// Interval at which the platform refreshes the workload status of units.
    async fn update_status_interval(&self) -> anyhow::Result<std::time::Duration>;

    async fn set_update_status_interval(&self, interval: std::time::Duration) -> anyhow::Result<()>;
}
