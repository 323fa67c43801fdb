use tidecrm_core::WorkspaceId;

/// Messages that belong to exactly one workspace.
///
/// Listeners use this to drop messages for other workspaces before they reach
/// a handler, e.g. a dashboard subscribed to one workspace's jobs.
pub trait WorkspaceScoped {
    fn workspace_id(&self) -> WorkspaceId;
}
