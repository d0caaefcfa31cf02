use std::sync::Arc;

use shelfkeep_core::{UserId, WorkspaceId};

use super::outcome::ChannelOutcome;
use super::ports::{MemberDirectory, PushMessage, PushSender};

/// Owners and admins of the workspace, looked up at processing time.
pub(crate) async fn recipients(
    members: &dyn MemberDirectory,
    workspace_id: WorkspaceId,
) -> Result<Vec<UserId>, ChannelOutcome> {
    members
        .admins(workspace_id)
        .await
        .map_err(|e| ChannelOutcome::Failed(format!("look up workspace admins: {e}")))
}

pub(crate) async fn push(
    sender: Option<&Arc<dyn PushSender>>,
    recipients: &[UserId],
    message: &PushMessage,
) -> ChannelOutcome {
    let Some(sender) = sender.filter(|s| s.is_enabled()) else {
        return ChannelOutcome::Skipped("push not configured");
    };
    if recipients.is_empty() {
        return ChannelOutcome::Skipped("no recipients");
    }
    match sender.send_to_users(recipients, message).await {
        Ok(()) => ChannelOutcome::Delivered {
            recipients: recipients.len(),
        },
        Err(e) => ChannelOutcome::Failed(e.to_string()),
    }
}
