use super::{Approval, ApprovalError, ApprovalManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteCommand {
    Approve(String),
    Reject(String),
}

impl VoteCommand {
    pub fn identifier(&self) -> &str {
        match self {
            VoteCommand::Approve(id) | VoteCommand::Reject(id) => id,
        }
    }
}

/// Parses `approve <identifier>` and `reject <identifier>`. The keyword is
/// case-insensitive; anything else yields `None`.
pub fn parse_vote_command(text: &str) -> Option<VoteCommand> {
    let mut parts = text.split_whitespace();
    let keyword = parts.next()?.to_lowercase();
    let identifier = parts.next()?.to_string();
    if parts.next().is_some() {
        return None;
    }

    match keyword.as_str() {
        "approve" => Some(VoteCommand::Approve(identifier)),
        "reject" => Some(VoteCommand::Reject(identifier)),
        _ => None,
    }
}

impl ApprovalManager {
    /// Applies a free-text vote command. Returns `Ok(None)` when the text is
    /// not a vote command.
    pub async fn handle_command(
        &self,
        text: &str,
        voter: &str,
    ) -> Result<Option<Approval>, ApprovalError> {
        match parse_vote_command(text) {
            Some(VoteCommand::Approve(id)) => self.approve(&id, voter).await.map(Some),
            Some(VoteCommand::Reject(id)) => self.reject(&id, voter).await.map(Some),
            None => Ok(None),
        }
    }
}
