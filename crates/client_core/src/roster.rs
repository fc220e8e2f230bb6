use std::collections::HashSet;

use shared::{
    domain::GroupDescriptor,
    error::{ErrorCode, RemoteError},
    protocol::{GroupHashRequest, GroupHashResponse, GroupSyncRequest, Operation},
};
use tracing::{info, warn};

use crate::{
    transport::{decode_reply, encode_payload},
    EngineError, ImClient,
};

const ROSTER_MISMATCH: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterSyncOutcome {
    /// The server's fingerprint matched; nothing was pushed.
    Unchanged,
    Pushed { groups: usize },
}

/// Drops repeated ids, keeping the first descriptor seen for each.
pub fn dedup_groups(groups: &[GroupDescriptor]) -> Vec<GroupDescriptor> {
    let mut seen = HashSet::new();
    groups
        .iter()
        .filter(|group| seen.insert(group.id.as_str()))
        .cloned()
        .collect()
}

/// Lowercase hex MD5 over the sorted, deduplicated ids, concatenated.
pub fn roster_fingerprint(groups: &[GroupDescriptor]) -> String {
    let mut ids: Vec<&str> = groups.iter().map(|group| group.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    format!("{:x}", md5::compute(ids.concat()))
}

impl ImClient {
    /// Reconciles the signed-in user's group roster with the server: one
    /// fingerprint check, plus one full push only when the server reports a
    /// mismatch.
    pub async fn sync_groups(
        &self,
        groups: &[GroupDescriptor],
    ) -> Result<RosterSyncOutcome, EngineError> {
        let Some(user_id) = self.current_user_id().await else {
            return Err(EngineError::TransportUnavailable(ErrorCode::NetUnavailable));
        };
        let groups = dedup_groups(groups);
        let fingerprint = roster_fingerprint(&groups);

        let check = GroupHashRequest {
            user_id: user_id.clone(),
            group_hash_code: fingerprint.clone(),
        };
        let verdict = self
            .bridge
            .request(Operation::GroupHashCheck, encode_payload(&check), &user_id)
            .await
            .and_then(|bytes| decode_reply::<GroupHashResponse>(Operation::GroupHashCheck, &bytes))
            .map_err(|err| {
                warn!(user_id, "roster: fingerprint check failed: {err}");
                EngineError::RosterSyncFailed(RemoteError::new(
                    ErrorCode::GroupSyncError,
                    err.to_string(),
                ))
            })?;

        if verdict.result != ROSTER_MISMATCH {
            info!(user_id, fingerprint, "roster: fingerprint matches");
            return Ok(RosterSyncOutcome::Unchanged);
        }

        let count = groups.len();
        let push = GroupSyncRequest { groups };
        self.bridge
            .request(Operation::GroupSync, encode_payload(&push), &user_id)
            .await
            .map_err(|err| {
                warn!(user_id, "roster: full push failed: {err}");
                EngineError::RosterSyncFailed(RemoteError::new(
                    ErrorCode::GroupMatchError,
                    err.to_string(),
                ))
            })?;
        info!(user_id, fingerprint, groups = count, "roster: pushed full list");
        Ok(RosterSyncOutcome::Pushed { groups: count })
    }
}
