use shared::{
    domain::{ConversationKey, ConversationType, PublicServiceProfile},
    protocol::{Operation, PublicServiceListResponse, PullPublicServicesRequest},
};
use tracing::{info, warn};

use crate::{
    transport::{decode_reply, encode_payload},
    ImClient,
};

impl ImClient {
    /// Pulls the public services the signed-in user follows and replaces the
    /// in-memory list. A full pull starts from 0; an incremental one asks for
    /// entries newer than the forward watermark. Failures keep the current
    /// list and are only logged.
    pub async fn refresh_public_services(&self, incremental: bool) -> Vec<PublicServiceProfile> {
        let Some(user_id) = self.current_user_id().await else {
            warn!("public services: refresh requested without a session");
            return self.public_service_list().await;
        };
        let watermark_key = ConversationKey::new(ConversationType::AppPublicService, user_id.clone());
        let time = if incremental {
            self.inner
                .lock()
                .await
                .forward_watermarks
                .get(&watermark_key)
                .unwrap_or(0)
        } else {
            0
        };

        let request = PullPublicServicesRequest {
            time,
            mp_id: String::new(),
        };
        let response = match self
            .bridge
            .request(
                Operation::PullPublicServices,
                encode_payload(&request),
                &user_id,
            )
            .await
            .and_then(|bytes| {
                decode_reply::<PublicServiceListResponse>(Operation::PullPublicServices, &bytes)
            }) {
            Ok(response) => response,
            Err(err) => {
                warn!(time, "public services: pull failed, keeping current list: {err}");
                return self.public_service_list().await;
            }
        };

        let mut guard = self.inner.lock().await;
        if let Some(sync_time) = response.sync_time {
            guard.forward_watermarks.advance(&watermark_key, sync_time);
        }
        guard.public_services = response.items;
        info!(
            time,
            count = guard.public_services.len(),
            "public services: list replaced"
        );
        guard.public_services.clone()
    }

    pub async fn public_service_list(&self) -> Vec<PublicServiceProfile> {
        self.inner.lock().await.public_services.clone()
    }

    pub async fn public_service_profile(
        &self,
        conversation_type: ConversationType,
        public_service_id: &str,
    ) -> Option<PublicServiceProfile> {
        let guard = self.inner.lock().await;
        guard
            .public_services
            .iter()
            .find(|profile| {
                profile.conversation_type == conversation_type
                    && profile.public_service_id == public_service_id
            })
            .cloned()
    }
}
