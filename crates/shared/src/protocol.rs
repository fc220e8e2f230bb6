use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ConnectionStatus, ConversationType, GroupDescriptor, MessageDirection,
        PublicServiceProfile,
    },
    error::{ErrorCode, RemoteError},
};

/// Every request the engine can issue to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Publish one upstream message; payload [`PublishRequest`], reply [`PublishAck`].
    PublishMessage,
    /// History pages; payload [`HistoryRequest`], reply [`HistoryResponse`].
    QueryPrivateHistory,
    QueryDiscussionHistory,
    QueryGroupHistory,
    QueryCustomerServiceHistory,
    QuerySystemHistory,
    QueryPublicServiceHistory,
    /// Target is the user id; reply [`crate::domain::UserInfo`].
    GetUserInfo,
    /// Target is the discussion id; reply [`crate::domain::Discussion`].
    GetDiscussion,
    /// Target is the current user; payload [`RelationsRequest`], reply [`RelationsResponse`].
    GetConversationList,
    /// Target is the conversation target id; payload [`RemoveConversationRequest`].
    RemoveConversation,
    /// Payload [`GroupHashRequest`], reply [`GroupHashResponse`].
    GroupHashCheck,
    /// Payload [`GroupSyncRequest`].
    GroupSync,
    /// Payload [`PullPublicServicesRequest`], reply [`PublicServiceListResponse`].
    PullPublicServices,
}

impl Operation {
    /// The history channel for a conversation type, if the backend keeps one.
    pub fn history_for(conversation_type: ConversationType) -> Option<Self> {
        match conversation_type {
            ConversationType::Private => Some(Self::QueryPrivateHistory),
            ConversationType::Discussion => Some(Self::QueryDiscussionHistory),
            ConversationType::Group => Some(Self::QueryGroupHistory),
            ConversationType::CustomerService => Some(Self::QueryCustomerServiceHistory),
            ConversationType::System => Some(Self::QuerySystemHistory),
            ConversationType::AppPublicService | ConversationType::PublicService => {
                Some(Self::QueryPublicServiceHistory)
            }
            ConversationType::ChatRoom => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub conversation_type: ConversationType,
    pub session_id: u8,
    pub class_name: String,
    pub content_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishAck {
    pub message_uid: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub target_id: String,
    pub data_time: i64,
    pub size: u32,
}

/// One page of history, newest first as delivered by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub list: Vec<WireMessage>,
    pub sync_time: i64,
    #[serde(default)]
    pub has_msg: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub from_user_id: String,
    pub conversation_type: ConversationType,
    pub target_id: String,
    pub class_name: String,
    pub content_b64: String,
    pub data_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_uid: Option<String>,
    pub direction: MessageDirection,
    #[serde(default)]
    pub read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationsRequest {
    pub relation_type: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationsResponse {
    #[serde(default)]
    pub info: Vec<RelationItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationItem {
    pub conversation_type: ConversationType,
    pub target_id: String,
    pub latest_message: WireMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveConversationRequest {
    pub conversation_type: ConversationType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupHashRequest {
    pub user_id: String,
    pub group_hash_code: String,
}

/// `result == 1` means the backend's roster differs and wants the full list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupHashResponse {
    pub result: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSyncRequest {
    pub groups: Vec<GroupDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullPublicServicesRequest {
    pub time: i64,
    pub mp_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicServiceListResponse {
    #[serde(default)]
    pub items: Vec<PublicServiceProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect {
        app_key: String,
        token: String,
    },
    Request {
        seq: u64,
        op: Operation,
        target: String,
        payload_b64: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectAck {
        user_id: String,
        server_time: i64,
    },
    ConnectRejected {
        code: ErrorCode,
    },
    Response {
        seq: u64,
        payload_b64: String,
    },
    Failure {
        seq: u64,
        error: RemoteError,
    },
    Push {
        message: WireMessage,
    },
    StatusChanged {
        status: ConnectionStatus,
    },
}
