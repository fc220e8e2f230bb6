use serde::{Deserialize, Serialize};

use crate::content::MessageContent;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(LocalMessageId);

macro_rules! wire_enum {
    ($name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        impl $name {
            pub fn as_i64(self) -> i64 {
                match self {
                    $(Self::$variant => $value,)+
                }
            }

            pub fn from_i64(value: i64) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Private,
    Discussion,
    Group,
    ChatRoom,
    CustomerService,
    System,
    AppPublicService,
    PublicService,
}

wire_enum!(ConversationType {
    Private = 1,
    Discussion = 2,
    Group = 3,
    ChatRoom = 4,
    CustomerService = 5,
    System = 6,
    AppPublicService = 7,
    PublicService = 8,
});

impl ConversationType {
    pub const ALL: [ConversationType; 8] = [
        ConversationType::Private,
        ConversationType::Discussion,
        ConversationType::Group,
        ConversationType::ChatRoom,
        ConversationType::CustomerService,
        ConversationType::System,
        ConversationType::AppPublicService,
        ConversationType::PublicService,
    ];
}

impl TryFrom<i64> for ConversationType {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::from_i64(value).ok_or(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub conversation_type: ConversationType,
    pub target_id: String,
}

impl ConversationKey {
    pub fn new(conversation_type: ConversationType, target_id: impl Into<String>) -> Self {
        Self {
            conversation_type,
            target_id: target_id.into(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.conversation_type.as_i64(), self.target_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Send,
    Receive,
}

wire_enum!(MessageDirection {
    Send = 1,
    Receive = 2,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentStatus {
    Sending,
    Sent,
    Failed,
    Canceled,
}

wire_enum!(SentStatus {
    Sending = 10,
    Failed = 20,
    Sent = 30,
    Canceled = 70,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceivedStatus {
    #[default]
    Unread,
    Read,
    Listened,
    Downloaded,
}

wire_enum!(ReceivedStatus {
    Unread = 0,
    Read = 1,
    Listened = 2,
    Downloaded = 4,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    DoNotDisturb,
    #[default]
    Notify,
}

wire_enum!(NotificationStatus {
    DoNotDisturb = 0,
    Notify = 1,
});

/// A single message as seen by this client, outgoing or incoming.
///
/// `local_id` is assigned by the local store on first persist and
/// `server_message_id` only once the server acknowledged the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalMessageId>,
    pub key: ConversationKey,
    pub sender_user_id: String,
    pub direction: MessageDirection,
    pub content: MessageContent,
    pub object_name: String,
    pub sent_status: SentStatus,
    #[serde(default)]
    pub received_status: ReceivedStatus,
    pub sent_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl Message {
    pub fn message_type(&self) -> &str {
        self.content.message_type()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub key: ConversationKey,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<Message>,
    pub unread_message_count: u32,
    pub is_top: bool,
    pub sent_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_status: Option<SentStatus>,
    #[serde(default)]
    pub notification_status: NotificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_portrait_uri: Option<String>,
}

impl Conversation {
    pub fn new(key: ConversationKey, title: impl Into<String>) -> Self {
        Self {
            key,
            title: title.into(),
            latest_message: None,
            unread_message_count: 0,
            is_top: false,
            sent_time: 0,
            sent_status: None,
            notification_status: NotificationStatus::default(),
            sender_user_id: None,
            sender_user_name: None,
            sender_portrait_uri: None,
        }
    }

    /// Replaces the latest message and the fields derived from it.
    pub fn apply_latest_message(&mut self, message: Message) {
        self.sent_time = message.sent_time;
        self.sent_status = Some(message.sent_status);
        self.latest_message = Some(message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portrait_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discussion {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
}

/// A group as known locally; the unit of roster synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub id: String,
    pub name: String,
}

impl GroupDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicServiceProfile {
    pub conversation_type: ConversationType,
    pub public_service_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introduction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portrait_uri: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
    KickedOffline,
    NetworkUnavailable,
}
