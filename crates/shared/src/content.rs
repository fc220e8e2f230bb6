use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const TEXT_MESSAGE: &str = "TextMessage";
pub const IMAGE_MESSAGE: &str = "ImageMessage";
pub const VOICE_MESSAGE: &str = "VoiceMessage";
pub const RICH_CONTENT_MESSAGE: &str = "RichContentMessage";
pub const LOCATION_MESSAGE: &str = "LocationMessage";
pub const DISCUSSION_NOTIFICATION_MESSAGE: &str = "DiscussionNotificationMessage";
pub const INFORMATION_NOTIFICATION_MESSAGE: &str = "InformationNotificationMessage";
pub const CONTACT_NOTIFICATION_MESSAGE: &str = "ContactNotificationMessage";
pub const PROFILE_NOTIFICATION_MESSAGE: &str = "ProfileNotificationMessage";
pub const COMMAND_NOTIFICATION_MESSAGE: &str = "CommandNotificationMessage";
pub const COMMAND_MESSAGE: &str = "CommandMessage";
pub const UNKNOWN_MESSAGE: &str = "UnknownMessage";
pub const CUSTOM_MESSAGE: &str = "CustomMessage";

const BUILTIN_MESSAGE_TYPES: &[&str] = &[
    TEXT_MESSAGE,
    IMAGE_MESSAGE,
    VOICE_MESSAGE,
    RICH_CONTENT_MESSAGE,
    LOCATION_MESSAGE,
    DISCUSSION_NOTIFICATION_MESSAGE,
    INFORMATION_NOTIFICATION_MESSAGE,
    CONTACT_NOTIFICATION_MESSAGE,
    PROFILE_NOTIFICATION_MESSAGE,
    COMMAND_NOTIFICATION_MESSAGE,
    COMMAND_MESSAGE,
];

/// Message body, tagged by its content type name.
///
/// `Custom` carries content types registered at runtime; its body is opaque
/// JSON owned by whoever registered the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", content = "body")]
pub enum MessageContent {
    #[serde(rename = "TextMessage")]
    Text {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<String>,
    },
    #[serde(rename = "ImageMessage")]
    Image {
        content: String,
        image_uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<String>,
    },
    #[serde(rename = "VoiceMessage")]
    Voice {
        content: String,
        duration: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<String>,
    },
    #[serde(rename = "RichContentMessage")]
    RichContent {
        title: String,
        content: String,
        image_uri: String,
        #[serde(default)]
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<String>,
    },
    #[serde(rename = "LocationMessage")]
    Location {
        latitude: f64,
        longitude: f64,
        poi: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<String>,
    },
    #[serde(rename = "DiscussionNotificationMessage")]
    DiscussionNotification {
        extension: String,
        operation: String,
        notification_type: i32,
        #[serde(default)]
        is_has_received: bool,
    },
    #[serde(rename = "InformationNotificationMessage")]
    InformationNotification {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<String>,
    },
    #[serde(rename = "ContactNotificationMessage")]
    ContactNotification {
        operation: String,
        source_user_id: String,
        target_user_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<String>,
    },
    #[serde(rename = "ProfileNotificationMessage")]
    ProfileNotification {
        operation: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<String>,
    },
    #[serde(rename = "CommandNotificationMessage")]
    CommandNotification { name: String, data: String },
    #[serde(rename = "CommandMessage")]
    Command { name: String, data: String },
    #[serde(rename = "UnknownMessage")]
    Unknown { object_name: String, raw: Vec<u8> },
    #[serde(rename = "CustomMessage")]
    Custom { message_type: String, body: Value },
}

impl MessageContent {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
            extra: None,
        }
    }

    pub fn custom(message_type: impl Into<String>, body: Value) -> Self {
        Self::Custom {
            message_type: message_type.into(),
            body,
        }
    }

    pub fn message_type(&self) -> &str {
        match self {
            Self::Text { .. } => TEXT_MESSAGE,
            Self::Image { .. } => IMAGE_MESSAGE,
            Self::Voice { .. } => VOICE_MESSAGE,
            Self::RichContent { .. } => RICH_CONTENT_MESSAGE,
            Self::Location { .. } => LOCATION_MESSAGE,
            Self::DiscussionNotification { .. } => DISCUSSION_NOTIFICATION_MESSAGE,
            Self::InformationNotification { .. } => INFORMATION_NOTIFICATION_MESSAGE,
            Self::ContactNotification { .. } => CONTACT_NOTIFICATION_MESSAGE,
            Self::ProfileNotification { .. } => PROFILE_NOTIFICATION_MESSAGE,
            Self::CommandNotification { .. } => COMMAND_NOTIFICATION_MESSAGE,
            Self::Command { .. } => COMMAND_MESSAGE,
            Self::Unknown { .. } => UNKNOWN_MESSAGE,
            Self::Custom { message_type, .. } => message_type,
        }
    }

    pub fn is_builtin_type(message_type: &str) -> bool {
        BUILTIN_MESSAGE_TYPES.contains(&message_type)
    }

    /// The JSON body without its type tag, as carried on the wire.
    pub fn to_body(&self) -> serde_json::Result<Value> {
        if let Self::Custom { body, .. } = self {
            return Ok(body.clone());
        }
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("body")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// Inverse of [`MessageContent::to_body`]. Types outside the built-in set
    /// come back as `Custom`.
    pub fn from_body(message_type: &str, body: Value) -> serde_json::Result<Self> {
        if !Self::is_builtin_type(message_type) {
            return Ok(Self::custom(message_type, body));
        }
        serde_json::from_value(json!({ "message_type": message_type, "body": body }))
    }
}
