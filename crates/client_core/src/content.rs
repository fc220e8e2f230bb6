use std::{collections::HashMap, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::{
    content::{self as kinds, MessageContent},
    domain::{ConversationKey, Message, MessageDirection, ReceivedStatus, SentStatus},
    protocol::WireMessage,
};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("message type must not be empty")]
    EmptyMessageType,
    #[error("object name must not be empty for {0}")]
    EmptyObjectName(String),
    #[error("no encoder supplied for {0}")]
    MissingEncoder(String),
    #[error("no decoder supplied for {0}")]
    MissingDecoder(String),
    #[error("object name {object_name} is already bound to {existing}")]
    ObjectNameTaken {
        object_name: String,
        existing: String,
    },
    #[error("content type {0} is not registered")]
    Unregistered(String),
    #[error("failed to encode {message_type}: {source}")]
    Encode {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode {message_type}: {source}")]
    Decode {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Server-side handling flags for one content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTag {
    pub persisted: bool,
    pub counted: bool,
}

impl MessageTag {
    pub const fn new(persisted: bool, counted: bool) -> Self {
        Self { persisted, counted }
    }

    /// Bit 0 is `persisted`, bit 1 is `counted`.
    pub fn session_id(self) -> u8 {
        u8::from(self.persisted) | (u8::from(self.counted) << 1)
    }
}

pub trait ContentEncoder: Send + Sync {
    fn encode(&self, content: &MessageContent) -> Result<Vec<u8>, ContentError>;
}

pub trait ContentDecoder: Send + Sync {
    fn decode(&self, message_type: &str, bytes: &[u8]) -> Result<MessageContent, ContentError>;
}

/// Encodes the untagged JSON body of a [`MessageContent`].
pub struct JsonContentCodec;

impl ContentEncoder for JsonContentCodec {
    fn encode(&self, content: &MessageContent) -> Result<Vec<u8>, ContentError> {
        let encode_err = |source| ContentError::Encode {
            message_type: content.message_type().to_string(),
            source,
        };
        let body = content.to_body().map_err(encode_err)?;
        serde_json::to_vec(&body).map_err(encode_err)
    }
}

impl ContentDecoder for JsonContentCodec {
    fn decode(&self, message_type: &str, bytes: &[u8]) -> Result<MessageContent, ContentError> {
        let decode_err = |source| ContentError::Decode {
            message_type: message_type.to_string(),
            source,
        };
        let body = serde_json::from_slice(bytes).map_err(decode_err)?;
        MessageContent::from_body(message_type, body).map_err(decode_err)
    }
}

pub struct ContentTypeRegistration {
    pub message_type: String,
    pub object_name: String,
    pub tag: MessageTag,
    pub encoder: Option<Arc<dyn ContentEncoder>>,
    pub decoder: Option<Arc<dyn ContentDecoder>>,
}

impl ContentTypeRegistration {
    pub fn json(
        message_type: impl Into<String>,
        object_name: impl Into<String>,
        tag: MessageTag,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            object_name: object_name.into(),
            tag,
            encoder: Some(Arc::new(JsonContentCodec)),
            decoder: Some(Arc::new(JsonContentCodec)),
        }
    }
}

#[derive(Clone)]
pub struct ContentDescriptor {
    pub message_type: String,
    pub object_name: String,
    pub tag: MessageTag,
    encoder: Arc<dyn ContentEncoder>,
    decoder: Arc<dyn ContentDecoder>,
}

impl std::fmt::Debug for ContentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentDescriptor")
            .field("message_type", &self.message_type)
            .field("object_name", &self.object_name)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

const BUILTIN_TYPES: &[(&str, &str, MessageTag)] = &[
    (kinds::TEXT_MESSAGE, "RC:TxtMsg", MessageTag::new(true, true)),
    (kinds::IMAGE_MESSAGE, "RC:ImgMsg", MessageTag::new(true, true)),
    (kinds::VOICE_MESSAGE, "RC:VcMsg", MessageTag::new(true, true)),
    (kinds::RICH_CONTENT_MESSAGE, "RC:ImgTextMsg", MessageTag::new(true, true)),
    (kinds::LOCATION_MESSAGE, "RC:LBSMsg", MessageTag::new(true, true)),
    (kinds::DISCUSSION_NOTIFICATION_MESSAGE, "RC:DizNtf", MessageTag::new(true, true)),
    (kinds::INFORMATION_NOTIFICATION_MESSAGE, "RC:InfoNtf", MessageTag::new(true, true)),
    (kinds::CONTACT_NOTIFICATION_MESSAGE, "RC:ContactNtf", MessageTag::new(true, true)),
    (kinds::PROFILE_NOTIFICATION_MESSAGE, "RC:ProfileNtf", MessageTag::new(true, true)),
    (kinds::COMMAND_NOTIFICATION_MESSAGE, "RC:CmdNtf", MessageTag::new(true, true)),
    (kinds::COMMAND_MESSAGE, "RC:CmdMsg", MessageTag::new(false, false)),
];

/// Maps content type names to wire object names, tags and codecs.
pub struct ContentRegistry {
    by_type: HashMap<String, ContentDescriptor>,
    type_by_object_name: HashMap<String, String>,
}

impl Default for ContentRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ContentRegistry {
    pub fn empty() -> Self {
        Self {
            by_type: HashMap::new(),
            type_by_object_name: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for (message_type, object_name, tag) in BUILTIN_TYPES {
            registry.insert(ContentDescriptor {
                message_type: (*message_type).to_string(),
                object_name: (*object_name).to_string(),
                tag: *tag,
                encoder: Arc::new(JsonContentCodec),
                decoder: Arc::new(JsonContentCodec),
            });
        }
        registry
    }

    /// Registers a content type. Registering an existing type name again
    /// replaces its entry.
    pub fn register(&mut self, registration: ContentTypeRegistration) -> Result<(), ContentError> {
        let ContentTypeRegistration {
            message_type,
            object_name,
            tag,
            encoder,
            decoder,
        } = registration;
        if message_type.trim().is_empty() {
            return Err(ContentError::EmptyMessageType);
        }
        if object_name.trim().is_empty() {
            return Err(ContentError::EmptyObjectName(message_type));
        }
        let encoder = encoder.ok_or_else(|| ContentError::MissingEncoder(message_type.clone()))?;
        let decoder = decoder.ok_or_else(|| ContentError::MissingDecoder(message_type.clone()))?;
        if let Some(existing) = self.type_by_object_name.get(&object_name) {
            if *existing != message_type {
                return Err(ContentError::ObjectNameTaken {
                    object_name,
                    existing: existing.clone(),
                });
            }
        }
        self.insert(ContentDescriptor {
            message_type,
            object_name,
            tag,
            encoder,
            decoder,
        });
        Ok(())
    }

    fn insert(&mut self, descriptor: ContentDescriptor) {
        if let Some(previous) = self.by_type.remove(&descriptor.message_type) {
            self.type_by_object_name.remove(&previous.object_name);
        }
        self.type_by_object_name.insert(
            descriptor.object_name.clone(),
            descriptor.message_type.clone(),
        );
        self.by_type
            .insert(descriptor.message_type.clone(), descriptor);
    }

    pub fn descriptor(&self, message_type: &str) -> Option<&ContentDescriptor> {
        self.by_type.get(message_type)
    }

    pub fn descriptor_for_object_name(&self, object_name: &str) -> Option<&ContentDescriptor> {
        self.type_by_object_name
            .get(object_name)
            .and_then(|message_type| self.by_type.get(message_type))
    }

    pub fn encode(
        &self,
        content: &MessageContent,
    ) -> Result<(ContentDescriptor, Vec<u8>), ContentError> {
        let descriptor = self
            .descriptor(content.message_type())
            .ok_or_else(|| ContentError::Unregistered(content.message_type().to_string()))?;
        let bytes = descriptor.encoder.encode(content)?;
        Ok((descriptor.clone(), bytes))
    }

    /// Never fails: object names without a registration, and bodies the
    /// registered decoder rejects, come back as [`MessageContent::Unknown`].
    pub fn decode(&self, object_name: &str, bytes: &[u8]) -> MessageContent {
        let unknown = || MessageContent::Unknown {
            object_name: object_name.to_string(),
            raw: bytes.to_vec(),
        };
        let Some(descriptor) = self.descriptor_for_object_name(object_name) else {
            return unknown();
        };
        match descriptor.decoder.decode(&descriptor.message_type, bytes) {
            Ok(content) => content,
            Err(err) => {
                warn!(object_name, "content: keeping undecodable body as unknown: {err}");
                unknown()
            }
        }
    }

    pub fn message_from_wire(&self, wire: &WireMessage) -> Message {
        let content = match STANDARD.decode(&wire.content_b64) {
            Ok(bytes) => self.decode(&wire.class_name, &bytes),
            Err(err) => {
                warn!(
                    object_name = %wire.class_name,
                    "content: wire body is not base64: {err}"
                );
                MessageContent::Unknown {
                    object_name: wire.class_name.clone(),
                    raw: wire.content_b64.clone().into_bytes(),
                }
            }
        };
        let received_status = if wire.read {
            ReceivedStatus::Read
        } else {
            ReceivedStatus::Unread
        };
        Message {
            local_id: None,
            key: ConversationKey::new(wire.conversation_type, wire.target_id.clone()),
            sender_user_id: wire.from_user_id.clone(),
            direction: wire.direction,
            content,
            object_name: wire.class_name.clone(),
            sent_status: SentStatus::Sent,
            received_status,
            sent_time: wire.data_time,
            received_time: (wire.direction == MessageDirection::Receive).then_some(wire.data_time),
            server_message_id: wire.message_uid.clone(),
            extra: None,
        }
    }
}
