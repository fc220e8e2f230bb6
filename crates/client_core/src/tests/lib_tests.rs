use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex as StdMutex,
    time::Duration,
};

use async_trait::async_trait;
use axum::{extract::Query, routing::get, Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::json;
use shared::{
    content::MessageContent,
    domain::{GroupDescriptor, Message, MessageDirection},
    protocol::{
        GroupHashRequest, GroupHashResponse, GroupSyncRequest, HistoryRequest, HistoryResponse,
        PublicServiceListResponse, PublishAck, PublishRequest, PullPublicServicesRequest,
        RelationItem, WireMessage,
    },
};
use tokio::{net::TcpListener, sync::oneshot};

use super::*;
use crate::content::MessageTag;

type Reply = Result<Vec<u8>, RemoteError>;

enum Scripted {
    Now(Reply),
    Gated(oneshot::Receiver<Reply>),
}

#[derive(Debug, Clone)]
struct RecordedRequest {
    op: Operation,
    payload: Vec<u8>,
    target: String,
}

struct FakeBridge {
    channel: StdMutex<ChannelState>,
    connect_result: StdMutex<Result<SessionInfo, RemoteError>>,
    scripted: StdMutex<HashMap<Operation, VecDeque<Scripted>>>,
    requests: StdMutex<Vec<RecordedRequest>>,
    listeners: StdMutex<Vec<Listener>>,
}

impl FakeBridge {
    fn new(channel: ChannelState) -> Arc<Self> {
        Arc::new(Self {
            channel: StdMutex::new(channel),
            connect_result: StdMutex::new(Ok(SessionInfo {
                user_id: "alice".into(),
                server_time: 10_000,
            })),
            scripted: StdMutex::new(HashMap::new()),
            requests: StdMutex::new(Vec::new()),
            listeners: StdMutex::new(Vec::new()),
        })
    }

    fn push(&self, op: Operation, scripted: Scripted) {
        self.scripted
            .lock()
            .expect("scripted")
            .entry(op)
            .or_default()
            .push_back(scripted);
    }

    fn reply_json<T: Serialize>(&self, op: Operation, body: &T) {
        let bytes = serde_json::to_vec(body).expect("reply body");
        self.push(op, Scripted::Now(Ok(bytes)));
    }

    fn fail(&self, op: Operation, code: ErrorCode) {
        self.push(
            op,
            Scripted::Now(Err(RemoteError::new(code, "scripted failure"))),
        );
    }

    fn gate(&self, op: Operation) -> oneshot::Sender<Reply> {
        let (tx, rx) = oneshot::channel();
        self.push(op, Scripted::Gated(rx));
        tx
    }

    fn requests_for(&self, op: Operation) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .expect("requests")
            .iter()
            .filter(|request| request.op == op)
            .cloned()
            .collect()
    }

    fn request_count(&self) -> usize {
        self.requests.lock().expect("requests").len()
    }

    fn listener_count(&self) -> usize {
        self.listeners.lock().expect("listeners").len()
    }
}

#[async_trait]
impl Bridge for FakeBridge {
    async fn connect(&self, _app_key: &str, _token: &str) -> Result<SessionInfo, RemoteError> {
        let result = self.connect_result.lock().expect("connect result").clone();
        if result.is_ok() {
            *self.channel.lock().expect("channel") = ChannelState::Connected;
        }
        result
    }

    async fn reconnect(&self) -> Result<SessionInfo, RemoteError> {
        self.connect("", "").await
    }

    async fn disconnect(&self) {
        *self.channel.lock().expect("channel") = ChannelState::Disconnected;
    }

    async fn channel_state(&self) -> ChannelState {
        *self.channel.lock().expect("channel")
    }

    async fn request(
        &self,
        op: Operation,
        payload: Vec<u8>,
        target: &str,
    ) -> Result<Vec<u8>, RemoteError> {
        self.requests.lock().expect("requests").push(RecordedRequest {
            op,
            payload,
            target: target.to_string(),
        });
        let next = self
            .scripted
            .lock()
            .expect("scripted")
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Scripted::Now(reply)) => reply,
            Some(Scripted::Gated(rx)) => rx.await.unwrap_or_else(|_| {
                Err(RemoteError::new(ErrorCode::NetUnavailable, "gate dropped"))
            }),
            None => Err(RemoteError::new(
                ErrorCode::NetUnavailable,
                format!("unscripted {op:?}"),
            )),
        }
    }

    async fn register_listener(&self, listener: Listener) {
        self.listeners.lock().expect("listeners").push(listener);
    }
}

fn test_settings() -> ClientSettings {
    ClientSettings {
        app_key: "test-app".into(),
        ..ClientSettings::default()
    }
}

fn client_with(bridge: Arc<FakeBridge>) -> (Arc<ImClient>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let client = ImClient::new_with_dependencies(&test_settings(), bridge, store.clone());
    (client, store)
}

async fn connected_client() -> (Arc<ImClient>, Arc<FakeBridge>, Arc<MemoryStore>) {
    let bridge = FakeBridge::new(ChannelState::Disconnected);
    let (client, store) = client_with(bridge.clone());
    client.connect("token").await.expect("connect");
    (client, bridge, store)
}

fn ack(uid: &str, timestamp: i64) -> Reply {
    Ok(serde_json::to_vec(&PublishAck {
        message_uid: uid.into(),
        timestamp,
    })
    .expect("ack"))
}

fn wire_text(key: &ConversationKey, text: &str, data_time: i64, uid: &str) -> WireMessage {
    let body = serde_json::to_vec(&json!({ "content": text })).expect("body");
    WireMessage {
        from_user_id: key.target_id.clone(),
        conversation_type: key.conversation_type,
        target_id: key.target_id.clone(),
        class_name: "RC:TxtMsg".into(),
        content_b64: STANDARD.encode(body),
        data_time,
        message_uid: Some(uid.into()),
        direction: MessageDirection::Receive,
        read: false,
    }
}

fn text_of(message: &Message) -> &str {
    match &message.content {
        MessageContent::Text { content, .. } => content,
        other => panic!("expected text content, got {other:?}"),
    }
}

async fn wait_for_requests(bridge: &FakeBridge, op: Operation, count: usize) {
    for _ in 0..200 {
        if bridge.requests_for(op).len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {count} {op:?} requests");
}

fn private(target: &str) -> ConversationKey {
    ConversationKey::new(ConversationType::Private, target)
}

#[tokio::test]
async fn send_text_surfaces_conversation_and_settles_as_sent() {
    let (client, bridge, _) = connected_client().await;
    let gate = bridge.gate(Operation::PublishMessage);

    let sender = Arc::clone(&client);
    let send = tokio::spawn(async move {
        sender
            .send_text(ConversationType::Private, "u1", "hi")
            .await
    });
    wait_for_requests(&bridge, Operation::PublishMessage, 1).await;

    let pending = client
        .get_conversation(&private("u1"))
        .await
        .expect("lookup")
        .expect("conversation created");
    assert_eq!(pending.sent_status, Some(SentStatus::Sending));
    assert!(pending.is_top);
    assert_eq!(pending.unread_message_count, 0);

    gate.send(ack("srv-1", 5_000)).expect("release ack");
    let sent = send.await.expect("join").expect("send succeeds");
    assert_eq!(sent.sent_status, SentStatus::Sent);
    assert_eq!(sent.server_message_id.as_deref(), Some("srv-1"));
    assert_eq!(sent.sent_time, 5_000);

    let conversation = client
        .get_conversation(&private("u1"))
        .await
        .expect("lookup")
        .expect("conversation");
    let latest = conversation.latest_message.expect("latest");
    assert_eq!(text_of(&latest), "hi");
    assert_eq!(latest.sent_status, SentStatus::Sent);
    assert_eq!(conversation.unread_message_count, 0);

    let request = &bridge.requests_for(Operation::PublishMessage)[0];
    assert_eq!(request.target, "u1");
    let publish: PublishRequest = serde_json::from_slice(&request.payload).expect("publish");
    assert_eq!(publish.class_name, "RC:TxtMsg");
    assert_eq!(publish.session_id, 3);
    let body = STANDARD.decode(publish.content_b64).expect("base64");
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&body).expect("json"),
        json!({ "content": "hi" })
    );

    let stored = client
        .fetch_local_history(&private("u1"), None, 20)
        .await
        .expect("local history");
    assert_eq!(stored.messages.len(), 1);
    assert_eq!(stored.messages[0].sent_status, SentStatus::Sent);
}

#[tokio::test]
async fn send_without_channel_fails_fast_and_writes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let client = ImClient::new_with_dependencies(
        &test_settings(),
        Arc::new(MissingBridge),
        store.clone(),
    );

    let err = client
        .send_text(ConversationType::Private, "u1", "hi")
        .await
        .expect_err("no channel");
    assert!(matches!(
        err.error,
        EngineError::TransportUnavailable(ErrorCode::NetUnavailable)
    ));
    assert!(err.message.is_none());
    assert!(client.list_conversations(None).await.is_empty());
    let stored = store
        .get_history_messages(&private("u1"), None, 20)
        .await
        .expect("history");
    assert!(stored.messages.is_empty());
}

#[tokio::test]
async fn send_on_unconnected_channel_reports_timeout_without_request() {
    let bridge = FakeBridge::new(ChannelState::Disconnected);
    let (client, _) = client_with(bridge.clone());

    let err = client
        .send_text(ConversationType::Group, "g1", "hello")
        .await
        .expect_err("not connected");
    assert_eq!(err.error.code(), Some(ErrorCode::Timeout));
    assert_eq!(bridge.request_count(), 0);
    assert!(client.list_conversations(None).await.is_empty());
}

#[tokio::test]
async fn failed_send_keeps_failed_message_as_latest() {
    let (client, bridge, store) = connected_client().await;
    bridge.fail(Operation::PublishMessage, ErrorCode::MessageRejected);

    let err = client
        .send_text(ConversationType::Private, "u2", "lost")
        .await
        .expect_err("rejected");
    assert!(matches!(err.error, EngineError::RemoteRejected(_)));
    let failed = err.message.expect("failed message reported");
    assert_eq!(failed.sent_status, SentStatus::Failed);

    let conversation = client
        .get_conversation(&private("u2"))
        .await
        .expect("lookup")
        .expect("conversation");
    assert_eq!(conversation.sent_status, Some(SentStatus::Failed));
    assert_eq!(
        conversation.latest_message.expect("latest").local_id,
        failed.local_id
    );

    let stored = store
        .get_history_messages(&private("u2"), None, 20)
        .await
        .expect("history");
    assert_eq!(stored.messages[0].sent_status, SentStatus::Failed);
}

async fn race_two_sends(first_settles_last: bool) -> Conversation {
    let (client, bridge, _) = connected_client().await;
    let gate_first = bridge.gate(Operation::PublishMessage);
    let gate_second = bridge.gate(Operation::PublishMessage);

    let sender = Arc::clone(&client);
    let first = tokio::spawn(async move {
        sender
            .send_text(ConversationType::Private, "race", "first")
            .await
    });
    wait_for_requests(&bridge, Operation::PublishMessage, 1).await;
    let sender = Arc::clone(&client);
    let second = tokio::spawn(async move {
        sender
            .send_text(ConversationType::Private, "race", "second")
            .await
    });
    wait_for_requests(&bridge, Operation::PublishMessage, 2).await;

    if first_settles_last {
        gate_second.send(ack("srv-2", 200)).expect("second ack");
        second.await.expect("join").expect("second sent");
        gate_first.send(ack("srv-1", 100)).expect("first ack");
        first.await.expect("join").expect("first sent");
    } else {
        gate_first.send(ack("srv-1", 100)).expect("first ack");
        first.await.expect("join").expect("first sent");
        gate_second.send(ack("srv-2", 200)).expect("second ack");
        second.await.expect("join").expect("second sent");
    }

    client
        .get_conversation(&private("race"))
        .await
        .expect("lookup")
        .expect("conversation")
}

#[tokio::test]
async fn latest_message_follows_last_settled_send() {
    let conversation = race_two_sends(true).await;
    let latest = conversation.latest_message.expect("latest");
    assert_eq!(text_of(&latest), "first");
    assert_eq!(latest.server_message_id.as_deref(), Some("srv-1"));

    let conversation = race_two_sends(false).await;
    let latest = conversation.latest_message.expect("latest");
    assert_eq!(text_of(&latest), "second");
}

#[tokio::test]
async fn oversized_history_page_is_rejected_before_any_request() {
    let (client, bridge, _) = connected_client().await;

    let err = client
        .fetch_remote_history(&private("u1"), None, 25)
        .await
        .expect_err("page too large");
    assert!(matches!(err, EngineError::PreconditionViolation(_)));
    let err = client
        .fetch_local_history(&private("u1"), None, 21)
        .await
        .expect_err("page too large");
    assert!(matches!(err, EngineError::PreconditionViolation(_)));

    let chat_room = ConversationKey::new(ConversationType::ChatRoom, "room");
    let err = client
        .fetch_remote_history(&chat_room, None, 10)
        .await
        .expect_err("no history channel");
    assert!(matches!(err, EngineError::PreconditionViolation(_)));
    assert_eq!(bridge.request_count(), 0);
}

#[tokio::test]
async fn remote_history_is_ascending_and_watermark_never_regresses() {
    let (client, bridge, store) = connected_client().await;
    let key = ConversationKey::new(ConversationType::Group, "g1");
    bridge.reply_json(
        Operation::QueryGroupHistory,
        &HistoryResponse {
            list: vec![
                wire_text(&key, "c", 300, "m3"),
                wire_text(&key, "b", 200, "m2"),
                wire_text(&key, "a", 100, "m1"),
            ],
            sync_time: 300,
            has_msg: true,
        },
    );
    bridge.reply_json(
        Operation::QueryGroupHistory,
        &HistoryResponse {
            list: vec![wire_text(&key, "z", 50, "m0")],
            sync_time: 250,
            has_msg: false,
        },
    );
    bridge.reply_json(
        Operation::QueryGroupHistory,
        &HistoryResponse {
            list: Vec::new(),
            sync_time: 10,
            has_msg: false,
        },
    );

    let page = client
        .fetch_remote_history(&key, None, 3)
        .await
        .expect("page");
    let times: Vec<_> = page.messages.iter().map(|m| m.sent_time).collect();
    assert_eq!(times, vec![100, 200, 300]);
    assert!(page.has_more);
    assert!(page.messages.iter().all(|m| m.local_id.is_some()));
    assert_eq!(client.history_watermark(&key).await, Some(300));

    let page = client
        .fetch_remote_history(&key, None, 3)
        .await
        .expect("page");
    assert_eq!(page.messages.len(), 1);
    assert!(!page.has_more);
    assert_eq!(client.history_watermark(&key).await, Some(300));

    client
        .fetch_remote_history(&key, Some(42), 3)
        .await
        .expect("explicit cursor");

    let cursors: Vec<i64> = bridge
        .requests_for(Operation::QueryGroupHistory)
        .iter()
        .map(|request| {
            serde_json::from_slice::<HistoryRequest>(&request.payload)
                .expect("history request")
                .data_time
        })
        .collect();
    assert_eq!(cursors, vec![0, 300, 42]);

    let stored = store
        .get_history_messages(&key, None, 20)
        .await
        .expect("stored history");
    assert_eq!(stored.messages.len(), 4);
}

#[tokio::test]
async fn failed_remote_history_reads_as_exhausted() {
    let (client, bridge, _) = connected_client().await;
    bridge.fail(Operation::QueryPrivateHistory, ErrorCode::Timeout);

    let page = client
        .fetch_remote_history(&private("u1"), None, 20)
        .await
        .expect("degrades to empty page");
    assert!(page.messages.is_empty());
    assert!(!page.has_more);
    assert_eq!(client.history_watermark(&private("u1")).await, None);
}

fn groups(ids: &[&str]) -> Vec<GroupDescriptor> {
    ids.iter()
        .map(|id| GroupDescriptor::new(*id, format!("group {id}")))
        .collect()
}

#[tokio::test]
async fn roster_sync_pushes_only_on_mismatch() {
    let (client, bridge, _) = connected_client().await;
    bridge.reply_json(Operation::GroupHashCheck, &GroupHashResponse { result: 0 });
    bridge.reply_json(Operation::GroupHashCheck, &GroupHashResponse { result: 0 });
    bridge.reply_json(Operation::GroupHashCheck, &GroupHashResponse { result: 1 });
    bridge.reply_json(Operation::GroupSync, &json!({}));

    let matching = groups(&["a", "b", "c"]);
    assert_eq!(
        client.sync_groups(&matching).await.expect("first sync"),
        RosterSyncOutcome::Unchanged
    );
    assert_eq!(
        client.sync_groups(&matching).await.expect("second sync"),
        RosterSyncOutcome::Unchanged
    );
    assert!(bridge.requests_for(Operation::GroupSync).is_empty());

    let mut changed = groups(&["a", "b", "d"]);
    changed.push(GroupDescriptor::new("a", "duplicate"));
    assert_eq!(
        client.sync_groups(&changed).await.expect("third sync"),
        RosterSyncOutcome::Pushed { groups: 3 }
    );

    let checks = bridge.requests_for(Operation::GroupHashCheck);
    assert_eq!(checks.len(), 3);
    let first: GroupHashRequest = serde_json::from_slice(&checks[0].payload).expect("check");
    assert_eq!(first.user_id, "alice");
    assert_eq!(first.group_hash_code, roster_fingerprint(&matching));

    let pushes = bridge.requests_for(Operation::GroupSync);
    assert_eq!(pushes.len(), 1);
    let pushed: GroupSyncRequest = serde_json::from_slice(&pushes[0].payload).expect("push");
    let ids: Vec<_> = pushed.groups.iter().map(|g| g.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "d"]);
    assert_eq!(pushed.groups[0].name, "group a");
}

#[tokio::test]
async fn roster_failures_surface_as_sync_failure() {
    let (client, bridge, _) = connected_client().await;
    bridge.fail(Operation::GroupHashCheck, ErrorCode::Timeout);
    let err = client
        .sync_groups(&groups(&["a"]))
        .await
        .expect_err("check fails");
    assert!(matches!(err, EngineError::RosterSyncFailed(_)));
    assert_eq!(err.code(), Some(ErrorCode::GroupSyncError));

    bridge.reply_json(Operation::GroupHashCheck, &GroupHashResponse { result: 1 });
    bridge.fail(Operation::GroupSync, ErrorCode::Timeout);
    let err = client
        .sync_groups(&groups(&["a"]))
        .await
        .expect_err("push fails");
    assert_eq!(err.code(), Some(ErrorCode::GroupMatchError));
}

#[tokio::test]
async fn roster_sync_requires_a_session() {
    let bridge = FakeBridge::new(ChannelState::Connected);
    let (client, _) = client_with(bridge.clone());

    let err = client
        .sync_groups(&groups(&["a"]))
        .await
        .expect_err("no session");
    assert!(matches!(err, EngineError::TransportUnavailable(_)));
    assert_eq!(bridge.request_count(), 0);
}

struct NoopListener;

impl ConnectionStatusListener for NoopListener {
    fn on_changed(&self, _status: ConnectionStatus) {}
}

impl ReceiveMessageListener for NoopListener {
    fn on_received(&self, _message: WireMessage) {}
}

#[tokio::test]
async fn queued_listeners_flush_exactly_once_on_connect() {
    let bridge = FakeBridge::new(ChannelState::Disconnected);
    let (client, _) = client_with(bridge.clone());

    client
        .set_connection_status_listener(Arc::new(NoopListener))
        .await;
    client
        .set_receive_message_listener(Arc::new(NoopListener))
        .await;
    assert_eq!(bridge.listener_count(), 0);

    client.connect("token").await.expect("connect");
    assert_eq!(bridge.listener_count(), 2);

    client.reconnect().await.expect("reconnect");
    client.connect("token").await.expect("connect again");
    assert_eq!(bridge.listener_count(), 2);

    client
        .set_receive_message_listener(Arc::new(NoopListener))
        .await;
    assert_eq!(bridge.listener_count(), 3);
}

#[tokio::test]
async fn connect_maps_token_rejection() {
    let bridge = FakeBridge::new(ChannelState::Disconnected);
    *bridge.connect_result.lock().expect("connect result") = Err(RemoteError::new(
        ErrorCode::TokenIncorrect,
        "expired",
    ));
    let (client, _) = client_with(bridge.clone());

    let err = client.connect("stale").await.expect_err("rejected");
    assert!(matches!(err, ConnectError::TokenIncorrect));
    assert_eq!(client.current_user_id().await, None);
    assert_eq!(client.connection_status().await, ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn connect_records_session_and_logout_keeps_cache() {
    let (client, _, _) = connected_client().await;
    assert_eq!(client.current_user_id().await.as_deref(), Some("alice"));
    assert_eq!(client.connection_status().await, ConnectionStatus::Connected);
    client
        .create_conversation(private("kept"), "Kept")
        .await;

    client.logout().await;
    assert_eq!(client.current_user_id().await, None);
    assert_eq!(client.connection_status().await, ConnectionStatus::Disconnected);
    assert_eq!(client.list_conversations(None).await.len(), 1);
}

#[tokio::test]
async fn remote_conversation_merge_preserves_existing_unread_counts() {
    let (client, bridge, store) = connected_client().await;
    let mut known = Conversation::new(private("bob"), "");
    known.unread_message_count = 3;
    store.add_conversation(&known).await.expect("seed");

    let group = ConversationKey::new(ConversationType::Group, "g1");
    bridge.reply_json(
        Operation::GetConversationList,
        &json!({
            "info": [
                RelationItem {
                    conversation_type: ConversationType::Private,
                    target_id: "bob".into(),
                    latest_message: wire_text(&private("bob"), "yo", 700, "r1"),
                },
                RelationItem {
                    conversation_type: ConversationType::Group,
                    target_id: "g1".into(),
                    latest_message: wire_text(&group, "hey", 900, "r2"),
                },
            ]
        }),
    );
    bridge.reply_json(
        Operation::GetUserInfo,
        &UserInfo {
            user_id: "bob".into(),
            name: "Bob".into(),
            portrait_uri: None,
        },
    );

    let merged = client.fetch_remote_conversations(None).await;
    let order: Vec<_> = merged.iter().map(|c| c.key.target_id.as_str()).collect();
    assert_eq!(order, vec!["g1", "bob"]);
    assert_eq!(merged[1].unread_message_count, 3);
    assert_eq!(merged[0].unread_message_count, 0);
    assert_eq!(bridge.requests_for(Operation::GetConversationList)[0].target, "alice");

    for _ in 0..200 {
        let title = client
            .get_conversation(&private("bob"))
            .await
            .expect("lookup")
            .map(|c| c.title);
        if title.as_deref() == Some("Bob") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let bob = client
        .get_conversation(&private("bob"))
        .await
        .expect("lookup")
        .expect("bob");
    assert_eq!(bob.title, "Bob");
    assert_eq!(bob.sender_user_name.as_deref(), Some("Bob"));
    assert!(bridge.requests_for(Operation::GetDiscussion).is_empty());

    let groups_only = client
        .fetch_remote_conversations(Some(&[ConversationType::Group]))
        .await;
    assert!(groups_only.is_empty(), "failed pull reports no conversations");
}

#[tokio::test]
async fn remove_conversation_requires_remote_success() {
    let (client, bridge, store) = connected_client().await;
    client.create_conversation(private("bob"), "Bob").await;

    bridge.fail(Operation::RemoveConversation, ErrorCode::NotAuthorized);
    let err = client
        .remove_conversation(&private("bob"))
        .await
        .expect_err("remote refusal");
    assert_eq!(err.code(), Some(ErrorCode::ConversationRemoveError));
    assert_eq!(client.list_conversations(None).await.len(), 1);

    bridge.reply_json(Operation::RemoveConversation, &json!({}));
    client
        .remove_conversation(&private("bob"))
        .await
        .expect("removed");
    assert!(client.list_conversations(None).await.is_empty());
    assert!(store
        .get_conversation(&private("bob"))
        .await
        .expect("lookup")
        .is_none());
}

#[tokio::test]
async fn pin_unpin_and_clear_conversations() {
    let (client, _, store) = connected_client().await;
    client.create_conversation(private("a"), "A").await;
    client.create_conversation(private("b"), "B").await;
    client
        .create_conversation(ConversationKey::new(ConversationType::Group, "g"), "G")
        .await;

    assert!(client.pin(&private("b")).await.expect("pin"));
    let listed = client.list_conversations(None).await;
    assert_eq!(listed[0].key.target_id, "b");
    assert!(listed[0].is_top);
    assert!(
        store
            .get_conversation(&private("b"))
            .await
            .expect("lookup")
            .expect("stored")
            .is_top
    );

    assert!(client.unpin(&private("b")).await.expect("unpin"));
    assert!(!client
        .get_conversation(&private("b"))
        .await
        .expect("lookup")
        .expect("b")
        .is_top);

    client
        .clear_conversations(Some(&[ConversationType::Private]))
        .await
        .expect("clear private");
    let remaining = client.list_conversations(None).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].key.conversation_type, ConversationType::Group);

    client.clear_conversations(None).await.expect("clear all");
    assert!(client.list_conversations(None).await.is_empty());
}

#[tokio::test]
async fn unread_counts_read_from_store_and_clear_resets_cache() {
    let (client, _, store) = connected_client().await;
    let mut bob = Conversation::new(private("bob"), "Bob");
    bob.unread_message_count = 2;
    let mut group = Conversation::new(ConversationKey::new(ConversationType::Group, "g"), "G");
    group.unread_message_count = 5;
    store.add_conversation(&bob).await.expect("bob");
    store.add_conversation(&group).await.expect("group");

    assert_eq!(client.get_total_unread_count().await.expect("total"), 7);
    assert_eq!(
        client
            .get_conversation_unread_count(&[ConversationType::Group])
            .await
            .expect("by type"),
        5
    );
    assert_eq!(client.get_unread_count(&private("bob")).await.expect("bob"), 2);

    client.list_conversations(None).await;
    assert!(client.clear_unread_count(&private("bob")).await.expect("clear"));
    assert_eq!(client.get_unread_count(&private("bob")).await.expect("bob"), 0);
    let cached = client
        .get_conversation(&private("bob"))
        .await
        .expect("lookup")
        .expect("bob");
    assert_eq!(cached.unread_message_count, 0);
}

#[tokio::test]
async fn insert_local_sets_direction_from_sender() {
    let (client, bridge, _) = connected_client().await;

    let own = client
        .insert_local(private("bob"), "alice", MessageContent::text("note"))
        .await
        .expect("own");
    assert_eq!(own.direction, MessageDirection::Send);
    assert_eq!(own.object_name, "RC:TxtMsg");

    let theirs = client
        .insert_local(private("bob"), "bob", MessageContent::text("reply"))
        .await
        .expect("theirs");
    assert_eq!(theirs.direction, MessageDirection::Receive);
    assert!(theirs.local_id.is_some());
    assert_eq!(bridge.request_count(), 0);

    let err = client
        .insert_local(
            private("bob"),
            "bob",
            MessageContent::custom("NeverRegistered", json!({})),
        )
        .await
        .expect_err("unregistered");
    assert!(matches!(err, EngineError::PreconditionViolation(_)));
}

#[tokio::test]
async fn message_store_passthroughs_update_records() {
    let (client, _, store) = connected_client().await;
    let message = client
        .insert_local(private("bob"), "bob", MessageContent::text("one"))
        .await
        .expect("insert");
    let id = message.local_id.expect("local id");

    assert!(client
        .set_message_received_status(id, ReceivedStatus::Read)
        .await
        .expect("received status"));
    assert!(client
        .set_message_extra(id, "starred")
        .await
        .expect("extra"));
    assert!(client
        .set_message_sent_status(id, SentStatus::Canceled)
        .await
        .expect("sent status"));

    let page = store
        .get_history_messages(&private("bob"), None, 20)
        .await
        .expect("history");
    assert_eq!(page.messages[0].received_status, ReceivedStatus::Read);
    assert_eq!(page.messages[0].extra.as_deref(), Some("starred"));
    assert_eq!(page.messages[0].sent_status, SentStatus::Canceled);

    client
        .delete_messages(&private("bob"), &[id])
        .await
        .expect("delete");
    client
        .insert_local(private("bob"), "bob", MessageContent::text("two"))
        .await
        .expect("insert");
    client.clear_messages(&private("bob")).await.expect("clear");
    let page = store
        .get_history_messages(&private("bob"), None, 20)
        .await
        .expect("history");
    assert!(page.messages.is_empty());
}

#[tokio::test]
async fn resend_submits_a_new_message() {
    let (client, bridge, _) = connected_client().await;
    bridge.fail(Operation::PublishMessage, ErrorCode::Timeout);
    let failed = client
        .send_text(ConversationType::Private, "bob", "again")
        .await
        .expect_err("first attempt fails")
        .message
        .expect("failed message");

    bridge.push(Operation::PublishMessage, Scripted::Now(ack("srv-9", 9_000)));
    let resent = client.resend(failed.clone()).await.expect("resend");
    assert_ne!(resent.local_id, failed.local_id);
    assert_eq!(resent.sent_status, SentStatus::Sent);
    assert_eq!(bridge.requests_for(Operation::PublishMessage).len(), 2);
}

#[tokio::test]
async fn registered_content_type_sends_with_its_object_name() {
    let (client, bridge, _) = connected_client().await;

    let mut incomplete =
        ContentTypeRegistration::json("CardMessage", "App:Card", MessageTag::new(true, false));
    incomplete.encoder = None;
    assert!(client.register_message_type(incomplete).await.is_err());

    client
        .register_message_type(ContentTypeRegistration::json(
            "CardMessage",
            "App:Card",
            MessageTag::new(true, false),
        ))
        .await
        .expect("register");
    bridge.push(Operation::PublishMessage, Scripted::Now(ack("srv-c", 1)));

    client
        .send_message(
            ConversationType::Private,
            "bob",
            MessageContent::custom("CardMessage", json!({ "title": "hello" })),
        )
        .await
        .expect("send card");
    let publish: PublishRequest = serde_json::from_slice(
        &bridge.requests_for(Operation::PublishMessage)[0].payload,
    )
    .expect("publish");
    assert_eq!(publish.class_name, "App:Card");
    assert_eq!(publish.session_id, 1);
}

#[tokio::test]
async fn public_service_refresh_uses_forward_watermark() {
    let (client, bridge, _) = connected_client().await;
    let profile = PublicServiceProfile {
        conversation_type: ConversationType::AppPublicService,
        public_service_id: "news".into(),
        name: "News".into(),
        introduction: None,
        portrait_uri: None,
    };
    bridge.reply_json(
        Operation::PullPublicServices,
        &PublicServiceListResponse {
            items: vec![profile.clone()],
            sync_time: Some(900),
        },
    );
    bridge.fail(Operation::PullPublicServices, ErrorCode::Timeout);

    let listed = client.refresh_public_services(false).await;
    assert_eq!(listed, vec![profile.clone()]);
    let kept = client.refresh_public_services(true).await;
    assert_eq!(kept, vec![profile.clone()]);
    assert_eq!(
        client
            .public_service_profile(ConversationType::AppPublicService, "news")
            .await,
        Some(profile)
    );

    let times: Vec<i64> = bridge
        .requests_for(Operation::PullPublicServices)
        .iter()
        .map(|request| {
            serde_json::from_slice::<PullPublicServicesRequest>(&request.payload)
                .expect("pull request")
                .time
        })
        .collect();
    assert_eq!(times, vec![0, 900]);
}

async fn exist_handler(Query(params): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
    let has_unread = params.get("appKey").map(String::as_str) == Some("test-app")
        && params.get("token").map(String::as_str) == Some("tok-1");
    let status = if has_unread { "1" } else { "0" };
    Json(json!({ "status": status }))
}

async fn spawn_probe_server() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/message/exist.json", get(exist_handler));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn unread_probe_queries_http_api() {
    let api_base_url = spawn_probe_server().await;
    let settings = ClientSettings {
        api_base_url,
        ..test_settings()
    };
    let client = ImClient::new(&settings);

    assert!(client
        .has_remote_unread_messages("tok-1")
        .await
        .expect("probe"));
    assert!(!client
        .has_remote_unread_messages("other")
        .await
        .expect("probe"));
}

#[tokio::test]
async fn unread_probe_failure_is_remote_rejected() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let settings = ClientSettings {
        api_base_url: "http://127.0.0.1:9".into(),
        ..test_settings()
    };
    let client = ImClient::new(&settings);
    let err = client
        .has_remote_unread_messages("tok-1")
        .await
        .expect_err("unreachable");
    assert_eq!(err.code(), Some(ErrorCode::Unknown));
}

#[tokio::test]
async fn durable_store_backs_send_and_conversation_reload() {
    let store = DurableLocalStore::initialize("sqlite::memory:")
        .await
        .expect("durable store");
    let bridge = FakeBridge::new(ChannelState::Disconnected);
    let client = ImClient::new_with_dependencies(&test_settings(), bridge.clone(), store.clone());
    client.connect("token").await.expect("connect");
    bridge.push(Operation::PublishMessage, Scripted::Now(ack("srv-d", 3_000)));

    client
        .send_text(ConversationType::Group, "g1", "persisted")
        .await
        .expect("send");

    let key = ConversationKey::new(ConversationType::Group, "g1");
    let page = client
        .fetch_local_history(&key, None, 20)
        .await
        .expect("local history");
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].server_message_id.as_deref(), Some("srv-d"));

    let reloaded = ImClient::new_with_dependencies(&test_settings(), bridge, store);
    let listed = reloaded.list_conversations(None).await;
    assert_eq!(listed.len(), 1);
    assert!(listed[0].is_top);
    assert_eq!(listed[0].sent_status, Some(SentStatus::Sent));
}

#[tokio::test]
async fn from_settings_opens_file_database_in_missing_directory() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let root = std::env::temp_dir().join(format!("imsync_client_db_{suffix}"));
    let db_path = root.join("nested").join("imsync.db");
    let settings = ClientSettings {
        database_url: format!("sqlite:{}", db_path.to_string_lossy().replace('\\', "/")),
        ..test_settings()
    };

    let client = ImClient::from_settings(&settings).await.expect("client");
    assert!(client.list_conversations(None).await.is_empty());
    assert!(db_path.exists());

    drop(client);
    std::fs::remove_dir_all(root).expect("cleanup");
}
