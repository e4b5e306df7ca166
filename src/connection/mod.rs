//! The Session Manager (§4.E): owns the WebSocket, the reconnect loop, the
//! pending-call registries, the active-subscription registry, and a handle
//! to the [`ClientCache`].
//!
//! Grounded in `crates/client-sdk/src/background_connection.rs` (the
//! overall task/channel shape) and `crates/client-sdk/src/websocket.rs` (URL
//! construction and the `tokio::select!` read/write loop).

mod pending;

pub use pending::{PendingCall, PendingRegistry};

use crate::bsatn;
use crate::cache::ClientCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::identity::{ConnectionId, Identity};
use crate::protocol::{
    self, CallReducer, CallReducerFlags, ClientMessage, OneOffQuery, ServerMessage, Subscribe, SubscribeApplied,
    SubscribeMulti, SubscribeMultiApplied, SubscribeSingle, Unsubscribe, UnsubscribeApplied, UnsubscribeMulti,
    UnsubscribeMultiApplied,
};
use futures::{SinkExt, StreamExt};
use http::Uri;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

const PROTOCOL_HEADER_VALUE: &str = "v1.bin.streamdb";

/// Where the session currently is in the lifecycle of §4.E's state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { identity: Identity, connection_id: ConnectionId },
    Reconnecting(u32),
}

/// An opaque handle to an active subscription. Carries a `QueryId` for
/// single/multi subscriptions; batch subscriptions (`subscribe`) carry none.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

enum SubscriptionEntry {
    Batch { queries: Vec<String> },
    Single { query: String, query_id: u32 },
    Multi { queries: Vec<String>, query_id: u32 },
}

impl SubscriptionEntry {
    fn queries(&self) -> Vec<String> {
        match self {
            SubscriptionEntry::Batch { queries } | SubscriptionEntry::Multi { queries, .. } => queries.clone(),
            SubscriptionEntry::Single { query, .. } => vec![query.clone()],
        }
    }

    fn query_id(&self) -> Option<u32> {
        match self {
            SubscriptionEntry::Batch { .. } => None,
            SubscriptionEntry::Single { query_id, .. } | SubscriptionEntry::Multi { query_id, .. } => Some(*query_id),
        }
    }
}

type Callback<T> = Box<dyn Fn(T) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_identity: Vec<Callback<(Identity, ConnectionId)>>,
    on_connect: Vec<Callback<()>>,
    on_disconnect: Vec<Callback<Option<Error>>>,
}

struct Shared {
    uri: Uri,
    token: StdMutex<Option<String>>,
    config: Config,
    cache: ClientCache,
    state: AsyncMutex<ConnectionState>,
    pending: AsyncMutex<PendingRegistry>,
    subscriptions: StdMutex<HashMap<u64, SubscriptionEntry>>,
    next_handle: AtomicU32,
    outbound: AsyncMutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    task: StdMutex<Option<JoinHandle<()>>>,
    callbacks: StdMutex<Callbacks>,
}

/// A handle to one client session. Cheap to clone; clones share the
/// underlying connection.
#[derive(Clone)]
pub struct DbConnection {
    shared: Arc<Shared>,
}

fn build_uri(host: &str, module_name: &str) -> Result<Uri> {
    if host.contains("/database/subscribe/") {
        return host.parse().map_err(|e| Error::connection_failed(format!("invalid uri: {e}")));
    }
    let mut base = host.trim_end_matches('/').to_string();
    if !base.starts_with("ws://") && !base.starts_with("wss://") {
        base = format!("ws://{base}");
    }
    format!("{base}/database/subscribe/{module_name}")
        .parse()
        .map_err(|e| Error::connection_failed(format!("invalid uri: {e}")))
}

/// Assembles a [`Config`] and connection target before `build()`.
pub struct DbConnectionBuilder {
    host: Option<String>,
    module_name: Option<String>,
    token: Option<String>,
    config: Config,
    callbacks: Callbacks,
}

impl Default for DbConnectionBuilder {
    fn default() -> Self {
        DbConnectionBuilder {
            host: None,
            module_name: None,
            token: None,
            config: Config::default(),
            callbacks: Callbacks::default(),
        }
    }
}

impl DbConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_uri(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_module_name(mut self, name: impl Into<String>) -> Self {
        self.module_name = Some(name.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn on_identity(mut self, f: impl Fn(Identity, ConnectionId) + Send + Sync + 'static) -> Self {
        self.callbacks.on_identity.push(Box::new(move |(id, conn)| f(id, conn)));
        self
    }

    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_connect.push(Box::new(move |()| f()));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn(Option<Error>) + Send + Sync + 'static) -> Self {
        self.callbacks.on_disconnect.push(Box::new(f));
        self
    }

    /// Build the connection. If `config.auto_connect`, immediately starts
    /// connecting in the background; otherwise the caller must invoke
    /// [`DbConnection::connect`].
    pub async fn build(self) -> Result<DbConnection> {
        let host = self.host.ok_or_else(|| Error::BuilderMissingConfiguration { field: "uri".into() })?;
        let module_name = self
            .module_name
            .ok_or_else(|| Error::BuilderMissingConfiguration { field: "module_name".into() })?;
        let uri = build_uri(&host, &module_name)?;

        let shared = Arc::new(Shared {
            uri,
            token: StdMutex::new(self.token),
            config: self.config,
            cache: ClientCache::new(),
            state: AsyncMutex::new(ConnectionState::Disconnected),
            pending: AsyncMutex::new(PendingRegistry::new()),
            subscriptions: StdMutex::new(HashMap::new()),
            next_handle: AtomicU32::new(0),
            outbound: AsyncMutex::new(None),
            task: StdMutex::new(None),
            callbacks: StdMutex::new(self.callbacks),
        });
        let conn = DbConnection { shared };
        if conn.shared.config.auto_connect {
            conn.connect().await?;
        }
        Ok(conn)
    }
}

impl DbConnection {
    pub fn builder() -> DbConnectionBuilder {
        DbConnectionBuilder::new()
    }

    pub fn cache(&self) -> &ClientCache {
        &self.shared.cache
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.state.lock().await.clone()
    }

    /// Open the WebSocket and complete the handshake. Transitions to
    /// `Connecting`, then `Connected` only once `IdentityToken` arrives.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().await;
            *state = ConnectionState::Connecting;
        }
        crate::metrics::CONNECTION_STATE.set(1);
        self.open_and_spawn(0).await
    }

    /// Attempt the handshake for connection attempt `attempt`. On the
    /// initial connect (`attempt == 0`, i.e. not part of the reconnect
    /// loop in [`on_receive_loop_terminated`]), any failure here terminates
    /// the session the same way a later socket error would: state resets to
    /// `Disconnected` and the disconnect callback fires, since no
    /// receive-loop task was ever spawned to do that for us (§4.E's
    /// terminal-Disconnected contract). Reconnect-loop attempts (`attempt >
    /// 0`) leave state/callback handling to their caller, which only
    /// transitions to `Disconnected` once every attempt is exhausted.
    async fn open_and_spawn(&self, attempt: u32) -> Result<()> {
        match self.try_open_and_spawn(attempt).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if attempt == 0 {
                    *self.shared.state.lock().await = ConnectionState::Disconnected;
                    crate::metrics::CONNECTION_STATE.set(0);
                    let callbacks = self.shared.callbacks.lock().unwrap();
                    for cb in &callbacks.on_disconnect {
                        cb(Some(Error::connection_failed(e.to_string())));
                    }
                }
                Err(e)
            }
        }
    }

    async fn try_open_and_spawn(&self, attempt: u32) -> Result<()> {
        let mut req = self
            .shared
            .uri
            .clone()
            .into_client_request()
            .map_err(|e| Error::connection_failed(e))?;
        req.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            http::HeaderValue::from_static(PROTOCOL_HEADER_VALUE),
        );
        if let Some(token) = self.shared.token.lock().unwrap().clone() {
            let value = format!("Bearer {token}");
            if let Ok(header) = http::HeaderValue::from_str(&value) {
                req.headers_mut().insert("Authorization", header);
            }
        }

        let (stream, _) = tokio::time::timeout(self.shared.config.connection_timeout, tokio_tungstenite::connect_async(req))
            .await
            .map_err(|_| Error::connection_failed("connection attempt timed out"))?
            .map_err(|e| Error::connection_failed(e))?;
        let (mut write, mut read) = stream.split();

        // Handshake: the first frame MUST be IdentityToken.
        let first = read.next().await.ok_or_else(|| Error::connection_failed("socket closed before handshake"))?;
        let first = first.map_err(|e| Error::connection_failed(e))?;
        let frame_bytes = match first {
            WsMessage::Binary(b) => b,
            WsMessage::Text(t) => t.into_bytes(),
            other => return Err(Error::connection_failed(format!("unexpected handshake frame {other:?}"))),
        };
        let msg = decode_server_message(&frame_bytes)
            .map_err(|e| Error::connection_failed(format!("handshake decode failed: {e}")))?;
        let ServerMessage::IdentityToken(ident) = msg else {
            return Err(Error::connection_failed("first frame was not IdentityToken"));
        };

        *self.shared.token.lock().unwrap() = Some(ident.token.clone());
        {
            let mut state = self.shared.state.lock().await;
            *state = ConnectionState::Connected {
                identity: ident.identity,
                connection_id: ident.connection_id,
            };
        }
        crate::metrics::CONNECTION_STATE.set(2);

        {
            let callbacks = self.shared.callbacks.lock().unwrap();
            for cb in &callbacks.on_identity {
                cb((ident.identity, ident.connection_id));
            }
            for cb in &callbacks.on_connect {
                cb(());
            }
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.shared.outbound.lock().await = Some(outbound_tx);

        // Replay active subscriptions after a reconnect (§4.E step 4, §8 property 10).
        if attempt > 0 {
            self.replay_subscriptions().await;
        }

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let ping_interval = shared.config.ping_interval;
            let mut ping_timer = ping_interval
                .map(|dur| tokio::time::interval_at(tokio::time::Instant::now() + dur, dur));

            loop {
                let result = if let Some(timer) = ping_timer.as_mut() {
                    tokio::select! {
                        frame = read.next() => Either::Frame(frame),
                        outgoing = outbound_rx.recv() => Either::Outgoing(outgoing),
                        _ = timer.tick() => Either::Ping,
                    }
                } else {
                    tokio::select! {
                        frame = read.next() => Either::Frame(frame),
                        outgoing = outbound_rx.recv() => Either::Outgoing(outgoing),
                    }
                };

                match result {
                    Either::Frame(None) => {
                        log::warn!("session receive loop ended: socket closed");
                        break;
                    }
                    Either::Frame(Some(Err(e))) => {
                        log::warn!("session receive loop ended: {e}");
                        break;
                    }
                    Either::Frame(Some(Ok(WsMessage::Binary(bytes)))) => {
                        match decode_server_message(&bytes) {
                            Ok(msg) => dispatch_server_message(&shared, msg).await,
                            Err(e) => {
                                // A malformed frame (bad compression tag, truncated
                                // data, bad UTF-8) is a protocol/codec error, not a
                                // per-delta one: it is non-recoverable on this
                                // session and must terminate the receive loop (§7).
                                log::error!("terminating receive loop: undecodable server frame: {e}");
                                break;
                            }
                        }
                    }
                    Either::Frame(Some(Ok(WsMessage::Text(text)))) => {
                        match decode_server_message(text.as_bytes()) {
                            Ok(msg) => dispatch_server_message(&shared, msg).await,
                            Err(e) => {
                                log::error!("terminating receive loop: undecodable server frame: {e}");
                                break;
                            }
                        }
                    }
                    Either::Frame(Some(Ok(WsMessage::Ping(payload)))) => {
                        if write.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Either::Frame(Some(Ok(WsMessage::Close(_)))) => {
                        log::info!("server closed the session");
                        break;
                    }
                    Either::Frame(Some(Ok(_))) => {}
                    Either::Outgoing(None) => break,
                    Either::Outgoing(Some(msg)) => {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Either::Ping => {
                        if write.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                            log::warn!("keep-alive ping failed, triggering reconnect");
                            break;
                        }
                    }
                }
            }

            on_receive_loop_terminated(shared).await;
        });

        *self.shared.task.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn replay_subscriptions(&self) {
        let queries: Vec<String> = {
            let subs = self.shared.subscriptions.lock().unwrap();
            let mut all = Vec::new();
            for entry in subs.values() {
                all.extend(entry.queries());
            }
            all
        };
        if queries.is_empty() {
            return;
        }
        let request_id = {
            let mut pending = self.shared.pending.lock().await;
            pending.next_request_id()
        };
        let _ = self
            .send(ClientMessage::Subscribe(Subscribe { queries, request_id }))
            .await;
    }

    async fn send(&self, msg: ClientMessage) -> Result<()> {
        let guard = self.shared.outbound.lock().await;
        let sender = guard.as_ref().ok_or(Error::NotConnected)?;
        let bytes = bsatn::to_vec(&msg).map_err(|e| Error::connection_failed(e))?;
        sender
            .send(WsMessage::Binary(bytes.into()))
            .map_err(|_| Error::NotConnected)
    }

    pub async fn call_reducer(&self, name: &str, args: impl Into<bytes::Bytes>) -> Result<protocol::TransactionUpdate> {
        let (tx, rx) = oneshot::channel();
        let request_id = {
            let mut pending = self.shared.pending.lock().await;
            let id = pending.next_request_id();
            pending.insert(id, PendingCall::Reducer(tx));
            id
        };
        self.send(ClientMessage::CallReducer(CallReducer {
            name: name.to_string(),
            args: args.into(),
            request_id,
            flags: CallReducerFlags::FullUpdate,
        }))
        .await?;

        let timeout = self.shared.config.reducer_call_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.shared.pending.lock().await.remove(request_id);
                Err(Error::reducer_timeout(name, timeout))
            }
        }
    }

    pub async fn call_procedure(&self, name: &str, args: impl Into<bytes::Bytes>) -> Result<protocol::ProcedureResult> {
        let (tx, rx) = oneshot::channel();
        let request_id = {
            let mut pending = self.shared.pending.lock().await;
            let id = pending.next_request_id();
            pending.insert(id, PendingCall::Procedure(tx, name.to_string()));
            id
        };
        self.send(ClientMessage::CallProcedure(protocol::CallProcedure {
            name: name.to_string(),
            args: args.into(),
            request_id,
            flags: CallReducerFlags::FullUpdate,
        }))
        .await?;

        let timeout = self.shared.config.reducer_call_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.shared.pending.lock().await.remove(request_id);
                Err(Error::reducer_timeout(name, timeout))
            }
        }
    }

    /// Run a one-off SQL query against the current database state, with no
    /// subscription created. Correlated by a caller-chosen `message_id`
    /// rather than the `request_id` used by every other request (§4.B).
    pub async fn one_off_query(&self, query: &str) -> Result<protocol::OneOffQueryResponse> {
        let (tx, rx) = oneshot::channel();
        let message_id = {
            let mut pending = self.shared.pending.lock().await;
            let id = pending.next_message_id();
            pending.insert_one_off(id.clone(), tx);
            id
        };
        self.send(ClientMessage::OneOffQuery(OneOffQuery {
            message_id,
            query: query.to_string(),
        }))
        .await?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Batch-subscribe, replacing the full server-side query set. The
    /// returned handle carries no `QueryId`. Resolves once the server
    /// confirms with `InitialSubscription`.
    pub async fn subscribe(&self, queries: &[&str]) -> Result<SubscriptionHandle> {
        let queries: Vec<String> = queries.iter().map(|s| s.to_string()).collect();
        let (request_id, rx) = self.register_pending_subscription().await;
        self.send(ClientMessage::Subscribe(Subscribe { queries: queries.clone(), request_id }))
            .await?;
        self.await_subscription(rx).await?;
        Ok(self.register_subscription(SubscriptionEntry::Batch { queries }))
    }

    pub async fn subscribe_single(&self, query: &str) -> Result<SubscriptionHandle> {
        let query_id = self.shared.pending.lock().await.next_query_id();
        let (request_id, rx) = self.register_pending_subscription().await;
        self.send(ClientMessage::SubscribeSingle(SubscribeSingle {
            query: query.to_string(),
            request_id,
            query_id,
        }))
        .await?;
        self.await_subscription(rx).await?;
        Ok(self.register_subscription(SubscriptionEntry::Single { query: query.to_string(), query_id }))
    }

    pub async fn subscribe_multi(&self, queries: &[&str]) -> Result<SubscriptionHandle> {
        let queries: Vec<String> = queries.iter().map(|s| s.to_string()).collect();
        let query_id = self.shared.pending.lock().await.next_query_id();
        let (request_id, rx) = self.register_pending_subscription().await;
        self.send(ClientMessage::SubscribeMulti(SubscribeMulti {
            queries: queries.clone(),
            request_id,
            query_id,
        }))
        .await?;
        self.await_subscription(rx).await?;
        Ok(self.register_subscription(SubscriptionEntry::Multi { queries, query_id }))
    }

    async fn register_pending_subscription(&self) -> (u32, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.shared.pending.lock().await;
        let request_id = pending.next_request_id();
        pending.insert(request_id, PendingCall::Subscription(tx));
        (request_id, rx)
    }

    async fn await_subscription(&self, rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        rx.await.map_err(|_| Error::Cancelled)?
    }

    fn register_subscription(&self, entry: SubscriptionEntry) -> SubscriptionHandle {
        let id = self.shared.next_handle.fetch_add(1, Ordering::Relaxed) as u64;
        self.shared.subscriptions.lock().unwrap().insert(id, entry);
        SubscriptionHandle(id)
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let entry = self.shared.subscriptions.lock().unwrap().remove(&handle.0);
        let Some(entry) = entry else { return Ok(()) };
        let request_id = {
            let mut pending = self.shared.pending.lock().await;
            pending.next_request_id()
        };
        match entry.query_id() {
            Some(query_id) => match &entry {
                SubscriptionEntry::Multi { .. } => {
                    self.send(ClientMessage::UnsubscribeMulti(UnsubscribeMulti { request_id, query_id })).await
                }
                _ => self.send(ClientMessage::Unsubscribe(Unsubscribe { request_id, query_id })).await,
            },
            None => Ok(()),
        }
    }

    /// Cancel timers, close the socket, cancel pending calls with
    /// `Cancelled`, transition to `Disconnected`, and fire the disconnect
    /// callback with no error (§4.E shutdown).
    pub async fn disconnect(&self) {
        if let Some(handle) = self.shared.task.lock().unwrap().take() {
            handle.abort();
        }
        *self.shared.outbound.lock().await = None;
        self.shared.pending.lock().await.fail_all(|| Error::Cancelled);
        *self.shared.state.lock().await = ConnectionState::Disconnected;
        crate::metrics::CONNECTION_STATE.set(0);
        let callbacks = self.shared.callbacks.lock().unwrap();
        for cb in &callbacks.on_disconnect {
            cb(None);
        }
    }
}

enum Either<F, O> {
    Frame(F),
    Outgoing(O),
    Ping,
}

fn decode_server_message(frame: &[u8]) -> std::result::Result<ServerMessage, String> {
    let decompressed = protocol::decompress_frame(frame).map_err(|e| e.to_string())?;
    bsatn::from_slice(&decompressed).map_err(|e| e.to_string())
}

async fn dispatch_server_message(shared: &Arc<Shared>, msg: ServerMessage) {
    match msg {
        ServerMessage::IdentityToken(_) => {
            log::debug!("ignoring unexpected post-handshake IdentityToken");
        }
        ServerMessage::InitialSubscription(m) => {
            apply_database_update(shared, &m.database_update);
            complete_subscription(shared, m.request_id, Ok(())).await;
        }
        ServerMessage::SubscribeApplied(SubscribeApplied { request_id, initial_update, .. }) => {
            apply_database_update(shared, &initial_update);
            complete_subscription(shared, request_id, Ok(())).await;
        }
        ServerMessage::SubscribeMultiApplied(SubscribeMultiApplied { request_id, initial_update, .. }) => {
            apply_database_update(shared, &initial_update);
            complete_subscription(shared, request_id, Ok(())).await;
        }
        ServerMessage::UnsubscribeApplied(UnsubscribeApplied { request_id, .. })
        | ServerMessage::UnsubscribeMultiApplied(UnsubscribeMultiApplied { request_id, .. }) => {
            complete_subscription(shared, request_id, Ok(())).await;
        }
        ServerMessage::SubscriptionError(err) => match err.request_id {
            Some(request_id) => {
                complete_subscription(shared, request_id, Err(Error::SubscriptionFailed { message: err.error })).await;
            }
            None => {
                // Drop all active subscriptions; cache observers are not fired.
                shared.subscriptions.lock().unwrap().clear();
                log::error!("fatal subscription error, all subscriptions dropped: {}", err.error);
            }
        },
        ServerMessage::TransactionUpdate(update) => {
            if let protocol::UpdateStatus::Committed(ref db_update) = update.status {
                apply_database_update(shared, db_update);
            }
            let request_id = update.reducer_call.request_id;
            let mut pending = shared.pending.lock().await;
            if let Some(PendingCall::Reducer(tx)) = pending.remove(request_id) {
                let result = match &update.status {
                    protocol::UpdateStatus::Committed(_) => Ok(update),
                    protocol::UpdateStatus::Failed(msg) => Err(Error::ReducerCallFailed {
                        name: update.reducer_call.reducer_name.clone(),
                        message: msg.clone(),
                    }),
                    protocol::UpdateStatus::OutOfEnergy => {
                        Err(Error::ReducerOutOfEnergy { name: update.reducer_call.reducer_name.clone() })
                    }
                };
                let _ = tx.send(result);
            }
        }
        ServerMessage::TransactionUpdateLight(update) => {
            apply_database_update(shared, &update.update);
        }
        ServerMessage::OneOffQueryResponse(resp) => {
            let mut pending = shared.pending.lock().await;
            if let Some(tx) = pending.remove_one_off(&resp.message_id) {
                let reply = match &resp.error {
                    Some(msg) => Err(Error::connection_failed(format!("one-off query failed: {msg}"))),
                    None => Ok(resp),
                };
                let _ = tx.send(reply);
            } else {
                log::debug!("one-off query response for unknown message_id delivered out of band");
            }
        }
        ServerMessage::ProcedureResult(result) => {
            let mut pending = shared.pending.lock().await;
            if let Some(PendingCall::Procedure(tx, name)) = pending.remove(result.request_id) {
                let reply = match &result.status {
                    protocol::ProcedureStatus::Returned(_) => Ok(result),
                    protocol::ProcedureStatus::Failed(msg) => {
                        Err(Error::ReducerCallFailed { name, message: msg.clone() })
                    }
                };
                let _ = tx.send(reply);
            }
        }
    }
}

async fn complete_subscription(shared: &Arc<Shared>, request_id: u32, result: std::result::Result<(), Error>) {
    let mut pending = shared.pending.lock().await;
    if let Some(PendingCall::Subscription(tx)) = pending.remove(request_id) {
        let _ = tx.send(result);
    }
}

fn apply_database_update(shared: &Arc<Shared>, update: &protocol::DatabaseUpdate) {
    for table in &update.tables {
        let mut deletes = Vec::new();
        let mut inserts = Vec::new();
        for delta in &table.deltas {
            let qu = match delta.clone().into_query_update() {
                Ok(qu) => qu,
                Err(e) => {
                    log::error!("skipping undecodable delta for table {:?}: {e}", table.table_name);
                    continue;
                }
            };
            match qu.deletes.rows() {
                Ok(rows) => deletes.extend(rows),
                Err(e) => log::error!("skipping malformed delete rows for {:?}: {e}", table.table_name),
            }
            match qu.inserts.rows() {
                Ok(rows) => inserts.extend(rows),
                Err(e) => log::error!("skipping malformed insert rows for {:?}: {e}", table.table_name),
            }
        }
        shared.cache.apply_delta(&table.table_name, &deletes, &inserts);
    }
}

async fn on_receive_loop_terminated(shared: Arc<Shared>) {
    let was_connected = matches!(*shared.state.lock().await, ConnectionState::Connected { .. });
    if !was_connected || shared.config.max_reconnect_attempts == 0 {
        shared.pending.lock().await.fail_all(|| Error::ConnectionClosed { reason: None });
        *shared.state.lock().await = ConnectionState::Disconnected;
        crate::metrics::CONNECTION_STATE.set(0);
        return;
    }

    for attempt in 1..=shared.config.max_reconnect_attempts {
        *shared.state.lock().await = ConnectionState::Reconnecting(attempt);
        crate::metrics::CONNECTION_STATE.set(3);
        shared.pending.lock().await.fail_all(|| Error::ConnectionClosed { reason: None });

        let delay = shared.config.delay_for_attempt(attempt - 1);
        tokio::time::sleep(delay).await;

        let conn = DbConnection { shared: shared.clone() };
        match conn.open_and_spawn(attempt).await {
            Ok(()) => {
                crate::metrics::RECONNECT_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
                return;
            }
            Err(e) => {
                crate::metrics::RECONNECT_ATTEMPTS_TOTAL.with_label_values(&["failure"]).inc();
                log::warn!("reconnect attempt {attempt} failed: {e}");
            }
        }
    }

    *shared.state.lock().await = ConnectionState::Disconnected;
    crate::metrics::CONNECTION_STATE.set(0);
    let callbacks = shared.callbacks.lock().unwrap();
    for cb in &callbacks.on_disconnect {
        cb(Some(Error::ReconnectFailed { attempts: shared.config.max_reconnect_attempts }));
    }
}
