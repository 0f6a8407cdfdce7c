// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-peer session lifecycle: resolve a trusted transport, handshake, then
//! run a cooperating sub-task group (ping, tip watcher, liveness monitor)
//! until one of them observes a reason to tear down. A `JoinSet` races
//! against a shutdown receiver; the first task to fail or the shutdown
//! signal arriving cancels the rest.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

use crate::address::ServerAddress;
use crate::certstore::{acquire_tls_context, CertPolicy};
use crate::chain::{deserialize_header, BlockHeader, ChainId, ChainParams, ChainView};
use crate::config::{InterfaceConfig, TimeoutClass};
use crate::error::{GracefulDisconnect, InterfaceError, InterfaceResult, ProtocolError};
use crate::headers::{self, PurportedCheckpoint};
use crate::network_handle::{NetworkHandle, TimeoutTier};
use crate::session::{AsyncReadWrite, NotificationSession};
use crate::sync::SyncEngine;

/// `(tip_height, tip_header)` as delivered by the peer's last
/// `blockchain.headers.subscribe` notification.
#[derive(Debug, Clone)]
pub struct TipView {
    pub height: u32,
    pub header: BlockHeader,
}

#[derive(Deserialize)]
struct TipNotification {
    hex: String,
    height: u32,
}

struct Shared {
    tip: RwLock<Option<TipView>>,
    binding: RwLock<Option<ChainId>>,
}

/// A single-shot signal fulfilled at most once, and cancellable before
/// fulfillment (dropping the sender wakes any waiter with an error).
struct ReadyLatch {
    tx: Mutex<Option<oneshot::Sender<()>>>,
    rx: AsyncMutex<Option<oneshot::Receiver<()>>>,
}

impl ReadyLatch {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(Some(rx)),
        }
    }

    fn fulfill(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Drops the sender without firing it, if it hasn't fired yet. Any
    /// current or future waiter resolves with `ReadyCancelled`.
    fn cancel(&self) {
        self.tx.lock().take();
    }

    async fn wait(&self) -> Result<(), GracefulDisconnect> {
        let mut guard = self.rx.lock().await;
        match guard.take() {
            Some(rx) => rx.await.map_err(|_| GracefulDisconnect::ReadyCancelled),
            None => Ok(()),
        }
    }
}

/// A single-shot signal that is always eventually fulfilled (the disconnect
/// handler is unconditional), never cancelled.
struct DisconnectLatch {
    tx: Mutex<Option<oneshot::Sender<()>>>,
    rx: AsyncMutex<Option<oneshot::Receiver<()>>>,
}

impl DisconnectLatch {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(Some(rx)),
        }
    }

    fn fulfill(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(());
        }
    }

    async fn wait(&self) {
        let mut guard = self.rx.lock().await;
        if let Some(rx) = guard.take() {
            let _ = rx.await;
        }
    }
}

/// Opens the TCP connection and, per `policy`, wraps it in a TLS stream or
/// leaves it bare.
async fn open_transport(
    address: &ServerAddress,
    policy: CertPolicy,
) -> io::Result<Box<dyn AsyncReadWrite>> {
    let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
    match policy {
        CertPolicy::NoTls => Ok(Box::new(stream)),
        CertPolicy::CaSigned(cfg) | CertPolicy::Pinned(cfg) => {
            let connector = TlsConnector::from(cfg);
            let server_name = rustls::pki_types::ServerName::try_from(address.host.clone())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let tls = connector.connect(server_name, stream).await?;
            Ok(Box::new(tls))
        }
    }
}

/// A live connection to one Electrum peer: TLS/TOFU transport trust, the
/// framed JSON-RPC session, and the header-sync state machine, plus the
/// ping/tip-watcher/liveness sub-task group that keeps it all running.
pub struct Interface {
    peer_label: String,
    config: Arc<InterfaceConfig>,
    network: Arc<dyn NetworkHandle>,
    chain: Arc<dyn ChainView>,
    params: Arc<dyn ChainParams>,
    session: Arc<NotificationSession>,
    shared: Arc<Shared>,
    ready_latch: Arc<ReadyLatch>,
    disconnected_latch: Arc<DisconnectLatch>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    requested_chunks: Arc<Mutex<HashSet<u32>>>,
}

impl Interface {
    /// Resolves TLS trust, dials the peer, handshakes, and spawns the
    /// sub-task group. Returns once `server.version` has been accepted;
    /// callers await [`Interface::ready`] separately for the first
    /// completed header sync pass.
    pub async fn connect(
        address: ServerAddress,
        config: InterfaceConfig,
        network: Arc<dyn NetworkHandle>,
        chain: Arc<dyn ChainView>,
        params: Arc<dyn ChainParams>,
    ) -> InterfaceResult<Arc<Interface>> {
        let cert_path = config.cert_path(&address.host);
        let policy =
            acquire_tls_context(&address.host, address.port, address.protocol, &cert_path).await?;
        let transport = open_transport(&address, policy)
            .await
            .map_err(InterfaceError::Transport)?;

        Self::handshake_and_spawn(address, transport, config, network, chain, params).await
    }

    /// Handshake plus sub-task spawn, taking an already-open transport.
    /// Split out from [`Interface::connect`] so tests can drive the state
    /// machine over an in-memory duplex stream instead of a real socket.
    async fn handshake_and_spawn(
        address: ServerAddress,
        transport: Box<dyn AsyncReadWrite>,
        config: InterfaceConfig,
        network: Arc<dyn NetworkHandle>,
        chain: Arc<dyn ChainView>,
        params: Arc<dyn ChainParams>,
    ) -> InterfaceResult<Arc<Interface>> {
        let config = Arc::new(config);
        let peer_label = address.to_string();
        let session = Arc::new(NotificationSession::new(
            transport,
            config.max_in_flight_requests,
            config.max_frame_size,
            peer_label.clone(),
        ));

        let handshake_timeout = network.network_timeout(TimeoutClass::GENERIC, TimeoutTier::Normal);
        session
            .send_request(
                "server.version",
                vec![json!(config.client_version), json!(config.protocol_version)],
                handshake_timeout,
            )
            .await
            .map_err(|e| match e {
                InterfaceError::Rpc { message, .. } => {
                    InterfaceError::GracefulDisconnect(GracefulDisconnect::VersionMismatch(message))
                }
                other => other,
            })?;

        let shared = Arc::new(Shared {
            tip: RwLock::new(None),
            binding: RwLock::new(None),
        });
        let ready_latch = Arc::new(ReadyLatch::new());
        let disconnected_latch = Arc::new(DisconnectLatch::new());
        let (tx_shutdown, rx_shutdown) = oneshot::channel();

        tokio::spawn(run_task_group(
            session.clone(),
            params.clone(),
            chain.clone(),
            network.clone(),
            config.clone(),
            peer_label.clone(),
            shared.clone(),
            ready_latch.clone(),
            disconnected_latch.clone(),
            rx_shutdown,
        ));

        Ok(Arc::new(Interface {
            peer_label,
            config,
            network,
            chain,
            params,
            session,
            shared,
            ready_latch,
            disconnected_latch,
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            requested_chunks: Arc::new(Mutex::new(HashSet::new())),
        }))
    }

    pub fn peer_label(&self) -> &str {
        &self.peer_label
    }

    /// Resolves once the first header-sync pass has chosen a starting
    /// chain binding, or fails with `ReadyCancelled` if the interface tore
    /// down before that happened.
    pub async fn ready(&self) -> Result<(), GracefulDisconnect> {
        self.ready_latch.wait().await
    }

    /// Resolves once the sub-task group has torn down, for any reason.
    pub async fn disconnected(&self) {
        self.disconnected_latch.wait().await
    }

    pub fn tip(&self) -> Option<u32> {
        self.shared.tip.read().as_ref().map(|t| t.height)
    }

    pub fn tip_header(&self) -> Option<BlockHeader> {
        self.shared.tip.read().as_ref().map(|t| t.header.clone())
    }

    pub fn blockchain(&self) -> Option<ChainId> {
        *self.shared.binding.read()
    }

    /// Requests shutdown: wakes the sub-task group's shutdown branch and
    /// aborts the session reader. Idempotent.
    pub fn close(&self) {
        if let Some(tx) = self.tx_shutdown.lock().take() {
            let _ = tx.send(());
        }
        self.session.abort();
    }

    pub async fn get_block_header(
        &self,
        height: u32,
        must_provide_proof: bool,
    ) -> InterfaceResult<(BlockHeader, bool)> {
        let timeout = self.network.network_timeout(TimeoutClass::GENERIC, TimeoutTier::Normal);
        headers::get_block_header(&self.session, self.params.as_ref(), height, timeout, must_provide_proof).await
    }

    pub async fn request_chunk(
        &self,
        start_height: u32,
        tip: u32,
    ) -> InterfaceResult<Option<(ChainId, u32)>> {
        let timeout = self.network.network_timeout(TimeoutClass::GENERIC, TimeoutTier::Relaxed);
        headers::request_chunk(
            &self.session,
            self.params.as_ref(),
            self.chain.as_ref(),
            &self.requested_chunks,
            start_height,
            tip,
            true,
            timeout,
        )
        .await
    }

    pub async fn get_purported_checkpoint(&self, cp_height: u32) -> InterfaceResult<PurportedCheckpoint> {
        let timeout = self.network.network_timeout(TimeoutClass::GENERIC, TimeoutTier::Relaxed);
        headers::get_purported_checkpoint(&self.session, self.chain.as_ref(), cp_height, timeout).await
    }
}

/// Periodic keepalive so the peer (and any NAT/load balancer) doesn't
/// consider the connection idle-dead.
async fn ping_task(session: Arc<NotificationSession>, interval: std::time::Duration, timeout: std::time::Duration) -> InterfaceResult<()> {
    loop {
        tokio::time::sleep(interval).await;
        session.send_request("server.ping", vec![], timeout).await?;
    }
}

/// Polls the session's reader task once a second; once it has exited, the
/// transport is gone and there's nothing left worth waiting on.
async fn liveness_task(session: Arc<NotificationSession>, poll_interval: std::time::Duration) -> InterfaceResult<()> {
    loop {
        tokio::time::sleep(poll_interval).await;
        if session.is_closing() {
            return Err(InterfaceError::GracefulDisconnect(GracefulDisconnect::ServerClosed));
        }
    }
}

/// Subscribes to `blockchain.headers.subscribe` and, for every delivered
/// tip: updates the cached `TipView`, rejects tips below the checkpoint,
/// picks (once) a starting chain binding and fulfills `ready`, then drives
/// the sync state machine under the process-wide header lock.
#[allow(clippy::too_many_arguments)]
async fn tip_watcher_task(
    session: Arc<NotificationSession>,
    params: Arc<dyn ChainParams>,
    chain: Arc<dyn ChainView>,
    network: Arc<dyn NetworkHandle>,
    peer_label: String,
    shared: Arc<Shared>,
    ready_latch: Arc<ReadyLatch>,
) -> InterfaceResult<()> {
    let timeout_generic = network.network_timeout(TimeoutClass::GENERIC, TimeoutTier::Normal);
    let timeout_urgent = network.network_timeout(TimeoutClass::URGENT, TimeoutTier::Normal);

    let mut queue = session
        .subscribe("blockchain.headers.subscribe", vec![], timeout_generic)
        .await?;

    let mut engine: Option<SyncEngine<'_>> = None;

    loop {
        let value = queue
            .recv()
            .await
            .ok_or(InterfaceError::GracefulDisconnect(GracefulDisconnect::ServerClosed))?;
        let note: TipNotification = serde_json::from_value(value)
            .map_err(|e| InterfaceError::Protocol(ProtocolError::Malformed(e.to_string())))?;

        if note.height < params.max_checkpoint() {
            return Err(InterfaceError::GracefulDisconnect(GracefulDisconnect::TipBelowCheckpoint));
        }

        let raw = hex::decode(&note.hex)
            .map_err(|e| InterfaceError::Protocol(ProtocolError::Malformed(e.to_string())))?;
        let header = deserialize_header(&raw, note.height)
            .ok_or_else(|| InterfaceError::Protocol(ProtocolError::Malformed("short header".to_string())))?;

        *shared.tip.write() = Some(TipView {
            height: note.height,
            header: header.clone(),
        });

        if engine.is_none() {
            let binding = chain.check_header(&header).unwrap_or_else(|| chain.best_chain());
            *shared.binding.write() = Some(binding);
            engine = Some(SyncEngine::new(
                session.as_ref(),
                params.as_ref(),
                chain.as_ref(),
                network.as_ref(),
                timeout_urgent,
                binding,
                note.height,
            ));
            ready_latch.fulfill();
        }

        {
            let _guard = network.acquire_header_lock().await;
            let eng = engine.as_mut().expect("initialized above");
            eng.process_tip(note.height, header).await?;
            *shared.binding.write() = Some(eng.binding());
        }

        network.trigger_callback("network_updated");
        network.consider_fork_or_lag(&peer_label).await;
    }
}

/// Runs the ping/tip-watcher/liveness group until one of them errors or an
/// explicit shutdown arrives, then runs the unconditional disconnect
/// handler. Mirrors `commit_syncer.rs`'s `schedule_loop`: a `JoinSet` raced
/// against a shutdown receiver, any failure cancels the rest.
#[allow(clippy::too_many_arguments)]
async fn run_task_group(
    session: Arc<NotificationSession>,
    params: Arc<dyn ChainParams>,
    chain: Arc<dyn ChainView>,
    network: Arc<dyn NetworkHandle>,
    config: Arc<InterfaceConfig>,
    peer_label: String,
    shared: Arc<Shared>,
    ready_latch: Arc<ReadyLatch>,
    disconnected_latch: Arc<DisconnectLatch>,
    mut rx_shutdown: oneshot::Receiver<()>,
) {
    let ping_timeout = network.network_timeout(TimeoutClass::GENERIC, TimeoutTier::Normal);
    let mut tasks: JoinSet<InterfaceResult<()>> = JoinSet::new();
    tasks.spawn(ping_task(session.clone(), config.ping_interval, ping_timeout));
    tasks.spawn(tip_watcher_task(
        session.clone(),
        params.clone(),
        chain.clone(),
        network.clone(),
        peer_label.clone(),
        shared.clone(),
        ready_latch.clone(),
    ));
    tasks.spawn(liveness_task(session.clone(), config.liveness_poll_interval));

    let outcome: InterfaceResult<()> = tokio::select! {
        Some(result) = tasks.join_next() => {
            match result {
                Ok(r) => r,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => Ok(()),
            }
        }
        _ = &mut rx_shutdown => Ok(()),
    };
    tasks.shutdown().await;

    match &outcome {
        Ok(()) => info!(peer = %peer_label, "interface closed"),
        Err(e) => warn!(peer = %peer_label, error = %e, "interface disconnecting"),
    }

    network.connection_down(&peer_label).await;
    disconnected_latch.fulfill();
    ready_latch.cancel();
}
