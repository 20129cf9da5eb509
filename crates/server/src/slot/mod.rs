//! Per-client session state machine and four-flow forwarder (spec §4.6).
//!
//! A `Slot` owns one external IPv4 source address and, while a client is in
//! session, the three upstream sockets plus the client's framed TCP link.
//! The slot's [`shared::worker::Worker`] doubles as the session's manager:
//! `Idle` means the slot is Free; admitting a connection stores it as
//! pending work and wakes the worker, whose body runs the handshake and
//! the client-read loop to completion before returning to `Idle`.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use regex::Regex;
use shared::{
    errors::ErrorKind,
    log,
    net::{TcpStreamConn, UdpConn},
    protocol::{self, MessageType},
    worker::Worker,
};
use tokio::sync::{Mutex, RwLock};

use crate::auth;
use crate::consts::{HANDSHAKE_READ_TIMEOUT_MS, TCP_PEER_PORT, UDP_CONTROL_PORT, UDP_DATA_PORT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Authenticating,
    Running,
    Draining,
}

struct PendingClient {
    conn: TcpStreamConn,
    addr: SocketAddr,
}

struct Upstream {
    udp_control: Arc<UdpConn>,
    udp_data: Arc<UdpConn>,
    tcp: RwLock<Option<Arc<TcpStreamConn>>>,
}

pub struct Slot {
    pub index: usize,
    pub source_addr: Ipv4Addr,
    worker: Worker,
    pending: Mutex<Option<PendingClient>>,
    state: RwLock<SlotState>,
    callsign: RwLock<Option<String>>,
    /// The client link of the in-progress session, if any. Kept separately
    /// from the session body's own local ownership so `drop_active()` can
    /// reach in and unblock the manager loop from outside (spec §4.6 path
    /// 4, §4.7 `drop()`).
    active_conn: RwLock<Option<Arc<TcpStreamConn>>>,
    /// Pinged whenever this slot's occupancy changes; the server aggregates
    /// across all slots and forwards the total to the registration
    /// reporter, since no single slot knows the others' occupancy.
    occupancy_tx: Option<flume::Sender<()>>,
    calls_allowed: Option<Regex>,
    calls_denied: Option<Regex>,
    password: Arc<str>,
}

impl Slot {
    pub fn new(
        index: usize,
        source_addr: Ipv4Addr,
        password: Arc<str>,
        calls_allowed: Option<Regex>,
        calls_denied: Option<Regex>,
        occupancy_tx: Option<flume::Sender<()>>,
    ) -> Arc<Self> {
        let slot = Arc::new(Slot {
            index,
            source_addr,
            worker: Worker::new(None),
            pending: Mutex::new(None),
            state: RwLock::new(SlotState::Free),
            callsign: RwLock::new(None),
            active_conn: RwLock::new(None),
            occupancy_tx,
            calls_allowed,
            calls_denied,
            password,
        });
        let body_slot = slot.clone();
        tokio::spawn(async move {
            body_slot
                .worker
                .start(move || {
                    let slot = body_slot.clone();
                    async move { slot.run_session().await }
                })
                .await;
        });
        slot
    }

    pub async fn is_free(&self) -> bool {
        self.worker.is_idle().await
    }

    pub async fn state(&self) -> SlotState {
        *self.state.read().await
    }

    pub async fn callsign(&self) -> Option<String> {
        self.callsign.read().await.clone()
    }

    /// Offers a freshly accepted connection to this slot. On success, the
    /// slot owns `conn` and will run its session. On failure (the slot
    /// isn't idle), `conn` is handed back so the caller can offer it to the
    /// next slot in the pool.
    pub async fn try_admit(
        self: &Arc<Self>,
        conn: TcpStreamConn,
        addr: SocketAddr,
    ) -> Result<(), TcpStreamConn> {
        if !self.worker.is_idle().await {
            return Err(conn);
        }
        *self.pending.lock().await = Some(PendingClient { conn, addr });
        if self.worker.wake().await.is_ok() {
            return Ok(());
        }
        // Lost a race with the worker leaving Idle between the check above
        // and `wake()`; take the connection back so it isn't stranded.
        match self.pending.lock().await.take() {
            Some(pending) => Err(pending.conn),
            None => Ok(()),
        }
    }

    /// Drops the client link of the in-progress session, if any, unblocking
    /// the manager loop. Used by server-initiated shutdown (spec §4.6 path
    /// 4, §4.7 `drop()`).
    pub async fn drop_active(&self) {
        if let Some(conn) = self.active_conn.read().await.as_ref() {
            conn.shutdown();
        }
    }

    pub async fn join(&self) {
        self.worker.join().await;
    }

    async fn run_session(&self) {
        let Some(PendingClient { conn, addr }) = self.pending.lock().await.take() else {
            return;
        };
        log::info!("slot {}: session starting for {}", self.index, addr);

        *self.state.write().await = SlotState::Authenticating;
        let handshake = tokio::time::timeout(
            std::time::Duration::from_millis(HANDSHAKE_READ_TIMEOUT_MS),
            auth::perform_handshake(
                &conn,
                &self.password,
                self.calls_allowed.as_ref(),
                self.calls_denied.as_ref(),
            ),
        )
        .await;
        let callsign = match handshake {
            Ok(Ok(callsign)) => callsign,
            Ok(Err(e)) => {
                let kind = match e {
                    auth::HandshakeError::BadPassword => ErrorKind::PermissionDenied,
                    auth::HandshakeError::AccessDenied => ErrorKind::PermissionDenied,
                    auth::HandshakeError::BadRequest => ErrorKind::InvalidData,
                };
                let err = shared::errors::ErrorWithAddr::new(Some(addr), kind, e.to_string());
                log::warn!("slot {}: handshake failed: {}", self.index, err);
                conn.close().await;
                *self.state.write().await = SlotState::Free;
                return;
            }
            Err(_) => {
                let err = shared::errors::ErrorWithAddr::new(
                    Some(addr),
                    ErrorKind::TimedOut,
                    "handshake did not complete in time",
                );
                log::warn!("slot {}: handshake failed: {}", self.index, err);
                conn.close().await;
                *self.state.write().await = SlotState::Free;
                return;
            }
        };
        *self.callsign.write().await = Some(callsign.clone());
        log::info!("slot {}: {} authenticated as {}", self.index, addr, callsign);

        let upstream = match self.open_upstream().await {
            Ok(upstream) => upstream,
            Err(e) => {
                log::error!("slot {}: failed to open upstream sockets: {:?}", self.index, e);
                conn.close().await;
                *self.state.write().await = SlotState::Free;
                return;
            }
        };

        *self.state.write().await = SlotState::Running;

        let conn = Arc::new(conn);
        *self.active_conn.write().await = Some(conn.clone());
        self.notify_occupancy_changed();

        let client_send_lock = Arc::new(Mutex::new(()));
        let stop = conn.stop_trigger();

        let udp_control_task = tokio::spawn(udp_forwarder(
            conn.clone(),
            client_send_lock.clone(),
            upstream.udp_control.clone(),
            MessageType::UdpControl,
            stop.clone(),
        ));
        let udp_data_task = tokio::spawn(udp_forwarder(
            conn.clone(),
            client_send_lock.clone(),
            upstream.udp_data.clone(),
            MessageType::UdpData,
            stop.clone(),
        ));

        self.manager_loop(&conn, &upstream, &client_send_lock).await;

        udp_control_task.abort();
        udp_data_task.abort();
        let _ = udp_control_task.await;
        let _ = udp_data_task.await;
        if let Some(tcp) = upstream.tcp.write().await.take() {
            tcp.close().await;
        }
        conn.close().await;
        *self.active_conn.write().await = None;

        *self.callsign.write().await = None;
        *self.state.write().await = SlotState::Free;
        self.notify_occupancy_changed();
        log::info!("slot {}: session ended for {}", self.index, addr);
    }

    async fn open_upstream(&self) -> Result<Upstream, ErrorKind> {
        let control_addr = SocketAddr::V4(SocketAddrV4::new(self.source_addr, UDP_CONTROL_PORT));
        let data_addr = SocketAddr::V4(SocketAddrV4::new(self.source_addr, UDP_DATA_PORT));
        Ok(Upstream {
            udp_control: Arc::new(UdpConn::bind(control_addr).await?),
            udp_data: Arc::new(UdpConn::bind(data_addr).await?),
            tcp: RwLock::new(None),
        })
    }

    /// Pings the server's occupancy aggregator, if registration is enabled.
    /// Best-effort: a full channel or a server shutting down just means the
    /// next periodic registration post carries the current count instead.
    fn notify_occupancy_changed(&self) {
        if let Some(tx) = &self.occupancy_tx {
            let _ = tx.send(());
        }
    }

    /// Reads framed messages from the client link and demultiplexes them to
    /// the upstream flows, per spec §4.6's "Client-received frame
    /// handling".
    async fn manager_loop(
        &self,
        conn: &Arc<TcpStreamConn>,
        upstream: &Upstream,
        client_send_lock: &Arc<Mutex<()>>,
    ) {
        loop {
            let header = match protocol::read_header(conn).await {
                Ok(header) => header,
                Err(_) => return,
            };

            match header.msg_type {
                MessageType::TcpOpen => {
                    let peer = protocol::address_to_ipv4(header.address);
                    let result = TcpStreamConn::connect(self.source_addr, peer, TCP_PEER_PORT).await;
                    let status: i32 = match &result {
                        Ok(_) => 0,
                        Err(_) => -1,
                    };
                    if let Ok(stream) = result {
                        let stream = Arc::new(stream);
                        *upstream.tcp.write().await = Some(stream.clone());
                        tokio::spawn(tcp_forwarder(
                            conn.clone(),
                            client_send_lock.clone(),
                            stream,
                        ));
                    }
                    let _ = send_framed(
                        conn,
                        client_send_lock,
                        MessageType::TcpStatus,
                        0,
                        &status.to_le_bytes(),
                    )
                    .await;
                }
                MessageType::TcpData => {
                    let tcp = upstream.tcp.read().await.clone();
                    let mut remaining = header.size as usize;
                    let mut upstream_failed = false;
                    let mut read_failed = false;
                    while remaining > 0 {
                        let take = remaining.min(shared::consts::MAX_FRAME_PAYLOAD);
                        let mut chunk = vec![0u8; take];
                        if conn.recv(&mut chunk).await.is_err() {
                            read_failed = true;
                            break;
                        }
                        remaining -= take;
                        if let Some(tcp) = &tcp {
                            if !upstream_failed && tcp.send(&chunk).await.is_err() {
                                upstream_failed = true;
                            }
                        }
                    }
                    if read_failed {
                        return;
                    }
                    if upstream_failed {
                        if let Some(tcp) = upstream.tcp.write().await.take() {
                            tcp.close().await;
                        }
                        // tcp_forwarder's own read loop unwinds from this
                        // close and emits its own TCP_CLOSE; spec §4.6
                        // tolerates the duplicate.
                        let _ = send_framed(conn, client_send_lock, MessageType::TcpClose, 0, &[])
                            .await;
                    }
                }
                MessageType::TcpClose => {
                    if let Some(tcp) = upstream.tcp.write().await.take() {
                        tcp.close().await;
                    }
                }
                MessageType::UdpData => {
                    if self.drain_and_forward_udp(conn, header, &upstream.udp_data, UDP_DATA_PORT).await.is_err() {
                        return;
                    }
                }
                MessageType::UdpControl => {
                    if self
                        .drain_and_forward_udp(conn, header, &upstream.udp_control, UDP_CONTROL_PORT)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                MessageType::TcpStatus | MessageType::System => {
                    // proxy→client only; a client should never send these.
                    return;
                }
                MessageType::Unknown => {
                    log::warn!("slot {}: unknown frame type, terminating session", self.index);
                    return;
                }
            }
        }
    }

    async fn drain_and_forward_udp(
        &self,
        conn: &Arc<TcpStreamConn>,
        header: protocol::FrameHeader,
        socket: &UdpConn,
        port: u16,
    ) -> Result<(), ErrorKind> {
        let peer = protocol::address_to_ipv4(header.address);
        let peer_addr = SocketAddr::V4(SocketAddrV4::new(peer, port));
        protocol::drain_payload(conn, header.size, |chunk| async move {
            if let Err(e) = socket.send_to(&chunk, peer_addr).await {
                log::warn!("slot {}: udp send to {} failed: {:?}", self.index, peer_addr, e);
            }
        })
        .await
    }
}

async fn send_framed(
    conn: &TcpStreamConn,
    client_send_lock: &Mutex<()>,
    msg_type: MessageType,
    address: u32,
    payload: &[u8],
) -> Result<(), ErrorKind> {
    let _guard = client_send_lock.lock().await;
    protocol::write_frame(conn, msg_type, address, payload).await
}

async fn udp_forwarder(
    conn: Arc<TcpStreamConn>,
    client_send_lock: Arc<Mutex<()>>,
    socket: Arc<UdpConn>,
    msg_type: MessageType,
    stop: shared::sync::Trigger,
) {
    let mut buf = vec![0u8; shared::consts::MAX_FRAME_PAYLOAD];
    loop {
        tokio::select! {
            _ = stop.wait_async() => return,
            result = socket.recv_any(&mut buf) => {
                let (n, addr) = match result {
                    Ok(v) => v,
                    Err(_) => {
                        conn.shutdown();
                        return;
                    }
                };
                let address = match addr.ip() {
                    std::net::IpAddr::V4(v4) => protocol::ipv4_to_address(v4),
                    std::net::IpAddr::V6(_) => continue,
                };
                if send_framed(&conn, &client_send_lock, msg_type, address, &buf[..n])
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn tcp_forwarder(
    conn: Arc<TcpStreamConn>,
    client_send_lock: Arc<Mutex<()>>,
    upstream: Arc<TcpStreamConn>,
) {
    let mut buf = vec![0u8; shared::consts::MAX_FRAME_PAYLOAD];
    loop {
        match upstream.recv_any(&mut buf).await {
            Ok(n) => {
                if send_framed(&conn, &client_send_lock, MessageType::TcpData, 0, &buf[..n])
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(_) => {
                let _ = send_framed(&conn, &client_send_lock, MessageType::TcpClose, 0, &[]).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slot_starts_free() {
        let slot = Slot::new(
            0,
            Ipv4Addr::UNSPECIFIED,
            Arc::from("PUBLIC"),
            None,
            None,
            None,
        );
        // Give the spawned worker-start task a moment to reach Idle.
        for _ in 0..50 {
            if slot.is_free().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(slot.is_free().await);
        assert_eq!(slot.state().await, SlotState::Free);
    }
}
