//! Proxy server: listener, slot pool, admission, lifecycle (spec §4.7).
//!
//! `ProxyServer::open` validates the configuration, compiles the callsign
//! regexes once, allocates one [`Slot`] per configured external interface,
//! starts the registration reporter if configured, and binds the listener.
//! `process()` accepts a single connection and offers it to the first free
//! slot in order, matching "walk the slot list in order" in spec §4.7.

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use shared::{errors::ErrorKind, log, net::TcpListenerConn};

use crate::config::ProxyConfig;
use crate::registration::RegistrationReporter;
use crate::slot::Slot;

pub struct ProxyServer {
    listener: TcpListenerConn,
    slots: Vec<Arc<Slot>>,
    registration: Option<Arc<RegistrationReporter>>,
    occupancy_task: Option<tokio::task::JoinHandle<()>>,
}

impl ProxyServer {
    /// Validates the password, compiles `calls_allowed`/`calls_denied`,
    /// allocates `1 + len(bind_addr_ext_add)` slots, starts the
    /// registration reporter (if configured), and binds the listener.
    pub async fn open(config: &ProxyConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let calls_allowed = compile_pattern(config.calls_allowed.as_deref())
            .context("invalid CallsignsAllowed pattern")?;
        let calls_denied = compile_pattern(config.calls_denied.as_deref())
            .context("invalid CallsignsDenied pattern")?;

        let slot_count = config.slot_count();
        let password: Arc<str> = Arc::from(config.password.as_str());

        let registration = if config.registration_enabled() {
            let reg_name = config.reg_name.as_deref().unwrap_or_default();
            let reg_comment = config.reg_comment.as_deref().unwrap_or_default();
            let public_addr = config.public_addr.as_deref().unwrap_or_default();
            let reporter = Arc::new(RegistrationReporter::new(
                reg_name,
                reg_comment,
                public_addr,
                config.port,
                config.is_public(),
                slot_count,
            ));
            reporter.start().await;
            Some(reporter)
        } else {
            None
        };

        // Every slot gets a clone of the sender half; only one task drains
        // the receiver and recomputes the aggregate occupancy across the
        // whole pool, since no single slot knows the others' state.
        let occupancy_tx = registration.as_ref().map(|_| flume::unbounded());
        let (occupancy_tx, occupancy_rx) = match occupancy_tx {
            Some((tx, rx)) => (Some(tx), Some(rx)),
            None => (None, None),
        };

        let mut slots = Vec::with_capacity(slot_count);
        for index in 0..slot_count {
            let source_addr: Ipv4Addr = config
                .slot_source_addr(index)
                .with_context(|| format!("slot {index}: invalid external bind address"))?;
            slots.push(Slot::new(
                index,
                source_addr,
                password.clone(),
                calls_allowed.clone(),
                calls_denied.clone(),
                occupancy_tx.clone(),
            ));
        }

        let occupancy_task = match (occupancy_rx, registration.clone()) {
            (Some(rx), Some(reporter)) => {
                Some(tokio::spawn(occupancy_aggregator(rx, slots.clone(), reporter)))
            }
            _ => None,
        };

        let listener = TcpListenerConn::listen(config.listen_sockaddr())
            .await
            .map_err(|e| map_listen_error(e, config))?;

        Ok(Arc::new(ProxyServer {
            listener,
            slots,
            registration,
            occupancy_task,
        }))
    }

    /// Blocks until an inbound connection arrives (or the listener is
    /// shut down), then offers it to the first free slot. Closes the
    /// connection without exchanging a byte if every slot is busy.
    pub async fn process(&self) -> Result<(), ErrorKind> {
        let (mut conn, addr) = self.listener.accept().await?;
        for slot in &self.slots {
            match slot.try_admit(conn, addr).await {
                Ok(()) => return Ok(()),
                Err(returned) => conn = returned,
            }
        }
        log::warn!(
            "server: all {} slot(s) busy, rejecting {}",
            self.slots.len(),
            addr
        );
        conn.close().await;
        Ok(())
    }

    /// Unblocks `process()`'s pending `accept()`. Asynchronous: does not
    /// wait for in-flight sessions to drain.
    pub fn shutdown(&self) {
        self.listener.shutdown();
    }

    /// Drops the active client connection on every slot, unblocking their
    /// manager loops.
    pub async fn drop_active(&self) {
        for slot in &self.slots {
            slot.drop_active().await;
        }
    }

    /// Full teardown: unblocks the listener, drops active sessions, waits
    /// for every slot's worker to return to `Stopped`, closes the listener,
    /// and posts a final `Off` registration update.
    pub async fn close(&self) {
        self.shutdown();
        self.drop_active().await;
        for slot in &self.slots {
            slot.join().await;
        }
        self.listener.close().await;
        if let Some(reporter) = &self.registration {
            reporter.stop().await;
        }
        if let Some(task) = &self.occupancy_task {
            task.abort();
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub async fn local_addr(&self) -> Result<std::net::SocketAddr, ErrorKind> {
        self.listener.local_addr().await
    }
}

fn compile_pattern(pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern {
        Some(p) => Ok(Some(Regex::new(p)?)),
        None => Ok(None),
    }
}

fn map_listen_error(kind: ErrorKind, config: &ProxyConfig) -> anyhow::Error {
    match kind {
        ErrorKind::AddressInUse => {
            anyhow::anyhow!("address {} already in use", config.listen_sockaddr())
        }
        other => anyhow::anyhow!("failed to bind listener: {}", other),
    }
}

/// Consumes occupancy-change pings from the slot pool and forwards the
/// recomputed total to the registration reporter. A slot only reports "my
/// occupancy changed", not the pool-wide total, so this recomputes it by
/// counting slots currently `Running`.
async fn occupancy_aggregator(
    rx: flume::Receiver<()>,
    slots: Vec<Arc<Slot>>,
    reporter: Arc<RegistrationReporter>,
) {
    while rx.recv_async().await.is_ok() {
        let states = futures::future::join_all(slots.iter().map(|s| s.state())).await;
        let used = states
            .iter()
            .filter(|s| **s == crate::slot::SlotState::Running)
            .count();
        reporter.notify_occupancy(used).await;
    }
}
