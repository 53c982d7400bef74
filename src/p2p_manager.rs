// vidswarm - p2p_manager.rs
//
// Multicast discovery. Every node announces itself on a fixed interval and listens for the
// announcements of others. Datagrams can be lost, reordered or delivered twice, so every
// announcement carries a fresh message id and the listener drops ids it has already seen.

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::config::NodeConfig;
use crate::metadata::PeerIdentity;
use crate::peer_directory::PeerDirectory;
use crate::protocol::{DiscoveryMessage, ProtocolError};

const MAX_DATAGRAM: usize = 64 * 1024;
const SEEN_CAPACITY: usize = 4096;
const SEEN_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Discovery socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("Could not encode announcement: {0}")]
    Encode(#[from] ProtocolError),
    #[error("Discovery is not running")]
    NotRunning,
}

/// What the listener reports to whoever owns the receiving end of the event channel.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// First announcement ever seen from this peer id.
    PeerDiscovered(PeerIdentity),
    /// The socket failed and the listener has exited.
    ListenerFailed(String),
}

/// How a single announcement was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    NewPeer,
    Refreshed,
    Duplicate,
    OwnAnnouncement,
    Incomplete,
}

/// Message ids seen recently. Bounded both by count and by age.
#[derive(Debug)]
pub struct SeenMessages {
    capacity: usize,
    window: Duration,
    order: VecDeque<(String, Instant)>,
    ids: HashSet<String>,
}

impl SeenMessages {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Records `id`. Returns false if it was already recorded and has not expired.
    pub fn check_and_mark(&mut self, id: &str, now: Instant) -> bool {
        self.evict(now);
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back((id.to_string(), now));
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((id, at)) = self.order.front() {
            if now.duration_since(*at) < self.window {
                break;
            }
            self.ids.remove(id);
            self.order.pop_front();
        }
    }
}

struct Shared {
    peer_id: String,
    directory: PeerDirectory,
    seen: Mutex<SeenMessages>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl Shared {
    fn ingest(&self, message: &DiscoveryMessage, source: IpAddr) -> IngestOutcome {
        let (Some(peer_id), Some(message_id)) = (&message.peer_id, &message.message_id) else {
            return IngestOutcome::Incomplete;
        };

        let fresh = self
            .seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .check_and_mark(message_id, Instant::now());
        if !fresh {
            return IngestOutcome::Duplicate;
        }
        if *peer_id == self.peer_id {
            return IngestOutcome::OwnAnnouncement;
        }

        let name = message.peer_name.clone().unwrap_or_else(|| "Peer".to_string());
        let peer = PeerIdentity::new(peer_id.clone(), name, source, message.control_port);
        if self.directory.upsert_peer(peer.clone()) {
            info!(peer = %peer, id = %peer.id, "Discovered peer");
            self.events.send(DiscoveryEvent::PeerDiscovered(peer)).ok();
            IngestOutcome::NewPeer
        } else {
            trace!(peer = %peer.id, "Peer refreshed");
            IngestOutcome::Refreshed
        }
    }
}

struct Running {
    socket: Arc<UdpSocket>,
    tasks: Vec<JoinHandle<()>>,
}

/// Announces this node and feeds announcements from others into the [`PeerDirectory`].
pub struct P2PManager {
    config: NodeConfig,
    shared: Arc<Shared>,
    running: Option<Running>,
}

impl P2PManager {
    /// The returned receiver yields one [`DiscoveryEvent::PeerDiscovered`] per new peer id.
    pub fn new(
        config: NodeConfig,
        peer_id: impl Into<String>,
        directory: PeerDirectory,
    ) -> (Self, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            peer_id: peer_id.into(),
            directory,
            seen: Mutex::new(SeenMessages::new(SEEN_CAPACITY, SEEN_WINDOW)),
            events,
        });
        (
            Self {
                config,
                shared,
                running: None,
            },
            receiver,
        )
    }

    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Joins the multicast group, then spawns the listener and the announce loop. The first
    /// announcement goes out immediately. Calling it again while running does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self) -> Result<(), DiscoveryError> {
        if self.running.is_some() {
            return Ok(());
        }

        let socket = Arc::new(bind_multicast(&self.config)?);
        let listener = tokio::spawn(listen_loop(Arc::clone(&socket), Arc::clone(&self.shared)));
        let announcer = tokio::spawn(announce_loop(
            Arc::clone(&socket),
            Arc::clone(&self.shared),
            self.config.clone(),
        ));

        info!(
            group = %self.config.multicast_group,
            port = self.config.multicast_port,
            ttl = self.config.multicast_ttl,
            "Discovery started"
        );
        self.running = Some(Running {
            socket,
            tasks: vec![listener, announcer],
        });
        Ok(())
    }

    /// Leaves the group and stops both loops. Safe to call when not running.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        for task in &running.tasks {
            task.abort();
        }
        if let Err(e) = running
            .socket
            .leave_multicast_v4(self.config.multicast_group, Ipv4Addr::UNSPECIFIED)
        {
            debug!(error = %e, "Leaving multicast group failed");
        }
        info!("Discovery stopped");
    }

    /// Sends one announcement now, outside the regular interval.
    pub async fn announce(&self) -> Result<(), DiscoveryError> {
        let running = self.running.as_ref().ok_or(DiscoveryError::NotRunning)?;
        send_announcement(&running.socket, &self.shared, &self.config).await
    }

    /// Applies one decoded announcement received from `source`.
    pub fn ingest(&self, message: &DiscoveryMessage, source: IpAddr) -> IngestOutcome {
        self.shared.ingest(message, source)
    }
}

impl Drop for P2PManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_multicast(config: &NodeConfig) -> Result<UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let listen_address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.multicast_port));
    socket.bind(&listen_address.into())?;
    socket.join_multicast_v4(&config.multicast_group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(config.multicast_ttl)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

async fn send_announcement(socket: &UdpSocket, shared: &Shared, config: &NodeConfig) -> Result<(), DiscoveryError> {
    let message = DiscoveryMessage::announce(&shared.peer_id, &config.peer_name, config.control_port);
    let bytes = message.encode()?;
    let target = SocketAddrV4::new(config.multicast_group, config.multicast_port);
    socket.send_to(&bytes, target).await?;
    trace!(message_id = ?message.message_id, "Announced");
    Ok(())
}

async fn announce_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>, config: NodeConfig) {
    let mut ticker = tokio::time::interval(config.announce_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = send_announcement(&socket, &shared, &config).await {
            warn!(error = %e, "Announce failed");
        }
    }
}

async fn listen_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((size, source)) => match DiscoveryMessage::decode(&buf[..size]) {
                Ok(message) => {
                    let outcome = shared.ingest(&message, source.ip());
                    trace!(%source, ?outcome, "Announcement received");
                }
                Err(e) => warn!(%source, error = %e, "Discarding malformed announcement"),
            },
            Err(e) => {
                error!(error = %e, "Discovery listener failed");
                shared.events.send(DiscoveryEvent::ListenerFailed(e.to_string())).ok();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ANNOUNCE;

    const LAN_PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

    fn manager() -> (P2PManager, mpsc::UnboundedReceiver<DiscoveryEvent>, PeerDirectory) {
        let directory = PeerDirectory::new();
        let (manager, events) = P2PManager::new(NodeConfig::default(), "self-id", directory.clone());
        (manager, events, directory)
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<DiscoveryEvent>) -> Vec<DiscoveryEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn duplicate_message_fires_new_peer_once() {
        let (manager, mut events, directory) = manager();
        let message = DiscoveryMessage::announce("peer-a", "alice", 47101);

        assert_eq!(manager.ingest(&message, LAN_PEER), IngestOutcome::NewPeer);
        assert_eq!(manager.ingest(&message, LAN_PEER), IngestOutcome::Duplicate);

        assert_eq!(drain(&mut events).len(), 1);
        let peer = directory.peer("peer-a").unwrap();
        assert_eq!(peer.address, LAN_PEER);
        assert_eq!(peer.control_port, 47101);
    }

    #[test]
    fn repeated_announcements_only_refresh() {
        let (manager, mut events, directory) = manager();
        let first = DiscoveryMessage::announce("peer-a", "alice", 47101);
        let second = DiscoveryMessage::announce("peer-a", "alice", 47102);

        assert_eq!(manager.ingest(&first, LAN_PEER), IngestOutcome::NewPeer);
        assert_eq!(manager.ingest(&second, LAN_PEER), IngestOutcome::Refreshed);

        let discovered = drain(&mut events);
        assert_eq!(discovered.len(), 1);
        assert!(matches!(&discovered[0], DiscoveryEvent::PeerDiscovered(p) if p.id == "peer-a"));
        assert_eq!(directory.peer("peer-a").unwrap().control_port, 47102);
    }

    #[test]
    fn own_and_incomplete_announcements_are_ignored() {
        let (manager, mut events, directory) = manager();
        let own = DiscoveryMessage::announce("self-id", "me", 47101);
        let incomplete = DiscoveryMessage {
            kind: ANNOUNCE.to_string(),
            message_id: None,
            peer_id: Some("peer-b".into()),
            peer_name: None,
            control_port: 1,
            epoch_ms: 0,
        };

        assert_eq!(manager.ingest(&own, LAN_PEER), IngestOutcome::OwnAnnouncement);
        assert_eq!(manager.ingest(&incomplete, LAN_PEER), IngestOutcome::Incomplete);
        assert!(drain(&mut events).is_empty());
        assert!(directory.peers().is_empty());
    }

    #[test]
    fn seen_ids_are_bounded_by_count() {
        let mut seen = SeenMessages::new(2, Duration::from_secs(60));
        let now = Instant::now();
        assert!(seen.check_and_mark("a", now));
        assert!(seen.check_and_mark("b", now));
        assert!(seen.check_and_mark("c", now));
        assert_eq!(seen.len(), 2);
        assert!(seen.check_and_mark("a", now));
        assert!(!seen.check_and_mark("c", now));
    }

    #[test]
    fn seen_ids_expire_after_window() {
        let mut seen = SeenMessages::new(16, Duration::from_secs(60));
        let start = Instant::now();
        assert!(seen.check_and_mark("a", start));
        assert!(!seen.check_and_mark("a", start + Duration::from_secs(30)));
        assert!(seen.check_and_mark("a", start + Duration::from_secs(61)));
    }

    #[tokio::test]
    async fn announce_requires_running_socket() {
        let (manager, _events, _directory) = manager();
        assert!(matches!(manager.announce().await, Err(DiscoveryError::NotRunning)));
    }

    #[tokio::test]
    #[ignore = "needs a multicast-capable interface"]
    async fn start_and_stop_are_idempotent() {
        let (mut manager, _events, _directory) = manager();
        manager.start().unwrap();
        manager.start().unwrap();
        assert!(manager.is_running());
        manager.announce().await.unwrap();
        manager.stop();
        manager.stop();
        assert!(!manager.is_running());
    }
}
