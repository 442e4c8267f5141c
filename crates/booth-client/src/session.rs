//! Per-call session context.
//!
//! A [`CallSession`] owns everything one call needs: participants, peer
//! connections, processed mailbox ids and timer state. It is driven by a
//! single task so handlers never race each other; timers report back through
//! a channel instead of touching state directly.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use booth_common::{
    is_initiator, ClientMessage, EndReason, PresenceRecord, ServerMessage, SignalingMessage,
};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::peer::{PeerEvent, PeerFactory, PeerLink};

const PEER_EVENT_CAPACITY: usize = 256;
const TIMER_EVENT_CAPACITY: usize = 256;

/// What the gateway told us in `JOINED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub participant_id: String,
    pub session_id: String,
    pub is_host: bool,
    pub host_id: String,
    pub start_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub session_id: String,
    pub participant_id: String,
    pub was_host: bool,
    pub reason: EndReason,
    pub duration: Duration,
}

#[derive(Debug)]
enum TimerEvent {
    SendOffer(String),
    Consume(String),
    DropPeer(String),
    GraceExpired(u64),
}

/// Ends a running call from outside its task.
#[derive(Debug, Clone)]
pub struct CallHandle {
    hangup: mpsc::Sender<()>,
}

impl CallHandle {
    pub fn hang_up(&self) {
        let _ = self.hangup.try_send(());
    }
}

struct CallContext {
    config: ClientConfig,
    info: CallInfo,
    started: Instant,
    participants: BTreeSet<String>,
    peers: HashMap<String, Box<dyn PeerLink>>,
    seen: HashSet<String>,
    grace_generation: u64,
    factory: Arc<dyn PeerFactory>,
    outbound: mpsc::Sender<ClientMessage>,
    peer_tx: mpsc::Sender<PeerEvent>,
    timer_tx: mpsc::Sender<TimerEvent>,
}

pub struct CallSession {
    ctx: CallContext,
    peer_rx: mpsc::Receiver<PeerEvent>,
    timer_rx: mpsc::Receiver<TimerEvent>,
    hangup_rx: mpsc::Receiver<()>,
}

impl CallSession {
    pub fn new(
        config: ClientConfig,
        info: CallInfo,
        factory: Arc<dyn PeerFactory>,
        outbound: mpsc::Sender<ClientMessage>,
    ) -> (Self, CallHandle) {
        let (peer_tx, peer_rx) = mpsc::channel(PEER_EVENT_CAPACITY);
        let (timer_tx, timer_rx) = mpsc::channel(TIMER_EVENT_CAPACITY);
        let (hangup_tx, hangup_rx) = mpsc::channel(1);

        let session = Self {
            ctx: CallContext {
                config,
                info,
                started: Instant::now(),
                participants: BTreeSet::new(),
                peers: HashMap::new(),
                seen: HashSet::new(),
                grace_generation: 0,
                factory,
                outbound,
                peer_tx,
                timer_tx,
            },
            peer_rx,
            timer_rx,
            hangup_rx,
        };
        (session, CallHandle { hangup: hangup_tx })
    }

    /// Run the call until it ends and return how it ended.
    pub async fn run(self, mut inbound: mpsc::Receiver<ServerMessage>) -> CallSummary {
        let CallSession {
            mut ctx,
            mut peer_rx,
            mut timer_rx,
            mut hangup_rx,
        } = self;

        info!(
            "call {} started as {} (host: {})",
            ctx.info.session_id, ctx.info.participant_id, ctx.info.is_host
        );

        let tick_every = ctx.config.tick;
        let mut tick = time::interval_at(ctx.started + tick_every, tick_every);

        let reason = loop {
            tokio::select! {
                msg = inbound.recv() => {
                    match msg {
                        Some(msg) => {
                            if let Some(reason) = ctx.on_server_message(msg).await {
                                break reason;
                            }
                        }
                        None => {
                            warn!("signaling connection lost");
                            break EndReason::Hangup;
                        }
                    }
                }
                Some(event) = peer_rx.recv() => ctx.on_peer_event(event).await,
                Some(event) = timer_rx.recv() => {
                    if let Some(reason) = ctx.on_timer(event).await {
                        break reason;
                    }
                }
                _ = tick.tick() => {
                    if let Some(reason) = ctx.on_tick().await {
                        break reason;
                    }
                }
                Some(()) = hangup_rx.recv() => break EndReason::Hangup,
            }
        };

        ctx.teardown(reason).await
    }
}

impl CallContext {
    fn self_id(&self) -> &str {
        &self.info.participant_id
    }

    async fn send(&self, msg: ClientMessage) {
        if self.outbound.send(msg).await.is_err() {
            debug!("signaling writer is gone; dropping outbound message");
        }
    }

    fn schedule(&self, delay: Duration, event: TimerEvent) {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(event).await;
        });
    }

    async fn report_participants(&self) {
        let count = self.participants.len() as u32 + 1;
        self.send(ClientMessage::Participants { count }).await;
    }

    async fn on_server_message(&mut self, msg: ServerMessage) -> Option<EndReason> {
        match msg {
            ServerMessage::UserAdded { user } => self.on_user_added(user).await,
            ServerMessage::UserRemoved { participant_id } => {
                self.on_user_removed(&participant_id).await
            }
            ServerMessage::Signal { message } => self.on_signal(message).await,
            ServerMessage::Chat { message } => {
                info!("[chat] {}: {}", message.sender, message.text);
            }
            ServerMessage::RoomClosed => {
                info!("host closed the room");
                return Some(EndReason::RoomClosed);
            }
            ServerMessage::Error { message } => warn!("gateway error: {}", message),
            ServerMessage::Joined { .. } | ServerMessage::Ended { .. } => {
                debug!("ignoring unexpected {:?}", msg);
            }
        }
        None
    }

    async fn on_user_added(&mut self, user: PresenceRecord) {
        let other = user.participant_id;
        if other == self.self_id() {
            return;
        }
        info!("{} ({}) joined", user.display_name, other);
        self.participants.insert(other.clone());
        self.report_participants().await;

        // A join invalidates any pending grace timer.
        self.grace_generation += 1;

        if is_initiator(self.self_id(), &other) {
            self.schedule(self.config.offer_delay, TimerEvent::SendOffer(other));
        }
    }

    async fn on_user_removed(&mut self, participant_id: &str) {
        if !self.participants.remove(participant_id) {
            return;
        }
        info!("{} left", participant_id);
        if let Some(peer) = self.peers.remove(participant_id) {
            peer.close().await;
        }
        self.report_participants().await;

        if self.participants.is_empty() {
            self.grace_generation += 1;
            debug!(
                "nobody else present; ending in {:?} unless someone rejoins",
                self.config.grace_period
            );
            self.schedule(
                self.config.grace_period,
                TimerEvent::GraceExpired(self.grace_generation),
            );
        }
    }

    async fn on_signal(&mut self, message: SignalingMessage) {
        if !self.seen.insert(message.message_id.clone()) {
            debug!("skipping duplicate signal {}", message.message_id);
            return;
        }
        if message.from.is_empty() {
            warn!("signal {} has no sender; discarding", message.message_id);
            self.send(ClientMessage::Consume {
                message_id: message.message_id,
            })
            .await;
            return;
        }

        let from = message.from.clone();
        if message.sdp.is_some() && !self.peers.contains_key(&from) {
            self.open_peer(&from).await;
        }

        match self.peers.get(&from) {
            Some(peer) => {
                if let Some(sdp) = message.sdp {
                    let is_offer = sdp.kind == booth_common::SdpType::Offer;
                    if let Err(err) = peer.apply_remote(sdp).await {
                        warn!("failed to apply remote description from {}: {}", from, err);
                    } else if is_offer {
                        match peer.create_answer().await {
                            Ok(answer) => {
                                self.send(ClientMessage::Signal {
                                    to: from.clone(),
                                    sdp: Some(answer),
                                    candidate: None,
                                })
                                .await;
                            }
                            Err(err) => warn!("failed to answer {}: {}", from, err),
                        }
                    }
                }
                if let Some(candidate) = message.candidate {
                    if let Err(err) = peer.add_candidate(candidate).await {
                        warn!("failed to add candidate from {}: {}", from, err);
                    }
                }
            }
            None => warn!("no peer connection for signal from {}", from),
        }

        self.schedule(
            self.config.consume_delay,
            TimerEvent::Consume(message.message_id),
        );
    }

    async fn open_peer(&mut self, remote_id: &str) -> bool {
        match self.factory.create(remote_id, self.peer_tx.clone()).await {
            Ok(peer) => {
                self.peers.insert(remote_id.to_string(), peer);
                true
            }
            Err(err) => {
                warn!("failed to create peer for {}: {}", remote_id, err);
                false
            }
        }
    }

    async fn send_offer(&mut self, remote_id: String) {
        if !self.participants.contains(&remote_id) || self.peers.contains_key(&remote_id) {
            return;
        }
        if !self.open_peer(&remote_id).await {
            return;
        }
        let offer = match self.peers.get(&remote_id) {
            Some(peer) => peer.create_offer().await,
            None => return,
        };
        match offer {
            Ok(offer) => {
                debug!("sending offer to {}", remote_id);
                self.send(ClientMessage::Signal {
                    to: remote_id,
                    sdp: Some(offer),
                    candidate: None,
                })
                .await;
            }
            Err(err) => warn!("failed to create offer for {}: {}", remote_id, err),
        }
    }

    async fn on_timer(&mut self, event: TimerEvent) -> Option<EndReason> {
        match event {
            TimerEvent::SendOffer(remote_id) => self.send_offer(remote_id).await,
            TimerEvent::Consume(message_id) => {
                self.send(ClientMessage::Consume { message_id }).await;
            }
            TimerEvent::DropPeer(remote_id) => {
                if let Some(peer) = self.peers.remove(&remote_id) {
                    info!("dropping peer connection to {}", remote_id);
                    peer.close().await;
                }
            }
            TimerEvent::GraceExpired(generation) => {
                if generation == self.grace_generation && self.participants.is_empty() {
                    info!("nobody rejoined within {:?}", self.config.grace_period);
                    return Some(EndReason::Timeout);
                }
            }
        }
        None
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate {
                remote_id,
                candidate,
            } => {
                self.send(ClientMessage::Signal {
                    to: remote_id,
                    sdp: None,
                    candidate: Some(candidate),
                })
                .await;
            }
            PeerEvent::StateChanged { remote_id, state } => {
                debug!("peer {} is {:?}", remote_id, state);
                if state.is_terminal() {
                    self.schedule(self.config.failed_peer_delay, TimerEvent::DropPeer(remote_id));
                }
            }
            PeerEvent::RemoteTrack { remote_id, kind } => {
                info!("receiving {} from {}", kind, remote_id);
            }
        }
    }

    async fn on_tick(&mut self) -> Option<EndReason> {
        self.send(ClientMessage::Heartbeat).await;
        if self.started.elapsed() > self.config.session_max {
            info!("call reached the {:?} limit", self.config.session_max);
            return Some(EndReason::Expired);
        }
        None
    }

    async fn teardown(mut self, reason: EndReason) -> CallSummary {
        self.send(ClientMessage::End { reason }).await;
        for (_, peer) in self.peers.drain() {
            peer.close().await;
        }
        let duration = self.started.elapsed();
        info!("call ended ({:?}) after {:?}", reason, duration);
        CallSummary {
            session_id: self.info.session_id,
            participant_id: self.info.participant_id,
            was_host: self.info.is_host,
            reason,
            duration,
        }
    }
}
