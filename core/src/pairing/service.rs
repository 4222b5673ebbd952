use super::code::{CodeAllocator, SessionCode};
use super::media::PeerConnector;
use super::signaling::{SignalEnvelope, SignalMessage, SignalingRelay};
use super::state::{PairingMachine, PairingRole, PairingState};
use crate::camera::{CameraSlot, FrameSource, SourceOrigin};
use crate::prelude::{RideError, RideResult, TuningConfig};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Builds a fresh media connector for every pairing attempt.
pub type ConnectorFactory = Box<dyn Fn() -> Arc<dyn PeerConnector> + Send + Sync>;

/// Starts pairing sessions against one relay. Holds at most one live session
/// per role: starting another cancels the previous one.
pub struct PairingService {
    relay: Arc<dyn SignalingRelay>,
    connectors: ConnectorFactory,
    codes: CodeAllocator,
    negotiation_timeout: Duration,
    active: HashMap<PairingRole, ActiveSession>,
}

struct ActiveSession {
    code: SessionCode,
    cancel: Weak<watch::Sender<bool>>,
    released: watch::Receiver<bool>,
}

impl PairingService {
    pub fn new(
        relay: Arc<dyn SignalingRelay>,
        connectors: impl Fn() -> Arc<dyn PeerConnector> + Send + Sync + 'static,
        tuning: &TuningConfig,
    ) -> Self {
        Self {
            relay,
            connectors: Box::new(connectors),
            codes: CodeAllocator::new(),
            negotiation_timeout: Duration::from_millis(tuning.negotiation_timeout_ms),
            active: HashMap::new(),
        }
    }

    pub fn with_codes(mut self, codes: CodeAllocator) -> Self {
        self.codes = codes;
        self
    }

    /// Primary device: allocate a fresh code and wait for a phone to join.
    pub fn host(&mut self) -> PairingHandle {
        let code = self.codes.allocate();
        self.spawn(code, PairingRole::Receiver, None)
    }

    /// Secondary device: join `code` and stream `camera` once connected.
    pub fn join(&mut self, code: SessionCode, camera: Box<dyn FrameSource + Send>) -> PairingHandle {
        self.spawn(code, PairingRole::Sender, Some(camera))
    }

    /// Ends `previous` and hosts again under a new code.
    pub fn retry(&mut self, previous: PairingHandle) -> PairingHandle {
        drop(previous);
        self.host()
    }

    /// Code of the live session for `role`, if its handle is still held.
    pub fn active_code(&self, role: PairingRole) -> Option<&SessionCode> {
        self.active
            .get(&role)
            .filter(|active| active.cancel.strong_count() > 0)
            .map(|active| &active.code)
    }

    /// Cancels the live session for `role` and hands back its release signal.
    fn supersede(&mut self, role: PairingRole) -> Option<watch::Receiver<bool>> {
        let active = self.active.remove(&role)?;
        if let Some(cancel) = active.cancel.upgrade() {
            log::info!(
                "pairing {} {} superseded by a new session",
                active.code,
                role.as_str()
            );
            cancel.send_replace(true);
        }
        Some(active.released)
    }

    fn spawn(
        &mut self,
        code: SessionCode,
        role: PairingRole,
        camera: Option<Box<dyn FrameSource + Send>>,
    ) -> PairingHandle {
        let previous = self.supersede(role);
        let (machine, state) = PairingMachine::new(role);
        let (cancel, cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel);
        let (released, released_rx) = watch::channel(false);
        self.active.insert(
            role,
            ActiveSession {
                code: code.clone(),
                cancel: Arc::downgrade(&cancel),
                released: released_rx,
            },
        );
        let (stream_tx, stream_rx) = oneshot::channel();
        let negotiation = Negotiation {
            relay: self.relay.clone(),
            connector: (self.connectors)(),
            code: code.clone(),
            machine,
            cancel: cancel_rx,
            stream: Some(stream_tx),
            camera,
            seq: 0,
            peer_left: false,
        };
        let deadline = Instant::now() + self.negotiation_timeout;
        let task = tokio::spawn(async move {
            if let Some(mut previous) = previous {
                // the superseded session must leave the relay before this one subscribes
                let _ = previous.wait_for(|done| *done).await;
            }
            negotiation.run(deadline).await;
            released.send_replace(true);
        });
        PairingHandle {
            code,
            role,
            state,
            cancel,
            stream: Some(stream_rx),
            task: Some(task),
        }
    }
}

/// Caller's view of one pairing session. Dropping it cancels the session.
pub struct PairingHandle {
    code: SessionCode,
    role: PairingRole,
    state: watch::Receiver<PairingState>,
    cancel: Arc<watch::Sender<bool>>,
    stream: Option<oneshot::Receiver<Box<dyn FrameSource + Send>>>,
    task: Option<JoinHandle<()>>,
}

impl PairingHandle {
    pub fn code(&self) -> &SessionCode {
        &self.code
    }

    pub fn role(&self) -> PairingRole {
        self.role
    }

    pub fn state(&self) -> PairingState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<PairingState> {
        self.state.clone()
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Waits until the session is connected or has ended.
    pub async fn settled(&mut self) -> PairingState {
        self.wait_for(|state| *state == PairingState::Connected || state.is_terminal())
            .await
    }

    /// Waits until the session reaches `failed` or `cancelled`.
    pub async fn ended(&mut self) -> PairingState {
        self.wait_for(PairingState::is_terminal).await
    }

    async fn wait_for(&mut self, done: impl Fn(&PairingState) -> bool) -> PairingState {
        loop {
            let current = self.state.borrow_and_update().clone();
            if done(&current) {
                return current;
            }
            if self.state.changed().await.is_err() {
                return self.state.borrow().clone();
            }
        }
    }

    /// Remote stream, available once on the receiver after `connected`.
    pub fn take_stream(&mut self) -> Option<Box<dyn FrameSource + Send>> {
        let stream = self.stream.as_mut()?.try_recv().ok()?;
        self.stream = None;
        Some(stream)
    }

    /// Binds the remote stream as the camera source and hands back the source
    /// it replaced. Returns `None` while no stream is available.
    pub fn bind_into(&mut self, slot: &mut CameraSlot) -> Option<Box<dyn FrameSource + Send>> {
        let stream = self.take_stream()?;
        let replaced = slot.substitute(
            stream,
            SourceOrigin::Remote {
                code: self.code.to_string(),
            },
        );
        log::info!(
            "camera source {} replaced by paired stream {}",
            replaced.label(),
            slot.label()
        );
        Some(replaced)
    }

    /// Cancels and waits until the relay subscription and media link are released.
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PairingHandle {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

struct Negotiation {
    relay: Arc<dyn SignalingRelay>,
    connector: Arc<dyn PeerConnector>,
    code: SessionCode,
    machine: PairingMachine,
    cancel: watch::Receiver<bool>,
    stream: Option<oneshot::Sender<Box<dyn FrameSource + Send>>>,
    camera: Option<Box<dyn FrameSource + Send>>,
    seq: u64,
    peer_left: bool,
}

impl Negotiation {
    async fn run(mut self, deadline: Instant) {
        let role = self.machine.role();
        let mut inbox = match self.relay.subscribe(&self.code, role).await {
            Ok(inbox) => inbox,
            Err(err) => {
                self.machine.fail(err.to_string());
                self.connector.close().await;
                return;
            }
        };
        if let Err(err) = self.open().await {
            self.machine.fail(err.to_string());
        } else {
            self.drive(&mut inbox, deadline).await;
        }
        self.teardown().await;
    }

    async fn open(&mut self) -> RideResult<()> {
        self.machine.advance(PairingState::Waiting)?;
        if self.machine.role() == PairingRole::Sender {
            self.send(SignalMessage::Join).await?;
            self.machine.advance(PairingState::PhoneJoined)?;
        }
        Ok(())
    }

    async fn drive(&mut self, inbox: &mut mpsc::UnboundedReceiver<SignalEnvelope>, deadline: Instant) {
        let timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(timeout);
        while !self.machine.state().is_terminal() {
            let connected = *self.machine.state() == PairingState::Connected;
            tokio::select! {
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        let _ = self.machine.advance(PairingState::Cancelled);
                    }
                }
                _ = &mut timeout, if !connected => {
                    self.machine.fail("negotiation timed out");
                }
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => {
                        if let Err(err) = self.handle(envelope).await {
                            self.machine.fail(err.to_string());
                        }
                    }
                    None => self.machine.fail("relay subscription closed"),
                },
            }
        }
    }

    async fn handle(&mut self, envelope: SignalEnvelope) -> RideResult<()> {
        if envelope.from == self.machine.role() {
            return Ok(());
        }
        let state = self.machine.state().clone();
        match (self.machine.role(), envelope.message) {
            (PairingRole::Receiver, SignalMessage::Join) if state == PairingState::Waiting => {
                self.machine.advance(PairingState::PhoneJoined)?;
                let offer = self.connector.create_offer().await?;
                self.machine.advance(PairingState::Connecting)?;
                self.send(SignalMessage::Offer { sdp: offer }).await?;
                self.send_candidates().await
            }
            (PairingRole::Receiver, SignalMessage::Answer { sdp })
                if state == PairingState::Connecting =>
            {
                let stream = self.connector.accept_answer(&sdp).await?;
                if let Some(slot) = self.stream.take() {
                    let _ = slot.send(stream);
                }
                self.machine.advance(PairingState::Connected)
            }
            (PairingRole::Sender, SignalMessage::Offer { sdp })
                if state == PairingState::PhoneJoined =>
            {
                self.machine.advance(PairingState::Connecting)?;
                let camera = self
                    .camera
                    .take()
                    .ok_or_else(|| RideError::Media("camera already in use".to_string()))?;
                let answer = self.connector.answer_offer(&sdp, camera).await?;
                self.send(SignalMessage::Answer { sdp: answer }).await?;
                self.send_candidates().await?;
                self.machine.advance(PairingState::Connected)
            }
            (_, SignalMessage::Candidate { candidate }) => {
                self.connector.add_candidate(&candidate).await
            }
            (_, SignalMessage::Leave { reason }) => {
                self.peer_left = true;
                self.machine.fail(format!("peer left: {}", reason));
                Ok(())
            }
            (_, message) => {
                log::debug!(
                    "pairing {} ignoring {} in {}",
                    self.code,
                    message.kind(),
                    state.label()
                );
                Ok(())
            }
        }
    }

    async fn send(&mut self, message: SignalMessage) -> RideResult<()> {
        self.seq += 1;
        self.relay
            .publish(SignalEnvelope {
                code: self.code.clone(),
                from: self.machine.role(),
                seq: self.seq,
                message,
            })
            .await
    }

    async fn send_candidates(&mut self) -> RideResult<()> {
        for candidate in self.connector.local_candidates() {
            self.send(SignalMessage::Candidate { candidate }).await?;
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        let role = self.machine.role();
        if !self.peer_left {
            let reason = match self.machine.state() {
                PairingState::Failed(reason) => reason.clone(),
                _ => "cancelled".to_string(),
            };
            if let Err(err) = self.send(SignalMessage::Leave { reason }).await {
                log::debug!("pairing {} leave not delivered: {}", self.code, err);
            }
        }
        self.connector.close().await;
        if let Err(err) = self.relay.unsubscribe(&self.code, role).await {
            log::warn!("pairing {} unsubscribe failed: {}", self.code, err);
        }
        log::info!(
            "pairing {} {} closed as {}",
            self.code,
            role.as_str(),
            self.machine.state().label()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::media::{LoopbackConnector, LoopbackNetwork};
    use crate::pairing::signaling::InMemoryRelay;
    use crate::processing::frame::Frame;

    struct StillCamera(&'static str);

    impl FrameSource for StillCamera {
        fn next_frame(&mut self) -> Option<Frame> {
            Some(Frame::filled(4, 4, [200, 200, 200, 255]))
        }
        fn label(&self) -> &str {
            self.0
        }
    }

    fn services(relay: Arc<InMemoryRelay>) -> (PairingService, PairingService) {
        services_on(relay, LoopbackNetwork::new())
    }

    fn services_on(
        relay: Arc<InMemoryRelay>,
        network: LoopbackNetwork,
    ) -> (PairingService, PairingService) {
        let tuning = TuningConfig::default();
        let primary = PairingService::new(
            relay.clone(),
            {
                let network = network.clone();
                move || -> Arc<dyn PeerConnector> {
                    Arc::new(LoopbackConnector::new(network.clone(), Duration::from_millis(5)))
                }
            },
            &tuning,
        )
        .with_codes(CodeAllocator::with_seed(3));
        let phone = PairingService::new(
            relay,
            move || -> Arc<dyn PeerConnector> {
                Arc::new(LoopbackConnector::new(network.clone(), Duration::from_millis(5)))
            },
            &tuning,
        );
        (primary, phone)
    }

    #[tokio::test]
    async fn host_and_join_reach_connected_and_stream_frames() {
        let relay = Arc::new(InMemoryRelay::new());
        let (mut primary, mut phone) = services(relay.clone());

        let mut host = primary.host();
        let mut guest = phone.join(host.code().clone(), Box::new(StillCamera("phone")));

        assert_eq!(host.settled().await, PairingState::Connected);
        assert_eq!(guest.settled().await, PairingState::Connected);

        let mut slot = CameraSlot::local(Box::new(StillCamera("local")));
        let local = host.bind_into(&mut slot).unwrap();
        assert_eq!(local.label(), "local");
        assert!(host.bind_into(&mut slot).is_none());
        assert_eq!(
            *slot.origin(),
            SourceOrigin::Remote {
                code: host.code().to_string()
            }
        );

        let mut frame = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            frame = slot.next_frame();
            if frame.is_some() {
                break;
            }
        }
        assert!(frame.is_some());

        let code = host.code().clone();
        guest.shutdown().await;
        assert_eq!(
            host.ended().await,
            PairingState::Failed("peer left: cancelled".into())
        );
        host.shutdown().await;
        assert!(!relay.is_subscribed(&code, PairingRole::Receiver));
        assert!(!relay.is_subscribed(&code, PairingRole::Sender));
        assert_eq!(relay.open_codes(), 0);

        // the remote source stays bound and simply dries up
        for _ in 0..5 {
            let _ = slot.next_frame();
        }
        assert!(matches!(slot.origin(), SourceOrigin::Remote { .. }));
    }

    #[tokio::test]
    async fn cancel_while_waiting_releases_relay_subscription() {
        let relay = Arc::new(InMemoryRelay::new());
        let (mut primary, _) = services(relay.clone());
        let mut host = primary.host();
        let code = host.code().clone();

        let mut states = host.watch_state();
        while *states.borrow_and_update() != PairingState::Waiting {
            states.changed().await.unwrap();
        }
        assert!(relay.is_subscribed(&code, PairingRole::Receiver));

        host.cancel();
        assert_eq!(host.settled().await, PairingState::Cancelled);
        host.shutdown().await;
        assert!(!relay.is_subscribed(&code, PairingRole::Receiver));
    }

    #[tokio::test]
    async fn unavailable_relay_fails_with_cause() {
        let relay = Arc::new(InMemoryRelay::new());
        relay.set_available(false);
        let (mut primary, _) = services(relay);
        let mut host = primary.host();
        assert_eq!(
            host.settled().await,
            PairingState::Failed("signaling failure: relay unavailable".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn negotiation_times_out_without_a_phone() {
        let relay = Arc::new(InMemoryRelay::new());
        let (mut primary, _) = services(relay);
        let mut host = primary.host();
        assert_eq!(
            host.settled().await,
            PairingState::Failed("negotiation timed out".into())
        );
    }

    #[tokio::test]
    async fn negotiation_failure_reaches_both_ends() {
        let relay = Arc::new(InMemoryRelay::new());
        let network = LoopbackNetwork::new();
        let tuning = TuningConfig::default();
        let mut primary = PairingService::new(
            relay.clone(),
            {
                let network = network.clone();
                move || -> Arc<dyn PeerConnector> {
                    Arc::new(LoopbackConnector::failing(network.clone(), "ice failed"))
                }
            },
            &tuning,
        );
        let mut phone = PairingService::new(
            relay,
            move || -> Arc<dyn PeerConnector> {
                Arc::new(LoopbackConnector::new(network.clone(), Duration::from_millis(5)))
            },
            &tuning,
        );

        let mut host = primary.host();
        let mut guest = phone.join(host.code().clone(), Box::new(StillCamera("phone")));
        assert_eq!(
            host.settled().await,
            PairingState::Failed("negotiation failure: ice failed".into())
        );
        assert_eq!(
            guest.settled().await,
            PairingState::Failed("peer left: negotiation failure: ice failed".into())
        );
    }

    #[tokio::test]
    async fn retry_allocates_a_fresh_code() {
        let relay = Arc::new(InMemoryRelay::new());
        let (mut primary, _) = services(relay);
        let first = primary.host();
        let first_code = first.code().clone();
        let second = primary.retry(first);
        assert_ne!(*second.code(), first_code);
    }

    async fn wait_for_state(handle: &PairingHandle, target: PairingState) {
        let mut states = handle.watch_state();
        while *states.borrow_and_update() != target {
            states.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn hosting_again_cancels_the_previous_session() {
        let relay = Arc::new(InMemoryRelay::new());
        let (mut primary, _) = services(relay.clone());
        let mut first = primary.host();
        wait_for_state(&first, PairingState::Waiting).await;
        let first_code = first.code().clone();

        let second = primary.host();
        assert_eq!(first.ended().await, PairingState::Cancelled);
        first.shutdown().await;
        assert!(!relay.is_subscribed(&first_code, PairingRole::Receiver));

        wait_for_state(&second, PairingState::Waiting).await;
        assert!(relay.is_subscribed(second.code(), PairingRole::Receiver));
        assert_eq!(primary.active_code(PairingRole::Receiver), Some(second.code()));
    }

    #[tokio::test]
    async fn joining_again_cancels_the_previous_join() {
        let relay = Arc::new(InMemoryRelay::new());
        let (_, mut phone) = services(relay);
        let code = SessionCode::parse("505050").unwrap();
        let mut first = phone.join(code.clone(), Box::new(StillCamera("phone")));
        let _second = phone.join(code, Box::new(StillCamera("phone")));
        assert_eq!(first.ended().await, PairingState::Cancelled);
    }

    #[tokio::test]
    async fn dropped_handle_is_no_longer_active() {
        let relay = Arc::new(InMemoryRelay::new());
        let (mut primary, _) = services(relay);
        let host = primary.host();
        assert!(primary.active_code(PairingRole::Receiver).is_some());
        drop(host);
        assert!(primary.active_code(PairingRole::Receiver).is_none());
    }

    #[tokio::test]
    async fn cancel_while_connecting_releases_link_and_relay() {
        let relay = Arc::new(InMemoryRelay::new());
        let network = LoopbackNetwork::new();
        let (mut primary, _) = services_on(relay.clone(), network.clone());
        let mut host = primary.host();
        let code = host.code().clone();
        wait_for_state(&host, PairingState::Waiting).await;

        // a phone that joins but never answers the offer
        relay
            .publish(SignalEnvelope {
                code: code.clone(),
                from: PairingRole::Sender,
                seq: 1,
                message: SignalMessage::Join,
            })
            .await
            .unwrap();
        wait_for_state(&host, PairingState::Connecting).await;
        assert_eq!(network.open_links(), 1);

        host.cancel();
        assert_eq!(host.ended().await, PairingState::Cancelled);
        host.shutdown().await;
        assert_eq!(network.open_links(), 0);
        assert!(!relay.is_subscribed(&code, PairingRole::Receiver));
        assert_eq!(relay.open_codes(), 0);
    }
}
