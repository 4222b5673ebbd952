use crate::camera::{ChannelFrameSource, FrameSource};
use crate::prelude::{RideError, RideResult};
use crate::processing::frame::Frame;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Frames buffered on a media link before the sender starts dropping.
const LINK_CAPACITY: usize = 4;

/// Peer-to-peer media negotiation. The relay only carries the strings these
/// methods produce.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Receiver side: describe the link it is willing to accept.
    async fn create_offer(&self) -> RideResult<String>;

    /// Sender side: accept an offer and start streaming `camera` over it.
    async fn answer_offer(
        &self,
        offer: &str,
        camera: Box<dyn FrameSource + Send>,
    ) -> RideResult<String>;

    /// Receiver side: complete the link and hand out the incoming stream.
    async fn accept_answer(&self, answer: &str) -> RideResult<Box<dyn FrameSource + Send>>;

    async fn add_candidate(&self, candidate: &str) -> RideResult<()>;

    fn local_candidates(&self) -> Vec<String> {
        Vec::new()
    }

    /// Releases the link and anything half-established. Idempotent.
    async fn close(&self);
}

/// Shared medium for [`LoopbackConnector`]s in one process.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    links: Arc<Mutex<HashMap<String, mpsc::Sender<Frame>>>>,
    next_id: Arc<AtomicU64>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_links(&self) -> usize {
        self.links.lock().map(|links| links.len()).unwrap_or(0)
    }
}

#[derive(Default)]
struct LoopbackState {
    token: Option<String>,
    incoming: Option<mpsc::Receiver<Frame>>,
    pump: Option<JoinHandle<()>>,
    candidates: usize,
}

/// Connector that moves frames over an in-process channel.
pub struct LoopbackConnector {
    network: LoopbackNetwork,
    frame_interval: Duration,
    fail_with: Option<String>,
    state: Mutex<LoopbackState>,
}

impl LoopbackConnector {
    pub fn new(network: LoopbackNetwork, frame_interval: Duration) -> Self {
        Self {
            network,
            frame_interval,
            fail_with: None,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    /// A connector whose negotiation always fails with `reason`.
    pub fn failing(network: LoopbackNetwork, reason: impl Into<String>) -> Self {
        Self {
            fail_with: Some(reason.into()),
            ..Self::new(network, Duration::from_millis(33))
        }
    }

    pub fn remote_candidates(&self) -> usize {
        self.state.lock().map(|state| state.candidates).unwrap_or(0)
    }

    pub fn is_streaming(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.pump.as_ref().map_or(false, |pump| !pump.is_finished()))
            .unwrap_or(false)
    }

    fn check_failure(&self) -> RideResult<()> {
        match &self.fail_with {
            Some(reason) => Err(RideError::Negotiation(reason.clone())),
            None => Ok(()),
        }
    }

    fn lock_state(&self) -> RideResult<std::sync::MutexGuard<'_, LoopbackState>> {
        self.state
            .lock()
            .map_err(|_| RideError::Internal("connector lock poisoned".to_string()))
    }

    fn lock_links(&self) -> RideResult<std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<Frame>>>> {
        self.network
            .links
            .lock()
            .map_err(|_| RideError::Internal("loopback network lock poisoned".to_string()))
    }
}

fn spawn_pump(
    mut camera: Box<dyn FrameSource + Send>,
    link: mpsc::Sender<Frame>,
    frame_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(frame) = camera.next_frame() else {
                continue;
            };
            match link.try_send(frame) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("loopback link from {} closed by peer", camera.label());
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn create_offer(&self) -> RideResult<String> {
        self.check_failure()?;
        let id = self.network.next_id.fetch_add(1, Ordering::SeqCst);
        let token = format!("loopback-{}", id);
        let (sender, receiver) = mpsc::channel(LINK_CAPACITY);
        self.lock_links()?.insert(token.clone(), sender);
        let mut state = self.lock_state()?;
        state.token = Some(token.clone());
        state.incoming = Some(receiver);
        Ok(format!("offer:{}", token))
    }

    async fn answer_offer(
        &self,
        offer: &str,
        camera: Box<dyn FrameSource + Send>,
    ) -> RideResult<String> {
        self.check_failure()?;
        let token = offer
            .strip_prefix("offer:")
            .ok_or_else(|| RideError::Negotiation(format!("malformed offer {:?}", offer)))?;
        let link = self
            .lock_links()?
            .remove(token)
            .ok_or_else(|| RideError::Negotiation(format!("unknown offer {}", token)))?;
        let pump = spawn_pump(camera, link, self.frame_interval);
        let mut state = self.lock_state()?;
        if let Some(previous) = state.pump.replace(pump) {
            previous.abort();
        }
        state.token = Some(token.to_string());
        Ok(format!("answer:{}", token))
    }

    async fn accept_answer(&self, answer: &str) -> RideResult<Box<dyn FrameSource + Send>> {
        let token = answer
            .strip_prefix("answer:")
            .ok_or_else(|| RideError::Negotiation(format!("malformed answer {:?}", answer)))?;
        let mut state = self.lock_state()?;
        if state.token.as_deref() != Some(token) {
            return Err(RideError::Negotiation(format!(
                "answer {} does not match the pending offer",
                token
            )));
        }
        let incoming = state
            .incoming
            .take()
            .ok_or_else(|| RideError::Media("media stream already handed out".to_string()))?;
        Ok(Box::new(ChannelFrameSource::new(
            format!("remote:{}", token),
            incoming,
        )))
    }

    async fn add_candidate(&self, candidate: &str) -> RideResult<()> {
        log::debug!("loopback candidate {}", candidate);
        self.lock_state()?.candidates += 1;
        Ok(())
    }

    fn local_candidates(&self) -> Vec<String> {
        vec!["host 127.0.0.1 udp".to_string()]
    }

    async fn close(&self) {
        let token = match self.state.lock() {
            Ok(mut state) => {
                if let Some(pump) = state.pump.take() {
                    pump.abort();
                }
                state.incoming = None;
                state.token.take()
            }
            Err(_) => None,
        };
        if let (Some(token), Ok(mut links)) = (token, self.network.links.lock()) {
            links.remove(&token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingCamera(u8);

    impl FrameSource for CountingCamera {
        fn next_frame(&mut self) -> Option<Frame> {
            self.0 = self.0.wrapping_add(1);
            Some(Frame::filled(4, 4, [self.0, 0, 0, 255]))
        }
        fn label(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn loopback_link_streams_camera_frames() {
        let network = LoopbackNetwork::new();
        let primary = LoopbackConnector::new(network.clone(), Duration::from_millis(5));
        let phone = LoopbackConnector::new(network.clone(), Duration::from_millis(5));

        let offer = primary.create_offer().await.unwrap();
        assert_eq!(network.open_links(), 1);
        let answer = phone
            .answer_offer(&offer, Box::new(CountingCamera(0)))
            .await
            .unwrap();
        assert_eq!(network.open_links(), 0);
        let mut stream = primary.accept_answer(&answer).await.unwrap();

        let mut received = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            received = stream.next_frame();
            if received.is_some() {
                break;
            }
        }
        assert!(received.is_some());
        assert!(phone.is_streaming());

        phone.close().await;
        assert!(!phone.is_streaming());
    }

    #[tokio::test]
    async fn mismatched_answer_is_rejected() {
        let network = LoopbackNetwork::new();
        let primary = LoopbackConnector::new(network, Duration::from_millis(5));
        primary.create_offer().await.unwrap();
        let err = primary.accept_answer("answer:loopback-99").await.err().unwrap();
        assert!(matches!(err, RideError::Negotiation(_)));
    }

    #[tokio::test]
    async fn failing_connector_reports_negotiation_error() {
        let connector = LoopbackConnector::failing(LoopbackNetwork::new(), "no route");
        assert_eq!(
            connector.create_offer().await,
            Err(RideError::Negotiation("no route".into()))
        );
    }

    #[tokio::test]
    async fn remote_candidates_are_counted() {
        let connector = LoopbackConnector::new(LoopbackNetwork::new(), Duration::from_millis(5));
        assert_eq!(connector.remote_candidates(), 0);
        for candidate in connector.local_candidates() {
            connector.add_candidate(&candidate).await.unwrap();
        }
        connector.add_candidate("srflx 10.0.0.2 udp").await.unwrap();
        assert_eq!(connector.remote_candidates(), 2);
    }

    #[tokio::test]
    async fn close_releases_unanswered_offer() {
        let network = LoopbackNetwork::new();
        let primary = LoopbackConnector::new(network.clone(), Duration::from_millis(5));
        primary.create_offer().await.unwrap();
        primary.close().await;
        primary.close().await;
        assert_eq!(network.open_links(), 0);
    }
}
