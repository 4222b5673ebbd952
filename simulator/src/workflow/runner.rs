use crate::generator::profile::{StaticCamera, SyntheticPedalCamera};
use crate::video::SimulatedVideo;
use crate::workflow::config::WorkflowConfig;
use anyhow::Context;
use pedalcore::camera::{CameraSlot, FrameSource, SourceOrigin};
use pedalcore::pairing::{
    BroadcastHandle, LoopbackConnector, LoopbackNetwork, PairingHandle, PairingService,
    PairingState, PeerConnector, SessionCode, SignalingRelay, StateBroadcaster,
};
use pedalcore::telemetry::MetricsSnapshot;
use pedalcore::{CameraLayout, RideResult, RideSession, RideSnapshot, RideSummary};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Length of the looping route video.
const ROUTE_VIDEO_SECS: f64 = 600.0;
const TRACE_INTERVAL_MS: f64 = 1_000.0;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TracePoint {
    pub t_ms: f64,
    pub rpm: f32,
    pub velocity_kmh: f32,
    pub playback_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RideReport {
    pub summary: RideSummary,
    pub trace: Vec<TracePoint>,
    pub metrics: MetricsSnapshot,
    pub video_position_secs: f64,
    pub video_restarts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairedReport {
    pub code: String,
    pub summary: RideSummary,
    pub remote_bound: bool,
    pub pairing_state: String,
    pub metrics: MetricsSnapshot,
}

/// A ride whose camera may be swapped for a paired phone's stream.
pub struct RideRig {
    session: RideSession,
    slot: CameraSlot,
    video: SimulatedVideo,
    pairing: Option<PairingHandle>,
    parked_local: Option<Box<dyn FrameSource + Send>>,
    broadcast: Option<(Arc<dyn SignalingRelay>, BroadcastHandle)>,
    last_ms: f64,
}

impl RideRig {
    pub fn new(session: RideSession, camera: Box<dyn FrameSource + Send>) -> Self {
        Self {
            session,
            slot: CameraSlot::local(camera),
            video: SimulatedVideo::new(ROUTE_VIDEO_SECS),
            pairing: None,
            parked_local: None,
            broadcast: None,
            last_ms: 0.0,
        }
    }

    pub fn session(&self) -> &RideSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut RideSession {
        &mut self.session
    }

    pub fn origin(&self) -> &SourceOrigin {
        self.slot.origin()
    }

    pub fn video(&self) -> &SimulatedVideo {
        &self.video
    }

    pub fn video_mut(&mut self) -> &mut SimulatedVideo {
        &mut self.video
    }

    pub fn attach_pairing(&mut self, handle: PairingHandle) {
        self.pairing = Some(handle);
    }

    pub fn pairing_state(&self) -> Option<PairingState> {
        self.pairing.as_ref().map(PairingHandle::state)
    }

    /// Mirrors the ride to viewers of `code` until the ride finishes or the
    /// code is cleared.
    pub fn start_broadcast(
        &mut self,
        relay: Arc<dyn SignalingRelay>,
        code: SessionCode,
    ) -> RideResult<()> {
        self.session.tuning().validate()?;
        let interval = Duration::from_millis(self.session.tuning().broadcast_interval_ms);
        let handle = StateBroadcaster::spawn(
            relay.clone(),
            code,
            self.session.subscribe(),
            interval,
            self.session.metrics(),
        );
        self.stop_broadcast();
        self.broadcast = Some((relay, handle));
        Ok(())
    }

    pub fn is_broadcasting(&self) -> bool {
        self.broadcast
            .as_ref()
            .map_or(false, |(_, handle)| handle.is_running())
    }

    /// Stops pushing but leaves the last mirrored snapshot for viewers.
    fn stop_broadcast(&mut self) -> Option<(Arc<dyn SignalingRelay>, SessionCode)> {
        let (relay, handle) = self.broadcast.take()?;
        let code = handle.code().clone();
        handle.stop();
        Some((relay, code))
    }

    /// Stops pushing and withdraws the mirrored snapshot from the relay.
    pub async fn clear_display_code(&mut self) {
        if let Some((relay, code)) = self.stop_broadcast() {
            if let Err(err) = relay.clear_state(&code).await {
                log::warn!("clearing mirrored state for {} failed: {}", code, err);
            }
        }
    }

    /// Swaps in the paired stream as soon as the pairing connects.
    fn poll_pairing(&mut self) {
        if self.parked_local.is_some() {
            return;
        }
        if let Some(handle) = self.pairing.as_mut() {
            if let Some(local) = handle.bind_into(&mut self.slot) {
                self.parked_local = Some(local);
                self.session.camera_source_changed();
            }
        }
    }

    /// A new layout ends any pairing and goes back to the local camera.
    pub fn select_layout(&mut self, layout: CameraLayout) {
        self.session.set_layout(layout);
        if let Some(handle) = self.pairing.take() {
            handle.cancel();
        }
        if let Some(local) = self.parked_local.take() {
            self.slot.substitute(local, SourceOrigin::Local);
            self.session.camera_source_changed();
        }
    }

    /// One render tick: camera frame, cadence, physics, video.
    pub fn frame(&mut self, now_ms: f64) -> RideSnapshot {
        self.poll_pairing();
        if let Some(frame) = self.slot.next_frame() {
            self.session.process_frame(frame, now_ms);
        }
        let snapshot = self.session.tick(now_ms);
        self.session.sync_video(&mut self.video);
        self.video.advance(now_ms - self.last_ms);
        self.last_ms = now_ms;
        snapshot
    }

    pub async fn shutdown(mut self) {
        self.stop_broadcast();
        if let Some(handle) = self.pairing.take() {
            handle.shutdown().await;
        }
    }
}

#[derive(Clone)]
pub struct Runner {
    config: WorkflowConfig,
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    fn new_session(&self) -> RideSession {
        RideSession::with_layout(
            self.config.profile.sanitized(),
            self.config.tuning.clone(),
            self.config.layout,
        )
    }

    /// Rides the synthetic camera in virtual time, as fast as possible.
    pub fn execute(&self) -> anyhow::Result<RideReport> {
        self.config.validate()?;
        let session = self.new_session();
        let camera = SyntheticPedalCamera::new(
            self.config.to_generator_config(),
            session.zones().to_vec(),
        );
        let mut rig = RideRig::new(session, Box::new(camera));
        rig.session_mut().start(0.0).context("starting ride")?;

        let frame_ms = self.config.frame_interval_ms();
        let mut stalls: Vec<f64> = self
            .config
            .video_stalls_secs
            .iter()
            .map(|secs| f64::from(*secs) * 1_000.0)
            .collect();
        stalls.sort_by(|a, b| a.total_cmp(b));
        let mut stalls = stalls.into_iter().peekable();
        let mut trace = Vec::new();
        let mut next_trace_ms = 0.0;
        let mut now_ms = 0.0;
        for index in 1..=self.config.frame_count() {
            now_ms = index as f64 * frame_ms;
            if stalls.next_if(|at| *at <= now_ms).is_some() {
                log::debug!("route video stalled at {:.0} ms", now_ms);
                rig.video_mut().stall();
            }
            let snapshot = rig.frame(now_ms);
            if now_ms >= next_trace_ms {
                trace.push(TracePoint {
                    t_ms: now_ms,
                    rpm: snapshot.rpm,
                    velocity_kmh: snapshot.velocity_kmh,
                    playback_rate: rig.session().playback_rate(),
                });
                next_trace_ms += TRACE_INTERVAL_MS;
            }
        }

        let summary = rig
            .session_mut()
            .finish(now_ms)
            .context("finishing ride")?;
        Ok(RideReport {
            summary,
            trace,
            metrics: rig.session().metrics_snapshot(),
            video_position_secs: rig.video().position_secs(),
            video_restarts: rig.session().video_restarts(),
        })
    }

    /// Rides in real time while a loopback phone pairs in, streams the
    /// synthetic camera and the ride is mirrored over `relay`.
    pub async fn execute_paired(&self, relay: Arc<dyn SignalingRelay>) -> anyhow::Result<PairedReport> {
        self.config.validate()?;
        let frame_interval = Duration::from_secs_f64(self.config.frame_interval_ms() / 1_000.0);
        let network = LoopbackNetwork::new();
        let connectors = move || -> Arc<dyn PeerConnector> {
            Arc::new(LoopbackConnector::new(network.clone(), frame_interval))
        };
        let mut primary = PairingService::new(relay.clone(), connectors.clone(), &self.config.tuning);
        let mut phone = PairingService::new(relay.clone(), connectors, &self.config.tuning);

        let session = self.new_session();
        let phone_camera = SyntheticPedalCamera::new(
            self.config.to_generator_config(),
            session.zones().to_vec(),
        );
        let local_camera = StaticCamera::new(
            self.config.frame_width,
            self.config.frame_height,
            self.config.noise,
            self.config.seed.wrapping_add(1),
        );

        let host = primary.host();
        let code = host.code().clone();
        log::info!("pairing code {} ({})", code, code.join_link("https://pedalsight.example.com"));
        let guest = phone.join(code.clone(), Box::new(phone_camera));

        let mut rig = RideRig::new(session, Box::new(local_camera));
        rig.attach_pairing(host);
        rig.start_broadcast(relay.clone(), code.clone())
            .context("starting state broadcast")?;

        let started = tokio::time::Instant::now();
        rig.session_mut().start(0.0).context("starting ride")?;
        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut now_ms = 0.0;
        for _ in 0..self.config.frame_count() {
            ticker.tick().await;
            now_ms = started.elapsed().as_secs_f64() * 1_000.0;
            rig.frame(now_ms);
        }

        let summary = rig
            .session_mut()
            .finish(now_ms)
            .context("finishing ride")?;
        let final_snapshot = rig.session().snapshot();
        if let Err(err) = relay.push_state(&code, &final_snapshot).await {
            log::warn!("final state push to {} failed: {}", code, err);
        }

        let remote_bound = matches!(rig.origin(), SourceOrigin::Remote { .. });
        let pairing_state = rig
            .pairing_state()
            .map(|state| state.label().to_string())
            .unwrap_or_else(|| "none".to_string());
        let metrics = rig.session().metrics_snapshot();
        rig.shutdown().await;
        guest.shutdown().await;

        Ok(PairedReport {
            code: code.to_string(),
            summary,
            remote_bound,
            pairing_state,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pedalcore::pairing::{InMemoryRelay, PairingRole};
    use pedalcore::processing::VideoHandle;
    use pedalcore::{Gear, RidePhase};

    fn config(cadence_rpm: f32, duration_secs: f32, layout: CameraLayout) -> WorkflowConfig {
        WorkflowConfig {
            seed: 5,
            frame_width: 80,
            frame_height: 60,
            ..WorkflowConfig::from_args(cadence_rpm, duration_secs, layout, Gear::Medium)
        }
    }

    #[test]
    fn runner_tracks_side_view_cadence() {
        let report = Runner::new(config(60.0, 12.0, CameraLayout::Side)).execute().unwrap();
        let last = report.trace.last().unwrap();
        assert!((last.rpm - 60.0).abs() < 6.0, "rpm {}", last.rpm);
        assert!(last.velocity_kmh > 5.0);
        assert!(report.summary.distance_km > 0.0);
        assert!(report.video_position_secs > 0.0);
        assert_eq!(report.video_restarts, 1);
        assert_eq!(report.metrics.frames_skipped, 1);
    }

    #[test]
    fn stalled_route_video_is_restarted_while_riding() {
        let mut cfg = config(60.0, 12.0, CameraLayout::Side);
        cfg.video_stalls_secs = vec![8.0, 4.0];
        let report = Runner::new(cfg).execute().unwrap();
        assert_eq!(report.video_restarts, 3);
        assert!(report.video_position_secs > 0.0);
    }

    #[test]
    fn refused_restart_is_retried_on_later_frames() {
        let cfg = config(60.0, 2.0, CameraLayout::Side);
        let runner = Runner::new(cfg);
        let mut rig = RideRig::new(runner.new_session(), Box::new(StaticCamera::new(80, 60, 0, 1)));
        rig.session_mut().start(0.0).unwrap();
        rig.video_mut().set_refuse_play(true);
        for tick in 1..=5 {
            rig.frame(tick as f64 * 33.0);
        }
        assert!(rig.video().is_paused());
        assert_eq!(rig.session().video_restarts(), 0);

        rig.video_mut().set_refuse_play(false);
        rig.frame(200.0);
        assert!(!rig.video().is_paused());
        assert_eq!(rig.session().video_restarts(), 1);
    }

    #[test]
    fn zero_broadcast_interval_is_refused() {
        let mut cfg = config(60.0, 2.0, CameraLayout::Side);
        cfg.tuning.broadcast_interval_ms = 0;
        let runner = Runner::new(cfg);
        let mut rig = RideRig::new(runner.new_session(), Box::new(StaticCamera::new(80, 60, 0, 1)));
        let relay: Arc<dyn SignalingRelay> = Arc::new(InMemoryRelay::new());
        let code = SessionCode::parse("121212").unwrap();
        assert!(rig.start_broadcast(relay, code).is_err());
        assert!(!rig.is_broadcasting());
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_the_display_code_withdraws_mirrored_state() {
        let relay = Arc::new(InMemoryRelay::new());
        let runner = Runner::new(config(60.0, 2.0, CameraLayout::Side));
        let mut rig = RideRig::new(runner.new_session(), Box::new(StaticCamera::new(80, 60, 0, 1)));
        let code = SessionCode::parse("343434").unwrap();
        rig.start_broadcast(relay.clone(), code.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(relay.latest_state(&code).is_some());
        assert!(rig.is_broadcasting());

        rig.clear_display_code().await;
        assert!(!rig.is_broadcasting());
        assert!(relay.latest_state(&code).is_none());
    }

    #[test]
    fn runner_tracks_front_view_cadence() {
        let report = Runner::new(config(60.0, 12.0, CameraLayout::Front)).execute().unwrap();
        let last = report.trace.last().unwrap();
        assert!((last.rpm - 60.0).abs() < 6.0, "rpm {}", last.rpm);
    }

    #[test]
    fn stopped_rider_winds_down() {
        let mut cfg = config(80.0, 16.0, CameraLayout::Side);
        cfg.stop_after_secs = Some(8.0);
        let report = Runner::new(cfg).execute().unwrap();
        let at_stop = report
            .trace
            .iter()
            .find(|point| point.t_ms >= 8_000.0)
            .unwrap();
        let last = report.trace.last().unwrap();
        assert!(at_stop.rpm > 60.0);
        assert_eq!(last.rpm, 0.0);
        assert!(last.velocity_kmh < at_stop.velocity_kmh);
    }

    #[test]
    fn in_phase_front_view_is_not_doubled() {
        let mut cfg = config(60.0, 12.0, CameraLayout::Front);
        cfg.in_phase = true;
        let report = Runner::new(cfg).execute().unwrap();
        assert!(report.trace.iter().all(|point| point.rpm < 100.0));
    }

    #[tokio::test(start_paused = true)]
    async fn paired_ride_uses_phone_camera_and_mirrors_state() {
        let relay = Arc::new(InMemoryRelay::new());
        let runner = Runner::new(config(60.0, 10.0, CameraLayout::Side));
        let report = runner.execute_paired(relay.clone()).await.unwrap();

        assert!(report.remote_bound);
        assert_eq!(report.pairing_state, "connected");
        assert!(report.summary.pedal_events > 0);
        assert!(report.metrics.broadcasts_sent > 0);

        let code = SessionCode::parse(&report.code).unwrap();
        assert_eq!(relay.latest_state(&code).unwrap().phase, RidePhase::Finished);
        assert!(!relay.is_subscribed(&code, PairingRole::Receiver));
    }

    #[tokio::test]
    async fn layout_change_cancels_pairing_and_restores_local_camera() {
        let relay = Arc::new(InMemoryRelay::new());
        let network = LoopbackNetwork::new();
        let cfg = config(60.0, 5.0, CameraLayout::Side);
        let tuning = cfg.tuning.clone();
        let connectors = move || -> Arc<dyn PeerConnector> {
            Arc::new(LoopbackConnector::new(network.clone(), Duration::from_millis(5)))
        };
        let mut primary = PairingService::new(relay.clone(), connectors.clone(), &tuning);
        let mut phone = PairingService::new(relay.clone(), connectors, &tuning);

        let runner = Runner::new(cfg.clone());
        let session = runner.new_session();
        let phone_camera = SyntheticPedalCamera::new(cfg.to_generator_config(), session.zones().to_vec());
        let mut rig = RideRig::new(session, Box::new(StaticCamera::new(80, 60, 0, 1)));

        let mut host = primary.host();
        let code = host.code().clone();
        let mut guest = phone.join(code.clone(), Box::new(phone_camera));
        assert_eq!(host.settled().await, PairingState::Connected);
        rig.attach_pairing(host);
        rig.frame(10.0);
        assert!(matches!(rig.origin(), SourceOrigin::Remote { .. }));

        rig.select_layout(CameraLayout::Front);
        assert_eq!(rig.origin(), &SourceOrigin::Local);
        assert_eq!(rig.session().zones().len(), 4);
        assert!(rig.pairing_state().is_none());

        assert_eq!(guest.ended().await, PairingState::Failed("peer left: cancelled".into()));
        for _ in 0..50 {
            if !relay.is_subscribed(&code, PairingRole::Receiver) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!relay.is_subscribed(&code, PairingRole::Receiver));
    }
}
