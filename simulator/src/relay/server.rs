use crate::relay::model::{PollQuery, RelayStore};
use pedalcore::pairing::{PairingRole, SignalEnvelope};
use pedalcore::RideSnapshot;
use serde_json::json;
use std::{
    net::SocketAddr,
    sync::{Arc, RwLock},
};
use warp::{http::StatusCode, Filter, Rejection, Reply};

pub fn relay_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9000))
}

#[derive(Debug)]
struct StoreUnavailable;

impl warp::reject::Reject for StoreUnavailable {}

#[derive(Debug)]
struct UnknownRole;

impl warp::reject::Reject for UnknownRole {}

type SharedStore = Arc<RwLock<RelayStore>>;

fn status(message: &str, code: StatusCode) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(&json!({ "status": message })), code)
}

fn parse_role(role: &str) -> Result<PairingRole, Rejection> {
    PairingRole::parse(role).ok_or_else(|| warp::reject::custom(UnknownRole))
}

/// Signaling and state-mirroring relay served over HTTP.
#[derive(Clone, Default)]
pub struct RelayServer {
    store: SharedStore,
}

impl RelayServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let store = self.store.clone();
        let store_filter = warp::any().map(move || store.clone());

        let publish_route = warp::path!("signal" / String)
            .and(warp::post())
            .and(warp::body::json())
            .and(store_filter.clone())
            .and_then(
                |code: String, envelope: SignalEnvelope, store: SharedStore| async move {
                    if envelope.code.as_str() != code {
                        return Ok::<_, Rejection>(status("code mismatch", StatusCode::BAD_REQUEST));
                    }
                    let mut guard = store
                        .write()
                        .map_err(|_| warp::reject::custom(StoreUnavailable))?;
                    log::debug!(
                        "relay {} {} from {} #{}",
                        code,
                        envelope.message.kind(),
                        envelope.from.as_str(),
                        envelope.seq
                    );
                    if !guard.publish(envelope) {
                        log::debug!("relay {} dropped message for a departed role", code);
                    }
                    Ok(status("ok", StatusCode::OK))
                },
            );

        let poll_route = warp::path!("signal" / String / String)
            .and(warp::get())
            .and(warp::query::<PollQuery>())
            .and(store_filter.clone())
            .and_then(
                |code: String, role: String, query: PollQuery, store: SharedStore| async move {
                    let role = parse_role(&role)?;
                    let mut guard = store
                        .write()
                        .map_err(|_| warp::reject::custom(StoreUnavailable))?;
                    let messages = guard.poll(&code, role, query.after);
                    Ok::<_, Rejection>(warp::reply::json(&messages))
                },
            );

        let leave_route = warp::path!("signal" / String / String)
            .and(warp::delete())
            .and(store_filter.clone())
            .and_then(|code: String, role: String, store: SharedStore| async move {
                let role = parse_role(&role)?;
                let mut guard = store
                    .write()
                    .map_err(|_| warp::reject::custom(StoreUnavailable))?;
                guard.leave(&code, role);
                Ok::<_, Rejection>(status("ok", StatusCode::OK))
            });

        let push_state_route = warp::path!("state" / String)
            .and(warp::post())
            .and(warp::body::json())
            .and(store_filter.clone())
            .and_then(
                |code: String, snapshot: RideSnapshot, store: SharedStore| async move {
                    let mut guard = store
                        .write()
                        .map_err(|_| warp::reject::custom(StoreUnavailable))?;
                    guard.set_state(&code, snapshot);
                    Ok::<_, Rejection>(status("ok", StatusCode::OK))
                },
            );

        let clear_state_route = warp::path!("state" / String)
            .and(warp::delete())
            .and(store_filter.clone())
            .and_then(|code: String, store: SharedStore| async move {
                let mut guard = store
                    .write()
                    .map_err(|_| warp::reject::custom(StoreUnavailable))?;
                guard.clear_state(&code);
                Ok::<_, Rejection>(status("ok", StatusCode::OK))
            });

        let view_state_route = warp::path!("state" / String)
            .and(warp::get())
            .and(store_filter)
            .and_then(|code: String, store: SharedStore| async move {
                let guard = store
                    .read()
                    .map_err(|_| warp::reject::custom(StoreUnavailable))?;
                let reply = match guard.state(&code) {
                    Some(snapshot) => {
                        warp::reply::with_status(warp::reply::json(snapshot), StatusCode::OK)
                    }
                    None => status("no state for code", StatusCode::NOT_FOUND),
                };
                Ok::<_, Rejection>(reply)
            });

        publish_route
            .or(poll_route)
            .or(leave_route)
            .or(push_state_route)
            .or(clear_state_route)
            .or(view_state_route)
    }

    /// Serves on `addr` until the runtime shuts down; returns the bound address.
    pub fn spawn(&self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let (bound, server) = warp::serve(self.routes()).try_bind_ephemeral(addr)?;
        tokio::spawn(server);
        log::info!("signaling relay listening on http://{}", bound);
        Ok(bound)
    }
}
