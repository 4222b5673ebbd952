use async_trait::async_trait;
use pedalcore::pairing::{PairingRole, SessionCode, SignalEnvelope, SignalingRelay};
use pedalcore::{RideError, RideResult, RideSnapshot};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Consecutive failed polls after which a subscription is closed.
const MAX_POLL_FAILURES: u32 = 5;

fn signaling_error(err: reqwest::Error) -> RideError {
    RideError::Signaling(err.to_string())
}

/// [`SignalingRelay`] backed by the HTTP relay server. Subscriptions are
/// served by a background task that long-polls the mailbox.
pub struct HttpRelay {
    base_url: String,
    client: reqwest::Client,
    poll_interval: Duration,
    pollers: Mutex<HashMap<(SessionCode, PairingRole), JoinHandle<()>>>,
}

impl HttpRelay {
    pub fn new(base_url: impl Into<String>, poll_interval: Duration) -> RideResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(signaling_error)?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            poll_interval,
            pollers: Mutex::new(HashMap::new()),
        })
    }

    fn mailbox_url(&self, code: &SessionCode, role: PairingRole) -> String {
        format!("{}/signal/{}/{}", self.base_url, code, role.as_str())
    }

    fn stop_poller(&self, code: &SessionCode, role: PairingRole) {
        if let Ok(mut pollers) = self.pollers.lock() {
            if let Some(poller) = pollers.remove(&(code.clone(), role)) {
                poller.abort();
            }
        }
    }
}

async fn fetch(client: &reqwest::Client, url: &str, after: u64) -> RideResult<Vec<SignalEnvelope>> {
    client
        .get(url)
        .query(&[("after", after)])
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(signaling_error)?
        .json::<Vec<SignalEnvelope>>()
        .await
        .map_err(signaling_error)
}

#[async_trait]
impl SignalingRelay for HttpRelay {
    async fn subscribe(
        &self,
        code: &SessionCode,
        role: PairingRole,
    ) -> RideResult<mpsc::UnboundedReceiver<SignalEnvelope>> {
        let url = self.mailbox_url(code, role);
        // first poll runs inline so an unreachable relay fails the subscribe
        let initial = fetch(&self.client, &url, 0).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut after = 0;
        for envelope in initial {
            after = after.max(envelope.seq);
            let _ = sender.send(envelope);
        }

        let client = self.client.clone();
        let poll_interval = self.poll_interval;
        let poller = tokio::spawn(async move {
            let mut failures = 0;
            while !sender.is_closed() {
                tokio::time::sleep(poll_interval).await;
                match fetch(&client, &url, after).await {
                    Ok(envelopes) => {
                        failures = 0;
                        for envelope in envelopes {
                            after = after.max(envelope.seq);
                            if sender.send(envelope).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        failures += 1;
                        log::warn!("relay poll {} failed ({}): {}", url, failures, err);
                        if failures >= MAX_POLL_FAILURES {
                            return;
                        }
                    }
                }
            }
        });
        self.stop_poller(code, role);
        if let Ok(mut pollers) = self.pollers.lock() {
            pollers.insert((code.clone(), role), poller);
        }
        Ok(receiver)
    }

    async fn publish(&self, envelope: SignalEnvelope) -> RideResult<()> {
        let url = format!("{}/signal/{}", self.base_url, envelope.code);
        self.client
            .post(url)
            .json(&envelope)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(signaling_error)?;
        Ok(())
    }

    async fn unsubscribe(&self, code: &SessionCode, role: PairingRole) -> RideResult<()> {
        self.stop_poller(code, role);
        self.client
            .delete(self.mailbox_url(code, role))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(signaling_error)?;
        Ok(())
    }

    async fn push_state(&self, code: &SessionCode, snapshot: &RideSnapshot) -> RideResult<()> {
        let url = format!("{}/state/{}", self.base_url, code);
        self.client
            .post(url)
            .json(snapshot)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(signaling_error)?;
        Ok(())
    }

    async fn clear_state(&self, code: &SessionCode) -> RideResult<()> {
        let url = format!("{}/state/{}", self.base_url, code);
        self.client
            .delete(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(signaling_error)?;
        Ok(())
    }
}

impl Drop for HttpRelay {
    fn drop(&mut self) {
        if let Ok(pollers) = self.pollers.lock() {
            for poller in pollers.values() {
                poller.abort();
            }
        }
    }
}
