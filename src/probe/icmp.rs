//! ICMP echo prober.
//!
//! Each round pings every target concurrently, reports replies as they land,
//! then signals the round boundary once every probe has answered or hit
//! `max_rtt`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::ProbeConfig;
use crate::probe::{ProbeSink, Prober, ProberError};

/// ICMP clients, created only for the address families in use.
struct Clients {
    v4: Option<Client>,
    v6: Option<Client>,
}

impl Clients {
    /// Opening a raw/dgram ICMP socket is where permission problems surface.
    fn for_targets(targets: &[IpAddr]) -> Result<Self, ProberError> {
        let v4 = if targets.iter().any(IpAddr::is_ipv4) {
            Some(Client::new(&Config::default())?)
        } else {
            None
        };
        let v6 = if targets.iter().any(IpAddr::is_ipv6) {
            Some(Client::new(&Config::builder().kind(ICMP::V6).build())?)
        } else {
            None
        };
        Ok(Self { v4, v6 })
    }

    fn for_addr(&self, addr: &IpAddr) -> Option<Client> {
        match addr {
            IpAddr::V4(_) => self.v4.clone(),
            IpAddr::V6(_) => self.v6.clone(),
        }
    }
}

/// Round-based ICMP prober.
#[derive(Debug, Clone)]
pub struct IcmpProber {
    config: ProbeConfig,
}

impl IcmpProber {
    /// Create a prober with the given timing.
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl Prober for IcmpProber {
    fn name(&self) -> &str {
        "icmp"
    }

    async fn run(
        &self,
        targets: Vec<IpAddr>,
        sink: ProbeSink,
        cancel: CancellationToken,
    ) -> Result<(), ProberError> {
        let clients = Clients::for_targets(&targets)?;
        let base_ident: u16 = rand::random();
        let payload: Arc<[u8]> = vec![0u8; self.config.payload_size].into();
        let max_rtt = self.config.max_rtt;

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut round: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let seq = PingSequence(round as u16);
            let mut probes = JoinSet::new();
            for (i, addr) in targets.iter().copied().enumerate() {
                let Some(client) = clients.for_addr(&addr) else {
                    continue;
                };
                let ident = PingIdentifier(base_ident.wrapping_add(i as u16));
                let payload = Arc::clone(&payload);
                probes.spawn(async move {
                    let rtt = ping_once(&client, addr, ident, seq, &payload, max_rtt).await;
                    (addr, rtt)
                });
            }

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        probes.abort_all();
                        return Ok(());
                    }
                    next = probes.join_next() => match next {
                        None => break,
                        Some(Ok((addr, Some(rtt)))) => {
                            if sink.on_reply(round, addr, rtt).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some(Ok((_, None))) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, round, "Probe task failed");
                        }
                    }
                }
            }

            if sink.on_idle(round).await.is_err() {
                return Ok(());
            }
            round += 1;
        }
    }
}

/// Send one echo request; `None` means no usable reply within `max_rtt`.
async fn ping_once(
    client: &Client,
    addr: IpAddr,
    ident: PingIdentifier,
    seq: PingSequence,
    payload: &[u8],
    max_rtt: Duration,
) -> Option<Duration> {
    let mut pinger = client.pinger(addr, ident).await;
    pinger.timeout(max_rtt);

    match timeout(max_rtt, pinger.ping(seq, payload)).await {
        Ok(Ok((_, rtt))) if rtt <= max_rtt => {
            tracing::trace!(address = %addr, rtt = ?rtt, "Echo reply");
            Some(rtt)
        }
        Ok(Ok((_, rtt))) => {
            tracing::debug!(address = %addr, rtt = ?rtt, "Echo reply past max_rtt");
            None
        }
        Ok(Err(e)) => {
            tracing::debug!(address = %addr, error = %e, "Echo request failed");
            None
        }
        Err(_) => None,
    }
}
