use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::poll_fn;
use futures::{pin_mut, select, FutureExt};
use log::{debug, trace, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::time::DelayQueue;

use crate::config::PeerConfig;

const TCP_INIT_TIMEOUT_MS: u64 = 1000;
/// Connect attempts at the base interval before back-off kicks in
const BACKOFF_AFTER_ATTEMPTS: u32 = 3;
const BACKOFF_CAP_MULTIPLIER: u32 = 8;

#[derive(Debug)]
pub enum PollerCommand {
    /// (Re-)schedule a peer for outbound dialing
    Upsert(Arc<PeerConfig>),
    /// Forget a peer by address
    Remove(String),
}

pub type PollerTx = mpsc::UnboundedSender<PollerCommand>;
pub type PollerRx = mpsc::UnboundedReceiver<PollerCommand>;

#[derive(Debug)]
pub enum PollerConnection {
    /// Accepted from the listener; the peer identifies itself via OPEN
    Incoming(TcpStream),
    /// Dialed out to a configured peer
    Outgoing(TcpStream, Arc<PeerConfig>),
}

#[derive(Debug)]
struct IdlePeer {
    config: Arc<PeerConfig>,
    /// Failed connect attempts since the last success
    attempts: u32,
}

impl IdlePeer {
    fn new(config: Arc<PeerConfig>) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }
}

impl fmt::Display for IdlePeer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<IdlePeer {}>", self.config.address)
    }
}

/// Retry delay: base interval for the first attempts, then doubling per
/// additional failure, capped. Monotonically non-decreasing.
fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    let multiplier = if attempts <= BACKOFF_AFTER_ATTEMPTS {
        1
    } else {
        2u32.saturating_pow(attempts - BACKOFF_AFTER_ATTEMPTS)
            .min(BACKOFF_CAP_MULTIPLIER)
    };
    base * multiplier
}

/// Stores idle peers and checks every interval whether outbound connection
/// attempts should be made; also fronts the TCP listener for incoming
/// sessions
pub struct Poller {
    idle_peers: HashMap<String, IdlePeer>,
    tcp_listener: TcpListener,
    rx: PollerRx,
    interval: Duration,
    delay_queue: DelayQueue<String>,
}

impl Poller {
    pub fn new(listener: TcpListener, interval_secs: u64, rx: PollerRx) -> Self {
        let mut delay_queue = DelayQueue::with_capacity(4);
        // Keep the queue non-empty so poll_expired never settles on None
        delay_queue.insert_at(
            String::new(),
            Instant::now() + Duration::from_secs(31_536_000),
        );
        Self {
            idle_peers: HashMap::new(),
            tcp_listener: listener,
            rx,
            interval: Duration::from_secs(interval_secs),
            delay_queue,
        }
    }

    pub fn upsert_config(&mut self, config: Arc<PeerConfig>) {
        let address = config.address.clone();
        if self
            .idle_peers
            .insert(address.clone(), IdlePeer::new(config))
            .is_some()
        {
            debug!("Peer config for {} updated", address);
        } else {
            self.delay_queue.insert(address, self.interval);
        }
    }

    pub fn remove_config(&mut self, address: &str) {
        // A queued dial for a removed peer fires harmlessly: the lookup
        // below misses and the entry is dropped
        self.idle_peers.remove(address);
    }

    async fn connect(&self, address: &str) -> Result<TcpStream, io::Error> {
        timeout(
            Duration::from_millis(TCP_INIT_TIMEOUT_MS),
            TcpStream::connect(address),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
    }

    /// Wait (bounded) for the next incoming or outgoing connection
    pub async fn get_connection(&mut self) -> Result<Option<PollerConnection>, io::Error> {
        enum Woken {
            Incoming(TcpStream),
            Dial(String),
            Command(Option<PollerCommand>),
            Idle,
        }

        // The select block ends before any of the state below is touched
        let woken = {
            let listener = FutureExt::fuse(timeout(
                Duration::from_millis(TCP_INIT_TIMEOUT_MS),
                self.tcp_listener.accept(),
            ));
            let initializer = FutureExt::fuse(poll_fn(|cx| self.delay_queue.poll_expired(cx)));
            let commands = FutureExt::fuse(self.rx.recv());
            pin_mut!(listener, initializer, commands);

            select! {
                incoming = listener => match incoming {
                    Ok(Ok((stream, socket))) => {
                        debug!("Incoming new connection from {}", socket);
                        Woken::Incoming(stream)
                    }
                    _ => Woken::Idle,
                },
                expired = initializer => match expired {
                    Some(expired) => Woken::Dial(expired.into_inner()),
                    None => Woken::Idle,
                },
                command = commands => Woken::Command(command),
            }
        };

        match woken {
            Woken::Incoming(stream) => Ok(Some(PollerConnection::Incoming(stream))),
            Woken::Dial(address) => {
                if address.is_empty() {
                    return Ok(None);
                }
                trace!("Poller outbound triggered for {}", address);
                // Peer may be gone if it was removed or an incoming session
                // was established in the meantime
                let (enabled, attempts) = match self.idle_peers.get(&address) {
                    Some(idle) => (idle.config.enabled && !idle.config.passive, idle.attempts),
                    None => return Ok(None),
                };
                if !enabled {
                    return Ok(None);
                }
                match self.connect(&address).await {
                    Ok(stream) => {
                        let idle = self
                            .idle_peers
                            .remove(&address)
                            .expect("Idle peer exists");
                        Ok(Some(PollerConnection::Outgoing(stream, idle.config)))
                    }
                    Err(err) => {
                        let next_delay = backoff_delay(self.interval, attempts + 1);
                        warn!(
                            "Error polling {}: {} [retry in {:?}]",
                            address, err, next_delay
                        );
                        if let Some(idle) = self.idle_peers.get_mut(&address) {
                            idle.attempts += 1;
                        }
                        self.delay_queue.insert(address, next_delay);
                        Ok(None)
                    }
                }
            }
            Woken::Command(command) => {
                match command {
                    Some(PollerCommand::Upsert(config)) => self.upsert_config(config),
                    Some(PollerCommand::Remove(address)) => self.remove_config(&address),
                    None => (),
                }
                Ok(None)
            }
            Woken::Idle => Ok(None),
        }
    }
}

impl fmt::Display for Poller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Poller peers={}>", self.idle_peers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let base = Duration::from_secs(30);
        let mut previous = Duration::from_secs(0);
        for attempts in 0..12 {
            let delay = backoff_delay(base, attempts);
            assert!(delay >= previous, "backoff decreased at {}", attempts);
            previous = delay;
        }
        assert_eq!(backoff_delay(base, 1), base);
        assert_eq!(backoff_delay(base, 3), base);
        assert_eq!(backoff_delay(base, 4), base * 2);
        assert_eq!(backoff_delay(base, 5), base * 4);
        assert_eq!(backoff_delay(base, 6), base * 8);
        assert_eq!(backoff_delay(base, 40), base * 8);
    }
}
