use std::fmt;
use std::time;

use chrono::{DateTime, Duration, Utc};
use tokio::time::{interval, Interval};

use super::SessionError;
use crate::utils::{format_elapsed_time, get_elapsed_time};

#[derive(Debug)]
pub struct HoldTimer {
    /// Negotiated hold time in seconds; 0 disables keepalives entirely
    pub(crate) hold_time: u64,
    /// Keepalives go out every 1/3rd of the hold time
    pub(crate) interval: u64,
    timer: Interval,
    pub(crate) last_sent: DateTime<Utc>,
    pub(crate) last_received: DateTime<Utc>,
}

impl HoldTimer {
    pub fn new(hold_time: u64) -> HoldTimer {
        HoldTimer {
            hold_time,
            interval: hold_time / 3,
            timer: interval(time::Duration::from_millis(100)),
            last_received: Utc::now(),
            last_sent: Utc::now(),
        }
    }

    // Calculate if a keepalive should be sent
    // Returns true when hold time remaining is less than 2/3 of the total,
    // which is 2x the keepalive interval
    pub async fn should_send_keepalive(&mut self) -> Result<bool, SessionError> {
        self.timer.tick().await;
        if self.hold_time == 0 {
            // Peer negotiated keepalives off
            return Ok(false);
        }
        if self.is_expired() {
            return Err(SessionError::HoldTimeExpired(self.hold_time));
        }
        Ok(self.get_hold_time().num_seconds() < (2 * self.interval as i64))
    }

    /// Bump the last received to now
    pub fn received(&mut self) {
        self.last_received = Utc::now();
    }

    /// Bump the last sent to now
    pub fn sent(&mut self) {
        self.last_sent = Utc::now();
    }

    // Calculate remaining hold time available
    // Counts down from self.hold_time to 0
    fn get_hold_time(&self) -> Duration {
        let hold_time = Duration::seconds(self.hold_time as i64);
        if get_elapsed_time(self.last_sent) > hold_time {
            Duration::seconds(0)
        } else {
            hold_time - get_elapsed_time(self.last_sent)
        }
    }

    fn is_expired(&self) -> bool {
        let hold_time = Duration::seconds(self.hold_time as i64);
        get_elapsed_time(self.last_received) >= hold_time
    }
}

impl fmt::Display for HoldTimer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format_elapsed_time(self.get_hold_time()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interval() {
        let mut ht = HoldTimer::new(30);
        assert_eq!(ht.interval, 10);
        assert!(!ht.is_expired());
        // Keepalive should not be sent yet
        ht.last_sent = ht.last_sent - Duration::seconds(5);
        ht.timer = interval(time::Duration::from_millis(1));
        assert!(!ht.should_send_keepalive().await.unwrap());
        // After waiting 1/3 of hold time, we should send a keepalive
        ht.last_sent = ht.last_sent - Duration::seconds(5);
        ht.timer = interval(time::Duration::from_millis(1));
        assert!(ht.should_send_keepalive().await.unwrap());

        ht.sent();
        ht.timer = interval(time::Duration::from_millis(1));
        assert!(!ht.should_send_keepalive().await.unwrap());

        // And if hold time is past, this session is expired
        ht.last_received = ht.last_received - Duration::seconds(30);
        ht.timer = interval(time::Duration::from_millis(1));
        assert!(matches!(
            ht.should_send_keepalive().await,
            Err(SessionError::HoldTimeExpired(30))
        ));
    }

    #[tokio::test]
    async fn test_zero_hold_time_disables_keepalives() {
        let mut ht = HoldTimer::new(0);
        ht.last_received = ht.last_received - Duration::seconds(3600);
        ht.timer = interval(time::Duration::from_millis(1));
        // Never expires, never asks for a keepalive
        assert!(!ht.should_send_keepalive().await.unwrap());
    }
}
