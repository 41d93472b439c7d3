//! Silent throttling of hosts that keep sending bad requests.
//!
//! This is a decaying counter, not a rate limiter: a host is blocked while
//! it has more than `max_bad_requests` bad requests each less than
//! `window` apart, and the whole table is cleared periodically.

use std::net::IpAddr;
use std::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::config::ThrottleConfig;

#[derive(Debug, Clone, Copy)]
struct Strikes {
    last: Instant,
    count: u32,
}

/// Per-host bad request counters.
#[derive(Debug)]
pub struct HostThrottle {
    config: ThrottleConfig,
    hosts: DashMap<IpAddr, Strikes>,
}

impl HostThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            hosts: DashMap::new(),
        }
    }

    /// Returns `true` if requests from `host` should be dropped.
    pub fn is_blocked(&self, host: IpAddr) -> bool {
        self.hosts.get(&host).is_some_and(|s| {
            s.last.elapsed() < self.config.window && s.count > self.config.max_bad_requests
        })
    }

    /// Records a bad request from `host`.
    pub fn record(&self, host: IpAddr) {
        let now = Instant::now();
        let window = self.config.window;
        self.hosts
            .entry(host)
            .and_modify(|s| {
                s.count = if now.duration_since(s.last) < window {
                    s.count + 1
                } else {
                    1
                };
                s.last = now;
            })
            .or_insert(Strikes {
                last: now,
                count: 1,
            });
    }

    pub fn clear(&self) {
        self.hosts.clear();
    }

    /// Clears the table every `clear_interval` until `cancel` fires.
    pub async fn run_cleanup(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.clear_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !self.hosts.is_empty() {
                        tracing::debug!(hosts = self.hosts.len(), "clearing throttle table");
                    }
                    self.clear();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn host(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, n))
    }

    #[test]
    fn blocks_after_threshold() {
        let throttle = HostThrottle::new(ThrottleConfig::default());
        for _ in 0..10 {
            throttle.record(host(1));
        }
        assert!(!throttle.is_blocked(host(1)));
        throttle.record(host(1));
        assert!(throttle.is_blocked(host(1)));
        assert!(!throttle.is_blocked(host(2)));

        throttle.clear();
        assert!(!throttle.is_blocked(host(1)));
    }

    #[test]
    fn strikes_decay_outside_window() {
        let throttle = HostThrottle::new(ThrottleConfig {
            max_bad_requests: 1,
            window: Duration::from_millis(20),
            ..Default::default()
        });
        throttle.record(host(1));
        throttle.record(host(1));
        assert!(throttle.is_blocked(host(1)));

        std::thread::sleep(Duration::from_millis(30));
        assert!(!throttle.is_blocked(host(1)));
        throttle.record(host(1));
        assert!(!throttle.is_blocked(host(1)));
    }

    #[tokio::test]
    async fn cleanup_task_clears_table() {
        let throttle = std::sync::Arc::new(HostThrottle::new(ThrottleConfig {
            max_bad_requests: 0,
            clear_interval: Duration::from_millis(20),
            ..Default::default()
        }));
        throttle.record(host(3));
        assert!(throttle.is_blocked(host(3)));

        let cancel = CancellationToken::new();
        let task = {
            let throttle = throttle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { throttle.run_cleanup(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!throttle.is_blocked(host(3)));

        cancel.cancel();
        task.await.unwrap();
    }
}
