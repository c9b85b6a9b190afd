//! A hierarchical token bucket shared by all torrents and their peer
//! sessions.
//!
//! There is one pair of buckets (one per transfer direction) for the whole
//! engine and one pair for each registered torrent. A grant is clipped by
//! both the torrent's own bucket and the global bucket, so the engine-wide
//! limit holds no matter how many torrents are active. Beyond its own
//! allotment a torrent may only take the global surplus left after every
//! other torrent's unspent allotment has been reserved for them; a lone busy
//! torrent can thus use the full engine-wide rate while idle torrents keep
//! their share claimable.
//!
//! Buckets are refilled on a 100 ms tick by a task spawned with [`spawn`].
//! Sessions that were denied tokens wait on the direction's notifier and
//! retry on the next refill.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{sync::Notify, task, time};

use crate::{conf::RateConf, TorrentId};

/// The refill period of all buckets.
pub(crate) const TICK: Duration = Duration::from_millis(100);

/// The number of refills per second; rates are expressed per second.
const TICKS_PER_SEC: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Up,
    Down,
}

/// A single token bucket. A bucket without a rate is unlimited and grants
/// everything asked of it.
#[derive(Debug)]
struct TokenBucket {
    /// The sustained rate, in bytes per second. `None` means unlimited.
    rate: Option<u64>,
    /// The most tokens the bucket may hold; this is the burst allowance of
    /// one second's worth of traffic.
    burst: u64,
    /// The currently available tokens.
    tokens: u64,
}

impl TokenBucket {
    fn new(rate: Option<u64>) -> Self {
        let burst = rate.unwrap_or(0);
        Self {
            rate,
            burst,
            tokens: burst,
        }
    }

    fn refill(&mut self) {
        if let Some(rate) = self.rate {
            self.tokens = (self.tokens + rate / TICKS_PER_SEC).min(self.burst);
        }
    }

    fn available(&self) -> u64 {
        if self.rate.is_some() {
            self.tokens
        } else {
            u64::MAX
        }
    }

    /// The tokens this bucket holds back for its own scope when another
    /// scope wants to borrow from the shared parent.
    fn reserved(&self) -> u64 {
        if self.rate.is_some() {
            self.tokens
        } else {
            0
        }
    }

    fn take(&mut self, n: u64) {
        if self.rate.is_some() {
            debug_assert!(n <= self.tokens);
            self.tokens -= n;
        }
    }
}

/// The up/down bucket pair of one limit scope.
#[derive(Debug)]
struct Channel {
    up: TokenBucket,
    down: TokenBucket,
}

impl Channel {
    fn new(up: Option<u64>, down: Option<u64>) -> Self {
        Self {
            up: TokenBucket::new(up),
            down: TokenBucket::new(down),
        }
    }

    fn bucket(&self, direction: Direction) -> &TokenBucket {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    fn bucket_mut(&mut self, direction: Direction) -> &mut TokenBucket {
        match direction {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
        }
    }
}

struct Inner {
    global: Channel,
    torrents: HashMap<TorrentId, Channel>,
    conf: RateConf,
}

pub(crate) struct RateLimiter {
    inner: Mutex<Inner>,
    up_notify: Notify,
    down_notify: Notify,
}

impl RateLimiter {
    pub fn new(conf: RateConf) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                global: Channel::new(conf.global_up, conf.global_down),
                torrents: HashMap::new(),
                conf,
            }),
            up_notify: Notify::new(),
            down_notify: Notify::new(),
        })
    }

    /// Registers a torrent, creating its limit scope.
    pub fn add_torrent(&self, id: TorrentId) {
        let mut inner = self.inner.lock().unwrap();
        let channel =
            Channel::new(inner.conf.torrent_up, inner.conf.torrent_down);
        inner.torrents.insert(id, channel);
    }

    /// Removes a torrent's limit scope.
    pub fn remove_torrent(&self, id: TorrentId) {
        let mut inner = self.inner.lock().unwrap();
        inner.torrents.remove(&id);
    }

    /// Requests up to `want` bytes of quota in the given direction on behalf
    /// of the given torrent. Returns the number of bytes granted, which may
    /// be zero; the caller should then [`wait`](Self::wait) for the next
    /// refill.
    pub fn request(
        &self,
        direction: Direction,
        id: TorrentId,
        want: usize,
    ) -> usize {
        if want == 0 {
            return 0;
        }
        let want = want as u64;
        let mut inner = self.inner.lock().unwrap();

        let global_available = inner.global.bucket(direction).available();
        let own_available = inner
            .torrents
            .get(&id)
            .map(|channel| channel.bucket(direction).available())
            .unwrap_or(u64::MAX);
        // every other torrent's unspent allotment stays claimable by them
        let others_reserved: u64 = inner
            .torrents
            .iter()
            .filter(|(other, _)| **other != id)
            .map(|(_, channel)| channel.bucket(direction).reserved())
            .sum();

        let base = want.min(own_available).min(global_available);
        let surplus = global_available
            .saturating_sub(base)
            .saturating_sub(others_reserved);
        let grant = base + (want - base).min(surplus);

        if let Some(channel) = inner.torrents.get_mut(&id) {
            let bucket = channel.bucket_mut(direction);
            let from_own = grant.min(bucket.available());
            bucket.take(from_own);
        }
        inner.global.bucket_mut(direction).take(grant);

        grant as usize
    }

    /// Resolves when the next refill happens. Callers that received a zero or
    /// partial grant should await this before retrying.
    pub async fn wait(&self, direction: Direction) {
        match direction {
            Direction::Up => self.up_notify.notified().await,
            Direction::Down => self.down_notify.notified().await,
        }
    }

    /// Refills all buckets with one tick's worth of tokens and wakes blocked
    /// sessions.
    pub fn tick(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.global.up.refill();
            inner.global.down.refill();
            for channel in inner.torrents.values_mut() {
                channel.up.refill();
                channel.down.refill();
            }
        }
        self.up_notify.notify_waiters();
        self.down_notify.notify_waiters();
    }
}

/// Spawns the task that refills the limiter's buckets every 100 ms.
pub(crate) fn spawn(limiter: Arc<RateLimiter>) -> task::JoinHandle<()> {
    task::spawn(async move {
        let mut interval = time::interval(TICK);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            limiter.tick();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TORRENT: TorrentId = 1;
    const OTHER: TorrentId = 2;

    fn limiter(conf: RateConf) -> Arc<RateLimiter> {
        let limiter = RateLimiter::new(conf);
        limiter.add_torrent(TORRENT);
        limiter.add_torrent(OTHER);
        limiter
    }

    // An unlimited limiter grants everything without bookkeeping.
    #[test]
    fn test_unlimited() {
        let limiter = limiter(RateConf::default());
        assert_eq!(
            limiter.request(Direction::Down, TORRENT, 123_456_789),
            123_456_789
        );
        assert_eq!(limiter.request(Direction::Up, OTHER, 42), 42);
    }

    // Over any one second window the globally admitted byte count must not
    // exceed rate + burst, regardless of how greedily quota is requested.
    #[test]
    fn test_global_window_bound() {
        let rate = 10_000;
        let limiter = limiter(RateConf {
            global_down: Some(rate),
            ..Default::default()
        });

        let mut admitted = 0;
        // start with a full burst, then ten refill ticks make up one second
        for _ in 0..10 {
            admitted += limiter.request(Direction::Down, TORRENT, 100_000);
            limiter.tick();
        }
        admitted += limiter.request(Direction::Down, TORRENT, 100_000);

        assert!(admitted as u64 <= 2 * rate);
        assert!(admitted > 0);
    }

    // A greedy torrent may borrow the global surplus, but the unspent
    // allotment of every other torrent remains reserved for them.
    #[test]
    fn test_borrowing_preserves_reservations() {
        let limiter = limiter(RateConf {
            global_down: Some(100_000),
            torrent_down: Some(10_000),
            ..Default::default()
        });

        // 10 000 from its own scope plus the 80 000 surplus not reserved by
        // the other torrent
        assert_eq!(
            limiter.request(Direction::Down, OTHER, 200_000),
            90_000
        );
        // the other torrent can still claim its full allotment
        assert_eq!(limiter.request(Direction::Down, TORRENT, 30_000), 10_000);
    }

    // Without competing torrents the whole global rate is borrowable.
    #[test]
    fn test_lone_torrent_borrows_global_rate() {
        let limiter = RateLimiter::new(RateConf {
            global_down: Some(100_000),
            torrent_down: Some(10_000),
            ..Default::default()
        });
        limiter.add_torrent(TORRENT);

        assert_eq!(limiter.request(Direction::Down, TORRENT, 50_000), 50_000);
    }

    // Refills are bounded by the burst allowance.
    #[test]
    fn test_refill_caps_at_burst() {
        let rate = 10_000;
        let limiter = limiter(RateConf {
            global_down: Some(rate),
            ..Default::default()
        });

        // many idle ticks must not accumulate more than one second's worth
        for _ in 0..100 {
            limiter.tick();
        }
        assert_eq!(
            limiter.request(Direction::Down, TORRENT, 100_000) as u64,
            rate
        );
    }

    // Directions are limited independently.
    #[test]
    fn test_directions_are_independent() {
        let limiter = limiter(RateConf {
            global_down: Some(10_000),
            ..Default::default()
        });

        assert_eq!(limiter.request(Direction::Down, TORRENT, 20_000), 10_000);
        // upload is unlimited by this configuration
        assert_eq!(limiter.request(Direction::Up, TORRENT, 20_000), 20_000);
    }
}
