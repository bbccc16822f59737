//! # Bandwidth Limiter
//!
//! Absolute per-second limits with slice reservation ("the cake"), plus
//! calendar-month totals persisted to disk.
//!
//! Each second, `sec_limit × cake_scale` bytes are baked into a cake and
//! cut into equal slices, one per registered transfer. A transfer asks for
//! its slice, sends, and reports back with [`BandwidthLimiter::update`],
//! which returns the unused part of the slice to the shared pool. Slices a
//! slow transfer has asked for but not used decay back into the pool in
//! proportion to how much of the second has elapsed, so a stalled transfer
//! never holds more than `size × (1 − progress)`.
//!
//! Requests without a contract draw from whatever the cake left over.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BandwidthConfig;
use crate::contract::ContractId;
use crate::error::{NodeError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Upstream,
    Downstream,
}

// ============================================================================
// Clock
// ============================================================================

/// Wall-clock seconds; injectable so the cake arithmetic can be tested.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> f64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// A clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn at(now: f64) -> Arc<Self> {
        Arc::new(Self { now: Mutex::new(now) })
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

// ============================================================================
// Persisted Usage
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthUsage {
    pub upstream: u64,
    pub downstream: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageFile {
    pub next_month: i64,
    pub usage: MonthUsage,
}

/// Unix time of UTC midnight on the first day of the month after `now`.
pub fn next_month_start(now: i64) -> i64 {
    let dt = DateTime::<Utc>::from_timestamp(now, 0).unwrap_or_default();
    let (year, month) = if dt.month() == 12 {
        (dt.year() + 1, 1)
    } else {
        (dt.year(), dt.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp())
        .unwrap_or(now + 31 * 86_400)
}

// ============================================================================
// Cake State
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Slice {
    size: u64,
    stale: u64,
    requested: bool,
}

#[derive(Debug, Default)]
struct Lane {
    sec_limit: u64,
    month_limit: u64,
    month_used: u64,
    /// Second the current cake was baked for.
    baked: Option<u64>,
    used: u64,
    registered: Vec<ContractId>,
    slices: HashMap<ContractId, Slice>,
    /// Contracts that already consumed their slice this second.
    spent: HashSet<ContractId>,
}

impl Lane {
    fn new(sec_limit: u64, month_limit: u64) -> Self {
        Self {
            sec_limit,
            month_limit,
            ..Default::default()
        }
    }

    fn bake(&mut self, second: u64, scale: f64) {
        self.baked = Some(second);
        self.slices.clear();
        self.spent.clear();
        self.used = 0;
        if self.registered.is_empty() {
            return;
        }
        let cake = (self.sec_limit as f64 * scale).floor() as u64;
        let n = self.registered.len() as u64;
        let each = cake / n;
        let remainder = cake % n;
        for (i, id) in self.registered.iter().enumerate() {
            let size = if i == 0 { each + remainder } else { each };
            self.slices.insert(*id, Slice { size, ..Default::default() });
            self.used += size;
        }
    }

    fn decay(&mut self, progress: f64) {
        for slice in self.slices.values_mut().filter(|s| s.requested) {
            let new_stale = (slice.size as f64 * progress).floor() as u64;
            if new_stale > slice.stale {
                self.used = self.used.saturating_sub(new_stale - slice.stale);
                slice.stale = new_stale;
            }
        }
    }

    fn month_remaining(&self) -> u64 {
        if self.month_limit == 0 {
            u64::MAX
        } else {
            self.month_limit.saturating_sub(self.month_used)
        }
    }

    fn pool(&self) -> u64 {
        self.sec_limit.saturating_sub(self.used)
    }
}

struct Inner {
    up: Lane,
    down: Lane,
    next_month: i64,
}

impl Inner {
    fn lane(&mut self, direction: Direction) -> &mut Lane {
        match direction {
            Direction::Upstream => &mut self.up,
            Direction::Downstream => &mut self.down,
        }
    }

    fn usage_file(&self) -> UsageFile {
        UsageFile {
            next_month: self.next_month,
            usage: MonthUsage {
                upstream: self.up.month_used,
                downstream: self.down.month_used,
            },
        }
    }
}

// ============================================================================
// Limiter
// ============================================================================

pub struct BandwidthLimiter {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    scale: f64,
    usage_path: Option<PathBuf>,
}

impl BandwidthLimiter {
    pub fn new(config: &BandwidthConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Load persisted monthly usage (if any) and start with an empty cake.
    pub fn with_clock(config: &BandwidthConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let now = clock.now() as i64;
        let mut inner = Inner {
            up: Lane::new(config.sec_upstream, config.month_upstream),
            down: Lane::new(config.sec_downstream, config.month_downstream),
            next_month: next_month_start(now),
        };

        if let Some(path) = &config.usage_path
            && path.exists()
        {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| NodeError::Fatal(format!("read {}: {e}", path.display())))?;
            let saved: UsageFile = serde_json::from_str(&raw)
                .map_err(|e| NodeError::Fatal(format!("corrupt usage file {}: {e}", path.display())))?;
            inner.next_month = saved.next_month;
            inner.up.month_used = saved.usage.upstream;
            inner.down.month_used = saved.usage.downstream;
            info!(
                path = %path.display(),
                upstream = saved.usage.upstream,
                downstream = saved.usage.downstream,
                "loaded monthly bandwidth usage"
            );
        }

        Ok(Self {
            inner: Mutex::new(inner),
            clock,
            scale: config.cake_scale,
            usage_path: config.usage_path.clone(),
        })
    }

    pub fn register_transfer(&self, direction: Direction, contract: ContractId) {
        let mut inner = self.inner.lock();
        let lane = inner.lane(direction);
        if !lane.registered.contains(&contract) {
            lane.registered.push(contract);
        }
    }

    /// The slice, if any, stays in the current cake until the next bake.
    pub fn remove_transfer(&self, direction: Direction, contract: &ContractId) {
        let mut inner = self.inner.lock();
        inner.lane(direction).registered.retain(|c| c != contract);
    }

    pub fn set_sec_limit(&self, direction: Direction, limit: u64) {
        self.inner.lock().lane(direction).sec_limit = limit;
    }

    pub fn set_month_limit(&self, direction: Direction, limit: u64) {
        self.inner.lock().lane(direction).month_limit = limit;
    }

    pub fn month_used(&self, direction: Direction) -> u64 {
        self.inner.lock().lane(direction).month_used
    }

    pub fn next_month(&self) -> i64 {
        self.inner.lock().next_month
    }

    /// Bake a new cake if the second changed and decay requested slices.
    fn tick(&self, inner: &mut Inner, direction: Direction, now: f64) {
        if now as i64 >= inner.next_month {
            inner.up.month_used = 0;
            inner.down.month_used = 0;
            inner.next_month = next_month_start(now as i64);
            info!(next_month = inner.next_month, "monthly bandwidth usage reset");
            self.persist(inner);
        }

        let second = now.floor() as u64;
        let progress = now - now.floor();
        let scale = self.scale;
        let lane = inner.lane(direction);
        if lane.baked != Some(second) {
            lane.bake(second, scale);
        }
        lane.decay(progress);
    }

    /// Bytes the caller may move now in `direction`.
    ///
    /// With a contract, this is what is left of its slice; without one, the
    /// non-transfer pool. Never more than `ceiling` or the month allowance.
    pub fn request(&self, direction: Direction, contract: Option<&ContractId>, ceiling: Option<u64>) -> u64 {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.tick(&mut inner, direction, now);
        let lane = inner.lane(direction);

        let month_left = lane.month_remaining();
        if month_left == 0 {
            return 0;
        }

        let granted = if lane.sec_limit == 0 {
            u64::MAX
        } else {
            match contract {
                Some(id) if lane.spent.contains(id) => 0,
                Some(id) => match lane.slices.get_mut(id) {
                    Some(slice) => {
                        slice.requested = true;
                        slice.size - slice.stale
                    }
                    None => lane.pool(),
                },
                None => lane.pool(),
            }
        };

        granted.min(month_left).min(ceiling.unwrap_or(u64::MAX))
    }

    /// [`request`](Self::request) for callers that cannot wait: zero becomes `RateLimited`.
    pub fn try_request(&self, direction: Direction, ceiling: Option<u64>) -> Result<u64> {
        match self.request(direction, None, ceiling) {
            0 => Err(NodeError::RateLimited),
            n => Ok(n),
        }
    }

    /// Wait until some allowance is available for `contract`.
    ///
    /// Fails with `RateLimited` once the month allowance is exhausted.
    pub async fn acquire(&self, direction: Direction, contract: &ContractId, ceiling: u64) -> Result<u64> {
        loop {
            let granted = self.request(direction, Some(contract), Some(ceiling));
            if granted > 0 {
                return Ok(granted);
            }
            if self.inner.lock().lane(direction).month_remaining() == 0 {
                return Err(NodeError::RateLimited);
            }
            let now = self.clock.now();
            let wait = (1.0 - (now - now.floor())).clamp(0.01, 1.0);
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    /// Record `bytes` moved. A contract's unused reservation returns to the pool.
    pub fn update(&self, direction: Direction, bytes: u64, contract: Option<&ContractId>) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.tick(&mut inner, direction, now);
        let lane = inner.lane(direction);

        let mut used = lane.used.saturating_add(bytes);
        if let Some(id) = contract
            && let Some(slice) = lane.slices.remove(id)
        {
            used = used.saturating_sub(slice.size - slice.stale);
            lane.spent.insert(*id);
        }
        lane.used = if lane.sec_limit == 0 {
            used
        } else {
            used.min(lane.sec_limit)
        };
        lane.month_used = lane.month_used.saturating_add(bytes);

        self.persist(&inner);
    }

    fn persist(&self, inner: &Inner) {
        let Some(path) = &self.usage_path else {
            return;
        };
        let result = serde_json::to_vec(&inner.usage_file())
            .map_err(std::io::Error::other)
            .and_then(|json| std::fs::write(path, json));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to persist bandwidth usage");
        } else {
            debug!(path = %path.display(), "bandwidth usage persisted");
        }
    }

    #[cfg(test)]
    fn used(&self, direction: Direction) -> u64 {
        self.inner.lock().lane(direction).used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: ContractId = [1u8; 32];
    const T2: ContractId = [2u8; 32];
    const START: f64 = 1_700_000_000.0;

    fn limiter(sec: u64, clock: Arc<ManualClock>) -> BandwidthLimiter {
        let config = BandwidthConfig::default().with_sec_limits(sec, sec);
        BandwidthLimiter::with_clock(&config, clock).expect("limiter")
    }

    #[test]
    fn slices_are_equal_with_remainder_first() {
        let clock = ManualClock::at(START);
        let bw = limiter(1000, clock.clone());
        bw.register_transfer(Direction::Upstream, T1);
        bw.register_transfer(Direction::Upstream, T2);
        bw.register_transfer(Direction::Upstream, [3u8; 32]);

        // 950 / 3 = 316 r 2
        assert_eq!(bw.request(Direction::Upstream, Some(&T1), None), 318);
        assert_eq!(bw.request(Direction::Upstream, Some(&T2), None), 316);
        assert_eq!(bw.request(Direction::Upstream, None, None), 50);
        assert_eq!(bw.used(Direction::Upstream), 950);
    }

    #[test]
    fn two_transfer_cake() {
        let clock = ManualClock::at(START);
        let bw = limiter(1000, clock.clone());
        bw.register_transfer(Direction::Upstream, T1);
        bw.register_transfer(Direction::Upstream, T2);

        assert_eq!(bw.request(Direction::Upstream, Some(&T1), None), 475);
        assert_eq!(bw.request(Direction::Upstream, Some(&T2), None), 475);
        assert_eq!(bw.request(Direction::Upstream, None, None), 50);

        bw.update(Direction::Upstream, 100, Some(&T1));
        assert_eq!(bw.request(Direction::Upstream, Some(&T2), None), 475);
        // 950 + 100 - 475 reserved
        assert_eq!(bw.request(Direction::Upstream, None, None), 425);
        // T1 used its slice for this second.
        assert_eq!(bw.request(Direction::Upstream, Some(&T1), None), 0);
    }

    #[test]
    fn requested_slices_decay_with_progress() {
        let clock = ManualClock::at(START);
        let bw = limiter(1000, clock.clone());
        bw.register_transfer(Direction::Downstream, T1);
        bw.register_transfer(Direction::Downstream, T2);

        assert_eq!(bw.request(Direction::Downstream, Some(&T1), None), 475);
        clock.set(START + 0.5);
        // T1 was requested: half its slice is stale. T2 never asked, so it keeps all.
        assert_eq!(bw.request(Direction::Downstream, None, None), 50 + 237);
        assert_eq!(bw.request(Direction::Downstream, Some(&T1), None), 475 - 237);
        assert_eq!(bw.request(Direction::Downstream, Some(&T2), None), 475);
    }

    #[test]
    fn new_second_bakes_a_new_cake() {
        let clock = ManualClock::at(START);
        let bw = limiter(1000, clock.clone());
        bw.register_transfer(Direction::Upstream, T1);
        bw.request(Direction::Upstream, Some(&T1), None);
        bw.update(Direction::Upstream, 900, Some(&T1));
        assert_eq!(bw.request(Direction::Upstream, Some(&T1), None), 0);

        clock.advance(1.0);
        assert_eq!(bw.request(Direction::Upstream, Some(&T1), None), 950);
        assert_eq!(bw.used(Direction::Upstream), 950);

        bw.remove_transfer(Direction::Upstream, &T1);
        clock.advance(1.0);
        assert_eq!(bw.request(Direction::Upstream, None, None), 1000);
    }

    #[test]
    fn ceiling_and_unlimited() {
        let clock = ManualClock::at(START);
        let bw = limiter(0, clock);
        assert_eq!(bw.request(Direction::Upstream, None, Some(4096)), 4096);
        assert_eq!(bw.try_request(Direction::Upstream, None).expect("unlimited"), u64::MAX);
    }

    #[test]
    fn exhausted_pool_is_rate_limited() {
        let clock = ManualClock::at(START);
        let bw = limiter(100, clock);
        bw.update(Direction::Upstream, 100, None);
        assert!(matches!(bw.try_request(Direction::Upstream, None), Err(NodeError::RateLimited)));
    }

    #[test]
    fn monthly_limit_and_rollover_persist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("usage.json");
        let clock = ManualClock::at(START);
        let config = BandwidthConfig::default()
            .with_month_limits(100, 0)
            .with_usage_path(path.clone());
        let bw = BandwidthLimiter::with_clock(&config, clock.clone()).expect("limiter");

        bw.update(Direction::Upstream, 100, None);
        assert_eq!(bw.request(Direction::Upstream, None, None), 0);
        let saved: UsageFile =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(saved.usage.upstream, 100);

        clock.set(bw.next_month() as f64 + 1.0);
        assert!(bw.request(Direction::Upstream, None, None) > 0);
        let saved: UsageFile =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(saved.usage.upstream, 0);
        assert!(saved.next_month > START as i64);
    }

    #[test]
    fn usage_is_reloaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("usage.json");
        let config = BandwidthConfig::default().with_usage_path(path.clone());
        {
            let bw = BandwidthLimiter::with_clock(&config, ManualClock::at(START)).expect("limiter");
            bw.update(Direction::Downstream, 1234, None);
        }
        let bw = BandwidthLimiter::with_clock(&config, ManualClock::at(START)).expect("reload");
        assert_eq!(bw.month_used(Direction::Downstream), 1234);
    }

    #[test]
    fn corrupt_usage_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("usage.json");
        std::fs::write(&path, b"{not json").expect("write");
        let config = BandwidthConfig::default().with_usage_path(path);
        assert!(matches!(
            BandwidthLimiter::with_clock(&config, ManualClock::at(START)),
            Err(NodeError::Fatal(_))
        ));
    }

    #[test]
    fn month_boundaries() {
        // 2023-12-15 -> 2024-01-01
        assert_eq!(next_month_start(1_702_598_400), 1_704_067_200);
        // 2024-02-01 00:00 -> 2024-03-01
        assert_eq!(next_month_start(1_706_745_600), 1_709_251_200);
    }
}
