//! Lease-based leader election over the shared store.
//!
//! The store offers no atomic compare-and-set, so acquisition is
//! read → write → wait a random jitter → read back. Two contexts may still
//! both believe they won; the server keeps one connection per credential and
//! closes the loser with the session-replaced reason, which makes it
//! [`LockManager::relinquish`].
//!
//! The manager never sleeps. It records deadlines, and the driver calls
//! [`LockManager::poll`] once the earliest one from
//! [`LockManager::next_deadline`] has passed.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use rtmsg_core::prelude::*;
use rtmsg_core::LockSettings;

use crate::clock::{Clock, ContextId};
use crate::store::SharedStore;

/// Store key holding the serialized [`LockRecord`].
pub const LOCK_KEY: &str = "rtmsg.lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub owner_id: ContextId,
    pub acquired_at_millis: i64,
}

/// Payload broadcast on the heartbeat topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    pub holder: ContextId,
    pub sent_at_millis: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No attempt made yet, or released.
    Idle,
    /// Record written, waiting for the read-back.
    AttemptPending,
    Held,
    NotHeld,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// This context now holds the lock.
    Acquired,
    /// Time to broadcast this heartbeat.
    Heartbeat(HeartbeatMessage),
}

pub struct LockManager {
    id: ContextId,
    store: Arc<dyn SharedStore>,
    clock: Clock,
    settings: LockSettings,
    state: LockState,
    retry_at: Option<Instant>,
    verify_at: Option<Instant>,
    heartbeat_at: Option<Instant>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("retry_at", &self.retry_at)
            .field("verify_at", &self.verify_at)
            .field("heartbeat_at", &self.heartbeat_at)
            .finish()
    }
}

impl LockManager {
    pub fn new(
        id: ContextId,
        store: Arc<dyn SharedStore>,
        clock: Clock,
        settings: LockSettings,
    ) -> Self {
        Self {
            id,
            store,
            clock,
            settings,
            state: LockState::Idle,
            retry_at: None,
            verify_at: None,
            heartbeat_at: None,
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn holds_lock(&self) -> bool {
        self.state == LockState::Held
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Current record in the store. Unparseable records count as absent.
    pub fn read_record(&self) -> Option<LockRecord> {
        let raw = self.store.get(LOCK_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Ignoring malformed lock record: {}", e);
                None
            }
        }
    }

    /// Start an acquisition attempt.
    ///
    /// A fresh record owned by someone else schedules a retry one lease
    /// later. Otherwise this context writes its own record and schedules the
    /// read-back after a random jitter.
    pub fn attempt_to_acquire(&mut self, now: Instant) {
        if self.state == LockState::Held || self.verify_at.is_some() {
            return;
        }
        self.retry_at = None;

        let now_millis = self.clock.wall_millis(now);
        if let Some(record) = self.read_record() {
            let age = now_millis.saturating_sub(record.acquired_at_millis);
            if age < self.lease_millis() {
                trace!("Lock held by {} ({} ms old), backing off", record.owner_id, age);
                self.state = LockState::NotHeld;
                self.retry_at = Some(now + self.settings.heartbeat_timeout());
                return;
            }
        }

        if let Err(e) = self.write_record(now_millis) {
            warn!("Failed to write lock record: {}", e);
            self.state = LockState::NotHeld;
            self.retry_at = Some(now + self.settings.heartbeat_timeout());
            return;
        }

        self.state = LockState::AttemptPending;
        self.verify_at = Some(now + self.jitter());
    }

    /// A heartbeat from the holder was observed: push the retry back a full
    /// lease.
    pub fn on_heartbeat(&mut self, now: Instant) {
        if self.state == LockState::Held {
            return;
        }
        if self.state == LockState::Idle {
            self.state = LockState::NotHeld;
        }
        if self.verify_at.is_none() {
            self.retry_at = Some(now + self.settings.heartbeat_timeout());
        }
    }

    /// Fire every deadline that has passed.
    pub fn poll(&mut self, now: Instant) -> Vec<LockEvent> {
        let mut events = Vec::new();

        if self.verify_at.is_some_and(|at| at <= now) {
            self.verify_at = None;
            self.verify(now, &mut events);
        }

        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
            self.attempt_to_acquire(now);
        }

        if self.state == LockState::Held && self.heartbeat_at.is_some_and(|at| at <= now) {
            events.push(self.heartbeat(now));
        }

        events
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [self.retry_at, self.verify_at, self.heartbeat_at]
            .into_iter()
            .flatten()
            .min()
    }

    /// Graceful shutdown: drop the record if it is ours and cancel every
    /// timer. Other contexts notice through heartbeat timeout.
    pub fn release(&mut self) {
        if self.state == LockState::Held {
            let ours = self
                .read_record()
                .is_some_and(|record| record.owner_id == self.id);
            if ours {
                if let Err(e) = self.store.remove(LOCK_KEY) {
                    warn!("Failed to remove lock record: {}", e);
                }
            }
            info!("Released lock");
        }
        self.state = LockState::Idle;
        self.retry_at = None;
        self.verify_at = None;
        self.heartbeat_at = None;
    }

    /// Stop believing this context holds the lock, leaving the record to the
    /// context that replaced it. Contention resumes one lease after the last
    /// heartbeat seen.
    pub fn relinquish(&mut self, now: Instant) {
        if self.state == LockState::Held {
            info!("Relinquishing lock; another context took over");
        }
        self.state = LockState::NotHeld;
        self.heartbeat_at = None;
        self.verify_at = None;
        self.retry_at = Some(now + self.settings.heartbeat_timeout());
    }

    fn verify(&mut self, now: Instant, events: &mut Vec<LockEvent>) {
        let won = self
            .read_record()
            .is_some_and(|record| record.owner_id == self.id);
        if !won {
            debug!("Lost lock race");
            self.state = LockState::NotHeld;
            self.retry_at = Some(now + self.settings.heartbeat_timeout());
            return;
        }

        info!("Acquired lock as {}", self.id);
        self.state = LockState::Held;
        self.retry_at = None;
        events.push(LockEvent::Acquired);
        events.push(self.heartbeat(now));
    }

    /// Renew the lease and produce the broadcast.
    fn heartbeat(&mut self, now: Instant) -> LockEvent {
        let now_millis = self.clock.wall_millis(now);
        if let Err(e) = self.write_record(now_millis) {
            warn!("Failed to renew lock record: {}", e);
        }
        self.heartbeat_at = Some(now + self.settings.heartbeat_interval());
        LockEvent::Heartbeat(HeartbeatMessage {
            holder: self.id,
            sent_at_millis: now_millis,
        })
    }

    fn write_record(&self, now_millis: i64) -> Result<()> {
        let record = LockRecord {
            owner_id: self.id,
            acquired_at_millis: now_millis,
        };
        self.store.set(LOCK_KEY, &serde_json::to_string(&record)?)
    }

    fn lease_millis(&self) -> i64 {
        i64::try_from(self.settings.heartbeat_timeout_ms).unwrap_or(i64::MAX)
    }

    fn jitter(&self) -> Duration {
        let min = self.settings.jitter_min_ms;
        let max = self.settings.jitter_max_ms.max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const STEP: Duration = Duration::from_millis(50);

    fn manager(backing: &MemoryStore, origin: Instant) -> LockManager {
        LockManager::new(
            ContextId::new(),
            Arc::new(backing.attach()),
            Clock::anchored(origin, 1_700_000_000_000),
            LockSettings::default(),
        )
    }

    fn poll_until_settled(lock: &mut LockManager, now: Instant) -> Vec<LockEvent> {
        lock.poll(now + Duration::from_millis(LockSettings::default().jitter_max_ms))
    }

    #[test]
    fn test_acquires_vacant_lock_after_jitter() {
        let origin = Instant::now();
        let backing = MemoryStore::new();
        let mut lock = manager(&backing, origin);

        lock.attempt_to_acquire(origin);
        assert_eq!(lock.state(), LockState::AttemptPending);
        assert!(lock.poll(origin).is_empty());

        let events = poll_until_settled(&mut lock, origin);
        assert_eq!(events[0], LockEvent::Acquired);
        assert!(matches!(events[1], LockEvent::Heartbeat(ref hb) if hb.holder == lock.id()));
        assert!(lock.holds_lock());
        assert_eq!(lock.read_record().unwrap().owner_id, lock.id());
    }

    #[test]
    fn test_fresh_record_defers_attempt() {
        let origin = Instant::now();
        let backing = MemoryStore::new();
        let mut holder = manager(&backing, origin);
        holder.attempt_to_acquire(origin);
        poll_until_settled(&mut holder, origin);

        let mut other = manager(&backing, origin);
        other.attempt_to_acquire(origin + STEP);
        assert_eq!(other.state(), LockState::NotHeld);
        assert_eq!(
            other.next_deadline(),
            Some(origin + STEP + LockSettings::default().heartbeat_timeout())
        );
    }

    #[test]
    fn test_renewed_record_stays_fresh_when_timer_clocks_disagree() {
        // The holder's timer clock lags a context started after a suspend
        let holder_origin = Instant::now();
        let newcomer_origin = holder_origin + Duration::from_secs(60);
        let backing = MemoryStore::new();
        let system = |backing: &MemoryStore| {
            LockManager::new(
                ContextId::new(),
                Arc::new(backing.attach()),
                Clock::system(),
                LockSettings::default(),
            )
        };

        let mut holder = system(&backing);
        holder.attempt_to_acquire(holder_origin);
        poll_until_settled(&mut holder, holder_origin);
        assert!(holder.holds_lock());
        holder.poll(holder_origin + Duration::from_secs(1));

        let mut newcomer = system(&backing);
        newcomer.attempt_to_acquire(newcomer_origin);
        assert_eq!(newcomer.state(), LockState::NotHeld);
        assert_eq!(holder.read_record().unwrap().owner_id, holder.id());
    }

    #[test]
    fn test_stale_record_is_taken_over() {
        let origin = Instant::now();
        let backing = MemoryStore::new();
        let mut lock = manager(&backing, origin);
        let stale = LockRecord {
            owner_id: ContextId::new(),
            acquired_at_millis: 1_700_000_000_000 - 10_000,
        };
        backing
            .attach()
            .set(LOCK_KEY, &serde_json::to_string(&stale).unwrap())
            .unwrap();

        lock.attempt_to_acquire(origin);
        poll_until_settled(&mut lock, origin);
        assert!(lock.holds_lock());
    }

    #[test]
    fn test_race_lost_on_read_back() {
        let origin = Instant::now();
        let backing = MemoryStore::new();
        let mut lock = manager(&backing, origin);

        lock.attempt_to_acquire(origin);
        // Another context overwrites the record during the jitter window
        let rival = LockRecord {
            owner_id: ContextId::new(),
            acquired_at_millis: 1_700_000_000_005,
        };
        backing
            .attach()
            .set(LOCK_KEY, &serde_json::to_string(&rival).unwrap())
            .unwrap();

        let events = poll_until_settled(&mut lock, origin);
        assert!(events.is_empty());
        assert_eq!(lock.state(), LockState::NotHeld);
        assert!(lock.next_deadline().is_some());
    }

    #[test]
    fn test_heartbeat_suppresses_contention() {
        let origin = Instant::now();
        let backing = MemoryStore::new();
        let mut holder = manager(&backing, origin);
        holder.attempt_to_acquire(origin);
        poll_until_settled(&mut holder, origin);

        let mut watcher = manager(&backing, origin);
        watcher.attempt_to_acquire(origin);

        // Heartbeats every second for a minute; the watcher never retries
        let mut now = origin;
        for _ in 0..60 {
            now += Duration::from_secs(1);
            for event in holder.poll(now) {
                if let LockEvent::Heartbeat(_) = event {
                    watcher.on_heartbeat(now);
                }
            }
            assert!(watcher.poll(now).is_empty());
            assert_eq!(watcher.state(), LockState::NotHeld);
        }
        assert!(holder.holds_lock());
    }

    #[test]
    fn test_takeover_after_heartbeats_stop() {
        let origin = Instant::now();
        let backing = MemoryStore::new();
        let mut holder = manager(&backing, origin);
        holder.attempt_to_acquire(origin);
        poll_until_settled(&mut holder, origin);
        let last_heartbeat = origin + Duration::from_millis(LockSettings::default().jitter_max_ms);

        let mut watcher = manager(&backing, origin);
        watcher.on_heartbeat(last_heartbeat);

        // Holder goes silent without releasing. The record stops being
        // renewed, so one lease later the watcher attempts and wins.
        let timeout = LockSettings::default().heartbeat_timeout();
        let attempt_at = last_heartbeat + timeout;
        assert!(watcher.poll(attempt_at - STEP).is_empty());
        assert!(watcher.poll(attempt_at).is_empty());
        assert_eq!(watcher.state(), LockState::AttemptPending);

        let events = poll_until_settled(&mut watcher, attempt_at);
        assert_eq!(events.first(), Some(&LockEvent::Acquired));
    }

    #[test]
    fn test_many_contexts_settle_on_one_holder() {
        let origin = Instant::now();
        let backing = MemoryStore::new();
        let mut contexts: Vec<LockManager> = (0..5).map(|_| manager(&backing, origin)).collect();

        for lock in &mut contexts {
            lock.attempt_to_acquire(origin);
        }

        let mut now = origin;
        for _ in 0..200 {
            now += STEP;
            let mut heartbeat_from = Vec::new();
            for (i, lock) in contexts.iter_mut().enumerate() {
                for event in lock.poll(now) {
                    if let LockEvent::Heartbeat(_) = event {
                        heartbeat_from.push(i);
                    }
                }
            }
            for i in heartbeat_from {
                for (j, lock) in contexts.iter_mut().enumerate() {
                    if i != j {
                        lock.on_heartbeat(now);
                    }
                }
            }
        }

        let holders = contexts.iter().filter(|lock| lock.holds_lock()).count();
        assert_eq!(holders, 1);
    }

    #[test]
    fn test_release_removes_own_record() {
        let origin = Instant::now();
        let backing = MemoryStore::new();
        let mut lock = manager(&backing, origin);
        lock.attempt_to_acquire(origin);
        poll_until_settled(&mut lock, origin);

        lock.release();
        assert_eq!(lock.state(), LockState::Idle);
        assert!(lock.read_record().is_none());
        assert_eq!(lock.next_deadline(), None);
    }

    #[test]
    fn test_relinquish_keeps_record() {
        let origin = Instant::now();
        let backing = MemoryStore::new();
        let mut lock = manager(&backing, origin);
        lock.attempt_to_acquire(origin);
        poll_until_settled(&mut lock, origin);

        lock.relinquish(origin + STEP);
        assert!(!lock.holds_lock());
        assert!(lock.read_record().is_some());
        // No more heartbeats
        let events = lock.poll(origin + Duration::from_millis(1500));
        assert!(events.is_empty());
    }
}
