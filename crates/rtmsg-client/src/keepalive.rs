//! Ping scheduling and half-open connection detection.
//!
//! Three timers, all plain deadlines:
//!
//! - the periodic ping, armed once the server advertises an interval;
//! - the pong deadline, armed by each ping and cleared by any inbound frame;
//! - the sweep, which catches the case where the ping timer was suspended
//!   (device sleep) and forces a ping when nothing has arrived for longer
//!   than `ping_interval + pong_timeout`.

use std::time::Duration;

use tokio::time::Instant;

use rtmsg_core::KeepAliveSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Send a ping now. The pong deadline is already armed.
    SendPing,
    /// No frame arrived in time; force-close with the pong-timeout code.
    PongTimeout,
}

#[derive(Debug, Clone)]
pub struct KeepAlive {
    pong_timeout: Duration,
    sweep_interval: Duration,
    ping_interval: Option<Duration>,
    next_ping_at: Option<Instant>,
    pong_deadline: Option<Instant>,
    next_sweep_at: Option<Instant>,
    last_message_at: Option<Instant>,
}

impl KeepAlive {
    pub fn new(settings: &KeepAliveSettings) -> Self {
        Self {
            pong_timeout: settings.pong_timeout(),
            sweep_interval: settings.sweep_interval(),
            ping_interval: None,
            next_ping_at: None,
            pong_deadline: None,
            next_sweep_at: None,
            last_message_at: None,
        }
    }

    /// Socket opened: start the sweep and treat the open as the last sign of
    /// life.
    pub fn on_open(&mut self, now: Instant) {
        self.last_message_at = Some(now);
        self.next_sweep_at = Some(now + self.sweep_interval);
    }

    /// Server advertised (or withdrew) a ping interval. Replaces any pending
    /// periodic ping.
    pub fn on_auth_result(&mut self, interval: Option<Duration>, now: Instant) {
        self.ping_interval = interval;
        self.next_ping_at = interval.map(|interval| now + interval);
    }

    /// Any inbound frame proves liveness.
    pub fn on_message_received(&mut self, now: Instant) {
        self.last_message_at = Some(now);
        self.pong_deadline = None;
    }

    /// Arm the pong deadline unless one is already pending. Returns whether
    /// a new deadline was armed.
    pub fn schedule_pong_timeout(&mut self, now: Instant) -> bool {
        if self.pong_deadline.is_some() {
            return false;
        }
        self.pong_deadline = Some(now + self.pong_timeout);
        true
    }

    pub fn pong_pending(&self) -> bool {
        self.pong_deadline.is_some()
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval
    }

    pub fn last_message_at(&self) -> Option<Instant> {
        self.last_message_at
    }

    pub fn poll(&mut self, now: Instant, connected: bool) -> Vec<KeepAliveAction> {
        let mut actions = Vec::new();

        if self.pong_deadline.is_some_and(|at| at <= now) {
            self.pong_deadline = None;
            if connected {
                actions.push(KeepAliveAction::PongTimeout);
                return actions;
            }
        }

        let mut ping = false;

        if let (Some(at), Some(interval)) = (self.next_ping_at, self.ping_interval) {
            if at <= now {
                self.next_ping_at = Some(now + interval);
                ping = true;
            }
        }

        if self.next_sweep_at.is_some_and(|at| at <= now) {
            self.next_sweep_at = Some(now + self.sweep_interval);
            if self.is_stale(now) {
                ping = true;
            }
        }

        if ping && connected {
            self.schedule_pong_timeout(now);
            actions.push(KeepAliveAction::SendPing);
        }
        actions
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [self.next_ping_at, self.pong_deadline, self.next_sweep_at]
            .into_iter()
            .flatten()
            .min()
    }

    /// Cancel everything. Used on close and before reconnecting.
    pub fn reset(&mut self) {
        self.ping_interval = None;
        self.next_ping_at = None;
        self.pong_deadline = None;
        self.next_sweep_at = None;
        self.last_message_at = None;
    }

    /// Nothing heard for longer than a full ping cycle and no pong pending.
    fn is_stale(&self, now: Instant) -> bool {
        let (Some(interval), Some(last)) = (self.ping_interval, self.last_message_at) else {
            return false;
        };
        self.pong_deadline.is_none()
            && now.saturating_duration_since(last) > interval + self.pong_timeout
    }
}
