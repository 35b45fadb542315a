//! Close-code taxonomy.

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Application code used when the keep-alive watchdog gives up on a socket.
pub const CLOSE_PONG_TIMEOUT: u16 = 4001;

/// Reason the server sends when a newer connection took over the credential.
pub const SESSION_REPLACED_REASON: &str = "AuthenticationToken.sessionReplaced";
/// Reason sent alongside [`CLOSE_PONG_TIMEOUT`]. Some runtimes rewrite every
/// close code to 1000, so the reason alone must identify it.
pub const PONG_TIMEOUT_REASON: &str = "RealTimeMessageService.pongTimeout";

/// What to do after the transport closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Reconnect after the backoff delay.
    Reconnect,
    /// Another connection replaced this one. Give up holder status, keep the
    /// lock record, do not reconnect.
    SessionReplaced,
    /// Report through the close handler and stop.
    Terminal,
}

pub fn classify_close(code: u16, reason: &str) -> CloseDisposition {
    match code {
        CLOSE_GOING_AWAY | CLOSE_ABNORMAL | CLOSE_PONG_TIMEOUT => CloseDisposition::Reconnect,
        CLOSE_NORMAL if reason == SESSION_REPLACED_REASON => CloseDisposition::SessionReplaced,
        CLOSE_NORMAL if reason == PONG_TIMEOUT_REASON => CloseDisposition::Reconnect,
        _ => CloseDisposition::Terminal,
    }
}
