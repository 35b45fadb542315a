//! Application callbacks and panic isolation.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use rtmsg_codec::{AuthenticationResult, MessageNotification};
use rtmsg_core::prelude::*;

pub type AuthHandler = Box<dyn FnMut(&AuthenticationResult) + Send>;
pub type NotificationHandler = Box<dyn FnMut(&MessageNotification) + Send>;
/// Receives every frame exactly as it arrived, before decoding.
pub type RawNotificationHandler = Box<dyn FnMut(&[u8]) + Send>;
pub type CloseHandler = Box<dyn FnMut(u16, &str) + Send>;

/// Callbacks registered at construction.
///
/// Every invocation runs behind [`guarded`], so a panicking handler is logged
/// and the rest of the dispatch (other handlers, re-publishing to other
/// contexts) continues.
#[derive(Default)]
pub struct Handlers {
    pub on_auth: Option<AuthHandler>,
    pub on_notification: Option<NotificationHandler>,
    pub on_raw_notification: Option<RawNotificationHandler>,
    pub on_close: Option<CloseHandler>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("on_auth", &self.on_auth.is_some())
            .field("on_notification", &self.on_notification.is_some())
            .field("on_raw_notification", &self.on_raw_notification.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_auth(mut self, handler: impl FnMut(&AuthenticationResult) + Send + 'static) -> Self {
        self.on_auth = Some(Box::new(handler));
        self
    }

    pub fn on_notification(
        mut self,
        handler: impl FnMut(&MessageNotification) + Send + 'static,
    ) -> Self {
        self.on_notification = Some(Box::new(handler));
        self
    }

    pub fn on_raw_notification(mut self, handler: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.on_raw_notification = Some(Box::new(handler));
        self
    }

    pub fn on_close(mut self, handler: impl FnMut(u16, &str) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(handler));
        self
    }

    pub(crate) fn auth(&mut self, result: &AuthenticationResult) {
        if let Some(handler) = self.on_auth.as_mut() {
            guarded("auth handler", || handler(result));
        }
    }

    pub(crate) fn notification(&mut self, notification: &MessageNotification) {
        if let Some(handler) = self.on_notification.as_mut() {
            guarded("notification handler", || handler(notification));
        }
    }

    pub(crate) fn raw_notification(&mut self, frame: &[u8]) {
        if let Some(handler) = self.on_raw_notification.as_mut() {
            guarded("raw notification handler", || handler(frame));
        }
    }

    pub(crate) fn close(&mut self, code: u16, reason: &str) {
        if let Some(handler) = self.on_close.as_mut() {
            guarded("close handler", || handler(code, reason));
        }
    }
}

/// Run `f`, logging instead of propagating a panic. Returns `false` if it
/// panicked.
pub(crate) fn guarded<F: FnOnce()>(what: &str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            error!("{} panicked: {}", what, panic_message(payload.as_ref()));
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
