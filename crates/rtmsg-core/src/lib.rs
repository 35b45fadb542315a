//! # rtmsg-core - Core Types
//!
//! Foundation crate for rtmsg. Provides error handling, logging setup and the
//! TOML settings document shared by the codec, the client and the binary.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, toml, thiserror, tracing).
//!
//! ## Public API
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ### Settings (`settings`)
//! - [`Settings`] - Server, lock, reconnect, keep-alive and store sections
//! - [`load_settings()`] - Parse `config.toml`, falling back to defaults
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use rtmsg_core::prelude::*;
//! ```

pub mod error;
pub mod logging;
pub mod prelude;
pub mod settings;

pub use error::{Error, Result, ResultExt};
pub use settings::{
    default_config_path, load_settings, KeepAliveSettings, LockSettings, ReconnectSettings,
    ServerSettings, Settings, StoreBackend, StoreSettings,
};
