//! DBus proxy interfaces for the slotd daemon.
//!
//! Generated with the `zbus` crate's `#[proxy]` macro. They give type-safe, asynchronous access
//! to the daemon's two interfaces.
//!
//! # DBus Service Information
//!
//! - **Service Name**: `com.canonical.slotd`
//! - **Control Interface**: `com.canonical.slotd.control` at `/com/canonical/slotd/control`
//! - **Status Interface**: `com.canonical.slotd.status` at `/com/canonical/slotd/status`

pub mod control_proxy;
pub mod status_proxy;
