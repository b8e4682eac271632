//! Installs application packages onto the device this runs on, through the
//! device's own wireless debugging daemon.
//!
//! [`identity::IdentityStore`] owns the key pair the daemon authorizes, and
//! [`session::AdbSession`] runs every exchange with the daemon: status
//! probes, pairing, the authorization test and package installs.

pub mod adb;
pub mod identity;
pub mod logging;
pub mod models;
pub mod session;
pub mod settings;
pub mod utils;

pub use identity::{IdentityError, IdentityStore};
pub use models::{ConnectionStatus, Settings, Timeouts};
pub use session::{AdbSession, PairingInputError, PairingRequest, SessionError};
