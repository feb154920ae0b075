//! Request-scoped session context.

use crate::backend::Backend;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use easync_state::StateStore;
use std::sync::Arc;

/// Protocol version 12.0, encoded as `major * 10 + minor`.
pub const VERSION_TWELVE: u16 = 120;
/// Protocol version 12.1.
pub const VERSION_TWELVE_ONE: u16 = 121;
/// Protocol version 14.0.
pub const VERSION_FOURTEEN: u16 = 140;
/// Protocol version 14.1.
pub const VERSION_FOURTEEN_ONE: u16 = 141;

/// The device and user a request is served for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Device id.
    pub id: String,
    /// Authenticated user.
    pub user: String,
    /// Negotiated protocol version.
    pub version: u16,
}

impl Device {
    /// Creates a device speaking protocol 14.1.
    pub fn new(id: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
            version: VERSION_FOURTEEN_ONE,
        }
    }

    /// Sets the protocol version.
    #[must_use]
    pub fn with_version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }
}

/// Everything a component needs to serve one request.
///
/// The context is passed explicitly into every component constructor.
/// Cloning it is cheap; all collaborators are shared.
#[derive(Clone)]
pub struct SessionContext {
    /// The device being served.
    pub device: Device,
    /// Durable state.
    pub store: Arc<dyn StateStore>,
    /// Groupware backend.
    pub backend: Arc<dyn Backend>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Engine configuration.
    pub config: EngineConfig,
}

impl SessionContext {
    /// Creates a context using the system clock and default configuration.
    pub fn new(device: Device, store: Arc<dyn StateStore>, backend: Arc<dyn Backend>) -> Self {
        Self {
            device,
            store,
            backend,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the current time in unix seconds.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Returns true if a remote wipe must interrupt the session.
    ///
    /// Always false while provisioning is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the device record cannot be read.
    pub fn remote_wipe_pending(&self) -> EngineResult<bool> {
        if !self.config.provisioning.is_enabled() {
            return Ok(false);
        }
        Ok(self
            .store
            .device_rw_status(&self.device.id)?
            .requires_folder_sync())
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("device", &self.device)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
