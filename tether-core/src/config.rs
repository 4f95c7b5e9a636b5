//! Runtime configuration for both sides of the boundary.

use std::time::Duration;

use crate::error::{Result, TetherError};

/// Upper bound accepted for `invoke_timeout`. Keeps "effectively infinite"
/// values out of the config.
pub const MAX_INVOKE_TIMEOUT: Duration = Duration::from_secs(600);

/// Configuration for a UI-side `Bridge`.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How long `invoke` waits for a response before failing with `Timeout`.
    /// Default: 10 s. Must be non-zero and at most [`MAX_INVOKE_TIMEOUT`].
    pub invoke_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            invoke_timeout: Duration::from_secs(10),
        }
    }
}

impl BridgeConfig {
    pub fn with_timeout(invoke_timeout: Duration) -> Self {
        Self { invoke_timeout }
    }

    pub fn validate(&self) -> Result<()> {
        if self.invoke_timeout.is_zero() {
            return Err(TetherError::InvalidConfig(
                "invoke_timeout must be greater than zero".into(),
            ));
        }
        if self.invoke_timeout > MAX_INVOKE_TIMEOUT {
            return Err(TetherError::InvalidConfig(format!(
                "invoke_timeout {:?} exceeds maximum {:?}",
                self.invoke_timeout, MAX_INVOKE_TIMEOUT
            )));
        }
        Ok(())
    }
}

/// Configuration for the `Controller`.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Bridge settings applied to contexts created by `Controller::attach`.
    pub bridge: BridgeConfig,
    /// Log every inbound/outbound envelope at `debug` level. Default: false.
    pub trace_envelopes: bool,
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        self.bridge.validate()
    }
}
