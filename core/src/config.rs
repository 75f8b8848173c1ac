//! Configuration for the central coordinator

use serde::{Deserialize, Serialize};

/// Options forwarded to `Device::connect`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
    /// Let the platform reconnect in the background instead of failing fast
    pub auto_connect: bool,
}

/// Top-level configuration of a `BleCentral`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CentralConfig {
    /// Options used for every `connectToDevice` request
    pub connect: ConnectOptions,
}

impl CentralConfig {
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.connect.auto_connect = auto_connect;
        self
    }
}
