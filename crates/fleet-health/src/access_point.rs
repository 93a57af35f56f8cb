//! Access point description accepted by the checker.

use serde::{Deserialize, Serialize};

/// One GSE server of an access point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddr {
    pub inner_ip: String,
    #[serde(default)]
    pub outer_ip: String,
}

/// Ports the access point's servers listen on. Only `io_port` is probed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub io_port: Option<u16>,
    pub file_svr_port: Option<u16>,
    pub data_port: Option<u16>,
}

/// Servers and package URLs of one access point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPoint {
    #[serde(default)]
    pub btfileserver: Vec<ServerAddr>,
    #[serde(default)]
    pub dataserver: Vec<ServerAddr>,
    #[serde(default)]
    pub taskserver: Vec<ServerAddr>,
    pub package_inner_url: String,
    pub package_outer_url: String,
    #[serde(default)]
    pub port_config: PortConfig,
}

impl AccessPoint {
    /// Every server, file servers first, then data and task servers.
    pub fn servers(&self) -> impl Iterator<Item = &ServerAddr> {
        self.btfileserver
            .iter()
            .chain(&self.dataserver)
            .chain(&self.taskserver)
    }
}
