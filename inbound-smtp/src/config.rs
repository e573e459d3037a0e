use std::net::{Ipv4Addr, SocketAddr};

use serde::Deserialize;

const fn default_listen() -> SocketAddr {
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 25)
}

fn default_domain() -> String {
    "mymail.com".to_string()
}

const fn default_max_message_size() -> u64 {
    10 * 1024 * 1024
}

const fn default_max_recipients() -> usize {
    50
}

const fn default_command_timeout() -> u64 {
    300
}

const fn default_data_timeout() -> u64 {
    600
}

/// Settings for the receiving side
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SmtpConfig {
    /// Address the listener binds to
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// The only domain recipients are accepted for (exact, case-sensitive)
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Largest accepted message body in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,

    /// Recipients accepted per transaction
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Seconds to wait for the next command before closing the connection
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Seconds allowed for receiving a whole message body after DATA
    #[serde(default = "default_data_timeout")]
    pub data_timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            domain: default_domain(),
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            command_timeout_secs: default_command_timeout(),
            data_timeout_secs: default_data_timeout(),
        }
    }
}
