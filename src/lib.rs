//! vpn-porthole - splice a containerised VPN into the host network
//!
//! A VPN client runs inside a container built per session profile. Only the
//! configured subnets and DNS domains are routed through it; everything else
//! keeps using the normal network.
//!
//! # Architecture
//!
//! - `ip`: IPv4 address and subnet values
//! - `config`: Settings file handling (TOML)
//! - `credentials`: Login and sudo password sources
//! - `expect`: Pty-driven expect/respond automaton (VPN login, sudo)
//! - `platform`: Host route and DNS splicing (direct or helper VM)
//! - `runtime`: Container runtime client
//! - `lock`: Per-session advisory lock
//! - `session`: Orchestration of one session's lifecycle
//!
//! # Usage
//!
//! ```bash
//! vpnp init
//! vpnp start work
//! vpnp add-route work 10.20.0.0/16
//! vpnp stop all
//! ```

pub mod config;
pub mod credentials;
pub mod expect;
pub mod ip;
pub mod lock;
pub mod platform;
pub mod runtime;
pub mod session;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use ip::{Ipv4Address, Ipv4Subnet};
pub use session::{Session, SessionError, SessionState};
