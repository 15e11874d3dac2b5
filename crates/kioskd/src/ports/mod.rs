//! Ports to the host
//!
//! Everything the supervisor does to the machine goes through one of these
//! traits. Production code uses the `Real*`/`Systemctl`/`XDisplay`/`LinuxOs`
//! implementations; tests use the fakes in [`fake`].

pub mod command;
pub mod display;
pub mod fake;
pub mod http;
pub mod os;
pub mod systemd;

pub use display::XDisplay;
pub use http::ReqwestLiveness;
pub use os::LinuxOs;
pub use systemd::Systemctl;

use anyhow::Result;
use async_trait::async_trait;
use std::net::IpAddr;

/// Host service supervision (systemd units)
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn is_running(&self, name: &str) -> bool;

    async fn restart(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;
}

/// Queries against the X display
#[async_trait]
pub trait DisplayIntrospection: Send + Sync {
    /// At least one output has a monitor attached
    async fn is_display_connected(&self) -> bool;

    /// A mapped, visible window carries `title`
    async fn is_window_visible(&self, title: &str) -> bool;
}

/// HTTP liveness endpoint
#[async_trait]
pub trait HttpLiveness: Send + Sync {
    /// GET `url` and return the status code
    async fn get_status(&self, url: &str) -> Result<u16>;
}

/// OS primitives used by remediation and resource reclamation
#[async_trait]
pub trait OsControl: Send + Sync {
    /// Flush dirty pages and drop the page cache
    async fn drop_page_cache(&self) -> Result<()>;

    /// Nudge a zombie's parent to reap it
    async fn signal_parent(&self, parent_pid: u32) -> Result<()>;

    /// SIGKILL; a process that is already gone is not an error
    async fn kill_process(&self, pid: u32) -> Result<()>;

    /// Close every socket to `peer`
    async fn close_peer(&self, peer: IpAddr) -> Result<()>;

    /// Run a maintenance command (package cache clean, journal vacuum)
    async fn run_maintenance(&self, argv: &[String]) -> Result<()>;

    async fn reboot(&self) -> Result<()>;
}
