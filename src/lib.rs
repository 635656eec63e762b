// CLASSIFICATION: COMMUNITY
// Filename: lib.rs v0.2
// Author: Lukas Bower
// Date Modified: 2026-07-27

//! Cohesix net9p: the host IP stack as a Plan 9 style file tree.
//!
//! The service exports
//!
//! ```text
//! /net
//!    /cs
//!    /tcp
//!       /clone
//!       /0/{ctl,data,local,remote,status,listen}
//!    /udp
//!       (identical)
//! ```
//!
//! over 9P. Clients dial by walking a family's `clone` file, writing
//! `connect host!port` to the returned ctl and opening `data`; they listen
//! by writing `announce port` and walking `listen`; they resolve names by
//! writing `network!host!service` to `cs` and reading back clone paths.
//! The 9P framing itself (codec, FID table, session multiplexing) comes
//! from the `ninep` crate; this crate supplies the tree and its semantics.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use log::info;
use ninep::server::Server;

pub mod conn;
pub mod cs;
pub mod serve;
pub mod tcpudp;
pub mod trees;

pub use conn::{Conn, ConnState, Network};
pub use serve::NetFs;
pub use trees::FileRef;

use cs::CsFile;
use tcpudp::{tcp_dir, udp_dir};
use trees::SyntheticDir;

/// Runtime configuration for the net9p service.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// TCP port the 9P server listens on.
    pub port: u16,
    /// Owning user reported for every tree entry.
    pub owner: String,
    /// Owning group reported for every tree entry.
    pub group: String,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            port: 564, // the classic Plan 9 port
            owner: "glenda".to_string(),
            group: "glenda".to_string(),
        }
    }
}

/// Build the exported `/net` tree.
pub fn net_root(owner: &str, group: &str) -> Arc<SyntheticDir> {
    let root = Arc::new(SyntheticDir::new("net", 0o777, owner, group));
    root.add("cs", Arc::new(CsFile::new(owner, group)));
    root.add("tcp", tcp_dir(owner, group) as FileRef);
    root.add("udp", udp_dir(owner, group) as FileRef);
    root
}

/// Handle for a running net9p server.
pub struct NetServer {
    handle: JoinHandle<()>,
}

impl NetServer {
    /// Build the tree and start serving it over TCP.
    pub fn start(cfg: NetConfig) -> Result<Self> {
        let fs = NetFs::new(net_root(&cfg.owner, &cfg.group));
        let server = Server::new(fs);
        info!("starting net9p service on port {}", cfg.port);
        let handle = server.serve_tcp(cfg.port);
        Ok(Self { handle })
    }

    /// Block until the serve thread exits.
    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| anyhow!("server thread panicked"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trees::File;

    #[test]
    fn default_config() {
        let cfg = NetConfig::default();
        assert_eq!(cfg.port, 564);
        assert_eq!(cfg.owner, "glenda");
    }

    #[test]
    fn root_tree_shape() {
        let root = net_root("glenda", "glenda");
        let names: Vec<String> = root.children().iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, vec!["cs", "tcp", "udp"]);
        assert!(root.lookup("tcp").unwrap().is_dir());
        assert!(root.lookup("udp").unwrap().is_dir());
        assert!(!root.lookup("cs").unwrap().is_dir());
    }
}
