// CLASSIFICATION: COMMUNITY
// Filename: cs.rs v0.2
// Author: Lukas Bower
// Date Modified: 2026-07-26

//! The connection service.
//!
//! `/net/cs` answers "how do I reach X?": a client writes a query of the
//! form `network!host!service`, then reads back one `/net/<family>/clone
//! <address>` line per read until the queue is empty. Each open gets its
//! own queue, so concurrent clients never see each other's answers.

use std::collections::VecDeque;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use log::debug;

use crate::trees::{can_open, File, FileHandle, HandleRef, OpenMode};

/// The `/net/cs` file. Opening it allocates a fresh [`CsHandle`].
pub struct CsFile {
    name: String,
    perm: u32,
    owner: String,
    group: String,
}

impl CsFile {
    /// World-readable/writable cs file.
    pub fn new(owner: &str, group: &str) -> Self {
        Self {
            name: "cs".to_string(),
            perm: 0o777,
            owner: owner.to_string(),
            group: group.to_string(),
        }
    }
}

impl File for CsFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn perm(&self) -> u32 {
        self.perm
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn open(&self, user: &str, mode: OpenMode) -> Result<HandleRef> {
        if !can_open(self.perm, &self.owner, user, mode) {
            bail!("permission denied");
        }
        Ok(Arc::new(CsHandle::new()))
    }
}

/// Per-open connection-service state: a queue of pending response lines.
pub struct CsHandle {
    queue: Mutex<VecDeque<Vec<u8>>>,
}

impl CsHandle {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn resolve(&self, query: &str) -> Result<()> {
        let parts: Vec<&str> = query.trim().split('!').collect();
        match parts.len() {
            // family!address pass-through.
            2 => {
                let line = format!("/net/{}/clone {}", parts[0], parts[1]).into_bytes();
                self.queue.lock().unwrap().push_back(line);
                return Ok(());
            }
            3 => {}
            _ => bail!("invalid query"),
        }

        let network = if parts[0] == "net" { "tcp" } else { parts[0] };
        let service = match parts[2] {
            "9fs" | "9pfs" => "564",
            other => other,
        };

        // Resolution may block on the OS resolver; the queue lock is taken
        // only once the response lines are ready, so concurrent reads on
        // this handle stay responsive.
        let port = lookup_port(network, service)?;
        let mut lines = Vec::new();
        if parts[1] == "*" {
            lines.push(format!("/net/{network}/clone {port}").into_bytes());
        } else {
            for addr in lookup_host(parts[1])? {
                lines.push(format!("/net/{network}/clone {addr}!{port}").into_bytes());
            }
        }

        self.queue.lock().unwrap().extend(lines);
        Ok(())
    }
}

impl FileHandle for CsHandle {
    fn read_at(&self, count: usize, _offset: u64) -> Result<Vec<u8>> {
        let mut queue = self.queue.lock().unwrap();
        match queue.pop_front() {
            Some(mut line) => {
                line.truncate(count);
                Ok(line)
            }
            None => Ok(Vec::new()),
        }
    }

    fn write_at(&self, data: &[u8], _offset: u64) -> Result<usize> {
        let query = std::str::from_utf8(data).map_err(|_| anyhow!("query is not utf-8"))?;
        debug!("cs query: {}", query.trim());
        self.resolve(query)?;
        Ok(data.len())
    }
}

/// Resolve `host` through the OS resolver.
pub fn lookup_host(host: &str) -> Result<Vec<IpAddr>> {
    let addrs: Vec<IpAddr> = (host, 0u16)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve host: {host}"))?
        .map(|sa| sa.ip())
        .collect();
    if addrs.is_empty() {
        bail!("cannot resolve host: {host}");
    }
    Ok(addrs)
}

/// Resolve a service name to a port, scoped to `network`.
///
/// Numeric services pass through; names go through the system services
/// database, which is what the OS port lookup consults.
pub fn lookup_port(network: &str, service: &str) -> Result<u16> {
    if let Ok(port) = service.parse::<u16>() {
        return Ok(port);
    }
    let db = std::fs::read_to_string("/etc/services").context("cannot read services database")?;
    service_port(&db, network, service).ok_or_else(|| anyhow!("unknown service: {service}"))
}

/// Scan a services database (`name port/proto aliases…`) for `service`.
fn service_port(db: &str, network: &str, service: &str) -> Option<u16> {
    for line in db.lines() {
        let line = line.split('#').next().unwrap_or("");
        let mut fields = line.split_whitespace();
        let name = match fields.next() {
            Some(name) => name,
            None => continue,
        };
        let port_proto = match fields.next() {
            Some(pp) => pp,
            None => continue,
        };
        let (port, proto) = match port_proto.split_once('/') {
            Some(split) => split,
            None => continue,
        };
        if proto != network {
            continue;
        }
        if name == service || fields.any(|alias| alias == service) {
            return port.parse().ok();
        }
    }
    None
}
