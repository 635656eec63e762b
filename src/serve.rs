// CLASSIFICATION: COMMUNITY
// Filename: serve.rs v0.2
// Author: Lukas Bower
// Date Modified: 2026-07-27

//! 9P substrate adapter.
//!
//! [`NetFs`] implements `Serve9p` over the synthetic tree, keeping ninep
//! confined to this module. Every walk step allocates a fresh qid, so a qid
//! stands in for one client FID: per-open handles hang off the qid and are
//! closed on clunk, which is what drives the slots' own-counts. Magic files
//! are resolved here, during walk, by substituting their `arrived` result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{anyhow, bail, Result};
use log::debug;
use ninep::{
    fs::{FileMeta, IoUnit, Mode, Perm, Stat, QID_ROOT},
    server::{ClientId, ReadOutcome, Serve9p},
};

use crate::trees::{FileRef, HandleRef, OpenMode, SyntheticDir};

const IO_UNIT: IoUnit = 8192;

#[derive(Clone)]
struct Node {
    file: FileRef,
    parent: u64,
}

/// The exported namespace, addressed by qid.
pub struct NetFs {
    nodes: Mutex<HashMap<u64, Node>>,
    handles: Mutex<HashMap<u64, HandleRef>>,
    next_qid: AtomicU64,
}

impl NetFs {
    /// Serve the tree rooted at `root`.
    pub fn new(root: Arc<SyntheticDir>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            QID_ROOT,
            Node {
                file: root as FileRef,
                parent: QID_ROOT,
            },
        );
        Self {
            nodes: Mutex::new(nodes),
            handles: Mutex::new(HashMap::new()),
            next_qid: AtomicU64::new(QID_ROOT + 1),
        }
    }

    fn node(&self, qid: u64) -> Result<Node> {
        self.nodes
            .lock()
            .unwrap()
            .get(&qid)
            .cloned()
            .ok_or_else(|| anyhow!("unknown qid: {qid}"))
    }

    fn alloc_qid(&self, file: FileRef, parent: u64) -> u64 {
        let qid = self.next_qid.fetch_add(1, Ordering::SeqCst);
        self.nodes.lock().unwrap().insert(qid, Node { file, parent });
        qid
    }
}

fn meta_for(file: &FileRef, qid: u64, name: &str) -> FileMeta {
    if file.is_dir() {
        FileMeta::dir(name, qid)
    } else {
        FileMeta::file(name, qid)
    }
}

fn perms_for(mode: u32) -> Perm {
    let mut perms = Perm::OWNER_READ;
    if mode & 0o200 != 0 {
        perms |= Perm::OWNER_WRITE;
    }
    perms
}

fn stat_for(file: &FileRef, qid: u64, name: &str) -> Stat {
    Stat {
        fm: meta_for(file, qid, name),
        perms: perms_for(file.perm()),
        n_bytes: 0,
        last_accesses: SystemTime::now(),
        last_modified: SystemTime::now(),
        owner: file.owner().to_string(),
        group: file.group().to_string(),
        last_modified_by: file.owner().to_string(),
    }
}

impl Serve9p for NetFs {
    fn walk(&mut self, _cid: ClientId, parent_qid: u64, child: &str, uname: &str) -> Result<FileMeta> {
        let parent = self.node(parent_qid)?;
        if child == ".." {
            let above = self.node(parent.parent)?;
            return Ok(meta_for(&above.file, parent.parent, above.file.name()));
        }
        if !parent.file.is_dir() {
            bail!("walk in non-directory");
        }
        let file = parent
            .file
            .lookup(child)
            .ok_or_else(|| anyhow!("{child}: no such file or directory"))?;
        // Magic files resolve to their hook result; the original entry
        // stays in the tree.
        let file = match file.arrived(uname)? {
            Some(produced) => produced,
            None => file,
        };
        let qid = self.alloc_qid(file.clone(), parent_qid);
        Ok(meta_for(&file, qid, child))
    }

    fn open(&mut self, _cid: ClientId, qid: u64, mode: Mode, uname: &str) -> Result<IoUnit> {
        let node = self.node(qid)?;
        let open_mode = if mode == Mode::READ {
            OpenMode::Read
        } else {
            OpenMode::ReadWrite
        };
        let handle = node.file.open(uname, open_mode)?;
        self.handles.lock().unwrap().insert(qid, handle);
        Ok(IO_UNIT)
    }

    fn clunk(&mut self, _cid: ClientId, qid: u64) {
        if let Some(handle) = self.handles.lock().unwrap().remove(&qid) {
            if let Err(e) = handle.close() {
                debug!("close on clunk: {e}");
            }
        }
        if qid != QID_ROOT {
            self.nodes.lock().unwrap().remove(&qid);
        }
    }

    fn create(
        &mut self,
        _cid: ClientId,
        _parent: u64,
        _name: &str,
        _perm: Perm,
        _mode: Mode,
        _uname: &str,
    ) -> Result<(FileMeta, IoUnit)> {
        bail!("create not permitted");
    }

    fn read(
        &mut self,
        _cid: ClientId,
        qid: u64,
        offset: usize,
        count: usize,
        _uname: &str,
    ) -> Result<ReadOutcome> {
        let handle = self
            .handles
            .lock()
            .unwrap()
            .get(&qid)
            .cloned()
            .ok_or_else(|| anyhow!("file not open"))?;
        // The handle lock is released here; data reads may block on the
        // socket for as long as the peer stays quiet.
        let data = handle.read_at(count, offset as u64)?;
        Ok(ReadOutcome::Immediate(data))
    }

    fn read_dir(&mut self, _cid: ClientId, qid: u64, _uname: &str) -> Result<Vec<Stat>> {
        let node = self.node(qid)?;
        if !node.file.is_dir() {
            bail!("not a directory");
        }
        let mut stats = Vec::new();
        for child in node.file.children() {
            let cqid = self.next_qid.fetch_add(1, Ordering::SeqCst);
            stats.push(stat_for(&child, cqid, child.name()));
        }
        Ok(stats)
    }

    fn write(
        &mut self,
        _cid: ClientId,
        qid: u64,
        offset: usize,
        data: Vec<u8>,
        _uname: &str,
    ) -> Result<usize> {
        let handle = self
            .handles
            .lock()
            .unwrap()
            .get(&qid)
            .cloned()
            .ok_or_else(|| anyhow!("file not open"))?;
        handle.write_at(&data, offset as u64)
    }

    fn remove(&mut self, _cid: ClientId, _qid: u64, _uname: &str) -> Result<()> {
        bail!("remove not permitted");
    }

    fn stat(&mut self, _cid: ClientId, qid: u64, _uname: &str) -> Result<Stat> {
        let node = self.node(qid)?;
        let name = node.file.name().to_string();
        Ok(stat_for(&node.file, qid, &name))
    }

    fn write_stat(&mut self, _cid: ClientId, _qid: u64, _stat: Stat, _uname: &str) -> Result<()> {
        bail!("write_stat not supported");
    }
}
