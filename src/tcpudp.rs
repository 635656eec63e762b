// CLASSIFICATION: COMMUNITY
// Filename: tcpudp.rs v0.2
// Author: Lukas Bower
// Date Modified: 2026-07-26

//! Family directories.
//!
//! Each socket family (`/net/tcp`, `/net/udp`) is a directory holding a
//! magic `clone` file and one numbered subdirectory per allocated slot.
//! Walking `clone` allocates a slot and resolves to its ctl file; walking a
//! slot's `listen` file blocks on the announced listener and resolves to the
//! ctl of a fresh slot wrapped around the accepted socket.

use std::net::TcpStream;
use std::sync::{Arc, Mutex, Weak};

use anyhow::{anyhow, Result};
use log::debug;

use crate::conn::{Conn, CtlFile, DataFile, Network};
use crate::trees::{FileRef, MagicWalkFile, OpenCounterFile, SyntheticDir, SyntheticFile};

/// Family directory for TCP slots.
pub fn tcp_dir(owner: &str, group: &str) -> Arc<SyntheticDir> {
    family_dir(Network::Tcp, owner, group)
}

/// Family directory for UDP slots.
pub fn udp_dir(owner: &str, group: &str) -> Arc<SyntheticDir> {
    family_dir(Network::Udp, owner, group)
}

fn family_dir(network: Network, owner: &str, group: &str) -> Arc<SyntheticDir> {
    let root = Arc::new(SyntheticDir::new(network.as_str(), 0o777, owner, group));
    let handler = Arc::new(FamilyHandler {
        // The directory owns the tree; the handler only borrows it so the
        // clone file (which owns the handler) does not close a cycle.
        root: Arc::downgrade(&root),
        network,
        owner: owner.to_string(),
        group: group.to_string(),
        next_slot: Mutex::new(0),
    });
    let clone_file = MagicWalkFile::new(
        "clone",
        0o777,
        owner,
        group,
        Box::new(move |_user| Ok(handler.allocate(None)? as FileRef)),
    );
    root.add("clone", Arc::new(clone_file));
    root
}

/// Owner of a family subtree: slot numbering and slot construction.
struct FamilyHandler {
    root: Weak<SyntheticDir>,
    network: Network,
    owner: String,
    group: String,
    next_slot: Mutex<u64>,
}

impl FamilyHandler {
    /// Allocate the next slot, build its subtree, and return its ctl file.
    ///
    /// The counter lock is held until the subdirectory is in the tree, so
    /// numbering and directory mutation are atomic even when an accept on
    /// the listen path races a clone walk. Numbers are never reused.
    fn allocate(self: &Arc<Self>, accepted: Option<TcpStream>) -> Result<Arc<CtlFile>> {
        let root = self
            .root
            .upgrade()
            .ok_or_else(|| anyhow!("family directory dropped"))?;
        let mut counter = self.next_slot.lock().unwrap();
        let slot = *counter;
        *counter += 1;

        let conn = Arc::new(match accepted {
            Some(stream) => Conn::accepted(self.network, stream),
            None => Conn::new(self.network),
        });
        debug!("{}: allocated slot {slot}", self.network);

        let dir = Arc::new(SyntheticDir::new(
            &slot.to_string(),
            0o777,
            &self.owner,
            &self.group,
        ));

        let ctl = Arc::new(CtlFile::new(
            "ctl",
            0o777,
            &self.owner,
            &self.group,
            conn.clone(),
        ));
        ctl.response(slot.to_string().as_bytes());
        dir.add("ctl", counted(ctl.clone() as FileRef, &conn));

        let data = Arc::new(DataFile::new(
            "data",
            0o777,
            &self.owner,
            &self.group,
            conn.clone(),
        ));
        dir.add("data", counted(data as FileRef, &conn));

        dir.add("local", self.snapshot("local", &conn, |c| c.local_text()));
        dir.add("remote", self.snapshot("remote", &conn, |c| c.remote_text()));
        dir.add(
            "status",
            self.snapshot("status", &conn, |c| format!("{}\n", c.state()).into_bytes()),
        );

        let handler = self.clone();
        let listen_conn = conn.clone();
        let listen = MagicWalkFile::new(
            "listen",
            0o777,
            &self.owner,
            &self.group,
            Box::new(move |_user| {
                let stream = listen_conn.accept()?;
                Ok(handler.allocate(Some(stream))? as FileRef)
            }),
        );
        dir.add("listen", Arc::new(listen));

        root.add(&slot.to_string(), dir);
        Ok(ctl)
    }

    /// Snapshot file: a magic walk whose result is a read-only file holding
    /// `render`'s output at walk time. Re-walk to refresh.
    fn snapshot(
        &self,
        name: &'static str,
        conn: &Arc<Conn>,
        render: impl Fn(&Conn) -> Vec<u8> + Send + Sync + 'static,
    ) -> FileRef {
        let owner = self.owner.clone();
        let group = self.group.clone();
        let conn = conn.clone();
        let hook_owner = owner.clone();
        let hook_group = group.clone();
        Arc::new(MagicWalkFile::new(
            name,
            0o555,
            &owner,
            &group,
            Box::new(move |_user| {
                let file = Arc::new(SyntheticFile::with_content(
                    name,
                    0o555,
                    &hook_owner,
                    &hook_group,
                    render(&conn),
                ));
                Ok(counted(file as FileRef, &conn))
            }),
        ))
    }
}

/// Wrap a slot file so opens and closes feed the slot's own-count.
fn counted(file: FileRef, conn: &Arc<Conn>) -> FileRef {
    let on_open = {
        let conn = conn.clone();
        move || conn.own()
    };
    let on_close = {
        let conn = conn.clone();
        move || conn.disown()
    };
    Arc::new(OpenCounterFile::new(file, on_open, on_close))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trees::{File, OpenMode};
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    fn arrive(dir: &Arc<SyntheticDir>, name: &str) -> FileRef {
        let file = dir.lookup(name).expect("entry present");
        match file.arrived("glenda").expect("walk hook") {
            Some(produced) => produced,
            None => file,
        }
    }

    fn read_all(file: &FileRef) -> Vec<u8> {
        let handle = file.open("glenda", OpenMode::Read).unwrap();
        let data = handle.read_at(8192, 0).unwrap();
        handle.close().unwrap();
        data
    }

    #[test]
    fn clone_allocates_monotonic_slots() {
        let tcp = tcp_dir("glenda", "glenda");
        for expected in ["0", "1", "2"] {
            let ctl = arrive(&tcp, "clone");
            let handle = ctl.open("glenda", OpenMode::ReadWrite).unwrap();
            assert_eq!(handle.read_at(64, 0).unwrap(), expected.as_bytes());
        }
        assert!(tcp.lookup("0").is_some());
        assert!(tcp.lookup("1").is_some());
        assert!(tcp.lookup("2").is_some());
    }

    #[test]
    fn slot_subtree_has_six_entries() {
        let tcp = tcp_dir("glenda", "glenda");
        let _ = arrive(&tcp, "clone");
        let slot = tcp.lookup("0").expect("slot directory");
        let names: Vec<String> = slot.children().iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, vec!["ctl", "data", "listen", "local", "remote", "status"]);
    }

    #[test]
    fn status_snapshot_tracks_state() {
        let tcp = tcp_dir("glenda", "glenda");
        let ctl = arrive(&tcp, "clone");
        let slot = tcp.lookup("0").unwrap();
        assert_eq!(read_all(&arrive_file(&slot, "status")), b"Closed\n");

        let ctl_handle = ctl.open("glenda", OpenMode::ReadWrite).unwrap();
        ctl_handle.write_at(b"announce 0", 0).unwrap();
        assert_eq!(read_all(&arrive_file(&slot, "status")), b"Announcing\n");
    }

    fn arrive_file(dir: &FileRef, name: &str) -> FileRef {
        let file = dir.lookup(name).expect("entry present");
        match file.arrived("glenda").expect("walk hook") {
            Some(produced) => produced,
            None => file,
        }
    }

    #[test]
    fn own_count_teardown_closes_slot() {
        let echo = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = echo.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = echo.accept().unwrap();
            let _ = stream.write(b"hi");
            stream
        });

        let tcp = tcp_dir("glenda", "glenda");
        let clone_ctl = arrive(&tcp, "clone");
        let clone_handle = clone_ctl.open("glenda", OpenMode::ReadWrite).unwrap();
        clone_handle
            .write_at(format!("connect 127.0.0.1!{port}").as_bytes(), 0)
            .unwrap();

        let slot = tcp.lookup("0").unwrap();
        let ctl_handle = arrive_file(&slot, "ctl")
            .open("glenda", OpenMode::ReadWrite)
            .unwrap();
        let data_handle = arrive_file(&slot, "data")
            .open("glenda", OpenMode::ReadWrite)
            .unwrap();
        let _peer = server.join().unwrap();
        assert_eq!(read_all(&arrive_file(&slot, "status")), b"Established\n");

        ctl_handle.close().unwrap();
        data_handle.close().unwrap();
        assert_eq!(read_all(&arrive_file(&slot, "status")), b"Closed\n");
    }

    #[test]
    fn clone_ctl_does_not_feed_own_count() {
        let tcp = tcp_dir("glenda", "glenda");
        let ctl = arrive(&tcp, "clone");
        let handle = ctl.open("glenda", OpenMode::ReadWrite).unwrap();
        handle.write_at(b"announce 0", 0).unwrap();
        handle.close().unwrap();

        // The clone walk returns the raw ctl, so closing it must not drive
        // the own-count to zero and tear the listener down.
        let slot = tcp.lookup("0").unwrap();
        assert_eq!(read_all(&arrive_file(&slot, "status")), b"Announcing\n");
    }

    #[test]
    fn udp_family_allocates_slots() {
        let udp = udp_dir("glenda", "glenda");
        let ctl = arrive(&udp, "clone");
        let handle = ctl.open("glenda", OpenMode::ReadWrite).unwrap();
        assert_eq!(handle.read_at(64, 0).unwrap(), b"0");
        let err = handle.write_at(b"announce 4500", 0).unwrap_err().to_string();
        assert!(err.contains("udp"));
    }
}
