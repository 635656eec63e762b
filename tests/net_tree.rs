// CLASSIFICATION: COMMUNITY
// Filename: net_tree.rs v0.2
// Date Modified: 2026-07-27
// Author: Cohesix Codex

//! End-to-end walks of the /net tree against real loopback sockets.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use cohesix_net9p::net_root;
use cohesix_net9p::trees::{File, FileRef, OpenMode};

/// Resolve a child the way the 9P walk does: magic files substitute their
/// hook result.
fn arrive(dir: &FileRef, name: &str) -> FileRef {
    let file = dir.lookup(name).expect("entry present");
    match file.arrived("glenda").expect("walk hook") {
        Some(produced) => produced,
        None => file,
    }
}

fn read_snapshot(dir: &FileRef, name: &str) -> Vec<u8> {
    let file = arrive(dir, name);
    let handle = file.open("glenda", OpenMode::Read).unwrap();
    let data = handle.read_at(8192, 0).unwrap();
    handle.close().unwrap();
    data
}

/// Port that was free a moment ago.
fn free_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

fn spawn_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 256];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });
    port
}

#[test]
fn tcp_echo_round_trip() {
    let echo_port = spawn_echo();
    let root = net_root("glenda", "glenda") as FileRef;
    let tcp = root.lookup("tcp").unwrap();

    let ctl = arrive(&tcp, "clone");
    let ctl_handle = ctl.open("glenda", OpenMode::ReadWrite).unwrap();
    assert_eq!(ctl_handle.read_at(64, 0).unwrap(), b"0");
    ctl_handle
        .write_at(format!("connect 127.0.0.1!{echo_port}").as_bytes(), 0)
        .unwrap();

    let slot = tcp.lookup("0").unwrap();
    let data = arrive(&slot, "data");
    let data_handle = data.open("glenda", OpenMode::ReadWrite).unwrap();
    data_handle.write_at(b"ping", 0).unwrap();
    let mut got = Vec::new();
    while got.len() < 4 {
        let chunk = data_handle.read_at(4 - got.len(), 0).unwrap();
        assert!(!chunk.is_empty(), "echo stream ended early");
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, b"ping");

    assert_eq!(read_snapshot(&slot, "status"), b"Established\n");
    let local = read_snapshot(&slot, "local");
    let remote = read_snapshot(&slot, "remote");
    assert!(local.starts_with(b"127.0.0.1!"), "{local:?}");
    assert_eq!(remote, format!("127.0.0.1!{echo_port}").into_bytes());
}

#[test]
fn announce_and_accept_through_listen_walk() {
    let root = net_root("glenda", "glenda") as FileRef;
    let tcp = root.lookup("tcp").unwrap();
    let port = free_port();

    let ctl = arrive(&tcp, "clone");
    let ctl_handle = ctl.open("glenda", OpenMode::ReadWrite).unwrap();
    assert_eq!(ctl_handle.read_at(64, 0).unwrap(), b"0");
    ctl_handle
        .write_at(format!("announce {port}").as_bytes(), 0)
        .unwrap();

    let slot = tcp.lookup("0").unwrap();
    assert_eq!(read_snapshot(&slot, "status"), b"Announcing\n");

    // The listen walk blocks on accept, so it runs on its own thread while
    // an external client dials in.
    let listen_slot = slot.clone();
    let accepted = thread::spawn(move || arrive(&listen_slot, "listen"));

    let mut dialer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    dialer.write_all(b"hello").unwrap();

    let new_ctl = accepted.join().unwrap();
    let new_ctl_handle = new_ctl.open("glenda", OpenMode::ReadWrite).unwrap();
    assert_eq!(new_ctl_handle.read_at(64, 0).unwrap(), b"1");

    let new_slot = tcp.lookup("1").unwrap();
    assert_eq!(read_snapshot(&new_slot, "status"), b"Established\n");

    let data = arrive(&new_slot, "data");
    let data_handle = data.open("glenda", OpenMode::ReadWrite).unwrap();
    let mut got = Vec::new();
    while got.len() < 5 {
        let chunk = data_handle.read_at(5 - got.len(), 0).unwrap();
        assert!(!chunk.is_empty(), "dialer stream ended early");
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, b"hello");

    data_handle.write_at(b"ok", 0).unwrap();
    let mut reply = [0u8; 2];
    dialer.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ok");
}

#[test]
fn own_count_teardown_releases_socket() {
    let echo_port = spawn_echo();
    let root = net_root("glenda", "glenda") as FileRef;
    let tcp = root.lookup("tcp").unwrap();

    let clone_ctl = arrive(&tcp, "clone");
    let clone_handle = clone_ctl.open("glenda", OpenMode::ReadWrite).unwrap();
    clone_handle
        .write_at(format!("connect 127.0.0.1!{echo_port}").as_bytes(), 0)
        .unwrap();

    let slot = tcp.lookup("0").unwrap();
    let ctl_handle = arrive(&slot, "ctl")
        .open("glenda", OpenMode::ReadWrite)
        .unwrap();
    let data_handle = arrive(&slot, "data")
        .open("glenda", OpenMode::ReadWrite)
        .unwrap();
    assert_eq!(read_snapshot(&slot, "status"), b"Established\n");

    ctl_handle.close().unwrap();
    data_handle.close().unwrap();
    assert_eq!(read_snapshot(&slot, "status"), b"Closed\n");
    assert!(read_snapshot(&slot, "local").is_empty());
}

#[test]
fn concurrent_clones_number_slots_uniquely() {
    let root = net_root("glenda", "glenda") as FileRef;
    let tcp = root.lookup("tcp").unwrap();
    let seen = Arc::new(Mutex::new(HashSet::new()));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let tcp = tcp.clone();
        let seen = seen.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..25 {
                let ctl = arrive(&tcp, "clone");
                let handle = ctl.open("glenda", OpenMode::ReadWrite).unwrap();
                let number = String::from_utf8(handle.read_at(64, 0).unwrap()).unwrap();
                let slot: u64 = number.parse().unwrap();
                assert!(seen.lock().unwrap().insert(slot), "slot {slot} reused");
            }
        }));
    }
    for worker in workers {
        worker.join().expect("thread failed");
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 100);
    assert_eq!(*seen.iter().max().unwrap(), 99);
    for slot in 0..100u64 {
        assert!(tcp.lookup(&slot.to_string()).is_some());
    }
}
