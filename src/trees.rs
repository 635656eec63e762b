// CLASSIFICATION: COMMUNITY
// Filename: trees.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-07-24

//! Synthetic file-tree primitives.
//!
//! Everything the 9P adapter serves is built from these pieces: plain
//! content files, directories, magic-walk files whose resolution runs a
//! hook, and an open-counting wrapper that lets a connection slot track how
//! many live handles refer to it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

/// Shared reference to a tree node.
pub type FileRef = Arc<dyn File>;

/// Shared reference to an open-file handle.
pub type HandleRef = Arc<dyn FileHandle>;

/// Disposition requested at open time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only open.
    Read,
    /// Read-write open.
    ReadWrite,
}

impl OpenMode {
    /// Whether the open asks for write access.
    pub fn wants_write(self) -> bool {
        matches!(self, OpenMode::ReadWrite)
    }
}

/// A node in the synthetic namespace.
///
/// Directories implement `lookup`/`children`; magic files implement
/// `arrived`. The defaults make a plain leaf file.
pub trait File: Send + Sync {
    /// Entry name within the parent directory.
    fn name(&self) -> &str;

    /// Unix-style permission bits (e.g. `0o555`).
    fn perm(&self) -> u32;

    /// Owning user.
    fn owner(&self) -> &str;

    /// Owning group.
    fn group(&self) -> &str;

    /// Whether this node is a directory.
    fn is_dir(&self) -> bool {
        false
    }

    /// Open the file on behalf of `user`, yielding a handle.
    fn open(&self, user: &str, mode: OpenMode) -> Result<HandleRef>;

    /// Directory child lookup. `None` for leaves and unknown names.
    fn lookup(&self, _child: &str) -> Option<FileRef> {
        None
    }

    /// Directory listing. Empty for leaves.
    fn children(&self) -> Vec<FileRef> {
        Vec::new()
    }

    /// Magic-walk hook, invoked while resolving this node during a walk.
    ///
    /// Returning `Some(file)` substitutes `file` as the walk result; the
    /// node itself stays in the tree. Returning `None` means the node is
    /// not magic.
    fn arrived(&self, _user: &str) -> Result<Option<FileRef>> {
        Ok(None)
    }
}

/// An open file. Offsets are honored by content files and ignored by the
/// stream-backed ones.
pub trait FileHandle: Send + Sync {
    /// Read up to `count` bytes at `offset`.
    fn read_at(&self, count: usize, offset: u64) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes consumed.
    fn write_at(&self, data: &[u8], offset: u64) -> Result<usize>;

    /// Release the handle.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Permission check applied by every open path.
///
/// Owner opens are checked against the owner bits, everything else against
/// the world bits. Group membership is not modelled; the namespace carries a
/// single service user.
pub fn can_open(perm: u32, owner: &str, user: &str, mode: OpenMode) -> bool {
    let bits = if user == owner { (perm >> 6) & 0o7 } else { perm & 0o7 };
    if bits & 0o4 == 0 {
        return false;
    }
    if mode.wants_write() && bits & 0o2 == 0 {
        return false;
    }
    true
}

/// A leaf file serving a fixed byte string.
pub struct SyntheticFile {
    name: String,
    perm: u32,
    owner: String,
    group: String,
    content: Mutex<Vec<u8>>,
}

impl SyntheticFile {
    /// Empty file.
    pub fn new(name: &str, perm: u32, owner: &str, group: &str) -> Self {
        Self::with_content(name, perm, owner, group, Vec::new())
    }

    /// File pre-loaded with `content`.
    pub fn with_content(
        name: &str,
        perm: u32,
        owner: &str,
        group: &str,
        content: Vec<u8>,
    ) -> Self {
        Self {
            name: name.to_string(),
            perm,
            owner: owner.to_string(),
            group: group.to_string(),
            content: Mutex::new(content),
        }
    }
}

impl File for SyntheticFile {
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
        // Handles snapshot the content; later set_content calls are not
        // visible through an already-open handle.
        let content = self.content.lock().unwrap().clone();
        Ok(Arc::new(ContentHandle { content }))
    }
}

struct ContentHandle {
    content: Vec<u8>,
}

impl FileHandle for ContentHandle {
    fn read_at(&self, count: usize, offset: u64) -> Result<Vec<u8>> {
        let start = (offset as usize).min(self.content.len());
        let end = (start + count).min(self.content.len());
        Ok(self.content[start..end].to_vec())
    }

    fn write_at(&self, _data: &[u8], _offset: u64) -> Result<usize> {
        bail!("file is read-only");
    }
}

/// A directory of named children.
pub struct SyntheticDir {
    name: String,
    perm: u32,
    owner: String,
    group: String,
    entries: Mutex<BTreeMap<String, FileRef>>,
}

impl SyntheticDir {
    /// Empty directory.
    pub fn new(name: &str, perm: u32, owner: &str, group: &str) -> Self {
        Self {
            name: name.to_string(),
            perm,
            owner: owner.to_string(),
            group: group.to_string(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Insert or replace the child `name`.
    pub fn add(&self, name: &str, file: FileRef) {
        self.entries.lock().unwrap().insert(name.to_string(), file);
    }
}

impl File for SyntheticDir {
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

    fn is_dir(&self) -> bool {
        true
    }

    fn open(&self, user: &str, mode: OpenMode) -> Result<HandleRef> {
        if mode.wants_write() {
            bail!("is a directory");
        }
        if !can_open(self.perm, &self.owner, user, mode) {
            bail!("permission denied");
        }
        Ok(Arc::new(DirHandle))
    }

    fn lookup(&self, child: &str) -> Option<FileRef> {
        self.entries.lock().unwrap().get(child).cloned()
    }

    fn children(&self) -> Vec<FileRef> {
        self.entries.lock().unwrap().values().cloned().collect()
    }
}

struct DirHandle;

impl FileHandle for DirHandle {
    fn read_at(&self, _count: usize, _offset: u64) -> Result<Vec<u8>> {
        bail!("is a directory");
    }

    fn write_at(&self, _data: &[u8], _offset: u64) -> Result<usize> {
        bail!("is a directory");
    }
}

/// Hook type for [`MagicWalkFile`].
pub type ArrivedHook = Box<dyn Fn(&str) -> Result<FileRef> + Send + Sync>;

/// A file whose walk-resolution runs a hook and substitutes its result.
///
/// The clone file, the listen file and the address/status snapshots are all
/// instances of this: they must look like ordinary files to the client but
/// produce a freshly built file (with side effects) each time they are
/// walked to.
pub struct MagicWalkFile {
    name: String,
    perm: u32,
    owner: String,
    group: String,
    hook: ArrivedHook,
}

impl MagicWalkFile {
    /// Magic file running `hook` on every walk.
    pub fn new(name: &str, perm: u32, owner: &str, group: &str, hook: ArrivedHook) -> Self {
        Self {
            name: name.to_string(),
            perm,
            owner: owner.to_string(),
            group: group.to_string(),
            hook,
        }
    }
}

impl File for MagicWalkFile {
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
        // Reached only when a client holds a FID for the magic node itself;
        // walks normally resolve to the hook result instead.
        if !can_open(self.perm, &self.owner, user, mode) {
            bail!("permission denied");
        }
        Ok(Arc::new(ContentHandle { content: Vec::new() }))
    }

    fn arrived(&self, user: &str) -> Result<Option<FileRef>> {
        (self.hook)(user).map(Some)
    }
}

/// Wrapper pairing each successful open with an open hook and each handle
/// close with a close hook. Read/write semantics of the wrapped file are
/// forwarded unchanged.
pub struct OpenCounterFile {
    inner: FileRef,
    on_open: Box<dyn Fn() + Send + Sync>,
    on_close: Arc<dyn Fn() + Send + Sync>,
}

impl OpenCounterFile {
    /// Wrap `inner` with the given hooks.
    pub fn new(
        inner: FileRef,
        on_open: impl Fn() + Send + Sync + 'static,
        on_close: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            on_open: Box::new(on_open),
            on_close: Arc::new(on_close),
        }
    }
}

impl File for OpenCounterFile {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn perm(&self) -> u32 {
        self.inner.perm()
    }

    fn owner(&self) -> &str {
        self.inner.owner()
    }

    fn group(&self) -> &str {
        self.inner.group()
    }

    fn is_dir(&self) -> bool {
        self.inner.is_dir()
    }

    fn open(&self, user: &str, mode: OpenMode) -> Result<HandleRef> {
        let handle = self.inner.open(user, mode)?;
        (self.on_open)();
        Ok(Arc::new(CountedHandle {
            inner: handle,
            on_close: self.on_close.clone(),
        }))
    }

    fn lookup(&self, child: &str) -> Option<FileRef> {
        self.inner.lookup(child)
    }

    fn children(&self) -> Vec<FileRef> {
        self.inner.children()
    }

    fn arrived(&self, user: &str) -> Result<Option<FileRef>> {
        self.inner.arrived(user)
    }
}

struct CountedHandle {
    inner: HandleRef,
    on_close: Arc<dyn Fn() + Send + Sync>,
}

impl FileHandle for CountedHandle {
    fn read_at(&self, count: usize, offset: u64) -> Result<Vec<u8>> {
        self.inner.read_at(count, offset)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.inner.write_at(data, offset)
    }

    fn close(&self) -> Result<()> {
        let res = self.inner.close();
        (self.on_close)();
        res
    }
}
