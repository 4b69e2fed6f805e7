//! Live file and directory handles.
//!
//! Every open object is tracked as an `(id, token)` pair: the id is
//! monotonic and never recycled within a process lifetime, the token is a
//! random 15-bit nonzero credential that replaces pointer identity. FILE
//! entries own their host file; DIR entries own only the host path. Closed
//! ids accumulate in the dead-handle log until the periodic broadcaster
//! drains it.

use rand::Rng;
use std::fs::File;
use std::path::PathBuf;

/// Allocation fails beyond this many live handles.
pub const MAX_HANDLES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Dir,
}

#[derive(Debug)]
pub struct Handle {
    pub id: u32,
    pub token: u16,
    pub kind: HandleKind,
    /// Present for FILE handles only.
    pub file: Option<File>,
    pub host_path: PathBuf,
    /// Logical file position; may sit past the end until a write extends it.
    pub seq_ptr: u32,
    pub load_addr: u32,
    pub exec_addr: u32,
    pub length: u32,
    pub attrs: u32,
}

#[derive(Debug, Default)]
pub struct HandleTable {
    items: Vec<Handle>,
    next_id: u32,
    dead: Vec<u32>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            // 0 is reserved for the root.
            next_id: 1,
            dead: Vec::new(),
        }
    }

    fn make_token() -> u16 {
        rand::thread_rng().gen_range(1u16..=0x7FFF)
    }

    /// Adds an entry and returns its `(id, token)` credential, or `None`
    /// when the table is full.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        kind: HandleKind,
        file: Option<File>,
        host_path: PathBuf,
        load_addr: u32,
        exec_addr: u32,
        length: u32,
        attrs: u32,
    ) -> Option<(u32, u16)> {
        if self.items.len() >= MAX_HANDLES {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        let token = Self::make_token();
        self.items.push(Handle {
            id,
            token,
            kind,
            file,
            host_path,
            seq_ptr: 0,
            load_addr,
            exec_addr,
            length,
            attrs,
        });
        Some((id, token))
    }

    /// Credentialed lookup.
    pub fn lookup(&mut self, id: u32, token: u16) -> Option<&mut Handle> {
        self.items
            .iter_mut()
            .find(|h| h.id == id && h.token == token)
    }

    /// Lookup by id alone, for operations that already trust the id.
    pub fn get(&mut self, id: u32) -> Option<&mut Handle> {
        self.items.iter_mut().find(|h| h.id == id)
    }

    /// Removes an entry by id, releasing its file and recording the id in
    /// the dead-handle log.
    pub fn remove(&mut self, id: u32) -> bool {
        self.remove_where(|h| h.id == id)
    }

    /// Credentialed removal.
    pub fn close(&mut self, id: u32, token: u16) -> bool {
        self.remove_where(|h| h.id == id && h.token == token)
    }

    fn remove_where(&mut self, pred: impl Fn(&Handle) -> bool) -> bool {
        if let Some(idx) = self.items.iter().position(|h| pred(h)) {
            let handle = self.items.swap_remove(idx);
            self.dead.push(handle.id);
            // The owned File (if any) closes here, exactly once.
            drop(handle);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Ids closed since the last drain.
    pub fn dead_handles(&self) -> &[u32] {
        &self.dead
    }

    /// Drains the dead-handle log for broadcast.
    pub fn take_dead_handles(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.dead)
    }
}
