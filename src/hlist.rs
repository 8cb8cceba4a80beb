//! Handler lists
//!
//! A singly linked chain of `(handler, directory, silent)` entries describing
//! the work left in a phase. [`HandlerListObject`] is the live position a
//! request walks during dispatch.

use crate::error::{BridgeError, BridgeResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// One node of a handler list
#[derive(Debug, PartialEq, Eq)]
pub struct HandlerEntry {
    pub handler: String,
    pub directory: Option<String>,
    /// Skip quietly instead of failing when the handler cannot be found
    pub silent: bool,
    pub next: Option<Box<HandlerEntry>>,
}

impl HandlerEntry {
    /// Single-node list
    pub fn new(handler: impl Into<String>, directory: Option<String>, silent: bool) -> Self {
        Self {
            handler: handler.into(),
            directory,
            silent,
            next: None,
        }
    }

    /// Link a new node after the current tail and return it
    pub fn append(
        &mut self,
        handler: impl Into<String>,
        directory: Option<String>,
        silent: bool,
    ) -> &mut HandlerEntry {
        self.tail_slot()
            .insert(Box::new(HandlerEntry::new(handler, directory, silent)))
    }

    /// Link every node of `other` after the current tail
    pub fn extend(&mut self, other: HandlerEntry) {
        *self.tail_slot() = Some(Box::new(other));
    }

    fn tail_slot(&mut self) -> &mut Option<Box<HandlerEntry>> {
        let mut slot = &mut self.next;
        while let Some(node) = slot {
            slot = &mut node.next;
        }
        slot
    }

    /// Deep copy, node by node, so the copy shares nothing with `self`
    pub fn copy(&self) -> HandlerEntry {
        let mut head = HandlerEntry::new(self.handler.clone(), self.directory.clone(), self.silent);
        let mut tail = &mut head;
        let mut src = self.next.as_deref();
        while let Some(node) = src {
            tail = tail.next.insert(Box::new(HandlerEntry::new(
                node.handler.clone(),
                node.directory.clone(),
                node.silent,
            )));
            src = node.next.as_deref();
        }
        head
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerEntry> + '_ {
        std::iter::successors(Some(self), |e| e.next.as_deref())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Build a list from `(handler, silent)` pairs sharing one directory
    pub fn from_handlers<'a, I>(handlers: I, directory: Option<&str>) -> Option<HandlerEntry>
    where
        I: IntoIterator<Item = (&'a str, bool)>,
    {
        let mut iter = handlers.into_iter();
        let (first, silent) = iter.next()?;
        let mut head = HandlerEntry::new(first, directory.map(str::to_owned), silent);
        for (handler, silent) in iter {
            head.append(handler, directory.map(str::to_owned), silent);
        }
        Some(head)
    }
}

impl Drop for HandlerEntry {
    fn drop(&mut self) {
        // Unlink iteratively so long chains do not recurse.
        let mut next = self.next.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

/// Snapshot of the head entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerInfo {
    pub handler: String,
    pub directory: Option<String>,
    pub silent: bool,
}

/// Reference-counted live position in a handler list
#[derive(Clone)]
pub struct HandlerListObject {
    head: Arc<Mutex<Option<Box<HandlerEntry>>>>,
}

impl HandlerListObject {
    /// Take ownership of a list (usually a per-request copy)
    pub fn new(list: Option<HandlerEntry>) -> Self {
        Self {
            head: Arc::new(Mutex::new(list.map(Box::new))),
        }
    }

    pub fn ptr_eq(&self, other: &HandlerListObject) -> bool {
        Arc::ptr_eq(&self.head, &other.head)
    }

    pub fn current(&self) -> Option<HandlerInfo> {
        self.head.lock().as_deref().map(|e| HandlerInfo {
            handler: e.handler.clone(),
            directory: e.directory.clone(),
            silent: e.silent,
        })
    }

    pub fn handler(&self) -> Option<String> {
        self.head.lock().as_deref().map(|e| e.handler.clone())
    }

    pub fn directory(&self) -> Option<String> {
        self.head.lock().as_deref().and_then(|e| e.directory.clone())
    }

    pub fn silent(&self) -> Option<bool> {
        self.head.lock().as_deref().map(|e| e.silent)
    }

    pub fn is_empty(&self) -> bool {
        self.head.lock().is_none()
    }

    /// Entries left, including the current one
    pub fn remaining(&self) -> usize {
        self.head.lock().as_deref().map_or(0, HandlerEntry::len)
    }

    /// Drop the head entry
    pub fn advance(&self) -> BridgeResult<()> {
        let mut head = self.head.lock();
        let mut current = head.take().ok_or(BridgeError::Exhausted)?;
        *head = current.next.take();
        Ok(())
    }

    /// Append to the end of the live list
    pub fn append(&self, handler: impl Into<String>, directory: Option<String>, silent: bool) {
        let mut head = self.head.lock();
        match head.as_mut() {
            Some(list) => {
                list.append(handler, directory, silent);
            }
            None => *head = Some(Box::new(HandlerEntry::new(handler, directory, silent))),
        }
    }
}

impl fmt::Debug for HandlerListObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerListObject")
            .field("current", &self.current())
            .field("remaining", &self.remaining())
            .finish()
    }
}
