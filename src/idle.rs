use std::collections::HashMap;
use std::sync::{Arc, Weak};

use slab::Slab;

use crate::tcp::TcpConn;

pub(crate) type IdleCallback = Arc<dyn Fn(&Arc<TcpConn>) + Send + Sync>;

/// Handle to an entry in a loop's idle tracker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IdleId(usize);

const NIL: usize = usize::MAX;

struct Node {
    conn: Weak<TcpConn>,
    callback: IdleCallback,
    last_active_s: u64,
    timeout_s: u64,
    prev: usize,
    next: usize,
}

// Head and tail of one bucket's intrusive list, oldest entry at the head.
#[derive(Copy, Clone)]
struct List {
    head: usize,
    tail: usize,
}

/// Per-timeout buckets of LRU-ordered connection entries.
///
/// Entries hold weak connection references, so the tracker never keeps a
/// connection alive. Touching an entry splices it to its bucket's tail in
/// O(1); the once-a-second sweep only ever inspects bucket heads.
pub(crate) struct IdleStore {
    nodes: Slab<Node>,
    buckets: HashMap<u64, List>,
}

impl IdleStore {
    pub fn new() -> IdleStore {
        IdleStore {
            nodes: Slab::new(),
            buckets: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        timeout_s: u64,
        conn: &Arc<TcpConn>,
        callback: IdleCallback,
        now_s: u64,
    ) -> IdleId {
        let key = self.nodes.insert(Node {
            conn: Arc::downgrade(conn),
            callback,
            last_active_s: now_s,
            timeout_s,
            prev: NIL,
            next: NIL,
        });
        self.push_tail(timeout_s, key);
        IdleId(key)
    }

    /// Stamp an entry as active now and move it to its bucket's tail.
    pub fn update(&mut self, id: IdleId, now_s: u64) {
        if !self.nodes.contains(id.0) {
            return;
        }
        let timeout_s = self.nodes[id.0].timeout_s;
        self.unlink(timeout_s, id.0);
        self.nodes[id.0].last_active_s = now_s;
        self.push_tail(timeout_s, id.0);
    }

    pub fn unregister(&mut self, id: IdleId) {
        if !self.nodes.contains(id.0) {
            return;
        }
        let timeout_s = self.nodes[id.0].timeout_s;
        self.unlink(timeout_s, id.0);
        self.nodes.remove(id.0);
    }

    /// Collect every expired entry.
    ///
    /// Expired entries are re-stamped and rotated to the tail rather than
    /// removed: the callback decides whether to close, and closing detaches
    /// the entry through the connection's own unregister path. Entries whose
    /// connection is gone are dropped here.
    pub fn sweep(&mut self, now_s: u64) -> Vec<(Weak<TcpConn>, IdleCallback)> {
        let mut fired = Vec::new();
        let timeouts: Vec<u64> = self.buckets.keys().copied().collect();
        for timeout_s in timeouts {
            loop {
                let head = self.buckets[&timeout_s].head;
                if head == NIL {
                    break;
                }
                if self.nodes[head].conn.strong_count() == 0 {
                    self.unlink(timeout_s, head);
                    self.nodes.remove(head);
                    continue;
                }
                if self.nodes[head].last_active_s + timeout_s > now_s {
                    break;
                }
                self.unlink(timeout_s, head);
                self.nodes[head].last_active_s = now_s;
                self.push_tail(timeout_s, head);
                fired.push((
                    self.nodes[head].conn.clone(),
                    Arc::clone(&self.nodes[head].callback),
                ));
            }
        }
        fired
    }

    fn push_tail(&mut self, timeout_s: u64, key: usize) {
        let mut list = *self
            .buckets
            .entry(timeout_s)
            .or_insert(List { head: NIL, tail: NIL });
        {
            let node = &mut self.nodes[key];
            node.prev = list.tail;
            node.next = NIL;
        }
        if list.tail != NIL {
            self.nodes[list.tail].next = key;
        } else {
            list.head = key;
        }
        list.tail = key;
        self.buckets.insert(timeout_s, list);
    }

    fn unlink(&mut self, timeout_s: u64, key: usize) {
        let mut list = match self.buckets.get(&timeout_s) {
            Some(list) => *list,
            None => return,
        };
        let (prev, next) = {
            let node = &self.nodes[key];
            (node.prev, node.next)
        };
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            list.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            list.tail = prev;
        }
        {
            let node = &mut self.nodes[key];
            node.prev = NIL;
            node.next = NIL;
        }
        self.buckets.insert(timeout_s, list);
    }
}
