use std::{cmp, fmt, mem};

const DEFAULT_GROW_HINT: usize = 512;

/// Growable byte buffer with head and tail cursors.
///
/// The readable region is `[begin, end)`, the writable region is
/// `[end, capacity)`. [`reserve`] makes room at the tail either by shifting
/// the readable bytes to the front or by growing the allocation, whichever
/// yields more room for the least work.
///
/// The view returned by [`data`] is invalidated by any mutating operation;
/// the borrow checker enforces that.
///
/// [`reserve`]: Buffer::reserve
/// [`data`]: Buffer::data
#[derive(Clone, Default)]
pub struct Buffer {
    data: Vec<u8>,
    begin: usize,
    end: usize,
    grow_hint: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_grow_hint(DEFAULT_GROW_HINT)
    }

    /// A buffer that grows to at least `grow_hint` bytes on first use.
    pub fn with_grow_hint(grow_hint: usize) -> Buffer {
        Buffer {
            data: Vec::new(),
            begin: 0,
            end: 0,
            grow_hint: cmp::max(grow_hint, 16),
        }
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The readable region.
    pub fn data(&self) -> &[u8] {
        &self.data[self.begin..self.end]
    }

    /// Ensure at least `n` writable bytes at the tail and return the whole
    /// writable region. Pair with [`commit`] after writing into it.
    ///
    /// [`commit`]: Buffer::commit
    pub fn reserve(&mut self, n: usize) -> &mut [u8] {
        if self.data.len() - self.end < n {
            self.make_room(n);
        }
        &mut self.data[self.end..]
    }

    /// Mark `n` bytes written into the region returned by [`reserve`].
    ///
    /// [`reserve`]: Buffer::reserve
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.data.len(), "commit past reserved room");
        self.end += n;
    }

    /// Drop up to `n` bytes from the head, returning how many were dropped.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = cmp::min(n, self.len());
        self.begin += n;
        if self.begin == self.end {
            self.begin = 0;
            self.end = 0;
        }
        n
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let room = self.reserve(bytes.len());
        room[..bytes.len()].copy_from_slice(bytes);
        self.commit(bytes.len());
    }

    /// Move `other`'s readable bytes to the tail of `self`, leaving `other`
    /// empty. When `self` is empty the storage is swapped instead of copied.
    pub fn absorb(&mut self, other: &mut Buffer) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            mem::swap(self, other);
        } else {
            self.append(other.data());
            other.clear();
        }
    }

    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }

    fn make_room(&mut self, n: usize) {
        let size = self.len();
        if size + n < self.data.len() / 2 {
            // Plenty of dead room at the head; shift instead of growing.
            self.data.copy_within(self.begin..self.end, 0);
        } else {
            let new_cap = cmp::max(cmp::max(self.grow_hint, 2 * self.data.len()), size + n);
            let mut data = vec![0; new_cap];
            data[..size].copy_from_slice(&self.data[self.begin..self.end]);
            self.data = data;
        }
        self.begin = 0;
        self.end = size;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_consume() {
        let mut buf = Buffer::new();
        buf.append(b"head");
        buf.append(b"tail");
        assert_eq!(buf.data(), b"headtail");
        assert_eq!(buf.consume(4), 4);
        assert_eq!(buf.data(), b"tail");
        assert_eq!(buf.consume(100), 4);
        assert!(buf.is_empty());
    }

    #[test]
    fn reserve_commit() {
        let mut buf = Buffer::new();
        let room = buf.reserve(3);
        assert!(room.len() >= 3);
        room[..3].copy_from_slice(b"abc");
        buf.commit(3);
        assert_eq!(buf.data(), b"abc");
    }

    #[test]
    fn head_shift_keeps_capacity() {
        let mut buf = Buffer::with_grow_hint(64);
        buf.append(&[b'x'; 60]);
        buf.consume(59);
        let cap = buf.capacity();
        // One live byte, plenty of dead head room: reserving must not grow.
        buf.reserve(8);
        assert_eq!(buf.capacity(), cap);
        assert_eq!(buf.data(), b"x");
    }

    #[test]
    fn absorb_swaps_into_empty() {
        let mut a = Buffer::new();
        let mut b = Buffer::new();
        b.append(b"payload");
        a.absorb(&mut b);
        assert_eq!(a.data(), b"payload");
        assert!(b.is_empty());

        let mut c = Buffer::new();
        c.append(b"pre");
        c.absorb(&mut a);
        assert_eq!(c.data(), b"prepayload");
        assert!(a.is_empty());
    }
}
