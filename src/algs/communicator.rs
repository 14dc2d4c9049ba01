//! Thin façade over in-process or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees). Every
//! handle is waitable but non-blocking to create; callers `.wait()` before
//! trusting a received buffer and may poll [`Wait::is_complete`] in between.
//!
//! Matching is per `(source, destination, tag)` and first-in first-out:
//! the n-th receive posted for a key is completed by the n-th message sent
//! on that key.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;

/// Typed message tag. The upper 8 bits are reserved for the context id of a
/// [`CommGroup`](crate::algs::comm_group::CommGroup); user tags live in the
/// lower 24 bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommTag(u32);

impl CommTag {
    /// Mask of the bits available to user tags.
    pub const USER_MASK: u32 = 0x00FF_FFFF;

    pub const fn new(tag: u32) -> Self {
        Self(tag & Self::USER_MASK)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Tag `self + k`, wrapping inside the user range.
    #[inline]
    pub const fn offset(self, k: u32) -> Self {
        Self(self.0.wrapping_add(k) & Self::USER_MASK)
    }
}

/// Non-blocking point-to-point interface.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Rank of this endpoint in the world.
    fn rank(&self) -> usize;
    /// Number of endpoints in the world.
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u32, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u32) -> Self::RecvHandle;
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;

    /// Non-blocking completion test.
    fn is_complete(&self) -> bool {
        true
    }
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Compile-time no-op comm for pure serial runs: a world of one rank.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u32, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u32) {}
}

// --- LocalComm: one endpoint per thread, shared in-process mailbox ---

type Key = (usize, usize, u32); // (src, dst, tag)

#[derive(Default)]
struct Channel {
    sent: u64,
    posted: u64,
    queue: HashMap<u64, Bytes>,
}

#[derive(Default)]
struct Slot {
    chan: Mutex<Channel>,
    ready: Condvar,
}

#[derive(Default)]
struct Mailbox {
    slots: DashMap<Key, Arc<Slot>>,
}

impl Mailbox {
    fn slot(&self, key: Key) -> Arc<Slot> {
        self.slots.entry(key).or_default().clone()
    }
}

/// Receive handle of [`LocalComm`]: a ticket on one mailbox slot.
pub struct LocalHandle {
    slot: Arc<Slot>,
    ticket: u64,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let mut chan = self.slot.chan.lock();
        loop {
            if let Some(bytes) = chan.queue.remove(&self.ticket) {
                return Some(bytes.to_vec());
            }
            self.slot.ready.wait(&mut chan);
        }
    }

    fn is_complete(&self) -> bool {
        self.slot.chan.lock().queue.contains_key(&self.ticket)
    }
}

/// In-process communicator. A universe of `n` endpoints shares one mailbox;
/// each endpoint is meant to be driven by its own thread.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl LocalComm {
    /// Create `n` connected endpoints, ranks `0..n`.
    pub fn universe(n: usize) -> Vec<LocalComm> {
        let mailbox = Arc::new(Mailbox::default());
        (0..n)
            .map(|rank| LocalComm {
                rank,
                size: n,
                mailbox: mailbox.clone(),
            })
            .collect()
    }
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl Communicator for LocalComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u32, buf: &[u8]) -> Self::SendHandle {
        let slot = self.mailbox.slot((self.rank, peer, tag));
        let mut chan = slot.chan.lock();
        let seq = chan.sent;
        chan.sent += 1;
        chan.queue.insert(seq, Bytes::copy_from_slice(buf));
        drop(chan);
        slot.ready.notify_all();
    }

    fn irecv(&self, peer: usize, tag: u32) -> Self::RecvHandle {
        let slot = self.mailbox.slot((peer, self.rank, tag));
        let ticket = {
            let mut chan = slot.chan.lock();
            let t = chan.posted;
            chan.posted += 1;
            t
        };
        LocalHandle { slot, ticket }
    }
}

/// Largest tag every MPI implementation must accept.
pub const MPI_TAG_FLOOR: u32 = 32767;

/// MPI tag carrying the full tag `tag`. Several full tags share one MPI tag;
/// the full tag travels in front of the payload.
#[cfg_attr(not(feature = "mpi-support"), allow(dead_code))]
#[inline]
fn mpi_tag(tag: u32) -> i32 {
    ((tag ^ (tag >> 15) ^ (tag >> 30)) & MPI_TAG_FLOOR) as i32
}

#[cfg_attr(not(feature = "mpi-support"), allow(dead_code))]
fn seal(tag: u32, buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + buf.len());
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(buf);
    out
}

#[cfg_attr(not(feature = "mpi-support"), allow(dead_code))]
fn unseal(mut msg: Vec<u8>) -> Option<(u32, Vec<u8>)> {
    let head: [u8; 4] = msg.get(..4)?.try_into().ok()?;
    msg.drain(..4);
    Some((u32::from_le_bytes(head), msg))
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::environment::Universe;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;
    use std::collections::VecDeque;

    /// Messages that arrived on a shared MPI tag ahead of their receive.
    type Stash = Arc<Mutex<HashMap<(i32, u32), VecDeque<Vec<u8>>>>>;

    /// World communicator backed by MPI.
    ///
    /// Sends are buffered (`MPI_Bsend`) so every `isend` completes locally;
    /// receives are matched lazily when waited on, so handles with the same
    /// `(peer, tag)` must be waited in posting order. Full 32-bit tags are
    /// folded onto MPI tags below 32768 and demultiplexed on arrival.
    #[derive(Clone, Debug)]
    pub struct MpiComm {
        rank: usize,
        size: usize,
        stash: Stash,
    }

    impl MpiComm {
        /// Attach a send buffer of `buffer_bytes` to `universe` and wrap its world.
        pub fn new(universe: &mut Universe, buffer_bytes: usize) -> Self {
            universe.set_buffer_size(buffer_bytes);
            let world = universe.world();
            Self {
                rank: world.rank() as usize,
                size: world.size() as usize,
                stash: Stash::default(),
            }
        }
    }

    pub struct MpiRecvHandle {
        peer: i32,
        tag: u32,
        stash: Stash,
    }

    impl MpiRecvHandle {
        fn stashed(&self) -> Option<Vec<u8>> {
            self.stash.lock().get_mut(&(self.peer, self.tag))?.pop_front()
        }

        /// Receive one message on the shared MPI tag and file it.
        fn pull(&self) {
            let world = SimpleCommunicator::world();
            let (msg, _status) = world
                .process_at_rank(self.peer)
                .receive_vec_with_tag::<u8>(mpi_tag(self.tag));
            match unseal(msg) {
                Some((tag, body)) => self.stash.lock().entry((self.peer, tag)).or_default().push_back(body),
                None => log::warn!("dropping unsealed message from rank {}", self.peer),
            }
        }
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            loop {
                if let Some(body) = self.stashed() {
                    return Some(body);
                }
                self.pull();
            }
        }

        fn is_complete(&self) -> bool {
            let world = SimpleCommunicator::world();
            loop {
                if self
                    .stash
                    .lock()
                    .get(&(self.peer, self.tag))
                    .is_some_and(|q| !q.is_empty())
                {
                    return true;
                }
                if world
                    .process_at_rank(self.peer)
                    .immediate_probe_with_tag(mpi_tag(self.tag))
                    .is_none()
                {
                    return false;
                }
                self.pull();
            }
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = ();
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u32, buf: &[u8]) {
            let world = SimpleCommunicator::world();
            world
                .process_at_rank(peer as i32)
                .buffered_send_with_tag(&seal(tag, buf)[..], mpi_tag(tag));
        }

        fn irecv(&self, peer: usize, tag: u32) -> MpiRecvHandle {
            MpiRecvHandle {
                peer: peer as i32,
                tag,
                stash: self.stash.clone(),
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_roundtrip_two_ranks() {
        let mut world = LocalComm::universe(2);
        let comm1 = world.pop().unwrap();
        let comm0 = world.pop().unwrap();

        // receive posted before the matching send
        let recv_handle = comm1.irecv(0, 7);
        assert!(!recv_handle.is_complete());
        comm0.isend(1, 7, &[1, 2, 3, 4]).wait();
        assert!(recv_handle.is_complete());

        let data = recv_handle
            .wait()
            .expect("Expected to receive data from rank 0");
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn local_matching_is_fifo_per_tag() {
        let world = LocalComm::universe(2);
        world[0].isend(1, 3, &[1]);
        world[0].isend(1, 4, &[9]);
        world[0].isend(1, 3, &[2]);
        let first = world[1].irecv(0, 3);
        let other = world[1].irecv(0, 4);
        let second = world[1].irecv(0, 3);
        assert_eq!(second.wait(), Some(vec![2]));
        assert_eq!(first.wait(), Some(vec![1]));
        assert_eq!(other.wait(), Some(vec![9]));
    }

    #[test]
    fn local_wait_blocks_until_sent() {
        let world = LocalComm::universe(2);
        let (a, b) = (world[0].clone(), world[1].clone());
        let h = b.irecv(0, 11);
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            a.isend(1, 11, b"late");
        });
        assert_eq!(h.wait().as_deref(), Some(&b"late"[..]));
        t.join().unwrap();
    }

    #[test]
    fn mpi_tags_fit_the_guaranteed_range() {
        let contexts = [0u32, 1, 2, 3, 0xFF];
        for ctx in contexts {
            for t in [0u32, 0x13, 0x10_0000, 0x3F_FFFF, 0xFF_FFFF] {
                let full = (ctx << 24) | t;
                let m = mpi_tag(full);
                assert!((0..=MPI_TAG_FLOOR as i32).contains(&m), "{full:#x} -> {m}");
            }
        }
        // the reserved context bits change the MPI tag
        assert_ne!(mpi_tag(1 << 24 | 0x10), mpi_tag(2 << 24 | 0x10));
    }

    #[test]
    fn sealed_messages_carry_their_tag() {
        let full = (3 << 24) | 0x20_0005;
        assert_eq!(unseal(seal(full, b"xy")), Some((full, b"xy".to_vec())));
        assert_eq!(unseal(seal(7, &[])), Some((7, Vec::new())));
        assert_eq!(unseal(vec![1, 2]), None);
    }

    #[test]
    fn tags_stay_in_user_range() {
        let t = CommTag::new(0xFFFF_FFFF);
        assert_eq!(t.as_u32(), CommTag::USER_MASK);
        assert_eq!(CommTag::new(5).offset(3).as_u32(), 8);
    }
}
