//! Sub-communicators and the collectives built on top of point-to-point.
//!
//! A [`CommGroup`] is an ordered member list of world ranks plus a context
//! id. Group ranks are positions in the member list. The context id is folded
//! into the upper tag bits so that messages of different groups never match
//! each other, even between the same pair of world ranks.
//!
//! Collectives are rooted at group rank 0 and are deterministic: reductions
//! combine contributions in ascending group-rank order on the root and
//! broadcast the root's result, so every member ends with identical bits.
//! All members must enter the same collectives in the same order.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{cast_slice, decode_exact};
use crate::combi_error::CombiError;
use bytemuck::Pod;
use std::sync::Arc;

/// Tag bases used by the crate. Bases that take an offset (subspace id,
/// global 1-D index) leave 20 bits for it.
pub mod tags {
    use crate::algs::communicator::CommTag;

    pub const BARRIER: CommTag = CommTag::new(0x01);
    pub const BARRIER_RELEASE: CommTag = CommTag::new(0x02);
    pub const BROADCAST: CommTag = CommTag::new(0x03);
    pub const REDUCE: CommTag = CommTag::new(0x04);
    pub const REDUCE_RESULT: CommTag = CommTag::new(0x05);
    pub const GATHER: CommTag = CommTag::new(0x06);

    pub const SIGNAL: CommTag = CommTag::new(0x10);
    pub const STATUS: CommTag = CommTag::new(0x11);
    pub const PAYLOAD: CommTag = CommTag::new(0x12);
    pub const RESULT: CommTag = CommTag::new(0x13);

    pub const FULL_GRID_GATHER: CommTag = CommTag::new(0x20);

    pub const SUBSPACE_GATHER: CommTag = CommTag::new(0x10_0000);
    pub const SUBSPACE_SCATTER: CommTag = CommTag::new(0x20_0000);
    pub const HIERARCHIZATION: CommTag = CommTag::new(0x30_0000);

    /// Largest offset accepted by the offset bases.
    pub const MAX_OFFSET: u32 = 0x0F_FFFF;
}

/// Ordered subset of the world with its own tag space.
pub struct CommGroup<C: Communicator> {
    comm: Arc<C>,
    members: Vec<usize>,
    rank: usize,
    context: u8,
}

impl<C: Communicator> CommGroup<C> {
    /// Group over `members` (world ranks, in group-rank order). The calling
    /// process must be one of them.
    pub fn new(comm: Arc<C>, members: Vec<usize>, context: u8) -> Result<Self, CombiError> {
        let me = comm.rank();
        if let Some(&bad) = members.iter().find(|&&m| m >= comm.size()) {
            return Err(CombiError::RankOutOfRange {
                rank: bad,
                size: comm.size(),
            });
        }
        let rank = members
            .iter()
            .position(|&m| m == me)
            .ok_or(CombiError::NotAMember { rank: me })?;
        Ok(Self {
            comm,
            members,
            rank,
            context,
        })
    }

    /// Group over the whole world, context 0.
    pub fn world(comm: Arc<C>) -> Self {
        let size = comm.size();
        let rank = comm.rank();
        Self {
            comm,
            members: (0..size).collect(),
            rank,
            context: 0,
        }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    /// World rank of group rank `r`.
    #[inline]
    pub fn world_rank(&self, r: usize) -> usize {
        self.members[r]
    }

    pub fn communicator(&self) -> &Arc<C> {
        &self.comm
    }

    #[inline]
    fn wire_tag(&self, tag: CommTag) -> u32 {
        ((self.context as u32) << 24) | tag.as_u32()
    }

    pub fn isend(&self, to: usize, tag: CommTag, buf: &[u8]) -> C::SendHandle {
        self.comm.isend(self.members[to], self.wire_tag(tag), buf)
    }

    pub fn irecv(&self, from: usize, tag: CommTag) -> C::RecvHandle {
        self.comm.irecv(self.members[from], self.wire_tag(tag))
    }

    /// Blocking send (completes locally on every backend).
    pub fn send(&self, to: usize, tag: CommTag, buf: &[u8]) {
        let _ = self.isend(to, tag, buf).wait();
    }

    /// Blocking receive.
    pub fn recv(&self, from: usize, tag: CommTag) -> Result<Vec<u8>, CombiError> {
        let handle = self.irecv(from, tag);
        self.complete(from, tag, handle)
    }

    /// Wait on a receive handle posted on this group, mapping a missing
    /// payload to a [`CombiError::CommError`].
    pub fn complete(
        &self,
        from: usize,
        tag: CommTag,
        handle: C::RecvHandle,
    ) -> Result<Vec<u8>, CombiError> {
        handle.wait().ok_or_else(|| CombiError::CommError {
            neighbor: self.members[from],
            source: format!("no message for tag {:#x}", tag.as_u32()).into(),
        })
    }

    pub fn barrier(&self) -> Result<(), CombiError> {
        if self.size() == 1 {
            return Ok(());
        }
        if self.rank == 0 {
            for r in 1..self.size() {
                self.recv(r, tags::BARRIER)?;
            }
            for r in 1..self.size() {
                self.send(r, tags::BARRIER_RELEASE, &[]);
            }
        } else {
            self.send(0, tags::BARRIER, &[]);
            self.recv(0, tags::BARRIER_RELEASE)?;
        }
        Ok(())
    }

    /// Broadcast `data` from `root`. Non-root callers pass an empty slice.
    pub fn broadcast_bytes(&self, root: usize, data: &[u8]) -> Result<Vec<u8>, CombiError> {
        if self.rank == root {
            let sends: Vec<_> = (0..self.size())
                .filter(|&r| r != root)
                .map(|r| self.isend(r, tags::BROADCAST, data))
                .collect();
            for s in sends {
                let _ = s.wait();
            }
            Ok(data.to_vec())
        } else {
            self.recv(root, tags::BROADCAST)
        }
    }

    /// Gather one byte blob per member on `root`, in group-rank order.
    pub fn gather_bytes(
        &self,
        root: usize,
        data: &[u8],
    ) -> Result<Option<Vec<Vec<u8>>>, CombiError> {
        if self.rank != root {
            self.send(root, tags::GATHER, data);
            return Ok(None);
        }
        let handles: Vec<_> = (0..self.size())
            .map(|r| (r != root).then(|| self.irecv(r, tags::GATHER)))
            .collect();
        let mut out = Vec::with_capacity(self.size());
        let mut maybe_err = None;
        for (r, h) in handles.into_iter().enumerate() {
            match h {
                None => out.push(data.to_vec()),
                Some(h) => match self.complete(r, tags::GATHER, h) {
                    Ok(buf) => out.push(buf),
                    Err(e) => {
                        out.push(Vec::new());
                        maybe_err.get_or_insert(e);
                    }
                },
            }
        }
        match maybe_err {
            Some(e) => Err(e),
            None => Ok(Some(out)),
        }
    }

    /// Start a batch of element-wise reductions combined with `op`.
    pub fn reduction_batch<T: Pod>(&self, op: fn(&mut T, T)) -> ReductionBatch<'_, C, T> {
        ReductionBatch {
            group: self,
            op,
            entries: Vec::new(),
            pending_sends: Vec::new(),
        }
    }

    /// Blocking element-wise all-reduce.
    pub fn allreduce<T: Pod>(&self, buf: &mut [T], op: fn(&mut T, T)) -> Result<(), CombiError> {
        let mut batch = self.reduction_batch(op);
        batch.post(buf.to_vec());
        let mut out = batch.finish()?;
        buf.copy_from_slice(&out.swap_remove(0));
        Ok(())
    }

    /// Element-wise max of `buf` over the group.
    pub fn allreduce_max_u64(&self, buf: &mut [u64]) -> Result<(), CombiError> {
        self.allreduce(buf, |a, b| *a = (*a).max(b))
    }
}

/// Combine operator for element-wise sums.
pub fn sum_op<T: Pod + std::ops::AddAssign>(acc: &mut T, v: T) {
    *acc += v;
}

struct PendingReduce<C: Communicator, T> {
    local: Vec<T>,
    contributions: Vec<C::RecvHandle>,
    result: Option<C::RecvHandle>,
}

/// Non-blocking batch of reductions: every [`post`](Self::post) is issued
/// immediately, [`finish`](Self::finish) completes them all and returns the
/// reduced buffers in posting order.
pub struct ReductionBatch<'g, C: Communicator, T: Pod> {
    group: &'g CommGroup<C>,
    op: fn(&mut T, T),
    entries: Vec<PendingReduce<C, T>>,
    pending_sends: Vec<C::SendHandle>,
}

impl<C: Communicator, T: Pod> ReductionBatch<'_, C, T> {
    /// Post one reduction; every member must post buffers of equal length
    /// in the same order.
    pub fn post(&mut self, local: Vec<T>) -> usize {
        let g = self.group;
        let mut entry = PendingReduce {
            local,
            contributions: Vec::new(),
            result: None,
        };
        if g.size() > 1 {
            if g.rank() == 0 {
                entry.contributions = (1..g.size()).map(|r| g.irecv(r, tags::REDUCE)).collect();
            } else {
                self.pending_sends
                    .push(g.isend(0, tags::REDUCE, cast_slice(&entry.local)));
                entry.result = Some(g.irecv(0, tags::REDUCE_RESULT));
            }
        }
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Complete every posted reduction.
    pub fn finish(self) -> Result<Vec<Vec<T>>, CombiError> {
        let g = self.group;
        let mut out = Vec::with_capacity(self.entries.len());
        let mut maybe_err = None;

        for entry in self.entries {
            let PendingReduce {
                mut local,
                contributions,
                result,
            } = entry;
            let n = local.len();
            if let Some(h) = result {
                match g
                    .complete(0, tags::REDUCE_RESULT, h)
                    .and_then(|buf| decode_exact::<T>(&buf, n, g.world_rank(0)))
                {
                    Ok(v) => local = v,
                    Err(e) => {
                        maybe_err.get_or_insert(e);
                    }
                }
            } else {
                for (i, h) in contributions.into_iter().enumerate() {
                    let r = i + 1;
                    match g
                        .complete(r, tags::REDUCE, h)
                        .and_then(|buf| decode_exact::<T>(&buf, n, g.world_rank(r)))
                    {
                        Ok(v) => {
                            for (a, b) in local.iter_mut().zip(v) {
                                (self.op)(a, b);
                            }
                        }
                        Err(e) => {
                            maybe_err.get_or_insert(e);
                        }
                    }
                }
                // results go out even after an error so no member blocks forever
                if g.rank() == 0 {
                    for r in 1..g.size() {
                        let _ = g.isend(r, tags::REDUCE_RESULT, cast_slice(&local)).wait();
                    }
                }
            }
            out.push(local);
        }

        for send in self.pending_sends {
            let _ = send.wait();
        }

        match maybe_err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}
