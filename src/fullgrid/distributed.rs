//! Domain-decomposed full grid.
//!
//! Every process of a group holds one contiguous hyper-rectangle
//! `[lower, upper)` of the global index space, as given by a
//! [`Decomposition`]. Local data is stored densely with dimension 0 varying
//! fastest.
//!
//! ## Subspaces
//!
//! The grid of level `l` contains every hierarchical subspace `1 <= k <= l`.
//! Subspace ids are mixed-radix numbers `sum (k_d - 1) * stride_d` with
//! dimension 0 fastest. A subspace's points form a tensor product of 1-D
//! point sets, so the points a process holds are a box in subspace
//! coordinates (its *piece*). [`fill_subspaces`](DistributedFullGrid::fill_subspaces)
//! copies the local values into one contiguous piece per subspace and
//! [`write_back_subspaces`](DistributedFullGrid::write_back_subspaces)
//! copies them back. Pieces, like full subspace buffers, are ordered with
//! dimension 0 fastest.

use crate::algs::comm_group::{tags, CommGroup};
use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{cast_slice, decode_exact};
use crate::combi_error::CombiError;
use crate::debug_invariants::{check_len, DebugInvariants};
use crate::fullgrid::decomposition::Decomposition;
use crate::fullgrid::element::GridElement;
use crate::fullgrid::full_grid::FullGrid;
use crate::fullgrid::hierarchical::{self, num_points};
use crate::fullgrid::{for_each_in_box, strides_of};
use crate::levels::{validate_levels, IndexVector, LevelType, LevelVector};
use crate::sparsegrid::DistributedSparseGrid;
use std::ops::Range;

/// Index arithmetic of one process's block of a decomposed grid.
#[derive(Clone, Debug)]
pub struct GridGeometry {
    levels: LevelVector,
    boundary: Vec<bool>,
    global_sizes: Vec<usize>,
    lower: Vec<usize>,
    upper: Vec<usize>,
    local_sizes: Vec<usize>,
    global_strides: Vec<usize>,
    local_strides: Vec<usize>,
}

impl GridGeometry {
    fn new(levels: &LevelVector, boundary: &[bool], decomposition: &Decomposition, rank: usize) -> Self {
        let global_sizes: Vec<usize> = levels
            .iter()
            .zip(boundary)
            .map(|(l, &b)| num_points(l, b))
            .collect();
        let lower = decomposition.lower_bounds(rank).into_inner();
        let upper = decomposition.upper_bounds(rank).into_inner();
        let local_sizes: Vec<usize> = lower.iter().zip(&upper).map(|(a, b)| b - a).collect();
        Self {
            levels: levels.clone(),
            boundary: boundary.to_vec(),
            global_strides: strides_of(&global_sizes),
            local_strides: strides_of(&local_sizes),
            global_sizes,
            lower,
            upper,
            local_sizes,
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.global_sizes.len()
    }

    pub fn levels(&self) -> &LevelVector {
        &self.levels
    }

    pub fn boundary(&self) -> &[bool] {
        &self.boundary
    }

    pub fn global_sizes(&self) -> &[usize] {
        &self.global_sizes
    }

    pub fn local_sizes(&self) -> &[usize] {
        &self.local_sizes
    }

    /// Inclusive lower corner of the local block.
    pub fn lower(&self) -> &[usize] {
        &self.lower
    }

    /// Exclusive upper corner of the local block.
    pub fn upper(&self) -> &[usize] {
        &self.upper
    }

    pub fn local_strides(&self) -> &[usize] {
        &self.local_strides
    }

    pub fn global_strides(&self) -> &[usize] {
        &self.global_strides
    }

    pub fn nr_local_elements(&self) -> usize {
        self.local_sizes.iter().product()
    }

    pub fn nr_global_elements(&self) -> usize {
        self.global_sizes.iter().product()
    }

    #[inline]
    pub fn global_linear(&self, global: &[usize]) -> usize {
        global.iter().zip(&self.global_strides).map(|(i, s)| i * s).sum()
    }

    #[inline]
    pub fn global_vector_into(&self, mut linear: usize, out: &mut [usize]) {
        for (o, &n) in out.iter_mut().zip(&self.global_sizes) {
            *o = linear % n;
            linear /= n;
        }
    }

    #[inline]
    pub fn local_linear(&self, local: &[usize]) -> usize {
        local.iter().zip(&self.local_strides).map(|(i, s)| i * s).sum()
    }

    #[inline]
    pub fn local_vector_into(&self, mut linear: usize, out: &mut [usize]) {
        for (o, &n) in out.iter_mut().zip(&self.local_sizes) {
            *o = linear % n;
            linear /= n;
        }
    }

    /// Global vector index of local linear index `local`.
    #[inline]
    pub fn local_to_global_into(&self, local: usize, out: &mut [usize]) {
        self.local_vector_into(local, out);
        for (o, &lo) in out.iter_mut().zip(&self.lower) {
            *o += lo;
        }
    }

    /// Local linear index of global vector index `global`, if it is local.
    #[inline]
    pub fn global_to_local(&self, global: &[usize]) -> Option<usize> {
        let mut linear = 0;
        for (k, &g) in global.iter().enumerate() {
            if g < self.lower[k] || g >= self.upper[k] {
                return None;
            }
            linear += (g - self.lower[k]) * self.local_strides[k];
        }
        Some(linear)
    }

    /// Coordinates in `[0, 1]^d` of the global point `global`.
    #[inline]
    pub fn coords_into(&self, global: &[usize], out: &mut [f64]) {
        for (k, (o, &g)) in out.iter_mut().zip(global).enumerate() {
            let x = hierarchical::position(g, self.boundary[k]);
            *o = x as f64 / (1usize << self.levels[k]) as f64;
        }
    }
}

/// One component grid, decomposed over a process group.
#[derive(Clone, Debug)]
pub struct DistributedFullGrid<T: GridElement> {
    geom: GridGeometry,
    decomposition: Decomposition,
    rank: usize,
    data: Vec<T>,
    subspace_levels: Vec<LevelVector>,
    subspace_strides: Vec<usize>,
    /// `[rank][dim][k - 1]`: subspace offsets held by each process.
    piece_ranges: Vec<Vec<Vec<Range<usize>>>>,
    subspace_data: Vec<Vec<T>>,
    hierarchized: bool,
}

impl<T: GridElement> DistributedFullGrid<T> {
    pub fn new(
        levels: LevelVector,
        boundary: Vec<bool>,
        decomposition: Decomposition,
        rank: usize,
    ) -> Result<Self, CombiError> {
        let dim = levels.dim();
        validate_levels(&levels, dim)?;
        if boundary.len() != dim || decomposition.dim() != dim {
            return Err(CombiError::DimensionMismatch {
                expected: dim,
                found: if boundary.len() != dim { boundary.len() } else { decomposition.dim() },
            });
        }
        let sizes: Vec<usize> = levels
            .iter()
            .zip(&boundary)
            .map(|(l, &b)| num_points(l, b))
            .collect();
        if sizes != decomposition.global_sizes() {
            return Err(CombiError::InvalidDecomposition(format!(
                "decomposition covers {:?} points, grid of level {levels} has {sizes:?}",
                decomposition.global_sizes()
            )));
        }
        if rank >= decomposition.num_procs() {
            return Err(CombiError::RankOutOfRange {
                rank,
                size: decomposition.num_procs(),
            });
        }

        let radix: Vec<usize> = levels.iter().map(|l| l as usize).collect();
        let subspace_strides = strides_of(&radix);
        let count: usize = radix.iter().product();
        let subspace_levels = (0..count)
            .map(|mut id| {
                radix
                    .iter()
                    .map(|&r| {
                        let k = id % r;
                        id /= r;
                        k as LevelType + 1
                    })
                    .collect()
            })
            .collect();
        let piece_ranges = (0..decomposition.num_procs())
            .map(|r| {
                let coords = decomposition.partition_coords(r);
                (0..dim)
                    .map(|d| {
                        let b = decomposition.bounds_1d(d, coords[d]);
                        hierarchical::subspace_ranges(levels[d], boundary[d], b.start, b.end)
                    })
                    .collect()
            })
            .collect();

        let geom = GridGeometry::new(&levels, &boundary, &decomposition, rank);
        let data = vec![T::zero(); geom.nr_local_elements()];
        let grid = Self {
            geom,
            decomposition,
            rank,
            data,
            subspace_levels,
            subspace_strides,
            piece_ranges,
            subspace_data: Vec::new(),
            hierarchized: false,
        };
        grid.debug_assert_invariants();
        Ok(grid)
    }

    /// Grid with the default even decomposition over `procs`.
    pub fn with_procs(
        levels: LevelVector,
        boundary: Vec<bool>,
        procs: Vec<usize>,
        rank: usize,
    ) -> Result<Self, CombiError> {
        if boundary.len() != levels.dim() {
            return Err(CombiError::DimensionMismatch {
                expected: levels.dim(),
                found: boundary.len(),
            });
        }
        validate_levels(&levels, levels.dim())?;
        let sizes = levels
            .iter()
            .zip(&boundary)
            .map(|(l, &b)| num_points(l, b))
            .collect();
        let decomposition = Decomposition::new(sizes, procs)?;
        Self::new(levels, boundary, decomposition, rank)
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geom
    }

    pub fn decomposition(&self) -> &Decomposition {
        &self.decomposition
    }

    pub fn dim(&self) -> usize {
        self.geom.dim()
    }

    pub fn levels(&self) -> &LevelVector {
        &self.geom.levels
    }

    pub fn boundary(&self) -> &[bool] {
        &self.geom.boundary
    }

    /// Rank of this process inside its group.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_procs(&self) -> usize {
        self.decomposition.num_procs()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn is_hierarchized(&self) -> bool {
        self.hierarchized
    }

    pub(crate) fn set_hierarchized(&mut self, hierarchized: bool) {
        self.hierarchized = hierarchized;
    }

    pub(crate) fn parts_mut(&mut self) -> (&GridGeometry, &Decomposition, &mut [T]) {
        (&self.geom, &self.decomposition, &mut self.data)
    }

    pub fn lower_bounds(&self) -> IndexVector {
        IndexVector::from(self.geom.lower.as_slice())
    }

    pub fn upper_bounds(&self) -> IndexVector {
        IndexVector::from(self.geom.upper.as_slice())
    }

    pub fn global_linear_index(&self, global: &IndexVector) -> usize {
        self.geom.global_linear(global.as_slice())
    }

    pub fn global_vector_index(&self, linear: usize) -> IndexVector {
        let mut out = vec![0; self.dim()];
        self.geom.global_vector_into(linear, &mut out);
        out.into()
    }

    pub fn local_linear_index(&self, local: &IndexVector) -> usize {
        self.geom.local_linear(local.as_slice())
    }

    pub fn local_vector_index(&self, linear: usize) -> IndexVector {
        let mut out = vec![0; self.dim()];
        self.geom.local_vector_into(linear, &mut out);
        out.into()
    }

    /// Global vector index of the local linear index `local`.
    pub fn local_to_global(&self, local: usize) -> IndexVector {
        let mut out = vec![0; self.dim()];
        self.geom.local_to_global_into(local, &mut out);
        out.into()
    }

    /// Local linear index of a global vector index, if this process holds it.
    pub fn global_to_local(&self, global: &IndexVector) -> Option<usize> {
        self.geom.global_to_local(global.as_slice())
    }

    /// Coordinates in `[0, 1]^d` of a global point.
    pub fn coords(&self, global: &IndexVector) -> Vec<f64> {
        let mut out = vec![0.0; self.dim()];
        self.geom.coords_into(global.as_slice(), &mut out);
        out
    }

    /// Level of global 1-D index `idx` along `dim` (0 for boundary points).
    pub fn level_1d(&self, dim: usize, idx: usize) -> LevelType {
        hierarchical::point_level(self.geom.levels[dim], self.geom.boundary[dim], idx)
    }

    pub fn left_predecessor(&self, dim: usize, idx: usize) -> Option<usize> {
        hierarchical::left_predecessor(self.geom.levels[dim], self.geom.boundary[dim], idx)
    }

    pub fn right_predecessor(&self, dim: usize, idx: usize) -> Option<usize> {
        hierarchical::right_predecessor(self.geom.levels[dim], self.geom.boundary[dim], idx)
    }

    pub fn successors(&self, dim: usize, idx: usize) -> Option<(usize, usize)> {
        hierarchical::successors(self.geom.levels[dim], self.geom.boundary[dim], idx)
    }

    /// Hierarchical coordinate `(level, index)` of a global point. Interior
    /// points get an odd index on their own level, boundary points level 0
    /// and index 0 or 1.
    pub fn level_and_index(&self, global: &IndexVector) -> (LevelVector, IndexVector) {
        let mut levels = Vec::with_capacity(self.dim());
        let mut index = Vec::with_capacity(self.dim());
        for (d, g) in global.iter().enumerate() {
            let l = self.geom.levels[d];
            let x = hierarchical::position(g, self.geom.boundary[d]);
            let k = self.level_1d(d, g);
            levels.push(k);
            index.push(if k == 0 { x >> l } else { x >> (l - k) });
        }
        (levels.into(), index.into())
    }

    /// Sample `f` at every local point; the grid is nodal afterwards.
    pub fn set_from_fn<F>(&mut self, f: F)
    where
        F: Fn(&[f64]) -> T + Sync,
    {
        let geom = &self.geom;
        let d = geom.dim();
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            self.data.par_iter_mut().enumerate().for_each_init(
                || (vec![0usize; d], vec![0.0f64; d]),
                |(g, x), (i, v)| {
                    geom.local_to_global_into(i, g);
                    geom.coords_into(g, x);
                    *v = f(x);
                },
            );
        }
        #[cfg(not(feature = "rayon"))]
        {
            let mut g = vec![0usize; d];
            let mut x = vec![0.0f64; d];
            for (i, v) in self.data.iter_mut().enumerate() {
                geom.local_to_global_into(i, &mut g);
                geom.coords_into(&g, &mut x);
                *v = f(&x);
            }
        }
        self.hierarchized = false;
    }

    // ----- subspaces -----------------------------------------------------

    pub fn num_subspaces(&self) -> usize {
        self.subspace_levels.len()
    }

    pub fn subspace_levels(&self) -> &[LevelVector] {
        &self.subspace_levels
    }

    /// Id of the subspace with level vector `level`, if this grid has it.
    pub fn subspace_index(&self, level: &LevelVector) -> Option<usize> {
        if level.dim() != self.dim() {
            return None;
        }
        let mut id = 0;
        for (d, k) in level.iter().enumerate() {
            if k < 1 || k > self.geom.levels[d] {
                return None;
            }
            id += (k as usize - 1) * self.subspace_strides[d];
        }
        Some(id)
    }

    /// Global 1-D extents of subspace `s`.
    pub fn subspace_sizes(&self, s: usize) -> Vec<usize> {
        self.subspace_levels[s]
            .iter()
            .zip(&self.geom.boundary)
            .map(|(k, &b)| hierarchical::subspace_size_1d(k, b))
            .collect()
    }

    pub fn subspace_size(&self, s: usize) -> usize {
        self.subspace_sizes(s).iter().product()
    }

    /// Box (in subspace coordinates) of subspace `s` held by `rank`.
    pub fn piece_box(&self, rank: usize, s: usize) -> Vec<Range<usize>> {
        self.subspace_levels[s]
            .iter()
            .enumerate()
            .map(|(d, k)| self.piece_ranges[rank][d][k as usize - 1].clone())
            .collect()
    }

    pub fn piece_len(&self, rank: usize, s: usize) -> usize {
        self.subspace_levels[s]
            .iter()
            .enumerate()
            .map(|(d, k)| self.piece_ranges[rank][d][k as usize - 1].len())
            .product()
    }

    /// Local piece of subspace `s` (empty unless subspaces are filled).
    pub fn subspace_data(&self, s: usize) -> &[T] {
        self.subspace_data.get(s).map_or(&[], |v| v.as_slice())
    }

    /// Replace the local piece of subspace `s`.
    pub fn set_subspace_data(&mut self, s: usize, piece: Vec<T>) -> Result<(), CombiError> {
        let expected = self.piece_len(self.rank, s);
        if piece.len() != expected {
            return Err(CombiError::SubspaceSizeMismatch {
                subspace: s,
                expected,
                found: piece.len(),
            });
        }
        if self.subspace_data.len() != self.num_subspaces() {
            self.subspace_data = vec![Vec::new(); self.num_subspaces()];
        }
        self.subspace_data[s] = piece;
        Ok(())
    }

    /// Per-dimension tables `(k - 1, offset inside the local piece)` for
    /// every local 1-D index.
    fn local_subspace_tables(&self) -> Vec<Vec<(usize, usize)>> {
        (0..self.dim())
            .map(|d| {
                let (l, b) = (self.geom.levels[d], self.geom.boundary[d]);
                (self.geom.lower[d]..self.geom.upper[d])
                    .map(|idx| {
                        let k = hierarchical::subspace_level(l, b, idx) as usize - 1;
                        let off = hierarchical::subspace_offset_1d(l, b, idx)
                            - self.piece_ranges[self.rank][d][k].start;
                        (k, off)
                    })
                    .collect()
            })
            .collect()
    }

    fn piece_strides(&self) -> Vec<Vec<usize>> {
        (0..self.num_subspaces())
            .map(|s| {
                let lens: Vec<usize> = self.piece_box(self.rank, s).iter().map(|r| r.len()).collect();
                strides_of(&lens)
            })
            .collect()
    }

    /// Walk every local point with its `(subspace id, piece offset)`.
    fn for_each_point_subspace(&self, mut f: impl FnMut(usize, usize, usize)) {
        let tables = self.local_subspace_tables();
        let piece_strides = self.piece_strides();
        let d = self.dim();
        let mut local = vec![0usize; d];
        for lin in 0..self.geom.nr_local_elements() {
            self.geom.local_vector_into(lin, &mut local);
            let mut s = 0;
            for k in 0..d {
                s += tables[k][local[k]].0 * self.subspace_strides[k];
            }
            let off = (0..d)
                .map(|k| tables[k][local[k]].1 * piece_strides[s][k])
                .sum();
            f(lin, s, off);
        }
    }

    /// Copy local values into one contiguous piece per subspace.
    pub fn fill_subspaces(&mut self) {
        let mut pieces: Vec<Vec<T>> = (0..self.num_subspaces())
            .map(|s| vec![T::zero(); self.piece_len(self.rank, s)])
            .collect();
        self.for_each_point_subspace(|lin, s, off| pieces[s][off] = self.data[lin]);
        self.subspace_data = pieces;
    }

    /// Copy the subspace pieces back into the grid.
    pub fn write_back_subspaces(&mut self) {
        if self.subspace_data.len() != self.num_subspaces() {
            return;
        }
        let mut data = std::mem::take(&mut self.data);
        self.for_each_point_subspace(|lin, s, off| data[lin] = self.subspace_data[s][off]);
        self.data = data;
    }

    /// Release the subspace pieces.
    pub fn clear_subspaces(&mut self) {
        self.subspace_data = Vec::new();
    }

    // ----- combination target -------------------------------------------

    pub(crate) fn check_group<C: Communicator>(&self, group: &CommGroup<C>) -> Result<(), CombiError> {
        if group.size() != self.num_procs() {
            return Err(CombiError::ProcessCountMismatch {
                expected: self.num_procs(),
                found: group.size(),
            });
        }
        if group.rank() != self.rank {
            return Err(CombiError::RankOutOfRange {
                rank: group.rank(),
                size: self.num_procs(),
            });
        }
        Ok(())
    }

    /// Grid subspace id -> target subspace index, `None` where the target
    /// does not contain the subspace.
    pub fn target_map(&self, target: &DistributedSparseGrid<T>) -> Result<Vec<Option<usize>>, CombiError> {
        if target.group_size() != self.num_procs() {
            return Err(CombiError::ProcessCountMismatch {
                expected: self.num_procs(),
                found: target.group_size(),
            });
        }
        self.subspace_levels
            .iter()
            .enumerate()
            .map(|(s, l)| match target.index(l) {
                Some(t) if target.subspace_size(t) != self.subspace_size(s) => {
                    Err(CombiError::SubspaceSizeMismatch {
                        subspace: t,
                        expected: target.subspace_size(t),
                        found: self.subspace_size(s),
                    })
                }
                other => Ok(other),
            })
            .collect()
    }

    #[inline]
    fn subspace_tag(base: CommTag, t: usize) -> CommTag {
        base.offset(t as u32 & tags::MAX_OFFSET)
    }

    /// Accumulate `coeff *` this (hierarchized) grid into `target`. Every
    /// subspace the target contains is gathered onto its owning process,
    /// which adds it into its buffer. Collective over `group`.
    pub fn add_to_combination_target<C: Communicator>(
        &mut self,
        target: &mut DistributedSparseGrid<T>,
        coeff: f64,
        group: &CommGroup<C>,
    ) -> Result<(), CombiError> {
        self.check_group(group)?;
        if !self.hierarchized {
            return Err(CombiError::HierarchizationState { hierarchized: false });
        }
        let map = self.target_map(target)?;
        self.fill_subspaces();
        let me = self.rank;
        let coeff = T::from_real(coeff);
        let common: Vec<(usize, usize)> = map
            .iter()
            .enumerate()
            .filter_map(|(s, t)| t.map(|t| (s, t)))
            .collect();

        // 1) owners post receives for every remote piece
        let mut recvs = Vec::new();
        for &(s, t) in &common {
            if target.owner(t) == me {
                for r in (0..self.num_procs()).filter(|&r| r != me && self.piece_len(r, s) > 0) {
                    let tag = Self::subspace_tag(tags::SUBSPACE_GATHER, t);
                    recvs.push((s, t, r, group.irecv(r, tag)));
                }
            }
        }

        // 2) everyone else ships its piece to the owner
        let mut pending_sends = Vec::new();
        for &(s, t) in &common {
            let owner = target.owner(t);
            if owner != me && !self.subspace_data[s].is_empty() {
                let tag = Self::subspace_tag(tags::SUBSPACE_GATHER, t);
                pending_sends.push(group.isend(owner, tag, cast_slice(&self.subspace_data[s])));
            }
        }

        // 3) own pieces; errors are kept until the sends are done
        let mut maybe_err = None;
        for &(s, t) in &common {
            if target.owner(t) != me {
                continue;
            }
            let sizes = self.subspace_sizes(s);
            if let Err(e) = target.ensure_initialized(t, T::zero()) {
                maybe_err.get_or_insert(e);
                continue;
            }
            match target.data_mut(t) {
                Ok(dst) => {
                    let mut src = self.subspace_data[s].iter();
                    for_each_in_box(&sizes, &self.piece_box(me, s), |off| {
                        if let Some(&v) = src.next() {
                            dst[off] += coeff * v;
                        }
                    });
                }
                Err(e) => {
                    maybe_err.get_or_insert(e);
                }
            }
        }

        // 4) remote pieces (drain everything, keep the first error)
        for (s, t, r, h) in recvs {
            let tag = Self::subspace_tag(tags::SUBSPACE_GATHER, t);
            let received = group
                .complete(r, tag, h)
                .and_then(|buf| decode_exact::<T>(&buf, self.piece_len(r, s), group.world_rank(r)));
            if maybe_err.is_some() {
                continue;
            }
            let piece = match received {
                Ok(piece) => piece,
                Err(e) => {
                    maybe_err.get_or_insert(e);
                    continue;
                }
            };
            match target.data_mut(t) {
                Ok(dst) => {
                    let sizes = self.subspace_sizes(s);
                    let mut src = piece.into_iter();
                    for_each_in_box(&sizes, &self.piece_box(r, s), |off| {
                        if let Some(v) = src.next() {
                            dst[off] += coeff * v;
                        }
                    });
                }
                Err(e) => {
                    maybe_err.get_or_insert(e);
                }
            }
        }
        for send in pending_sends {
            let _ = send.wait();
        }
        self.clear_subspaces();
        match maybe_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Overwrite every subspace the target contains with the target's
    /// values; the owning process scatters each subspace to the group.
    /// Subspaces missing from the target keep their current values.
    /// Collective over `group`.
    pub fn extract_from_combination_target<C: Communicator>(
        &mut self,
        target: &DistributedSparseGrid<T>,
        group: &CommGroup<C>,
    ) -> Result<(), CombiError> {
        self.check_group(group)?;
        let map = self.target_map(target)?;
        self.fill_subspaces();
        let me = self.rank;
        let common: Vec<(usize, usize)> = map
            .iter()
            .enumerate()
            .filter_map(|(s, t)| t.map(|t| (s, t)))
            .collect();

        let mut recvs = Vec::new();
        for &(s, t) in &common {
            let owner = target.owner(t);
            if owner != me && self.piece_len(me, s) > 0 {
                let tag = Self::subspace_tag(tags::SUBSPACE_SCATTER, t);
                recvs.push((s, t, owner, group.irecv(owner, tag)));
            }
        }

        let mut pending_sends = Vec::new();
        for &(s, t) in &common {
            if target.owner(t) != me {
                continue;
            }
            let sizes = self.subspace_sizes(s);
            let stored = target.data(t)?;
            let zeros;
            let full: &[T] = if stored.is_empty() {
                zeros = vec![T::zero(); target.subspace_size(t)];
                &zeros
            } else {
                stored
            };
            let tag = Self::subspace_tag(tags::SUBSPACE_SCATTER, t);
            for r in 0..self.num_procs() {
                if self.piece_len(r, s) == 0 {
                    continue;
                }
                let mut piece = Vec::with_capacity(self.piece_len(r, s));
                for_each_in_box(&sizes, &self.piece_box(r, s), |off| piece.push(full[off]));
                if r == me {
                    self.subspace_data[s] = piece;
                } else {
                    pending_sends.push(group.isend(r, tag, cast_slice(&piece)));
                }
            }
        }

        let mut maybe_err = None;
        for (s, t, owner, h) in recvs {
            let tag = Self::subspace_tag(tags::SUBSPACE_SCATTER, t);
            match group
                .complete(owner, tag, h)
                .and_then(|buf| decode_exact::<T>(&buf, self.piece_len(me, s), group.world_rank(owner)))
            {
                Ok(piece) => self.subspace_data[s] = piece,
                Err(e) => {
                    maybe_err.get_or_insert(e);
                }
            }
        }
        for send in pending_sends {
            let _ = send.wait();
        }
        if let Some(e) = maybe_err {
            self.clear_subspaces();
            return Err(e);
        }
        self.write_back_subspaces();
        self.clear_subspaces();
        Ok(())
    }

    /// Assemble the whole grid on group rank `root`. Collective over `group`.
    pub fn gather_full_grid<C: Communicator>(
        &self,
        group: &CommGroup<C>,
        root: usize,
    ) -> Result<Option<FullGrid<T>>, CombiError> {
        self.check_group(group)?;
        let Some(blocks) = group.gather_bytes(root, cast_slice(&self.data))? else {
            return Ok(None);
        };
        let mut fg = FullGrid::new(self.levels().clone(), self.boundary().to_vec())?;
        fg.set_hierarchized(self.hierarchized);
        let sizes = self.geom.global_sizes.clone();
        for (r, bytes) in blocks.iter().enumerate() {
            let expected: usize = self.decomposition.local_sizes(r).iter().product();
            let values = decode_exact::<T>(bytes, expected, group.world_rank(r))?;
            let block: Vec<Range<usize>> = self
                .decomposition
                .lower_bounds(r)
                .iter()
                .zip(self.decomposition.upper_bounds(r).iter())
                .map(|(a, b)| a..b)
                .collect();
            let dst = fg.data_mut();
            let mut src = values.into_iter();
            for_each_in_box(&sizes, &block, |off| {
                if let Some(v) = src.next() {
                    dst[off] = v;
                }
            });
        }
        Ok(Some(fg))
    }
}

impl<T: GridElement> DebugInvariants for DistributedFullGrid<T> {
    fn validate_invariants(&self) -> Result<(), CombiError> {
        check_len(self.geom.nr_local_elements(), self.data.len())?;
        if self.subspace_data.is_empty() {
            return Ok(());
        }
        check_len(self.num_subspaces(), self.subspace_data.len())?;
        for (s, piece) in self.subspace_data.iter().enumerate() {
            if !piece.is_empty() {
                check_len(self.piece_len(self.rank, s), piece.len())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(levels: [LevelType; 2], boundary: [bool; 2], procs: [usize; 2], rank: usize) -> DistributedFullGrid<f64> {
        DistributedFullGrid::with_procs(levels.into(), boundary.to_vec(), procs.to_vec(), rank).unwrap()
    }

    #[test]
    fn index_maps_roundtrip() {
        let g = grid([3, 2], [true, false], [2, 1], 1);
        assert_eq!(g.geometry().global_sizes(), &[9, 3]);
        assert_eq!(g.lower_bounds(), IndexVector::from([5, 0]));
        assert_eq!(g.upper_bounds(), IndexVector::from([9, 3]));
        for lin in 0..g.geometry().nr_local_elements() {
            let global = g.local_to_global(lin);
            assert_eq!(g.global_to_local(&global), Some(lin));
            let glin = g.global_linear_index(&global);
            assert_eq!(g.global_vector_index(glin), global);
            let local = g.local_vector_index(lin);
            assert_eq!(g.local_linear_index(&local), lin);
        }
        assert_eq!(g.global_to_local(&IndexVector::from([4, 0])), None);
    }

    #[test]
    fn coordinates_and_hierarchical_coordinates() {
        let g = grid([2, 2], [true, false], [1, 1], 0);
        assert_eq!(g.coords(&IndexVector::from([2, 0])), vec![0.5, 0.25]);
        let (l, i) = g.level_and_index(&IndexVector::from([4, 1]));
        assert_eq!(l, LevelVector::from([0, 1]));
        assert_eq!(i, IndexVector::from([1, 1]));
        let (l, i) = g.level_and_index(&IndexVector::from([3, 2]));
        assert_eq!(l, LevelVector::from([2, 2]));
        assert_eq!(i, IndexVector::from([3, 3]));
    }

    #[test]
    fn subspace_ids_and_sizes() {
        let g = grid([3, 2], [true, false], [1, 1], 0);
        assert_eq!(g.num_subspaces(), 6);
        let s = g.subspace_index(&LevelVector::from([1, 2])).unwrap();
        assert_eq!(g.subspace_levels()[s], LevelVector::from([1, 2]));
        assert_eq!(g.subspace_sizes(s), vec![3, 2]);
        assert_eq!(g.subspace_index(&LevelVector::from([4, 1])), None);
        let total: usize = (0..g.num_subspaces()).map(|s| g.subspace_size(s)).sum();
        assert_eq!(total, g.geometry().nr_global_elements());
    }

    #[test]
    fn fill_and_write_back_are_inverse() {
        for rank in 0..4 {
            let mut g = grid([3, 3], [true, false], [2, 2], rank);
            g.set_from_fn(|x| x[0] * 10.0 + x[1]);
            let before = g.data().to_vec();
            g.fill_subspaces();
            let filled: usize = (0..g.num_subspaces()).map(|s| g.subspace_data(s).len()).sum();
            assert_eq!(filled, before.len());
            g.data_mut().iter_mut().for_each(|v| *v = 0.0);
            g.write_back_subspaces();
            g.clear_subspaces();
            assert_eq!(g.data(), &before[..]);
        }
    }

    #[test]
    fn pieces_tile_each_subspace() {
        let g0 = grid([3, 2], [false, true], [2, 2], 0);
        for s in 0..g0.num_subspaces() {
            let sizes = g0.subspace_sizes(s);
            let mut hits = vec![0u8; g0.subspace_size(s)];
            for r in 0..4 {
                for_each_in_box(&sizes, &g0.piece_box(r, s), |off| hits[off] += 1);
            }
            assert!(hits.iter().all(|&h| h == 1), "subspace {s}: {hits:?}");
        }
    }

    #[test]
    fn construction_errors() {
        let d = Decomposition::new(vec![9, 9], vec![1, 1]).unwrap();
        assert!(matches!(
            DistributedFullGrid::<f64>::new(LevelVector::from([3, 2]), vec![true, true], d.clone(), 0),
            Err(CombiError::InvalidDecomposition(_))
        ));
        assert!(matches!(
            DistributedFullGrid::<f64>::new(LevelVector::from([3, 3]), vec![true, true], d, 1),
            Err(CombiError::RankOutOfRange { rank: 1, size: 1 })
        ));
    }

    #[test]
    fn local_buffers_match_the_geometry() {
        let mut g = grid([3, 2], [true, false], [2, 1], 1);
        assert!(g.validate_invariants().is_ok());
        g.fill_subspaces();
        assert!(g.validate_invariants().is_ok());

        let s = (0..g.num_subspaces()).find(|&s| g.piece_len(1, s) > 0).unwrap();
        g.subspace_data[s].push(0.0);
        assert!(matches!(
            g.validate_invariants(),
            Err(CombiError::DataSizeMismatch { .. })
        ));
        g.clear_subspaces();
        g.data.pop();
        assert!(g.validate_invariants().is_err());
    }
}
