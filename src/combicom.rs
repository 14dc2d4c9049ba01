//! Combination protocol: component grids into the sparse grid and back.
//!
//! One combination phase on a process:
//!
//! 1. every local task grid is hierarchized and its subspaces are gathered,
//!    scaled by the task's coefficient, onto their owners in the group
//!    ([`DistributedFullGrid::add_to_combination_target`]);
//! 2. the owned subspaces are summed across groups over the reduce
//!    communicator (same rank-in-group in every group) as one non-blocking
//!    batch of reductions;
//! 3. every task grid takes the combined values back and is dehierarchized.
//!
//! Groups without tasks still take part in step 2; their untouched
//! subspaces contribute zeros.

use crate::algs::comm_group::{sum_op, CommGroup};
use crate::algs::communicator::Communicator;
use crate::combi_error::CombiError;
use crate::combination::parameters::CombiParameters;
use crate::debug_invariants::DebugInvariants;
use crate::fullgrid::distributed::DistributedFullGrid;
use crate::fullgrid::element::GridElement;
use crate::hierarchization::{dehierarchize, hierarchize};
use crate::sparsegrid::DistributedSparseGrid;

/// Empty combination target for the scheme of `params` on this process.
pub fn new_target<T: GridElement, C: Communicator>(
    params: &CombiParameters,
    local: &CommGroup<C>,
) -> Result<DistributedSparseGrid<T>, CombiError> {
    DistributedSparseGrid::new(
        params.lmin().clone(),
        params.lmax().clone(),
        params.boundary().to_vec(),
        local.rank(),
        local.size(),
        params.placement(),
    )
}

/// Hierarchize `grid` and add `coeff` times it to `target`.
pub fn contribute<T: GridElement, C: Communicator>(
    grid: &mut DistributedFullGrid<T>,
    coeff: f64,
    target: &mut DistributedSparseGrid<T>,
    local: &CommGroup<C>,
) -> Result<(), CombiError> {
    hierarchize(grid, local)?;
    grid.add_to_combination_target(target, coeff, local)
}

/// Sum every owned subspace of `target` across `reduce`. Subspaces nobody
/// touched are materialized as zeros first so that all members post the same
/// buffers in the same order.
pub fn reduce_target<T: GridElement, C: Communicator>(
    target: &mut DistributedSparseGrid<T>,
    reduce: &CommGroup<C>,
) -> Result<(), CombiError> {
    let owned: Vec<usize> = target.owned_subspaces().collect();
    let mut batch = reduce.reduction_batch::<T>(sum_op);
    for &i in &owned {
        target.ensure_initialized(i, T::zero())?;
        batch.post(target.data(i)?.to_vec());
    }
    log::debug!(
        "reducing {} subspaces across {} groups",
        batch.len(),
        reduce.size()
    );
    let reduced = batch.finish()?;
    for (i, values) in owned.into_iter().zip(reduced) {
        target.set_data(i, values)?;
    }
    target.debug_assert_invariants();
    Ok(())
}

/// Copy the combined values back into `grid` and return it to the nodal basis.
pub fn distribute<T: GridElement, C: Communicator>(
    grid: &mut DistributedFullGrid<T>,
    target: &DistributedSparseGrid<T>,
    local: &CommGroup<C>,
) -> Result<(), CombiError> {
    grid.extract_from_combination_target(target, local)?;
    dehierarchize(grid, local)
}

/// Full combination phase over the local task grids `tasks`, given as
/// `(grid, coefficient)`. Returns the combined target, which the caller may
/// keep to seed recomputed tasks.
pub fn combine<'a, T, C, I>(
    tasks: I,
    params: &CombiParameters,
    local: &CommGroup<C>,
    reduce: &CommGroup<C>,
) -> Result<DistributedSparseGrid<T>, CombiError>
where
    T: GridElement,
    C: Communicator,
    I: IntoIterator<Item = (&'a mut DistributedFullGrid<T>, f64)>,
{
    let mut target = new_target(params, local)?;
    if cfg!(any(debug_assertions, feature = "strict-invariants")) {
        target.check_uniform_sizes(reduce)?;
    }
    let mut grids = Vec::new();
    for (grid, coeff) in tasks {
        contribute(grid, coeff, &mut target, local)?;
        grids.push(grid);
    }
    reduce_target(&mut target, reduce)?;
    for grid in grids {
        distribute(grid, &target, local)?;
    }
    Ok(target)
}
