#![allow(dead_code)]
use combigrid_dist::algs::comm_group::CommGroup;
use combigrid_dist::algs::communicator::LocalComm;
use combigrid_dist::fullgrid::FullGrid;
use combigrid_dist::levels::LevelVector;
use combigrid_dist::manager::SystemConfig;
use combigrid_dist::system::CombiSystem;
use std::sync::Arc;

/// Run `f` on every rank of an `n`-process in-memory world, one thread per
/// rank. Results come back in rank order.
pub fn run_group<R, F>(n: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(CommGroup<LocalComm>) -> R + Sync,
{
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = LocalComm::universe(n)
            .into_iter()
            .map(|comm| s.spawn(move || f(CommGroup::world(Arc::new(comm)))))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Like [`run_group`], but every rank gets the full process topology of
/// `config`, the manager rank included.
pub fn run_system<R, F>(config: &SystemConfig, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(&CombiSystem<LocalComm>) -> R + Sync,
{
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = LocalComm::universe(config.world_size())
            .into_iter()
            .map(|comm| {
                let config = config.clone();
                s.spawn(move || {
                    let system = CombiSystem::new(Arc::new(comm), config).expect("topology");
                    f(&system)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Serial nodal grid of `level` sampled from `f`.
pub fn sampled(level: &LevelVector, boundary: &[bool], f: impl Fn(&[f64]) -> f64) -> FullGrid<f64> {
    let mut fg = FullGrid::new(level.clone(), boundary.to_vec()).unwrap();
    fg.set_from_fn(f);
    fg
}

/// Smooth non-polynomial test function.
pub fn wave(x: &[f64]) -> f64 {
    x.iter()
        .enumerate()
        .map(|(k, &a)| (1.0 + 0.3 * k as f64) * (2.1 * a + 0.4).sin())
        .product::<f64>()
        + 0.25
}

pub fn assert_close(a: f64, b: f64, tol: f64) {
    assert!((a - b).abs() <= tol, "{a} != {b} (tol {tol})");
}
