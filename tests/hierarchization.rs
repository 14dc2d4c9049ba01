mod util;

use combigrid_dist::fullgrid::DistributedFullGrid;
use combigrid_dist::hierarchization::{dehierarchize, hierarchize};
use combigrid_dist::levels::LevelVector;
use proptest::prelude::*;
use util::{run_group, sampled, wave};

/// Hierarchize `level` decomposed over `procs` and return the assembled
/// hierarchical grid next to its serial counterpart.
fn distributed_vs_serial(level: &LevelVector, boundary: &[bool], procs: &[usize]) -> f64 {
    let nprocs = procs.iter().product();
    let gathered = run_group(nprocs, |group| {
        let mut g =
            DistributedFullGrid::<f64>::with_procs(level.clone(), boundary.to_vec(), procs.to_vec(), group.rank())
                .unwrap();
        g.set_from_fn(wave);
        hierarchize(&mut g, &group).unwrap();
        assert!(g.is_hierarchized());
        g.gather_full_grid(&group, 0).unwrap()
    });
    let fg = gathered.into_iter().next().flatten().expect("root holds the grid");
    let mut serial = sampled(level, boundary, wave);
    serial.hierarchize();
    fg.max_abs_diff(&serial).expect("same shape")
}

#[test]
fn matches_serial_1d() {
    for boundary in [true, false] {
        for procs in [1, 2, 3, 4] {
            let err = distributed_vs_serial(&LevelVector::from([5]), &[boundary], &[procs]);
            assert!(err < 1e-12, "boundary={boundary} procs={procs}: {err}");
        }
    }
}

#[test]
fn matches_serial_2d_all_splits() {
    let level = LevelVector::from([4, 3]);
    for boundary in [[true, true], [false, true], [false, false]] {
        for procs in [[1, 1], [2, 1], [1, 2], [2, 2], [4, 1], [3, 2]] {
            let err = distributed_vs_serial(&level, &boundary, &procs);
            assert!(err < 1e-12, "boundary={boundary:?} procs={procs:?}: {err}");
        }
    }
}

#[test]
fn matches_serial_3d() {
    let err = distributed_vs_serial(&LevelVector::from([3, 2, 3]), &[true, false, true], &[2, 1, 2]);
    assert!(err < 1e-12, "{err}");
}

#[test]
fn round_trip_restores_nodal_values() {
    let cases: [(&[i32], &[bool], &[usize]); 3] = [
        (&[6], &[true], &[4]),
        (&[4, 4], &[true, false], &[2, 2]),
        (&[2, 3, 2, 2], &[true, true, false, true], &[1, 2, 1, 2]),
    ];
    for (level, boundary, procs) in cases {
        let level = LevelVector::from(level);
        let nprocs = procs.iter().product();
        let errs = run_group(nprocs, |group| {
            let mut g = DistributedFullGrid::<f64>::with_procs(
                level.clone(),
                boundary.to_vec(),
                procs.to_vec(),
                group.rank(),
            )
            .unwrap();
            g.set_from_fn(wave);
            let nodal = g.data().to_vec();
            hierarchize(&mut g, &group).unwrap();
            dehierarchize(&mut g, &group).unwrap();
            assert!(!g.is_hierarchized());
            nodal
                .iter()
                .zip(g.data())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f64, f64::max)
        });
        for e in errs {
            assert!(e < 1e-12, "level {level}: {e}");
        }
    }
}

#[test]
fn hierarchical_surplus_of_linear_function_vanishes_inside() {
    // a linear function is reproduced exactly by the level-1 boundary hats
    let level = LevelVector::from([4, 4]);
    let out = run_group(4, |group| {
        let mut g =
            DistributedFullGrid::<f64>::with_procs(level.clone(), vec![true, true], vec![2, 2], group.rank())
                .unwrap();
        g.set_from_fn(|x| 1.0 + 2.0 * x[0] - 0.5 * x[1]);
        hierarchize(&mut g, &group).unwrap();
        let mut max_inner = 0.0f64;
        for (i, v) in g.data().iter().enumerate() {
            let global = g.local_to_global(i);
            let (l, _) = g.level_and_index(&global);
            if l.iter().any(|k| k > 1) {
                max_inner = max_inner.max(v.abs());
            }
        }
        max_inner
    });
    for m in out {
        assert!(m < 1e-12, "{m}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn random_layouts_match_serial(
        dims in prop::collection::vec((2i32..5, any::<bool>(), 1usize..3), 1..4),
    ) {
        let level: LevelVector = dims.iter().map(|&(l, _, _)| l).collect();
        let boundary: Vec<bool> = dims.iter().map(|&(_, b, _)| b).collect();
        let procs: Vec<usize> = dims.iter().map(|&(_, _, p)| p).collect();
        let err = distributed_vs_serial(&level, &boundary, &procs);
        prop_assert!(err < 1e-12, "level {} procs {:?}: {}", level, procs, err);
    }
}
