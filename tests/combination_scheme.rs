use combigrid_dist::combination::{CombiParameters, CombinationScheme};
use combigrid_dist::levels::LevelVector;
use combigrid_dist::manager::task::next_task_id;
use combigrid_dist::CombiError;

fn lv<const N: usize>(l: [i32; N]) -> LevelVector {
    LevelVector::from(l)
}

#[test]
fn standard_2d_scheme() {
    let s = CombinationScheme::new(lv([2, 2]), lv([4, 4])).unwrap();
    let expected = [
        (lv([2, 4]), 1.0),
        (lv([3, 3]), 1.0),
        (lv([4, 2]), 1.0),
        (lv([2, 3]), -1.0),
        (lv([3, 2]), -1.0),
    ];
    assert_eq!(s.len(), expected.len());
    for (l, c) in &expected {
        assert_eq!(s.coefficient(l), Some(*c), "level {l}");
    }
    assert_eq!(s.coefficient(&lv([2, 2])), None);
    assert_eq!(s.coefficient_sum(), 1.0);
}

#[test]
fn standard_3d_scheme_uses_binomials() {
    let s = CombinationScheme::new(lv([1, 1, 1]), lv([3, 3, 3])).unwrap();
    // diagonal sums 5, 4, 3 with coefficients 1, -2, 1
    for (l, c) in s.iter() {
        let expected = match l.sum() {
            5 => 1.0,
            4 => -2.0,
            3 => 1.0,
            other => panic!("unexpected level sum {other}"),
        };
        assert_eq!(c, expected, "level {l}");
    }
    assert_eq!(s.levels_of_diagonal(0).len(), 6);
    assert_eq!(s.levels_of_diagonal(1).len(), 3);
    assert_eq!(s.levels_of_diagonal(2).len(), 1);
    assert_eq!(s.coefficient_sum(), 1.0);
}

#[test]
fn anisotropic_box_is_clipped() {
    let s = CombinationScheme::new(lv([1, 2]), lv([4, 3])).unwrap();
    assert!(s.levels().iter().all(|l| lv([1, 2]).le_all(l) && l.le_all(&lv([4, 3]))));
    // n = 3 + 3; the diagonals are cut by the box
    assert_eq!(s.levels_of_diagonal(0), vec![&lv([3, 3]), &lv([4, 2])]);
    assert_eq!(s.levels_of_diagonal(1), vec![&lv([2, 3]), &lv([3, 2])]);
}

#[test]
fn fault_tolerant_diagonals_have_zero_weight() {
    let standard = CombinationScheme::new(lv([2, 2]), lv([5, 5])).unwrap();
    let ft = CombinationScheme::fault_tolerant(lv([2, 2]), lv([5, 5]), 2).unwrap();
    assert_eq!(ft.extra_diagonals(), 2);
    for (l, c) in standard.iter() {
        assert_eq!(ft.coefficient(l), Some(c));
    }
    let extra: Vec<_> = ft
        .iter()
        .filter(|(l, _)| standard.coefficient(l).is_none())
        .collect();
    assert!(!extra.is_empty());
    assert!(extra.iter().all(|&(_, c)| c == 0.0));
    assert_eq!(ft.coefficient_sum(), 1.0);
}

#[test]
fn parameters_follow_scheme_order() {
    let s = CombinationScheme::new(lv([1, 1]), lv([3, 3])).unwrap();
    let ids: Vec<_> = (0..s.len()).map(|_| next_task_id()).collect();
    let p = CombiParameters::from_scheme(&s, vec![true, false], &ids).unwrap();
    for (&id, (l, c)) in ids.iter().zip(s.iter()) {
        assert_eq!(p.level(id), Some(l));
        assert_eq!(p.coefficient(id), Some(c));
    }
    let back = CombiParameters::from_bytes(&p.to_bytes().unwrap()).unwrap();
    assert_eq!(back, p);

    assert!(matches!(
        CombiParameters::from_scheme(&s, vec![true, true], &ids[1..]),
        Err(CombiError::DimensionMismatch { .. })
    ));
}
