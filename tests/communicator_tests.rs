mod util;

use combigrid_dist::algs::comm_group::{sum_op, tags, CommGroup};
use combigrid_dist::algs::communicator::{CommTag, Communicator, LocalComm, NoComm, Wait};
use std::sync::Arc;
use util::run_group;

#[test]
fn local_round_trip() {
    let tag = CommTag::new(0x1000);
    let comms = LocalComm::universe(2);
    comms[0].isend(1, tag.as_u32(), b"hello");
    let h = comms[1].irecv(0, tag.as_u32());
    assert!(h.is_complete());
    assert_eq!(h.wait().unwrap(), b"hello");
}

#[test]
fn local_fifo_order_with_early_posts() {
    let tag = CommTag::new(0x1001);
    let comms = LocalComm::universe(2);
    let handles: Vec<_> = (0..10).map(|_| comms[1].irecv(0, tag.as_u32())).collect();
    assert!(!handles[0].is_complete());
    for i in 0..10u8 {
        comms[0].isend(1, tag.as_u32(), &[i]);
    }
    let out: Vec<u8> = handles.into_iter().map(|h| h.wait().unwrap()[0]).collect();
    assert_eq!(out, (0u8..10).collect::<Vec<_>>());
}

#[test]
fn tags_do_not_cross() {
    let comms = LocalComm::universe(2);
    comms[0].isend(1, 7, &[7]);
    comms[0].isend(1, 8, &[8]);
    assert_eq!(comms[1].irecv(0, 8).wait().unwrap(), vec![8]);
    assert_eq!(comms[1].irecv(0, 7).wait().unwrap(), vec![7]);
}

#[test]
fn no_comm_is_a_single_rank() {
    let c = NoComm;
    assert_eq!((c.rank(), c.size()), (0, 1));
    let g = CommGroup::world(Arc::new(NoComm));
    g.barrier().unwrap();
    assert_eq!(g.broadcast_bytes(0, &[1, 2]).unwrap(), vec![1, 2]);
    let mut v = [1.5f64, 2.0];
    g.allreduce(&mut v, sum_op).unwrap();
    assert_eq!(v, [1.5, 2.0]);
}

#[test]
fn collectives_over_threads() {
    let out = run_group(4, |g| {
        g.barrier().unwrap();
        let root_data: &[u8] = if g.rank() == 2 { b"root" } else { &[] };
        let b = g.broadcast_bytes(2, root_data).unwrap();
        let gathered = g.gather_bytes(0, &[g.rank() as u8; 2]).unwrap();
        let mut sum = [g.rank() as f64, 1.0];
        g.allreduce(&mut sum, sum_op).unwrap();
        let mut max = [g.rank() as u64 * 3];
        g.allreduce_max_u64(&mut max).unwrap();
        (b, gathered, sum, max[0])
    });
    for (r, (b, gathered, sum, max)) in out.into_iter().enumerate() {
        assert_eq!(b, b"root");
        if r == 0 {
            let g = gathered.unwrap();
            assert_eq!(g, (0..4u8).map(|k| vec![k; 2]).collect::<Vec<_>>());
        } else {
            assert!(gathered.is_none());
        }
        assert_eq!(sum, [6.0, 4.0]);
        assert_eq!(max, 9);
    }
}

#[test]
fn reduction_batch_keeps_posting_order() {
    let out = run_group(3, |g| {
        let mut batch = g.reduction_batch::<f64>(sum_op);
        for k in 0..5 {
            batch.post(vec![(g.rank() * 10 + k) as f64; k + 1]);
        }
        assert_eq!(batch.len(), 5);
        batch.finish().unwrap()
    });
    for result in out {
        for (k, buf) in result.iter().enumerate() {
            assert_eq!(buf.len(), k + 1);
            // ranks 0, 1, 2 contribute k, 10 + k, 20 + k
            assert!(buf.iter().all(|&v| v == (30 + 3 * k) as f64));
        }
    }
}

#[test]
fn group_contexts_isolate_traffic() {
    let out = run_group(2, |world| {
        let comm = world.communicator().clone();
        let a = CommGroup::new(comm.clone(), vec![0, 1], 5).unwrap();
        let b = CommGroup::new(comm, vec![1, 0], 6).unwrap();
        if world.rank() == 0 {
            // group rank 1 in `a` is world rank 1; in `b` it is world rank 0
            a.send(1, tags::PAYLOAD, b"a");
            b.send(0, tags::PAYLOAD, b"b");
            Vec::new()
        } else {
            let from_b = b.recv(1, tags::PAYLOAD).unwrap();
            let from_a = a.recv(0, tags::PAYLOAD).unwrap();
            [from_a, from_b].concat()
        }
    });
    assert_eq!(out[1], b"ab");
}

#[test]
fn foreign_ranks_are_rejected() {
    let comm = Arc::new(LocalComm::universe(3).remove(2));
    assert!(CommGroup::new(comm.clone(), vec![0, 1], 1).is_err());
    assert!(CommGroup::new(comm, vec![0, 7], 1).is_err());
}
