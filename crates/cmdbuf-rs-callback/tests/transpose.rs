use std::num::NonZeroUsize;
use std::sync::Arc;

use cmdbuf_rs_callback::{TransposeOptions, TransposePlan, TransposePlanCache};

fn iota(len: usize) -> Vec<u8> {
    (0..len).map(|value| value as u8).collect()
}

#[test]
fn rank_three_permutation_moves_the_minor_axis_first() {
    // Input [2, 3, 4] row-major, output walks [4, 2, 3].
    let plan = TransposePlan::new(TransposeOptions {
        elem_size_in_bytes: 1,
        dims: vec![2, 3, 4],
        permutation: vec![2, 0, 1],
        input_strides: vec![12, 4, 1],
    })
    .expect("valid plan");
    assert_eq!(plan.output_dims(), &[4, 2, 3]);

    let input = iota(24);
    let mut out = vec![0u8; plan.output_len()];
    plan.execute(&input, &mut out).expect("execute");
    for k in 0..4 {
        for i in 0..2 {
            for j in 0..3 {
                assert_eq!(out[k * 6 + i * 3 + j], input[i * 12 + j * 4 + k]);
            }
        }
    }
}

#[test]
fn multi_byte_elements_move_as_units() {
    let values = [1u16, 2, 3, 4, 5, 6];
    let input = values
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect::<Vec<_>>();
    let plan = TransposePlan::new(TransposeOptions {
        elem_size_in_bytes: 2,
        dims: vec![2, 3],
        permutation: vec![1, 0],
        input_strides: vec![6, 2],
    })
    .expect("valid plan");
    let mut out = vec![0u8; 12];
    plan.execute(&input, &mut out).expect("execute");
    let transposed = out
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .collect::<Vec<_>>();
    assert_eq!(transposed, vec![1, 4, 2, 5, 3, 6]);
}

#[test]
fn broadcast_strides_repeat_elements() {
    let plan = TransposePlan::new(TransposeOptions {
        elem_size_in_bytes: 1,
        dims: vec![3, 2],
        permutation: vec![0, 1],
        input_strides: vec![0, 1],
    })
    .expect("valid plan");
    let mut out = vec![0u8; 6];
    plan.execute(&[7, 9], &mut out).expect("execute");
    assert_eq!(out, vec![7, 9, 7, 9, 7, 9]);
}

#[test]
fn empty_arrays_write_nothing() {
    let plan = TransposePlan::new(TransposeOptions {
        elem_size_in_bytes: 4,
        dims: vec![0, 3],
        permutation: vec![1, 0],
        input_strides: vec![12, 4],
    })
    .expect("valid plan");
    assert_eq!(plan.output_len(), 0);
    plan.execute(&[], &mut []).expect("nothing to copy");
}

#[test]
fn cache_is_shared_across_threads() {
    let cache = Arc::new(TransposePlanCache::new(
        NonZeroUsize::new(4).expect("non-zero"),
    ));
    let options = TransposeOptions {
        elem_size_in_bytes: 4,
        dims: vec![8, 8],
        permutation: vec![1, 0],
        input_strides: vec![32, 4],
    };
    let workers = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let options = options.clone();
            std::thread::spawn(move || cache.get_or_create(&options).expect("plan"))
        })
        .collect::<Vec<_>>();
    let plans = workers
        .into_iter()
        .map(|worker| worker.join().expect("worker thread"))
        .collect::<Vec<_>>();
    assert_eq!(cache.len(), 1);
    assert!(plans.iter().all(|plan| Arc::ptr_eq(plan, &plans[0])));
    assert_eq!(plans[0].options(), &options);
}
