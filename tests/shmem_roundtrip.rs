//! SharedMemory and NDArray round-trips that don't need a worker process.

use appose::{DType, NDArray, Order, Shape, SharedMemory};

#[test]
fn shared_memory_created_here_is_readable_after_reattaching_by_name() {
    let mut shm = SharedMemory::create(None, 96).expect("create");
    for (i, byte) in shm.as_mut_slice().iter_mut().enumerate() {
        *byte = i as u8;
    }
    let name = shm.name().to_string();
    let rsize = shm.rsize();

    let reattached = SharedMemory::attach(&name, 96).expect("attach");
    assert_eq!(reattached.name(), name);
    assert!(reattached.rsize() >= rsize);
    assert_eq!(reattached.as_slice(), shm.as_slice());

    let sum: u64 = reattached.as_slice().iter().map(|&b| b as u64).sum();
    assert_eq!(sum, 4560);
}

#[test]
fn ndarray_reshape_preserves_bytes_and_element_count() {
    let shape = Shape::c_order(vec![2, 3, 4]);
    let dtype = DType::Float32;
    let nbytes = shape.product() as u64 * dtype.size() as u64;

    let shm = SharedMemory::create(None, nbytes).expect("create");
    let mut arr = NDArray::new(dtype, shape, shm).expect("wrap");

    for (i, chunk) in arr.as_bytes_mut().chunks_mut(4).enumerate() {
        chunk.copy_from_slice(&(i as f32).to_le_bytes());
    }

    let original_bytes = arr.as_bytes().to_vec();
    let reshaped = arr.reshape(Shape::c_order(vec![4, 3, 2])).expect("reshape");
    assert_eq!(reshaped.as_bytes(), &original_bytes[..]);
    assert_eq!(reshaped.shape().extents(), &[4, 3, 2]);
    assert_eq!(reshaped.shape().to_order(Order::C).extents(), &[4, 3, 2]);
}

#[test]
fn creating_a_named_segment_smaller_than_an_existing_one_reattaches_instead_of_failing() {
    let big = SharedMemory::create(Some("appose-test-reattach-small"), 64).expect("create big");
    let name = big.name().to_string();

    let smaller = SharedMemory::create(Some(&name), 8);
    assert!(smaller.is_ok());
}
