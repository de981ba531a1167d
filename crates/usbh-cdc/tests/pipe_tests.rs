//! Pipe property tests
//!
//! Drives a [`Pipe`] with random operation sequences and checks it against a
//! `VecDeque` model bounded by the same capacity.
//!
//! Run with: `cargo test -p usbh-cdc --test pipe_tests`

use proptest::prelude::*;
use std::collections::VecDeque;
use usbh_cdc::pipe::{MIN_BUFFER_SIZE, Pipe};

#[derive(Debug, Clone)]
enum Op {
    Push(Vec<u8>),
    Pop(usize),
    PeekCommit(usize),
    PeekOnly(usize),
    Flush,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => proptest::collection::vec(any::<u8>(), 0..200).prop_map(Op::Push),
        3 => (0usize..200).prop_map(Op::Pop),
        2 => (0usize..200).prop_map(Op::PeekCommit),
        1 => (0usize..200).prop_map(Op::PeekOnly),
        1 => Just(Op::Flush),
    ]
}

proptest! {
    /// Property: the pipe behaves like a bounded FIFO
    #[test]
    fn prop_pipe_matches_bounded_fifo(
        capacity in MIN_BUFFER_SIZE..512usize,
        ops in proptest::collection::vec(op_strategy(), 1..100),
    ) {
        let pipe = Pipe::new(capacity).unwrap();
        let mut model: VecDeque<u8> = VecDeque::new();

        for op in ops {
            match op {
                Op::Push(data) => {
                    let accepted = pipe.push(&data);
                    let expected = data.len().min(capacity - model.len());
                    prop_assert_eq!(accepted, expected);
                    model.extend(&data[..accepted]);
                }
                Op::Pop(n) => {
                    let mut out = vec![0u8; n];
                    let got = pipe.pop(&mut out);
                    let expected: Vec<u8> = model.drain(..n.min(model.len())).collect();
                    prop_assert_eq!(&out[..got], &expected[..]);
                }
                Op::PeekCommit(n) => {
                    let mut out = vec![0u8; n];
                    let mark = pipe.peek(&mut out);
                    let expected: Vec<u8> = model.drain(..n.min(model.len())).collect();
                    prop_assert_eq!(&out[..mark.len()], &expected[..]);
                    prop_assert!(pipe.commit(mark));
                }
                Op::PeekOnly(n) => {
                    let mut out = vec![0u8; n];
                    let mark = pipe.peek(&mut out);
                    let expected: Vec<u8> = model.iter().take(n).copied().collect();
                    prop_assert_eq!(&out[..mark.len()], &expected[..]);
                }
                Op::Flush => {
                    pipe.flush();
                    model.clear();
                }
            }

            prop_assert_eq!(pipe.available_bytes(), model.len());
            prop_assert_eq!(pipe.free_space(), capacity - model.len());
            prop_assert!(pipe.available_bytes() <= pipe.capacity());
        }
    }

    /// Property: flushing twice is the same as flushing once
    #[test]
    fn prop_flush_idempotent(
        data in proptest::collection::vec(any::<u8>(), 0..300),
    ) {
        let pipe = Pipe::new(256).unwrap();
        pipe.push(&data);

        pipe.flush();
        prop_assert!(pipe.is_empty());
        pipe.flush();
        prop_assert!(pipe.is_empty());
        prop_assert_eq!(pipe.free_space(), 256);
    }

    /// Property: a mark taken before a flush is refused afterwards
    #[test]
    fn prop_commit_after_flush_refused(
        data in proptest::collection::vec(any::<u8>(), 1..256),
        more in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let pipe = Pipe::new(256).unwrap();
        pipe.push(&data);

        let mut out = vec![0u8; 64];
        let mark = pipe.peek(&mut out);
        pipe.flush();
        pipe.push(&more);

        prop_assert!(!pipe.commit(mark));
        prop_assert_eq!(pipe.available_bytes(), more.len());
    }
}

#[test]
fn test_stream_across_threads_preserves_order() {
    use std::sync::Arc;
    use std::time::Duration;

    const TOTAL: usize = 20_000;
    let pipe = Arc::new(Pipe::new(128).unwrap());
    let producer = {
        let pipe = pipe.clone();
        std::thread::spawn(move || {
            let data: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
            let mut sent = 0;
            while sent < TOTAL {
                let n = pipe.push(&data[sent..(sent + 37).min(TOTAL)]);
                if n == 0 {
                    std::thread::yield_now();
                }
                sent += n;
            }
        })
    };

    let mut received = Vec::with_capacity(TOTAL);
    let mut buf = [0u8; 50];
    while received.len() < TOTAL {
        if pipe.wait_readable(Duration::from_millis(10)) {
            let n = pipe.pop(&mut buf);
            received.extend_from_slice(&buf[..n]);
        }
    }
    producer.join().unwrap();

    assert!(received.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));
}
