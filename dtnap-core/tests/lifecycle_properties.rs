//! Property-based tests for the access-point lifecycle.
//!
//! Random operation sequences are checked against a reference model of the state table, and
//! against the loopback engine to confirm every engine handle is released exactly once.

use std::cell::Cell;

use dtnap_core::admin::AdminDatabase;
use dtnap_core::lifecycle::{CloseAction, Lifecycle, Settled};
use dtnap_core::{AccessPoint, BpSendOptions, Eid, Error, LoopbackNode, OpenOptions, SapState};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
    BeginReceive,
    Interrupt,
    Close,
    Settle,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::BeginReceive),
        Just(Op::Interrupt),
        Just(Op::Close),
        Just(Op::Settle),
    ]
}

// Reference transitions: (next state, engine signalled, released).
fn model(state: SapState, op: Op) -> (SapState, bool, bool) {
    use SapState::*;
    match (op, state) {
        (Op::BeginReceive, Idle) => (Running, false, false),
        (Op::BeginReceive, s) => (s, false, false),
        (Op::Interrupt, Running) => (Interrupting, true, false),
        (Op::Interrupt, s) => (s, false, false),
        (Op::Close, Idle) => (Closed, false, true),
        (Op::Close, Running) => (Closing, true, false),
        (Op::Close, Interrupting) => (Closing, false, false),
        (Op::Close, s) => (s, false, false),
        (Op::Settle, Running) | (Op::Settle, Interrupting) => (Idle, false, false),
        (Op::Settle, Closing) => (Closed, false, true),
        (Op::Settle, s) => (s, false, false),
    }
}

#[test]
fn prop_lifecycle_follows_state_table() {
    proptest!(|(ops in proptest::collection::vec(op_strategy(), 1..64))| {
        let lc = Lifecycle::new();
        let (signals, releases) = (Cell::new(0u32), Cell::new(0u32));
        let mut expected = SapState::Idle;

        for op in ops {
            // Settling only happens after a receive began.
            if matches!(op, Op::Settle) && !matches!(
                expected,
                SapState::Running | SapState::Interrupting | SapState::Closing
            ) {
                continue;
            }
            let before = (signals.get(), releases.get());
            let (next, signalled, released) = model(expected, op);
            match op {
                Op::BeginReceive => {
                    prop_assert_eq!(lc.begin_receive().is_ok(), expected == SapState::Idle);
                }
                Op::Interrupt => {
                    let fired = lc.interrupt(|| signals.set(signals.get() + 1));
                    prop_assert_eq!(fired, signalled);
                }
                Op::Close => {
                    let action = lc.close(
                        || signals.set(signals.get() + 1),
                        || releases.set(releases.get() + 1),
                    );
                    let want = match expected {
                        SapState::Idle => CloseAction::Released,
                        SapState::Running | SapState::Interrupting => CloseAction::Deferred,
                        _ => CloseAction::Nothing,
                    };
                    prop_assert_eq!(action, want);
                }
                Op::Settle => {
                    let settled = lc.settle(|| releases.set(releases.get() + 1), || {});
                    let want = match expected {
                        SapState::Running => Settled::Completed,
                        SapState::Interrupting => Settled::Interrupted,
                        _ => Settled::Released,
                    };
                    prop_assert_eq!(settled, want);
                }
            }
            prop_assert_eq!(signals.get() - before.0, u32::from(signalled));
            prop_assert_eq!(releases.get() - before.1, u32::from(released));
            expected = next;
            prop_assert_eq!(lc.state(), expected);
            prop_assert!(releases.get() <= 1);
        }

        // Dropping the owner releases whatever is left, and never twice.
        lc.abandon(|| releases.set(releases.get() + 1));
        prop_assert_eq!(releases.get(), 1);
        prop_assert_eq!(lc.state(), SapState::Closed);
    });
}

#[derive(Debug, Clone)]
enum ApOp {
    Send(usize),
    Receive,
    Interrupt,
    Close,
}

fn ap_op_strategy() -> impl Strategy<Value = ApOp> {
    prop_oneof![
        4 => (0usize..3000).prop_map(ApOp::Send),
        3 => Just(ApOp::Receive),
        2 => Just(ApOp::Interrupt),
        1 => Just(ApOp::Close),
    ]
}

#[test]
fn prop_engine_handle_released_exactly_once() {
    proptest!(|(ops in proptest::collection::vec(ap_op_strategy(), 1..40))| {
        let node = LoopbackNode::new(1, 1 << 20);
        let (a, b) = (Eid::ipn(1, 1), Eid::ipn(1, 2));
        node.add_endpoint(&a, false).unwrap();
        node.add_endpoint(&b, false).unwrap();
        let tx = AccessPoint::open(node.bp(), a, OpenOptions::default()).unwrap();
        let rx = AccessPoint::open(node.bp(), b.clone(), OpenOptions::default()).unwrap();
        let mut sent: Vec<usize> = Vec::new();
        let mut closed = false;

        for op in ops {
            match op {
                ApOp::Send(len) => {
                    tx.send(&b, &vec![7u8; len], &BpSendOptions::default()).unwrap();
                    if !closed {
                        sent.push(len);
                    }
                }
                // Only receive when it cannot block.
                ApOp::Receive if closed => {
                    let closed_rx = matches!(rx.receive(), Err(Error::Closed { .. }));
                    prop_assert!(closed_rx, "receive on a closed endpoint must fail with Closed");
                }
                ApOp::Receive if !sent.is_empty() => {
                    let got = rx.receive().unwrap();
                    prop_assert_eq!(got.payload.len(), sent.remove(0));
                }
                ApOp::Receive => {}
                ApOp::Interrupt => rx.interrupt(),
                ApOp::Close => {
                    rx.close();
                    closed = true;
                }
            }
            let expected = if closed { SapState::Closed } else { SapState::Idle };
            prop_assert_eq!(rx.state(), expected);
        }

        // Nobody was ever running, so no interrupt reached the engine.
        prop_assert_eq!(node.counters().interrupts, 0);
        drop(rx);
        drop(tx);
        let c = node.counters();
        prop_assert_eq!(c.closes, 2);
        prop_assert_eq!(c.opens, 2);
    });
}
