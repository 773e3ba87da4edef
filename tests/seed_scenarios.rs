//! End-to-end scenarios exercising the public surface the way a caller
//! assembling a driver or service would.

use std::sync::Arc;

use helcore::address_space::{AccessMode, AddressSpace, AllocationPolicy};
use helcore::collaborators::test_support::{collaborators, TestPhysicalAllocator};
use helcore::collaborators::PhysicalAllocator;
use helcore::event::BitsetEvent;
use helcore::irq::{IrqObject, UnmaskStrategy};
use helcore::memory::cow::{CowChainNode, CowView};
use helcore::memory::hardware::HardwareView;
use helcore::memory::{CacheMode, MemoryView, PhysicalAddress, Rights, PAGE_SIZE};
use helcore::queue::{Cancellable, CompletionQueue};
use helcore::stream::{Action, Lane, Outcome, RecipeItem, SubmitOutcome};
use helcore::HelError;

fn expect_ready(outcome: SubmitOutcome) -> Vec<Result<Outcome, HelError>> {
    match outcome {
        SubmitOutcome::Ready(result) => result,
        SubmitOutcome::Pending(slot) => slot.lock().clone().expect("group never matched"),
    }
}

#[test]
fn s1_offer_accept_then_send_recv_inline() {
    let (a, b) = Lane::new_pair();

    let a_results = a
        .submit(vec![
            RecipeItem::root(Action::Offer),
            RecipeItem::root(Action::SendFromBuffer(b"hello".to_vec())),
        ])
        .unwrap();
    let b_results = b
        .submit(vec![RecipeItem::root(Action::Accept), RecipeItem::root(Action::RecvInline)])
        .unwrap();

    let a_outcomes: Vec<_> = a_results.into_iter().map(expect_ready).collect();
    let b_outcomes: Vec<_> = b_results.into_iter().map(expect_ready).collect();

    assert!(matches!(a_outcomes[0][0], Ok(Outcome::NewLane(_))));
    assert!(matches!(b_outcomes[0][0], Ok(Outcome::NewLane(_))));
    assert!(matches!(a_outcomes[1][0], Ok(Outcome::Ack)));
    match &b_outcomes[1][0] {
        Ok(Outcome::Data(bytes)) => {
            assert_eq!(bytes.len(), 5);
            assert_eq!(bytes.as_slice(), b"hello");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn s2_flow_fault_reports_fault_locally_and_remote_fault_to_peer() {
    use helcore::stream::flow::transfer_with_fault;

    let (send, recv) = transfer_with_fault(vec![0u8; 8192], true, false);
    let send_err = send.unwrap_err();
    let recv_err = recv.unwrap_err();
    assert_eq!(send_err.error, HelError::Fault);
    assert_eq!(recv_err.error, HelError::RemoteFault);
    assert_eq!(send_err.transferred, 0);
    assert_eq!(recv_err.transferred, 0);
}

#[test]
fn s3_cow_write_in_one_space_is_invisible_to_the_other() {
    let alloc: Arc<dyn PhysicalAllocator> = Arc::new(TestPhysicalAllocator::new(64));
    let base_view: Arc<dyn MemoryView> =
        Arc::new(HardwareView::new(PhysicalAddress::new(0xAA_000), PAGE_SIZE * 4, CacheMode::Normal));

    let node = CowChainNode::fork_from_base(base_view, alloc);
    let cow_view = Arc::new(CowView::new(node, PAGE_SIZE * 4));

    let space_a = AddressSpace::new(PAGE_SIZE, PAGE_SIZE * 1024);
    let base_a = space_a
        .map_cow(AllocationPolicy::PreferBottom, 0, cow_view.clone(), 0, PAGE_SIZE * 4, Rights::READ | Rights::WRITE)
        .unwrap();

    let space_b = AddressSpace::new(PAGE_SIZE, PAGE_SIZE * 1024);
    let parent_view: Arc<dyn MemoryView> = cow_view.clone();
    let base_b = space_b
        .map(AllocationPolicy::PreferBottom, 0, parent_view, 0, PAGE_SIZE * 4, Rights::READ)
        .unwrap();

    assert!(space_a.resolve_fault(base_a + PAGE_SIZE, AccessMode::Write).is_ok());
    assert_ne!(cow_view.page_identity(PAGE_SIZE), None);
    assert_ne!(cow_view.page_identity(PAGE_SIZE), Some(PhysicalAddress::new(0xAA_000 + PAGE_SIZE as u64)));

    assert!(space_b.resolve_fault(base_b + PAGE_SIZE, AccessMode::Read).is_ok());
    assert!(space_b.resolve_fault(base_b, AccessMode::Write).is_err());
}

#[test]
fn s4_cancel_invokes_hook_promptly() {
    struct RecordOnCancel(Arc<std::sync::Mutex<bool>>);
    impl Cancellable for RecordOnCancel {
        fn handle_cancellation(&self) {
            *self.0.lock().unwrap() = true;
        }
    }

    let queue = CompletionQueue::new(4, 1).unwrap();
    let id = queue.alloc_async_id();
    let fired = Arc::new(std::sync::Mutex::new(false));
    queue.register_cancellable(id, Box::new(RecordOnCancel(fired.clone())));

    queue.cancel_async(id).unwrap();
    assert!(*fired.lock().unwrap());
}

#[test]
fn s5_irq_ack_unmasks_then_nack_leaves_masked() {
    let irq = IrqObject::new(UnmaskStrategy::MaskThenEoi);
    let collab = collaborators();

    let seq1 = irq.raise(collab.scheduler.as_ref());
    assert!(irq.is_masked());
    irq.ack(seq1);
    assert!(!irq.is_masked());

    let seq2 = irq.raise(collab.scheduler.as_ref());
    assert_eq!(seq2, seq1 + 1);
    irq.nack(seq2);
    assert!(irq.is_masked());
}

#[test]
fn s6_bitset_wakes_both_waiters_with_their_respective_bit() {
    use helcore::collaborators::test_support::TestScheduler;

    let event = BitsetEvent::new();
    let scheduler = TestScheduler::new();

    let baseline = event.current_sequences();
    event.register_waiter(1);
    event.register_waiter(2);
    event.trigger(0b11, &scheduler);

    let advanced = event.advanced_since(&baseline);
    assert_eq!(advanced & 0b1, 0b1);
    assert_eq!(advanced & 0b10, 0b10);
    assert_eq!(*scheduler.woken.lock(), vec![1, 2]);
}
