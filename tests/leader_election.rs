//! Leader election across independent attachments

use serial_test::serial;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use taskmem::election::LeaderElection;
use taskmem::workers::StopHandle;
use taskmem::Segment;

fn unique_name(tag: &str) -> String {
    format!("tm_{}_{}", std::process::id(), tag)
}

#[test]
#[serial]
fn exactly_one_claimant_wins() {
    const CLAIMANTS: u32 = 6;
    let name = unique_name("one_leader");
    let keeper = Segment::attach(&name, true).unwrap();
    let barrier = Arc::new(Barrier::new(CLAIMANTS as usize));

    let handles: Vec<_> = (0..CLAIMANTS)
        .map(|i| {
            let name = name.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let segment = Segment::attach(&name, false).unwrap();
                barrier.wait();
                LeaderElection::new(&segment, 10_000 + i, Duration::from_millis(1))
                    .try_claim()
                    .unwrap()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);

    let leader = keeper.snapshot().unwrap().leader().unwrap();
    assert!((10_000..10_000 + CLAIMANTS).contains(&leader));
}

#[test]
#[serial]
fn leadership_passes_to_a_waiting_process_after_step_down() {
    let name = unique_name("handover");
    let leader_seg = Segment::attach(&name, true).unwrap();
    let waiter_seg = Segment::attach(&name, false).unwrap();

    let leader = LeaderElection::new(&leader_seg, 1, Duration::from_millis(1));
    assert!(leader.try_claim().unwrap());

    let (_handle, stop) = StopHandle::new();
    thread::scope(|scope| {
        let waiting = scope.spawn(|| {
            LeaderElection::new(&waiter_seg, 2, Duration::from_millis(1))
                .wait_for_leadership(&stop)
                .unwrap()
        });
        thread::sleep(Duration::from_millis(30));
        assert!(!waiting.is_finished());
        assert!(leader.step_down().unwrap());
        assert!(waiting.join().unwrap());
    });

    assert_eq!(leader_seg.snapshot().unwrap().leader(), Some(2));
}
