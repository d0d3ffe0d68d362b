use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;

use kyrograph::sync::{LockMode, MonitorTable};
use kyrograph::{
    Addr, ElementType, EventCallback, EventType, Memory, MemoryConfig, Permissions, Subscription,
};

const IDLE: Duration = Duration::from_secs(10);

fn shared_memory() -> Arc<Memory> {
    Arc::new(
        Memory::initialize(MemoryConfig {
            max_event_threads: 4,
            limit_threads_by_cores: false,
            ..MemoryConfig::default()
        })
        .unwrap(),
    )
}

#[test]
fn opposite_lock_orders_do_not_deadlock() {
    let table = Arc::new(MonitorTable::new());
    let a = Addr::new(1, 1);
    let b = Addr::new(1, 2);
    let (done_tx, done_rx) = bounded(2);

    let workers: Vec<_> = [[a, b], [b, a]]
        .into_iter()
        .map(|order| {
            let table = Arc::clone(&table);
            let done = done_tx.clone();
            thread::spawn(move || {
                for _ in 0..2_000 {
                    let set = table.lock_all(&order, LockMode::Write);
                    assert!(set.contains(a) && set.contains(b));
                }
                done.send(()).unwrap();
            })
        })
        .collect();

    for _ in 0..2 {
        done_rx.recv_timeout(IDLE).expect("lock_all deadlocked");
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(table.is_empty());
}

#[test]
fn write_lock_excludes_other_writers() {
    let table = Arc::new(MonitorTable::new());
    let addr = Addr::new(3, 7);
    let inside = Arc::new(AtomicUsize::new(0));
    let entered = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let table = Arc::clone(&table);
            let inside = Arc::clone(&inside);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                for _ in 0..500 {
                    let _guard = table.lock(addr, LockMode::Write);
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    entered.fetch_add(1, Ordering::Relaxed);
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(entered.load(Ordering::Relaxed), 8 * 500);
}

#[test]
fn concurrent_node_creation_yields_distinct_addresses() {
    let memory = shared_memory();
    let before = memory.stats(&memory.system_context()).unwrap();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let memory = Arc::clone(&memory);
            thread::spawn(move || {
                let ctx = memory.system_context();
                (0..250)
                    .map(|_| memory.node_new(&ctx, ElementType::CONST_NODE).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for worker in workers {
        for addr in worker.join().unwrap() {
            assert!(seen.insert(addr), "{addr} handed out twice");
        }
    }
    let after = memory.stats(&memory.system_context()).unwrap();
    assert_eq!(seen.len(), 2_000);
    assert_eq!(after.nodes - before.nodes, 2_000);
}

#[test]
fn concurrent_connectors_and_erase_keep_incidence_consistent() {
    let memory = shared_memory();
    let system = memory.system_context();
    let hub = memory.node_new(&system, ElementType::CONST_NODE).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let memory = Arc::clone(&memory);
            thread::spawn(move || {
                let ctx = memory.system_context();
                let mut kept = Vec::new();
                for i in 0..100 {
                    let leaf = memory.node_new(&ctx, ElementType::CONST_NODE).unwrap();
                    let arc = memory
                        .connector_new(&ctx, ElementType::CONST_POS_ARC, hub, leaf)
                        .unwrap();
                    if i % 2 == 0 {
                        memory.erase(&ctx, leaf).unwrap();
                    } else {
                        kept.push(arc);
                    }
                }
                kept
            })
        })
        .collect();

    let mut kept = HashSet::new();
    for worker in workers {
        kept.extend(worker.join().unwrap());
    }
    assert!(memory.wait_idle(IDLE));

    let outgoing: HashSet<Addr> = memory.outgoing(&system, hub).unwrap().into_iter().collect();
    assert_eq!(outgoing, kept);
    assert_eq!(memory.outgoing_count(&system, hub).unwrap(), 200);
}

#[test]
fn rights_granted_during_context_creation_are_kept() {
    let memory = Arc::new(
        Memory::initialize(MemoryConfig {
            user_mode: true,
            max_event_threads: 2,
            ..MemoryConfig::default()
        })
        .unwrap(),
    );
    let system = memory.system_context();

    for round in 0..100 {
        let actor = memory.node_new(&system, ElementType::CONST_NODE).unwrap();
        let structure = memory.node_new(&system, ElementType::CONST_NODE_STRUCTURE).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let granter = {
            let memory = Arc::clone(&memory);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                memory.contexts().grant_global(actor, Permissions::AUTHENTICATED | Permissions::READ);
                memory.contexts().grant_local(actor, structure, Permissions::WRITE);
            })
        };
        barrier.wait();
        let ctx = memory.context_new(actor).unwrap();
        granter.join().unwrap();

        assert!(ctx.global_permissions().contains(Permissions::READ), "round {round}");
        assert_eq!(ctx.local_permissions(structure), Some(Permissions::WRITE), "round {round}");
        memory.context_free(&ctx).unwrap();
    }
}

#[test]
fn panicking_callback_does_not_stall_emission() {
    let memory = Memory::initialize(MemoryConfig {
        max_event_threads: 1,
        limit_threads_by_cores: false,
        ..MemoryConfig::default()
    })
    .unwrap();
    let ctx = memory.system_context();
    let a = memory.node_new(&ctx, ElementType::CONST_NODE).unwrap();
    let b = memory.node_new(&ctx, ElementType::CONST_NODE).unwrap();

    let panicking = Subscription::builder(
        a,
        EventType::AfterGenerateOutgoingArc,
        EventCallback::event(|_, _| panic!("subscriber bug")),
    )
    .build();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let healthy = Subscription::builder(
        b,
        EventType::AfterGenerateIncomingArc,
        EventCallback::event(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    )
    .build();
    memory.subscribe(&ctx, &panicking).unwrap();
    memory.subscribe(&ctx, &healthy).unwrap();

    for _ in 0..5 {
        memory.connector_new(&ctx, ElementType::CONST_POS_ARC, a, b).unwrap();
    }
    assert!(memory.wait_idle(IDLE));
    assert_eq!(hits.load(Ordering::SeqCst), 5);
    assert_eq!(memory.engine().emission().stats().failed, 5);

    // The erase continuation runs after a panicking before-erase callback.
    let on_erase = Subscription::builder(
        a,
        EventType::BeforeEraseElement,
        EventCallback::event(|_, _| panic!("subscriber bug")),
    )
    .build();
    memory.subscribe(&ctx, &on_erase).unwrap();
    memory.erase(&ctx, a).unwrap();
    assert!(memory.wait_idle(IDLE));
    assert!(!memory.is_element(&ctx, a).unwrap());
}
