use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kyrograph::{
    Addr, ElementType, EventCallback, EventType, Memory, MemoryConfig, MemoryContext, ResultCode,
    Subscription, TransactionState,
};

const WAIT: Duration = Duration::from_secs(5);

fn memory(user_mode: bool) -> Memory {
    Memory::initialize(MemoryConfig {
        user_mode,
        max_event_threads: 2,
        limit_threads_by_cores: false,
        ..MemoryConfig::default()
    })
    .unwrap()
}

fn authenticated_user(memory: &Memory) -> Arc<MemoryContext> {
    let system = memory.system_context();
    let user = memory.node_new(&system, ElementType::CONST_NODE).unwrap();
    let ctx = memory.context_new(user).unwrap();
    memory
        .connector_new(
            &system,
            ElementType::CONST_POS_ARC,
            memory.keynodes().concept_authentication_request_user,
            user,
        )
        .unwrap();
    assert!(memory.wait_idle(WAIT));
    ctx
}

#[test]
fn committed_transaction_applies_and_notifies() {
    let memory = memory(false);
    let ctx = memory.system_context();
    let hub = memory.node_new(&ctx, ElementType::CONST_NODE).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let sub = Subscription::builder(
        hub,
        EventType::AfterGenerateOutgoingArc,
        EventCallback::event(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    )
    .build();
    memory.subscribe(&ctx, &sub).unwrap();

    let txn = memory.transaction_new(&ctx).unwrap();
    let leaf = txn.node_new(ElementType::CONST_NODE).unwrap();
    let arc = txn.connector_new(ElementType::CONST_POS_ARC, hub, leaf).unwrap();
    memory.transaction_commit(&txn).unwrap();

    assert_eq!(txn.wait(WAIT), TransactionState::Executed);
    assert!(memory.wait_idle(WAIT));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let arc = txn.resolve(arc).unwrap();
    assert_eq!(memory.connector_end(&ctx, arc).unwrap(), txn.resolve(leaf).unwrap());
    assert_eq!(memory.transaction_stats().executed, 1);
}

#[test]
fn commit_checks_rights_on_existing_elements() {
    let memory = memory(true);
    let system = memory.system_context();
    let ctx = authenticated_user(&memory);
    let node = memory.node_new(&system, ElementType::CONST_NODE).unwrap();

    let txn = memory.transaction_new(&ctx).unwrap();
    txn.erase(node).unwrap();
    let err = memory.transaction_commit(&txn).unwrap_err();
    assert_eq!(err.code(), ResultCode::NoErasePermission);
    assert_eq!(txn.state(), TransactionState::Open);
    assert!(memory.is_element(&system, node).unwrap());

    let txn = memory.transaction_new(&ctx).unwrap();
    txn.connector_new(ElementType::CONST_POS_ARC, node, node).unwrap();
    let err = memory.transaction_commit(&txn).unwrap_err();
    assert_eq!(err.code(), ResultCode::NoWritePermission);
}

#[test]
fn staged_operands_need_no_rights() {
    let memory = memory(true);
    let ctx = authenticated_user(&memory);

    let txn = memory.transaction_new(&ctx).unwrap();
    let a = txn.node_new(ElementType::CONST_NODE).unwrap();
    let b = txn.node_new(ElementType::CONST_NODE).unwrap();
    txn.connector_new(ElementType::CONST_COMMON_ARC, a, b).unwrap();
    let link = txn.link_new(ElementType::CONST_LINK).unwrap();
    txn.set_link_content(link, "staged").unwrap();
    memory.transaction_commit(&txn).unwrap();

    assert_eq!(txn.wait(WAIT), TransactionState::Executed);
    let system = memory.system_context();
    let link = txn.resolve(link).unwrap();
    assert_eq!(memory.find_links_with_content(&system, b"staged").unwrap(), vec![link]);
}

#[test]
fn unauthenticated_context_cannot_open_transaction() {
    let memory = memory(true);
    let system = memory.system_context();
    let user = memory.node_new(&system, ElementType::CONST_NODE).unwrap();
    let ctx = memory.context_new(user).unwrap();
    let err = memory.transaction_new(&ctx).unwrap_err();
    assert_eq!(err.code(), ResultCode::ContextIsNotAuthenticated);
}

#[test]
fn failed_transaction_leaves_graph_unchanged() {
    let memory = memory(false);
    let ctx = memory.system_context();
    let node = memory.node_new(&ctx, ElementType::CONST_NODE).unwrap();
    let before = memory.stats(&ctx).unwrap().total();

    let txn = memory.transaction_new(&ctx).unwrap();
    let staged = txn.node_new(ElementType::CONST_NODE).unwrap();
    txn.connector_new(ElementType::CONST_POS_ARC, node, staged).unwrap();
    txn.set_subtype(node, ElementType::CONST_LINK).unwrap();
    memory.transaction_commit(&txn).unwrap();

    assert_eq!(txn.wait(WAIT), TransactionState::Failed);
    assert_eq!(txn.resolve(staged), None);
    assert_eq!(memory.stats(&ctx).unwrap().total(), before);
    assert_eq!(memory.outgoing_count(&ctx, node).unwrap(), 0);
    assert_eq!(memory.transaction_stats().failed, 1);
}

#[test]
fn queued_transactions_run_before_shutdown() {
    let memory = memory(false);
    let ctx = memory.system_context();
    let txns: Vec<_> = (0..8)
        .map(|_| {
            let txn = memory.transaction_new(&ctx).unwrap();
            txn.node_new(ElementType::CONST_NODE).unwrap();
            memory.transaction_commit(&txn).unwrap();
            txn
        })
        .collect();

    memory.shutdown().unwrap();
    for txn in &txns {
        assert_eq!(txn.state(), TransactionState::Executed);
    }
    let late = memory.transaction_new(&ctx).unwrap();
    assert_eq!(memory.transaction_commit(&late).unwrap_err().code(), ResultCode::InvalidState);
}

#[test]
fn staged_address_is_empty_before_commit() {
    let memory = memory(false);
    let ctx = memory.system_context();
    let txn = memory.transaction_new(&ctx).unwrap();
    let staged = txn.node_new(ElementType::CONST_NODE).unwrap();
    assert_eq!(txn.resolve(staged), None);
    assert_eq!(txn.resolve(Addr::new(1, 1).into()), Some(Addr::new(1, 1)));
}
