use std::sync::Arc;
use std::time::Duration;

use kyrograph::{
    ActionClass, Addr, ElementType, Memory, MemoryConfig, MemoryContext, Permissions, ResultCode,
};

const IDLE: Duration = Duration::from_secs(5);

fn memory() -> Memory {
    Memory::initialize(MemoryConfig {
        user_mode: true,
        max_event_threads: 2,
        ..MemoryConfig::default()
    })
    .unwrap()
}

/// Asks the memory to authenticate `user` and waits for the handler.
fn authenticate(memory: &Memory, user: Addr) {
    let system = memory.system_context();
    memory
        .connector_new(
            &system,
            ElementType::CONST_POS_ARC,
            memory.keynodes().concept_authentication_request_user,
            user,
        )
        .unwrap();
    assert!(memory.wait_idle(IDLE));
}

/// Adds `user` to `class` through the relation and returns the relation arc.
fn grant_class(memory: &Memory, user: Addr, class: ActionClass) -> Addr {
    let system = memory.system_context();
    let class_node = memory.keynodes().action_class_addr(class);
    let pair = memory
        .connector_new(&system, ElementType::CONST_COMMON_ARC, user, class_node)
        .unwrap();
    let arc = memory
        .connector_new(
            &system,
            ElementType::CONST_POS_ARC,
            memory.keynodes().nrel_user_action_class,
            pair,
        )
        .unwrap();
    assert!(memory.wait_idle(IDLE));
    arc
}

/// Adds `user` to `class` inside `structure`.
fn grant_class_within(memory: &Memory, user: Addr, class: ActionClass, structure: Addr) {
    let system = memory.system_context();
    let class_node = memory.keynodes().action_class_addr(class);
    let inner = memory
        .connector_new(&system, ElementType::CONST_COMMON_ARC, class_node, structure)
        .unwrap();
    let pair = memory
        .connector_new(&system, ElementType::CONST_COMMON_ARC, user, inner)
        .unwrap();
    memory
        .connector_new(
            &system,
            ElementType::CONST_POS_ARC,
            memory.keynodes().nrel_user_action_class_within_sc_structure,
            pair,
        )
        .unwrap();
    assert!(memory.wait_idle(IDLE));
}

fn user(memory: &Memory) -> (Addr, Arc<MemoryContext>) {
    let system = memory.system_context();
    let user = memory.node_new(&system, ElementType::CONST_NODE).unwrap();
    let ctx = memory.context_new(user).unwrap();
    (user, ctx)
}

#[test]
fn authentication_request_is_consumed() {
    let memory = memory();
    let system = memory.system_context();
    let (user, ctx) = user(&memory);
    assert_eq!(
        memory.node_new(&ctx, ElementType::CONST_NODE).unwrap_err().code(),
        ResultCode::ContextIsNotAuthenticated
    );

    authenticate(&memory, user);
    memory.node_new(&ctx, ElementType::CONST_NODE).unwrap();

    let request = memory.keynodes().concept_authentication_request_user;
    assert_eq!(memory.outgoing_count(&system, request).unwrap(), 0);

    let marks = memory.incoming(&system, user).unwrap();
    assert_eq!(marks.len(), 1);
    let mark = memory.connector_info(&system, marks[0]).unwrap();
    assert_eq!(mark.begin, memory.keynodes().concept_authenticated_user);
    assert_eq!(mark.ty, ElementType::CONST_TEMP_POS_ARC);
    assert!(memory
        .element_permissions(&system, marks[0])
        .unwrap()
        .contains(Permissions::ALL_PERMISSIONS));
}

#[test]
fn erase_without_rights_leaves_element() {
    let memory = memory();
    let system = memory.system_context();
    let (user, ctx) = user(&memory);
    authenticate(&memory, user);
    let node = memory.node_new(&system, ElementType::CONST_NODE).unwrap();

    let err = memory.erase(&ctx, node).unwrap_err();
    assert_eq!(err.code(), ResultCode::NoErasePermission);
    assert!(memory.is_element(&system, node).unwrap());
}

#[test]
fn action_class_relation_grants_and_revokes() {
    let memory = memory();
    let system = memory.system_context();
    let (user, ctx) = user(&memory);
    authenticate(&memory, user);
    let node = memory.node_new(&system, ElementType::CONST_NODE).unwrap();

    assert_eq!(
        memory.element_type(&ctx, node).unwrap_err().code(),
        ResultCode::NoReadPermission
    );

    let relation = grant_class(&memory, user, ActionClass::Read);
    assert_eq!(memory.element_type(&ctx, node).unwrap(), ElementType::CONST_NODE);
    assert!(memory
        .contexts()
        .user_global_permissions(user)
        .contains(Permissions::READ));

    // The relation arc is guarded once the handler has seen it.
    grant_class(&memory, user, ActionClass::Erase);
    let err = memory.erase(&ctx, relation).unwrap_err();
    assert_eq!(err.code(), ResultCode::NoPermissionToErasePermissions);

    memory.erase(&system, relation).unwrap();
    assert!(memory.wait_idle(IDLE));
    assert_eq!(
        memory.element_type(&ctx, node).unwrap_err().code(),
        ResultCode::NoReadPermission
    );
}

#[test]
fn structure_scoped_rights() {
    let memory = memory();
    let system = memory.system_context();
    let (user, ctx) = user(&memory);
    authenticate(&memory, user);

    let structure = memory.node_new(&system, ElementType::CONST_NODE_STRUCTURE).unwrap();
    let inside = memory.node_new(&system, ElementType::CONST_NODE).unwrap();
    let outside = memory.node_new(&system, ElementType::CONST_NODE).unwrap();
    memory
        .connector_new(&system, ElementType::CONST_POS_ARC, structure, inside)
        .unwrap();

    grant_class_within(&memory, user, ActionClass::Read, structure);
    assert!(memory
        .element_permissions(&system, structure)
        .unwrap()
        .contains(Permissions::PERMITTED_STRUCTURE));
    assert_eq!(memory.element_type(&ctx, inside).unwrap(), ElementType::CONST_NODE);
    assert_eq!(
        memory.element_type(&ctx, outside).unwrap_err().code(),
        ResultCode::NoReadPermission
    );
}

#[test]
fn structure_rights_take_precedence_over_global() {
    let memory = memory();
    let system = memory.system_context();
    let (user, ctx) = user(&memory);
    authenticate(&memory, user);
    grant_class(&memory, user, ActionClass::Read);

    let structure = memory.node_new(&system, ElementType::CONST_NODE_STRUCTURE).unwrap();
    let inside = memory.node_new(&system, ElementType::CONST_NODE).unwrap();
    let outside = memory.node_new(&system, ElementType::CONST_NODE).unwrap();
    memory
        .connector_new(&system, ElementType::CONST_POS_ARC, structure, inside)
        .unwrap();
    grant_class_within(&memory, user, ActionClass::Generate, structure);

    assert_eq!(
        memory.element_type(&ctx, inside).unwrap_err().code(),
        ResultCode::NoReadPermission
    );
    assert_eq!(memory.element_type(&ctx, outside).unwrap(), ElementType::CONST_NODE);

    // Write inside the structure lets the user add members without global write.
    let member = memory.node_new(&ctx, ElementType::CONST_NODE).unwrap();
    memory
        .connector_new(&ctx, ElementType::CONST_POS_ARC, structure, member)
        .unwrap();
    assert_eq!(
        memory
            .connector_new(&ctx, ElementType::CONST_COMMON_ARC, outside, member)
            .unwrap_err()
            .code(),
        ResultCode::NoWritePermission
    );
}

#[test]
fn relations_reapplied_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = MemoryConfig {
        repo_path: Some(dir.path().to_path_buf()),
        user_mode: true,
        max_event_threads: 2,
        ..MemoryConfig::default()
    };

    let (user, node) = {
        let memory = Memory::initialize(config.clone()).unwrap();
        let system = memory.system_context();
        let (user, ctx) = user(&memory);
        authenticate(&memory, user);
        grant_class(&memory, user, ActionClass::Read);
        let node = memory.node_new(&system, ElementType::CONST_NODE).unwrap();
        memory.element_type(&ctx, node).unwrap();
        memory.context_free(&ctx).unwrap();
        memory.shutdown().unwrap();
        (user, node)
    };

    let memory = Memory::initialize(config).unwrap();
    let ctx = memory.context_new(user).unwrap();
    assert!(ctx.global_permissions().contains(Permissions::READ));
    assert_eq!(
        memory.element_type(&ctx, node).unwrap_err().code(),
        ResultCode::ContextIsNotAuthenticated
    );

    authenticate(&memory, user);
    assert_eq!(memory.element_type(&ctx, node).unwrap(), ElementType::CONST_NODE);
}
