mod common;

use conversation_service::{
    error::AppError,
    models::{MemberRole, MessageKind, MetadataPatch},
    services::{LeaveOutcome, OutgoingMessage},
};
use uuid::Uuid;

fn text(content: &str) -> OutgoingMessage {
    OutgoingMessage {
        content: content.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn direct_conversation_is_shared_by_the_pair() {
    let orchestrator = common::orchestrator();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    let (first, second) = tokio::join!(
        orchestrator.create_direct(a, b),
        orchestrator.create_direct(b, a)
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.id, second.id);
    assert!(!first.is_group);
    assert_eq!(first.peer_id, Some(b));
    assert_eq!(second.peer_id, Some(a));

    let again = orchestrator.create_direct(a, b).await.unwrap();
    assert_eq!(again.id, first.id);

    let err = orchestrator.create_direct(a, a).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));
}

#[tokio::test]
async fn direct_conversation_rejects_group_operations() {
    let orchestrator = common::orchestrator();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let direct = orchestrator.create_direct(a, b).await.unwrap();

    let err = orchestrator
        .add_members(direct.id, a, &[Uuid::new_v4()])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));

    let err = orchestrator.leave(direct.id, a).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));
}

#[tokio::test]
async fn read_receipts_and_removal_reach_the_right_sessions() {
    let orchestrator = common::orchestrator();
    let owner = Uuid::new_v4();
    let member = Uuid::new_v4();
    let group = orchestrator
        .create_group(owner, "Team", None, &[member])
        .await
        .unwrap();
    let (_o_sid, mut owner_rx) = orchestrator.connect_session(owner).await.unwrap();
    let (_m_sid, mut member_rx) = orchestrator.connect_session(member).await.unwrap();

    let hello = orchestrator
        .send_message(group.id, owner, text("hi"))
        .await
        .unwrap();
    assert_eq!(hello.sequence, group.last_sequence + 1);
    assert_eq!(common::event_types(&common::drain(&mut owner_rx)), vec!["message.appended"]);
    assert_eq!(common::event_types(&common::drain(&mut member_rx)), vec!["message.appended"]);

    let read = orchestrator
        .mark_read(group.id, member, hello.sequence)
        .await
        .unwrap();
    assert!(read.advanced);
    assert_eq!(read.last_read_sequence, hello.sequence);

    let owner_events = common::drain(&mut owner_rx);
    assert_eq!(common::event_types(&owner_events), vec!["read.advanced"]);
    assert_eq!(owner_events[0]["user_id"], member.to_string());
    assert!(common::drain(&mut member_rx).is_empty());

    // idempotent: same or lower sequence publishes nothing
    let again = orchestrator
        .mark_read(group.id, member, hello.sequence)
        .await
        .unwrap();
    assert!(!again.advanced);
    let lower = orchestrator.mark_read(group.id, member, 1).await.unwrap();
    assert_eq!(lower.last_read_sequence, hello.sequence);
    assert!(common::drain(&mut owner_rx).is_empty());

    let err = orchestrator
        .mark_read(group.id, member, hello.sequence + 10)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));

    orchestrator
        .remove_member(group.id, owner, member)
        .await
        .unwrap();
    assert!(!orchestrator.registry().is_subscribed(member, group.id).await);

    let member_events = common::drain(&mut member_rx);
    assert_eq!(common::event_types(&member_events), vec!["member.removed"]);
    assert_eq!(member_events[0]["sequence"], hello.sequence + 1);
    assert_eq!(member_events[0]["reason"], "removed");

    let owner_events = common::drain(&mut owner_rx);
    assert_eq!(
        common::event_types(&owner_events),
        vec!["member.removed", "message.appended"]
    );
    assert_eq!(owner_events[1]["message"]["kind"], "system");

    // nothing further reaches the removed user
    orchestrator
        .send_message(group.id, owner, text("after"))
        .await
        .unwrap();
    assert!(common::drain(&mut member_rx).is_empty());

    let err = orchestrator
        .get_page(group.id, member, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}

#[tokio::test]
async fn owner_must_transfer_before_leaving() {
    let orchestrator = common::orchestrator();
    let owner = Uuid::new_v4();
    let member = Uuid::new_v4();
    let group = orchestrator
        .create_group(owner, "Handover", None, &[member])
        .await
        .unwrap();

    let err = orchestrator.leave(group.id, owner).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));

    let err = orchestrator
        .transfer_ownership(group.id, member, owner)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    orchestrator
        .transfer_ownership(group.id, owner, member)
        .await
        .unwrap();
    let outcome = orchestrator.leave(group.id, owner).await.unwrap();
    assert_eq!(outcome, LeaveOutcome::Left);

    let summary = orchestrator.get_conversation(group.id, member).await.unwrap();
    assert_eq!(summary.participants.len(), 1);
    assert_eq!(summary.participants[0].user_id, member);
    assert_eq!(summary.participants[0].role, MemberRole::Owner);

    let err = orchestrator.get_conversation(group.id, owner).await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}

#[tokio::test]
async fn last_member_leaving_deletes_the_conversation() {
    let orchestrator = common::orchestrator();
    let owner = Uuid::new_v4();
    let group = orchestrator.create_group(owner, "Solo", None, &[]).await.unwrap();
    let (_sid, mut rx) = orchestrator.connect_session(owner).await.unwrap();

    let outcome = orchestrator.leave(group.id, owner).await.unwrap();
    assert_eq!(outcome, LeaveOutcome::ConversationDeleted);
    assert_eq!(
        common::event_types(&common::drain(&mut rx)),
        vec!["conversation.deleted"]
    );
    assert_eq!(orchestrator.registry().subscriber_count(group.id).await, 0);

    let err = orchestrator
        .get_page(group.id, owner, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(orchestrator.list_conversations(owner).await.unwrap().is_empty());
}

#[tokio::test]
async fn added_members_see_new_messages() {
    let orchestrator = common::orchestrator();
    let owner = Uuid::new_v4();
    let newcomer = Uuid::new_v4();
    let group = orchestrator.create_group(owner, "Growing", None, &[]).await.unwrap();
    let (_sid, mut rx) = orchestrator.connect_session(newcomer).await.unwrap();

    let added = orchestrator
        .add_members(group.id, owner, &[newcomer, owner])
        .await
        .unwrap();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].role, MemberRole::Member);

    let err = orchestrator
        .add_members(group.id, owner, &[newcomer])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));

    orchestrator
        .send_message(group.id, owner, text("welcome"))
        .await
        .unwrap();
    assert_eq!(
        common::event_types(&common::drain(&mut rx)),
        vec!["member.added", "message.appended", "message.appended"]
    );

    // plain members cannot manage the roster
    let err = orchestrator
        .add_members(group.id, newcomer, &[Uuid::new_v4()])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}

#[tokio::test]
async fn role_changes_follow_the_hierarchy() {
    let orchestrator = common::orchestrator();
    let owner = Uuid::new_v4();
    let admin = Uuid::new_v4();
    let member = Uuid::new_v4();
    let group = orchestrator
        .create_group(owner, "Ranks", None, &[admin, member])
        .await
        .unwrap();

    let promoted = orchestrator
        .update_role(group.id, owner, admin, MemberRole::Admin)
        .await
        .unwrap();
    assert_eq!(promoted.role, MemberRole::Admin);

    let err = orchestrator
        .update_role(group.id, member, admin, MemberRole::Member)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let err = orchestrator
        .update_role(group.id, admin, owner, MemberRole::Member)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));

    let err = orchestrator
        .update_role(group.id, owner, member, MemberRole::Owner)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));

    let err = orchestrator
        .remove_member(group.id, member, admin)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    orchestrator
        .remove_member(group.id, admin, member)
        .await
        .unwrap();
    let err = orchestrator
        .remove_member(group.id, admin, member)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn metadata_updates_are_recorded_in_the_ledger() {
    let orchestrator = common::orchestrator();
    let owner = Uuid::new_v4();
    let member = Uuid::new_v4();
    let group = orchestrator
        .create_group(owner, "Old name", None, &[member])
        .await
        .unwrap();
    let (_sid, mut rx) = orchestrator.connect_session(member).await.unwrap();

    let updated = orchestrator
        .update_metadata(
            group.id,
            owner,
            MetadataPatch {
                title: Some("New name".into()),
                media_url: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.title.as_deref(), Some("New name"));
    assert_eq!(updated.last_sequence, group.last_sequence + 1);

    let events = common::drain(&mut rx);
    assert_eq!(
        common::event_types(&events),
        vec!["conversation.updated", "message.appended"]
    );

    let err = orchestrator
        .update_metadata(
            group.id,
            member,
            MetadataPatch {
                title: Some("Hijack".into()),
                media_url: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let err = orchestrator
        .update_metadata(
            group.id,
            owner,
            MetadataPatch {
                title: Some("   ".into()),
                media_url: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));
}

#[tokio::test]
async fn typing_reaches_other_members_only() {
    let orchestrator = common::orchestrator();
    let owner = Uuid::new_v4();
    let member = Uuid::new_v4();
    let group = orchestrator
        .create_group(owner, "Chatty", None, &[member])
        .await
        .unwrap();
    let (_o_sid, mut owner_rx) = orchestrator.connect_session(owner).await.unwrap();
    let (_m_sid, mut member_rx) = orchestrator.connect_session(member).await.unwrap();

    orchestrator.typing(group.id, member).await.unwrap();
    let events = common::drain(&mut owner_rx);
    assert_eq!(common::event_types(&events), vec!["typing"]);
    assert_eq!(events[0]["user_id"], member.to_string());
    assert!(common::drain(&mut member_rx).is_empty());

    let err = orchestrator
        .typing(group.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    // typing never touches the ledger
    let page = orchestrator.get_page(group.id, owner, None, None).await.unwrap();
    assert_eq!(page.messages.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removal_and_own_send_are_linearized() {
    for _ in 0..20 {
        let orchestrator = common::orchestrator();
        let owner = Uuid::new_v4();
        let member = Uuid::new_v4();
        let group = orchestrator
            .create_group(owner, "Race", None, &[member])
            .await
            .unwrap();

        let (removed, sent) = tokio::join!(
            orchestrator.remove_member(group.id, owner, member),
            orchestrator.send_message(group.id, member, text("last words"))
        );
        removed.unwrap();

        let page = orchestrator.get_page(group.id, owner, None, None).await.unwrap();
        let removal_sequence = page
            .messages
            .iter()
            .filter(|m| m.kind == MessageKind::System)
            .map(|m| m.sequence)
            .max()
            .unwrap();
        match sent {
            Ok(message) => assert!(message.sequence < removal_sequence),
            Err(err) => {
                assert!(matches!(err, AppError::Forbidden(_)));
                assert!(page.messages.iter().all(|m| m.sender_id != Some(member)));
            }
        }

        let err = orchestrator
            .send_message(group.id, member, text("still here?"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
