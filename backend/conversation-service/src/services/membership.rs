//! Role state machine for group membership.
//!
//! Every permission rule lives here so handlers and the orchestrator never re-derive them.
//! All checks are pure: they look at the current rows and either allow the transition or
//! fail `Forbidden` / `InvalidRequest`.

use crate::error::{AppError, AppResult};
use crate::models::{Conversation, Member, MemberRole};
use uuid::Uuid;

pub fn require_group(conversation: &Conversation) -> AppResult<()> {
    if !conversation.is_group {
        return Err(AppError::invalid(
            "this action is only allowed in group conversations",
        ));
    }
    Ok(())
}

pub fn require_member(member: Option<Member>) -> AppResult<Member> {
    member.ok_or_else(|| AppError::forbidden("not a member of this conversation"))
}

/// Target of a management action must currently be a member.
pub fn require_target(member: Option<Member>) -> AppResult<Member> {
    member.ok_or_else(|| AppError::not_found("member"))
}

pub fn check_manage_members(actor: &Member) -> AppResult<()> {
    if !actor.role.is_privileged() {
        return Err(AppError::forbidden("only the owner or an admin can manage members"));
    }
    Ok(())
}

pub fn check_update_metadata(actor: &Member) -> AppResult<()> {
    if !actor.role.is_privileged() {
        return Err(AppError::forbidden(
            "only the owner or an admin can update the group information",
        ));
    }
    Ok(())
}

pub fn check_remove(actor: &Member, target: &Member) -> AppResult<()> {
    if actor.user_id == target.user_id {
        return Err(AppError::invalid("use leave to remove yourself"));
    }
    check_manage_members(actor)?;
    if target.role == MemberRole::Owner {
        return Err(AppError::invalid("the owner cannot be removed"));
    }
    if !actor.role.can_manage(target.role) {
        return Err(AppError::forbidden("admins cannot remove other admins"));
    }
    Ok(())
}

pub fn check_role_change(actor: &Member, target: &Member, new_role: MemberRole) -> AppResult<()> {
    check_manage_members(actor)?;
    if actor.user_id == target.user_id {
        return Err(AppError::invalid("cannot change your own role"));
    }
    if target.role == MemberRole::Owner {
        return Err(AppError::invalid(
            "the owner's role cannot be changed, transfer ownership instead",
        ));
    }
    if new_role == MemberRole::Owner {
        return Err(AppError::invalid("use ownership transfer to assign a new owner"));
    }
    if !actor.role.can_manage(target.role) || new_role > actor.role {
        return Err(AppError::forbidden("insufficient role to change this member"));
    }
    if target.role == new_role {
        return Err(AppError::invalid(format!("member already has role {new_role}")));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeavePlan {
    /// Remove the member and keep the conversation.
    Leave,
    /// The member is the last one; the conversation goes with them.
    DeleteConversation,
}

pub fn check_leave(member: &Member, member_count: usize) -> AppResult<LeavePlan> {
    if member_count <= 1 {
        return Ok(LeavePlan::DeleteConversation);
    }
    if member.role == MemberRole::Owner {
        return Err(AppError::invalid("owner must transfer ownership first"));
    }
    Ok(LeavePlan::Leave)
}

/// Runs before the target is looked up so non-owners learn nothing about membership.
pub fn check_transfer(actor: &Member, target_id: Uuid) -> AppResult<()> {
    if actor.role != MemberRole::Owner {
        return Err(AppError::forbidden("only the owner can transfer ownership"));
    }
    if actor.user_id == target_id {
        return Err(AppError::invalid("you already own this group"));
    }
    Ok(())
}

/// Deduplicates requested ids, dropping `exclude` and anyone already present.
pub fn new_member_ids(requested: &[Uuid], existing: &[Member], exclude: Uuid) -> Vec<Uuid> {
    let mut ids = Vec::with_capacity(requested.len());
    for id in requested {
        if *id == exclude || ids.contains(id) || existing.iter().any(|m| m.user_id == *id) {
            continue;
        }
        ids.push(*id);
    }
    ids
}

/// Texts of the SYSTEM entries written for membership and metadata changes.
pub mod texts {
    use crate::models::MemberRole;
    use uuid::Uuid;

    pub fn created_group(creator: Uuid) -> String {
        format!("{creator} created the group")
    }

    pub fn added(actor: Uuid, users: &[Uuid]) -> String {
        let names: Vec<String> = users.iter().map(Uuid::to_string).collect();
        format!("{actor} added {} into the group", names.join(", "))
    }

    pub fn removed(actor: Uuid, target: Uuid) -> String {
        format!("{actor} removed {target} from the group")
    }

    pub fn left(user: Uuid) -> String {
        format!("{user} left the conversation")
    }

    pub fn role_changed(target: Uuid, role: MemberRole) -> String {
        format!("{target} was authorized to be {}", role.to_db().to_uppercase())
    }

    pub fn ownership_transferred(from: Uuid, to: Uuid) -> String {
        format!("{from} transferred group ownership to {to}")
    }

    pub fn metadata_updated(actor: Uuid, title_changed: bool, media_changed: bool) -> String {
        match (title_changed, media_changed) {
            (true, false) => format!("{actor} renamed the group"),
            (false, true) => format!("{actor} changed the group photo"),
            _ => format!("{actor} updated the group information"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(role: MemberRole) -> Member {
        Member::new(Uuid::nil(), Uuid::new_v4(), role)
    }

    #[test]
    fn member_cannot_remove_others() {
        let actor = member(MemberRole::Member);
        let target = member(MemberRole::Member);
        assert!(matches!(check_remove(&actor, &target), Err(AppError::Forbidden(_))));
    }

    #[test]
    fn admin_cannot_remove_admin_or_owner() {
        let admin = member(MemberRole::Admin);
        assert!(matches!(
            check_remove(&admin, &member(MemberRole::Admin)),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            check_remove(&admin, &member(MemberRole::Owner)),
            Err(AppError::InvalidRequest(_))
        ));
        assert!(check_remove(&admin, &member(MemberRole::Member)).is_ok());
    }

    #[test]
    fn owner_removes_admins_but_not_self() {
        let owner = member(MemberRole::Owner);
        assert!(check_remove(&owner, &member(MemberRole::Admin)).is_ok());
        assert!(matches!(check_remove(&owner, &owner), Err(AppError::InvalidRequest(_))));
    }

    #[test]
    fn role_changes_never_touch_ownership() {
        let owner = member(MemberRole::Owner);
        let admin = member(MemberRole::Admin);
        let plain = member(MemberRole::Member);

        assert!(check_role_change(&owner, &plain, MemberRole::Admin).is_ok());
        assert!(check_role_change(&owner, &admin, MemberRole::Member).is_ok());
        assert!(matches!(
            check_role_change(&owner, &plain, MemberRole::Owner),
            Err(AppError::InvalidRequest(_))
        ));
        assert!(matches!(
            check_role_change(&admin, &owner, MemberRole::Member),
            Err(AppError::InvalidRequest(_))
        ));
        assert!(matches!(
            check_role_change(&owner, &owner, MemberRole::Admin),
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[test]
    fn admin_promotes_members_but_not_demotes_admins() {
        let admin = member(MemberRole::Admin);
        assert!(check_role_change(&admin, &member(MemberRole::Member), MemberRole::Admin).is_ok());
        assert!(matches!(
            check_role_change(&admin, &member(MemberRole::Admin), MemberRole::Member),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            check_role_change(&member(MemberRole::Member), &member(MemberRole::Member), MemberRole::Admin),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn owner_leave_requires_transfer() {
        let owner = member(MemberRole::Owner);
        assert!(matches!(check_leave(&owner, 3), Err(AppError::InvalidRequest(msg)) if msg == "owner must transfer ownership first"));
        assert_eq!(check_leave(&owner, 1).unwrap(), LeavePlan::DeleteConversation);
        assert_eq!(check_leave(&member(MemberRole::Admin), 2).unwrap(), LeavePlan::Leave);
    }

    #[test]
    fn transfer_is_owner_only() {
        let owner = member(MemberRole::Owner);
        let admin = member(MemberRole::Admin);
        assert!(check_transfer(&owner, admin.user_id).is_ok());
        assert!(matches!(check_transfer(&admin, owner.user_id), Err(AppError::Forbidden(_))));
        assert!(matches!(check_transfer(&owner, owner.user_id), Err(AppError::InvalidRequest(_))));
    }

    #[test]
    fn new_member_ids_dedupes_and_skips_existing() {
        let creator = Uuid::new_v4();
        let existing = member(MemberRole::Member);
        let fresh = Uuid::new_v4();
        let ids = new_member_ids(
            &[fresh, creator, existing.user_id, fresh],
            std::slice::from_ref(&existing),
            creator,
        );
        assert_eq!(ids, vec![fresh]);
    }

    #[test]
    fn direct_conversations_reject_group_actions() {
        let direct = Conversation::new_direct(Uuid::new_v4(), Uuid::new_v4());
        assert!(matches!(require_group(&direct), Err(AppError::InvalidRequest(_))));
    }
}
