//! Conversation store: durable record of conversations and their
//! participant lists. Every participation check here goes through the
//! identity equivalence set.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use uuid::Uuid;

use atrium_types::identity::Identity;
use atrium_types::models::{Conversation, ConversationKind, Role};

use crate::models::{ConversationRow, ParticipantRow, fmt_ts, placeholders};
use crate::{Database, StoreError, StoreResult, TOMBSTONE};

impl Database {
    /// Create a direct conversation between two identities, or return the
    /// existing one for the same unordered (equivalence-aware) pair.
    pub fn create_direct(
        &self,
        a: &Identity,
        a_name: &str,
        b: &Identity,
        b_name: &str,
    ) -> StoreResult<Conversation> {
        if a.same_as(b) {
            return Err(StoreError::Validation(
                "Cannot create a conversation with yourself".into(),
            ));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if let Some(existing) = find_direct(&tx, a, b)? {
                let conv = load_conversation(&tx, &existing)?;
                tx.commit()?;
                return Ok(conv);
            }

            let id = Uuid::new_v4();
            let now = fmt_ts(Utc::now());
            tx.execute(
                "INSERT INTO conversations (id, kind, name, created_by, last_activity, is_active)
                 VALUES (?1, 'direct', NULL, ?2, ?3, 1)",
                params![id.to_string(), a.as_str(), now],
            )?;
            insert_participant(&tx, &id, a, a_name, Role::Member, &now)?;
            insert_participant(&tx, &id, b, b_name, Role::Member, &now)?;

            let conv = load_conversation(&tx, &id)?;
            tx.commit()?;
            Ok(conv)
        })
    }

    /// Create a group conversation. The creator becomes admin; participant
    /// entries that duplicate the creator or each other (by equivalence)
    /// collapse.
    pub fn create_group(
        &self,
        name: &str,
        creator: &Identity,
        creator_name: &str,
        participants: &[(Identity, String)],
    ) -> StoreResult<Conversation> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Validation("Group name is required".into()));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let id = Uuid::new_v4();
            let now = fmt_ts(Utc::now());
            tx.execute(
                "INSERT INTO conversations (id, kind, name, created_by, last_activity, is_active)
                 VALUES (?1, 'group', ?2, ?3, ?4, 1)",
                params![id.to_string(), name, creator.as_str(), now],
            )?;

            insert_participant(&tx, &id, creator, creator_name, Role::Admin, &now)?;

            let mut added: Vec<Identity> = vec![creator.clone()];
            for (identity, display_name) in participants {
                if added.iter().any(|existing| existing.same_as(identity)) {
                    continue;
                }
                insert_participant(&tx, &id, identity, display_name, Role::Member, &now)?;
                added.push(identity.clone());
            }

            let conv = load_conversation(&tx, &id)?;
            tx.commit()?;
            Ok(conv)
        })
    }

    pub fn get_conversation(&self, id: Uuid) -> StoreResult<Conversation> {
        self.with_conn(|conn| load_conversation(conn, &id))
    }

    /// Active conversations for an identity, last-activity descending, each
    /// paired with its unread count for that identity.
    pub fn list_for(&self, identity: &Identity) -> StoreResult<Vec<(Conversation, usize)>> {
        let forms = identity.equivalent_forms();
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT DISTINCT c.id FROM conversations c
                 JOIN participants p ON p.conversation_id = c.id
                 WHERE c.is_active = 1 AND p.identity IN ({})
                 ORDER BY c.last_activity DESC",
                placeholders(forms.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(forms.iter()), |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut out = Vec::with_capacity(ids.len());
            for raw in ids {
                let id: Uuid = raw
                    .parse()
                    .map_err(|e| StoreError::Internal(format!("corrupt conversation id '{raw}': {e}")))?;
                let conv = load_conversation(conn, &id)?;
                let unread = crate::messages::unread_rows(conn, &forms, Some(&id), None)?.len();
                out.push((conv, unread));
            }
            Ok(out)
        })
    }

    /// Add a participant to a group conversation. Only group admins may do
    /// this; adding an existing member (by equivalence) is a no-op.
    pub fn add_participant(
        &self,
        id: Uuid,
        actor: &Identity,
        new_identity: &Identity,
        display_name: &str,
    ) -> StoreResult<Conversation> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let conv = load_conversation(&tx, &id)?;

            if conv.kind == ConversationKind::Direct {
                return Err(StoreError::InvalidState(
                    "Participants can only be added to group conversations".into(),
                ));
            }
            let acting = conv
                .participant_for(actor)
                .ok_or_else(|| StoreError::PermissionDenied("Not a participant".into()))?;
            if acting.role != Role::Admin {
                return Err(StoreError::PermissionDenied(
                    "Only admins can add participants".into(),
                ));
            }

            if conv.participant_for(new_identity).is_some() {
                tx.commit()?;
                return Ok(conv);
            }

            let now = fmt_ts(Utc::now());
            insert_participant(&tx, &id, new_identity, display_name, Role::Member, &now)?;
            let conv = load_conversation(&tx, &id)?;
            tx.commit()?;
            Ok(conv)
        })
    }

    /// Remove a participant from a group conversation. Allowed for admins
    /// or for self-leave. If the removal leaves members but no admin, the
    /// earliest-joined remaining member is promoted.
    pub fn remove_participant(
        &self,
        id: Uuid,
        actor: &Identity,
        target: &Identity,
    ) -> StoreResult<Conversation> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let conv = load_conversation(&tx, &id)?;

            if conv.kind == ConversationKind::Direct {
                return Err(StoreError::InvalidState(
                    "Participants can only be removed from group conversations".into(),
                ));
            }
            let acting = conv
                .participant_for(actor)
                .ok_or_else(|| StoreError::PermissionDenied("Not a participant".into()))?;
            if acting.role != Role::Admin && !actor.same_as(target) {
                return Err(StoreError::PermissionDenied("Access denied".into()));
            }
            if conv.participant_for(target).is_none() {
                return Err(StoreError::NotFound("participant"));
            }

            let target_forms = target.equivalent_forms();
            let sql = format!(
                "DELETE FROM participants WHERE conversation_id = ?1 AND identity IN ({})",
                placeholders_from(2, target_forms.len())
            );
            let mut bind: Vec<String> = vec![id.to_string()];
            bind.extend(target_forms);
            tx.execute(&sql, params_from_iter(bind.iter()))?;

            promote_if_leaderless(&tx, &id)?;

            let conv = load_conversation(&tx, &id)?;
            tx.commit()?;
            Ok(conv)
        })
    }

    /// Soft-delete a conversation and cascade a tombstoned soft-delete to
    /// every message in it. Any participant may delete a direct
    /// conversation; groups require admin.
    pub fn soft_delete_conversation(&self, id: Uuid, actor: &Identity) -> StoreResult<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let conv = load_conversation(&tx, &id)?;

            let acting = conv.participant_for(actor).ok_or_else(|| {
                StoreError::PermissionDenied("Access denied: Not a participant of this conversation".into())
            })?;
            if conv.kind == ConversationKind::Group && acting.role != Role::Admin {
                return Err(StoreError::PermissionDenied(
                    "Only admins can delete group conversations".into(),
                ));
            }

            let now = fmt_ts(Utc::now());
            tx.execute(
                "UPDATE conversations SET is_active = 0 WHERE id = ?1",
                params![id.to_string()],
            )?;
            tx.execute(
                "UPDATE messages SET is_deleted = 1, deleted_at = ?1, body = ?2
                 WHERE conversation_id = ?3 AND is_deleted = 0",
                params![now, TOMBSTONE, id.to_string()],
            )?;

            tx.commit()?;
            Ok(())
        })
    }
}

/// `?n, ?n+1, …` placeholder list starting at a given index, for queries
/// that mix fixed and dynamic parameters.
fn placeholders_from(start: usize, n: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn find_direct(conn: &Connection, a: &Identity, b: &Identity) -> StoreResult<Option<Uuid>> {
    let a_forms = a.equivalent_forms();
    let b_forms = b.equivalent_forms();

    let sql = format!(
        "SELECT c.id FROM conversations c
         WHERE c.kind = 'direct' AND c.is_active = 1
           AND EXISTS (SELECT 1 FROM participants p
                       WHERE p.conversation_id = c.id AND p.identity IN ({}))
           AND EXISTS (SELECT 1 FROM participants p
                       WHERE p.conversation_id = c.id AND p.identity IN ({}))
         LIMIT 1",
        placeholders(a_forms.len()),
        placeholders(b_forms.len())
    );

    let bind: Vec<&String> = a_forms.iter().chain(b_forms.iter()).collect();
    let raw: Option<String> = conn
        .prepare(&sql)?
        .query_row(params_from_iter(bind), |row| row.get(0))
        .optional()?;

    raw.map(|r| {
        r.parse()
            .map_err(|e| StoreError::Internal(format!("corrupt conversation id '{r}': {e}")))
    })
    .transpose()
}

fn insert_participant(
    conn: &Connection,
    conversation_id: &Uuid,
    identity: &Identity,
    display_name: &str,
    role: Role,
    joined_at: &str,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO participants (conversation_id, identity, display_name, role, joined_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            conversation_id.to_string(),
            identity.as_str(),
            display_name,
            role.as_str(),
            joined_at
        ],
    )?;
    Ok(())
}

/// Last-admin policy: a group left with members but no admin promotes its
/// earliest-joined remaining member.
fn promote_if_leaderless(conn: &Connection, conversation_id: &Uuid) -> StoreResult<()> {
    let cid = conversation_id.to_string();
    let admins: i64 = conn.query_row(
        "SELECT COUNT(*) FROM participants WHERE conversation_id = ?1 AND role = 'admin'",
        params![cid],
        |row| row.get(0),
    )?;
    if admins > 0 {
        return Ok(());
    }

    conn.execute(
        "UPDATE participants SET role = 'admin'
         WHERE rowid = (SELECT rowid FROM participants
                        WHERE conversation_id = ?1
                        ORDER BY joined_at ASC, rowid ASC
                        LIMIT 1)",
        params![cid],
    )?;
    Ok(())
}

pub(crate) fn load_conversation(conn: &Connection, id: &Uuid) -> StoreResult<Conversation> {
    let raw = id.to_string();
    let row: Option<ConversationRow> = conn
        .prepare(
            "SELECT id, kind, name, created_by, last_message_id, last_activity, is_active
             FROM conversations WHERE id = ?1",
        )?
        .query_row(params![raw], |row| {
            Ok(ConversationRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                name: row.get(2)?,
                created_by: row.get(3)?,
                last_message_id: row.get(4)?,
                last_activity: row.get(5)?,
                is_active: row.get(6)?,
            })
        })
        .optional()?;

    let row = row.ok_or(StoreError::NotFound("conversation"))?;
    let participants = load_participants(conn, &raw)?;
    row.into_conversation(participants)
}

fn load_participants(conn: &Connection, conversation_id: &str) -> StoreResult<Vec<ParticipantRow>> {
    let mut stmt = conn.prepare(
        "SELECT identity, display_name, role, joined_at, last_read_message_id
         FROM participants WHERE conversation_id = ?1
         ORDER BY joined_at ASC, rowid ASC",
    )?;
    let rows = stmt
        .query_map(params![conversation_id], |row| {
            Ok(ParticipantRow {
                identity: row.get(0)?,
                display_name: row.get(1)?,
                role: row.get(2)?,
                joined_at: row.get(3)?,
                last_read_message_id: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn direct_creation_is_idempotent_in_either_order() {
        let db = db();
        let a = Identity::new("1");
        let b = Identity::new("2");

        let first = db.create_direct(&a, "Alice", &b, "Bohdan").unwrap();
        let second = db.create_direct(&b, "Bohdan", &a, "Alice").unwrap();
        assert_eq!(first.id, second.id);

        // A prefixed variant of either side still resolves to the same pair.
        let third = db
            .create_direct(&Identity::new("sso_1"), "Alice", &b, "Bohdan")
            .unwrap();
        assert_eq!(first.id, third.id);
    }

    #[test]
    fn direct_self_pair_is_rejected() {
        let db = db();
        let err = db
            .create_direct(&Identity::new("1"), "A", &Identity::new("sso_1"), "A")
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn group_creator_is_admin_and_duplicates_collapse() {
        let db = db();
        let creator = Identity::new("1");
        let conv = db
            .create_group(
                "study group",
                &creator,
                "Alice",
                &[
                    (Identity::new("2"), "Bohdan".into()),
                    (Identity::new("sso_2"), "Bohdan".into()),
                    (Identity::new("sso_1"), "Alice".into()),
                ],
            )
            .unwrap();

        assert_eq!(conv.participants.len(), 2);
        let alice = conv.participant_for(&creator).unwrap();
        assert_eq!(alice.role, Role::Admin);
    }

    #[test]
    fn only_admins_add_participants_and_direct_rejects_them() {
        let db = db();
        let admin = Identity::new("1");
        let member = Identity::new("2");
        let group = db
            .create_group("g", &admin, "A", &[(member.clone(), "B".into())])
            .unwrap();

        let err = db
            .add_participant(group.id, &member, &Identity::new("3"), "C")
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));

        db.add_participant(group.id, &admin, &Identity::new("3"), "C")
            .unwrap();
        let listed = db.list_for(&Identity::new("3")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0.id, group.id);

        let direct = db
            .create_direct(&admin, "A", &member, "B")
            .unwrap();
        let err = db
            .add_participant(direct.id, &admin, &Identity::new("3"), "C")
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
    }

    #[test]
    fn removing_the_sole_admin_promotes_the_earliest_member() {
        let db = db();
        let admin = Identity::new("1");
        let group = db
            .create_group(
                "g",
                &admin,
                "A",
                &[
                    (Identity::new("2"), "B".into()),
                    (Identity::new("3"), "C".into()),
                ],
            )
            .unwrap();

        let conv = db.remove_participant(group.id, &admin, &admin).unwrap();
        let admins: Vec<_> = conv
            .participants
            .iter()
            .filter(|p| p.role == Role::Admin)
            .collect();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].identity.as_str(), "2");
    }

    #[test]
    fn self_leave_is_allowed_for_members() {
        let db = db();
        let admin = Identity::new("1");
        let member = Identity::new("2");
        let group = db
            .create_group("g", &admin, "A", &[(member.clone(), "B".into())])
            .unwrap();

        // A member cannot remove someone else...
        let err = db
            .remove_participant(group.id, &member, &admin)
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));

        // ...but can leave, under either identity form.
        let conv = db
            .remove_participant(group.id, &Identity::new("sso_2"), &member)
            .unwrap();
        assert!(conv.participant_for(&member).is_none());
    }

    #[test]
    fn soft_delete_requires_admin_for_groups_and_cascades() {
        let db = db();
        let admin = Identity::new("1");
        let member = Identity::new("2");
        let group = db
            .create_group("g", &admin, "A", &[(member.clone(), "B".into())])
            .unwrap();
        db.append_message(group.id, &admin, "A", "hello", Default::default(), None)
            .unwrap();

        let err = db
            .soft_delete_conversation(group.id, &member)
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));

        db.soft_delete_conversation(group.id, &admin).unwrap();
        assert!(db.list_for(&member).unwrap().is_empty());

        let (messages, _) = db
            .history(group.id, Some(&admin), 1, 50)
            .unwrap();
        assert!(messages.is_empty());
    }
}
