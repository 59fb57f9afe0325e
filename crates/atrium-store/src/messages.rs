//! Message store: durable, ordered record of messages per conversation,
//! including edit/delete/read state. The per-conversation `seq` column is
//! the authoritative ordering key; appends and conversation-pointer
//! advances happen in one transaction.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use uuid::Uuid;

use atrium_types::identity::Identity;
use atrium_types::models::{Message, MessageKind, PaginationMeta};

use crate::conversations::load_conversation;
use crate::models::{MessageRow, ReceiptRow, fmt_ts, placeholders};
use crate::{Database, EDIT_WINDOW_SECS, StoreError, StoreResult, TOMBSTONE};

const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.seq, m.sender, m.sender_name, m.body, \
     m.kind, m.created_at, m.is_edited, m.edited_at, m.is_deleted, m.deleted_at, m.reply_to";

impl Database {
    /// Append a message and advance the owning conversation's last-message
    /// pointer and last-activity timestamp in the same transaction.
    pub fn append_message(
        &self,
        conversation_id: Uuid,
        sender: &Identity,
        sender_name: &str,
        body: &str,
        kind: MessageKind,
        reply_to: Option<Uuid>,
    ) -> StoreResult<Message> {
        let body = body.trim();
        if body.is_empty() {
            return Err(StoreError::Validation("Message body is required".into()));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let conv = load_conversation(&tx, &conversation_id)?;
            if conv.participant_for(sender).is_none() {
                return Err(StoreError::PermissionDenied(
                    "Access denied: Not a participant of this conversation".into(),
                ));
            }

            let cid = conversation_id.to_string();
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
                params![cid],
                |row| row.get(0),
            )?;

            let id = Uuid::new_v4();
            let now = fmt_ts(Utc::now());
            tx.execute(
                "INSERT INTO messages (id, conversation_id, seq, sender, sender_name, body, kind,
                                       created_at, reply_to)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    cid,
                    seq,
                    sender.as_str(),
                    sender_name,
                    body,
                    kind.as_str(),
                    now,
                    reply_to.map(|r| r.to_string())
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET last_message_id = ?1, last_activity = ?2 WHERE id = ?3",
                params![id.to_string(), now, cid],
            )?;

            let message = load_message(&tx, &id)?.ok_or(StoreError::NotFound("message"))?;
            tx.commit()?;
            Ok(message)
        })
    }

    /// Edit a message body. Author only, within the 15-minute window.
    pub fn edit_message(&self, id: Uuid, actor: &Identity, new_body: &str) -> StoreResult<Message> {
        let new_body = new_body.trim();
        if new_body.is_empty() {
            return Err(StoreError::Validation("Message body is required".into()));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let row = load_message_row(&tx, &id)?.ok_or(StoreError::NotFound("message"))?;

            if !actor.same_as(&Identity::new(row.sender.clone())) {
                return Err(StoreError::PermissionDenied(
                    "Can only edit your own messages".into(),
                ));
            }
            if row.is_deleted {
                return Err(StoreError::InvalidState(
                    "Cannot edit a deleted message".into(),
                ));
            }
            let created = crate::models::parse_ts(&row.created_at);
            if Utc::now() - created > chrono::Duration::seconds(EDIT_WINDOW_SECS) {
                return Err(StoreError::Expired(
                    "Cannot edit messages older than 15 minutes".into(),
                ));
            }

            tx.execute(
                "UPDATE messages SET body = ?1, is_edited = 1, edited_at = ?2 WHERE id = ?3",
                params![new_body, fmt_ts(Utc::now()), id.to_string()],
            )?;
            let message = load_message(&tx, &id)?.ok_or(StoreError::NotFound("message"))?;
            tx.commit()?;
            Ok(message)
        })
    }

    /// Soft-delete a message: the body is replaced by the tombstone but the
    /// row keeps its place in the ordering stream. Author only, no time
    /// window; deleting an already-deleted message is a no-op.
    pub fn soft_delete_message(&self, id: Uuid, actor: &Identity) -> StoreResult<Message> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let row = load_message_row(&tx, &id)?.ok_or(StoreError::NotFound("message"))?;

            if !actor.same_as(&Identity::new(row.sender.clone())) {
                return Err(StoreError::PermissionDenied(
                    "Can only delete your own messages".into(),
                ));
            }
            if !row.is_deleted {
                tx.execute(
                    "UPDATE messages SET is_deleted = 1, deleted_at = ?1, body = ?2 WHERE id = ?3",
                    params![fmt_ts(Utc::now()), TOMBSTONE, id.to_string()],
                )?;
            }
            let message = load_message(&tx, &id)?.ok_or(StoreError::NotFound("message"))?;
            tx.commit()?;
            Ok(message)
        })
    }

    /// Record a read receipt. Idempotent across identity forms: if any
    /// equivalence form of the reader already has a receipt, nothing is
    /// written. Returns whether a receipt was newly recorded.
    pub fn mark_read(&self, id: Uuid, reader: &Identity) -> StoreResult<bool> {
        let forms = reader.equivalent_forms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if load_message_row(&tx, &id)?.is_none() {
                return Err(StoreError::NotFound("message"));
            }

            let sql = format!(
                "SELECT COUNT(*) FROM read_receipts WHERE message_id = ? AND identity IN ({})",
                placeholders(forms.len())
            );
            let mut bind: Vec<String> = vec![id.to_string()];
            bind.extend(forms.iter().cloned());
            let existing: i64 = tx
                .prepare(&sql)?
                .query_row(params_from_iter(bind.iter()), |row| row.get(0))?;
            if existing > 0 {
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO read_receipts (message_id, identity, read_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), reader.as_str(), fmt_ts(Utc::now())],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    /// Mark every currently-unread message in a conversation as read and
    /// advance the reader's last-read pointer. Returns how many receipts
    /// were recorded.
    pub fn mark_all_read(&self, conversation_id: Uuid, reader: &Identity) -> StoreResult<usize> {
        let forms = reader.equivalent_forms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let conv = load_conversation(&tx, &conversation_id)?;
            if conv.participant_for(reader).is_none() {
                return Err(StoreError::PermissionDenied("Access denied".into()));
            }

            let unread = unread_rows(&tx, &forms, Some(&conversation_id), None)?;
            let now = fmt_ts(Utc::now());
            let mut newest: Option<(i64, String)> = None;
            for row in &unread {
                tx.execute(
                    "INSERT OR IGNORE INTO read_receipts (message_id, identity, read_at)
                     VALUES (?1, ?2, ?3)",
                    params![row.id, reader.as_str(), now],
                )?;
                if newest.as_ref().is_none_or(|(seq, _)| row.seq > *seq) {
                    newest = Some((row.seq, row.id.clone()));
                }
            }

            if let Some((_, last_id)) = newest {
                let sql = format!(
                    "UPDATE participants SET last_read_message_id = ?1
                     WHERE conversation_id = ?2 AND identity IN ({})",
                    placeholders(forms.len())
                );
                let mut bind: Vec<String> = vec![last_id, conversation_id.to_string()];
                bind.extend(forms.iter().cloned());
                tx.execute(&sql, params_from_iter(bind.iter()))?;
            }

            tx.commit()?;
            Ok(unread.len())
        })
    }

    /// Messages the identity has not read: not authored by any of its
    /// equivalence forms, not already receipted, not soft-deleted, newer
    /// than the participant's last-read pointer when one exists. Newest
    /// first.
    pub fn unread_for(
        &self,
        identity: &Identity,
        conversation: Option<Uuid>,
    ) -> StoreResult<Vec<Message>> {
        let forms = identity.equivalent_forms();
        self.with_conn(|conn| {
            let rows = unread_rows(conn, &forms, conversation.as_ref(), None)?;
            rows_to_messages(conn, rows)
        })
    }

    /// One history page, oldest-first, with total-count pagination metadata.
    /// Soft-deleted messages are excluded. Participation is enforced when a
    /// requester is given.
    pub fn history(
        &self,
        conversation_id: Uuid,
        requester: Option<&Identity>,
        page: u32,
        page_size: u32,
    ) -> StoreResult<(Vec<Message>, PaginationMeta)> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 200);

        self.with_conn(|conn| {
            let conv = load_conversation(conn, &conversation_id)?;
            if let Some(requester) = requester {
                if conv.participant_for(requester).is_none() {
                    return Err(StoreError::PermissionDenied("Access denied".into()));
                }
            }

            let cid = conversation_id.to_string();
            let total: u64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND is_deleted = 0",
                params![cid],
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 WHERE m.conversation_id = ?1 AND m.is_deleted = 0
                 ORDER BY m.seq DESC
                 LIMIT ?2 OFFSET ?3"
            );
            // Widened so an absurd page number stays a valid (empty) window
            // instead of overflowing u32.
            let offset = (page as u64 - 1) * page_size as u64;
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(params![cid, page_size, offset], message_row_mapper)?
                .collect::<Result<Vec<_>, _>>()?;

            // Query is newest-first for the page window; display order is
            // oldest-first.
            rows.reverse();
            let messages = rows_to_messages(conn, rows)?;

            let total_pages = (total.div_ceil(page_size as u64)) as u32;
            let meta = PaginationMeta {
                current_page: page,
                total_pages,
                total_messages: total,
                has_more: page < total_pages,
            };
            Ok((messages, meta))
        })
    }
}

fn message_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        sender: row.get(3)?,
        sender_name: row.get(4)?,
        body: row.get(5)?,
        kind: row.get(6)?,
        created_at: row.get(7)?,
        is_edited: row.get(8)?,
        edited_at: row.get(9)?,
        is_deleted: row.get(10)?,
        deleted_at: row.get(11)?,
        reply_to: row.get(12)?,
    })
}

fn load_message_row(conn: &Connection, id: &Uuid) -> StoreResult<Option<MessageRow>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1");
    let row = conn
        .prepare(&sql)?
        .query_row(params![id.to_string()], message_row_mapper)
        .optional()?;
    Ok(row)
}

pub(crate) fn load_message(conn: &Connection, id: &Uuid) -> StoreResult<Option<Message>> {
    match load_message_row(conn, id)? {
        Some(row) => Ok(Some(rows_to_messages(conn, vec![row])?.remove(0))),
        None => Ok(None),
    }
}

/// Unread message rows for an identity (given as its equivalence forms),
/// optionally scoped to one conversation. Applies the full unread filter:
/// active conversation, participant membership, not own, not receipted, not
/// deleted, past the last-read pointer.
pub(crate) fn unread_rows(
    conn: &Connection,
    forms: &[String],
    conversation: Option<&Uuid>,
    limit: Option<u32>,
) -> StoreResult<Vec<MessageRow>> {
    let in_forms = placeholders(forms.len());
    let mut sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m
         JOIN conversations c ON c.id = m.conversation_id
         WHERE c.is_active = 1
           AND m.is_deleted = 0
           AND m.sender NOT IN ({in_forms})
           AND EXISTS (SELECT 1 FROM participants p
                       WHERE p.conversation_id = m.conversation_id
                         AND p.identity IN ({in_forms}))
           AND NOT EXISTS (SELECT 1 FROM read_receipts r
                           WHERE r.message_id = m.id AND r.identity IN ({in_forms}))
           AND NOT EXISTS (SELECT 1 FROM participants p
                           JOIN messages lm ON lm.id = p.last_read_message_id
                           WHERE p.conversation_id = m.conversation_id
                             AND p.identity IN ({in_forms})
                             AND m.created_at <= lm.created_at)"
    );

    let mut bind: Vec<String> = Vec::with_capacity(forms.len() * 4 + 2);
    for _ in 0..4 {
        bind.extend(forms.iter().cloned());
    }
    if let Some(cid) = conversation {
        sql.push_str(" AND m.conversation_id = ?");
        bind.push(cid.to_string());
    }
    sql.push_str(" ORDER BY m.created_at DESC, m.seq DESC");
    if let Some(n) = limit {
        sql.push_str(" LIMIT ?");
        bind.push(n.to_string());
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind.iter()), message_row_mapper)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Attach read receipts to message rows with one batched query.
pub(crate) fn rows_to_messages(
    conn: &Connection,
    rows: Vec<MessageRow>,
) -> StoreResult<Vec<Message>> {
    if rows.is_empty() {
        return Ok(vec![]);
    }

    let ids: Vec<&String> = rows.iter().map(|r| &r.id).collect();
    let sql = format!(
        "SELECT message_id, identity, read_at FROM read_receipts WHERE message_id IN ({})",
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let receipts = stmt
        .query_map(params_from_iter(ids.iter()), |row| {
            Ok(ReceiptRow {
                message_id: row.get(0)?,
                identity: row.get(1)?,
                read_at: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_message: HashMap<String, Vec<ReceiptRow>> = HashMap::new();
    for receipt in receipts {
        by_message
            .entry(receipt.message_id.clone())
            .or_default()
            .push(receipt);
    }

    rows.into_iter()
        .map(|row| {
            let receipts = by_message.remove(&row.id).unwrap_or_default();
            row.into_message(receipts)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_types::models::ConversationKind;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn direct(db: &Database) -> (Uuid, Identity, Identity) {
        let a = Identity::new("1");
        let b = Identity::new("2");
        let conv = db.create_direct(&a, "Alice", &b, "Bohdan").unwrap();
        assert_eq!(conv.kind, ConversationKind::Direct);
        (conv.id, a, b)
    }

    fn backdate(db: &Database, message_id: Uuid, seconds: i64) {
        db.with_conn(|conn| {
            let past = fmt_ts(Utc::now() - chrono::Duration::seconds(seconds));
            conn.execute(
                "UPDATE messages SET created_at = ?1 WHERE id = ?2",
                params![past, message_id.to_string()],
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn append_advances_the_conversation_pointer() {
        let db = db();
        let (cid, a, _) = direct(&db);

        let msg = db
            .append_message(cid, &a, "Alice", "hello", MessageKind::Text, None)
            .unwrap();

        let conv = db.get_conversation(cid).unwrap();
        assert_eq!(conv.last_message_id, Some(msg.id));
        assert!(conv.last_activity >= msg.created_at);
    }

    #[test]
    fn appends_are_sequenced_in_insertion_order() {
        let db = db();
        let (cid, a, _) = direct(&db);

        let m1 = db
            .append_message(cid, &a, "Alice", "first", MessageKind::Text, None)
            .unwrap();
        let m2 = db
            .append_message(cid, &a, "Alice", "second", MessageKind::Text, None)
            .unwrap();
        assert!(m2.seq > m1.seq);

        let (page, _) = db.history(cid, Some(&a), 1, 50).unwrap();
        let seqs: Vec<i64> = page.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![m1.seq, m2.seq]);
    }

    #[test]
    fn append_rejects_non_participants_and_missing_conversations() {
        let db = db();
        let (cid, _, _) = direct(&db);

        let err = db
            .append_message(cid, &Identity::new("9"), "Mallory", "hi", MessageKind::Text, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));

        let err = db
            .append_message(
                Uuid::new_v4(),
                &Identity::new("1"),
                "Alice",
                "hi",
                MessageKind::Text,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn mark_read_is_idempotent_across_identity_forms() {
        let db = db();
        let (cid, a, b) = direct(&db);
        let msg = db
            .append_message(cid, &a, "Alice", "hello", MessageKind::Text, None)
            .unwrap();

        assert!(db.mark_read(msg.id, &b).unwrap());
        assert!(!db.mark_read(msg.id, &b).unwrap());
        assert!(!db.mark_read(msg.id, &Identity::new("sso_2")).unwrap());

        let (page, _) = db.history(cid, Some(&b), 1, 50).unwrap();
        assert_eq!(page[0].read_by.len(), 1);
    }

    #[test]
    fn unread_never_includes_own_messages_under_any_form() {
        let db = db();
        let (cid, a, b) = direct(&db);
        db.append_message(cid, &a, "Alice", "from alice", MessageKind::Text, None)
            .unwrap();
        db.append_message(cid, &Identity::new("sso_2"), "Bohdan", "from bohdan", MessageKind::Text, None)
            .unwrap();

        for form in ["2", "sso_2"] {
            let unread = db.unread_for(&Identity::new(form), Some(cid)).unwrap();
            assert_eq!(unread.len(), 1);
            assert_eq!(unread[0].body, "from alice");
        }

        let unread = db.unread_for(&a, Some(cid)).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].body, "from bohdan");
    }

    #[test]
    fn mark_all_read_clears_unread_and_sets_the_pointer() {
        let db = db();
        let (cid, a, b) = direct(&db);
        db.append_message(cid, &a, "Alice", "one", MessageKind::Text, None)
            .unwrap();
        db.append_message(cid, &a, "Alice", "two", MessageKind::Text, None)
            .unwrap();

        let marked = db.mark_all_read(cid, &b).unwrap();
        assert_eq!(marked, 2);
        assert!(db.unread_for(&b, Some(cid)).unwrap().is_empty());

        let conv = db.get_conversation(cid).unwrap();
        let participant = conv.participant_for(&b).unwrap();
        assert_eq!(participant.last_read_message_id, conv.last_message_id);

        // Second pass has nothing left to mark.
        assert_eq!(db.mark_all_read(cid, &b).unwrap(), 0);
    }

    #[test]
    fn edit_window_expires_after_fifteen_minutes() {
        let db = db();
        let (cid, a, _) = direct(&db);
        let msg = db
            .append_message(cid, &a, "Alice", "tpyo", MessageKind::Text, None)
            .unwrap();

        // One second before the window closes: allowed.
        backdate(&db, msg.id, 15 * 60 - 1);
        let edited = db.edit_message(msg.id, &a, "typo").unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.body, "typo");

        let late = db
            .append_message(cid, &a, "Alice", "old", MessageKind::Text, None)
            .unwrap();
        backdate(&db, late.id, 16 * 60);
        let err = db.edit_message(late.id, &a, "too late").unwrap_err();
        assert!(matches!(err, StoreError::Expired(_)));
    }

    #[test]
    fn only_the_author_edits_or_deletes() {
        let db = db();
        let (cid, a, b) = direct(&db);
        let msg = db
            .append_message(cid, &a, "Alice", "mine", MessageKind::Text, None)
            .unwrap();

        let err = db.edit_message(msg.id, &b, "hijack").unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
        let err = db.soft_delete_message(msg.id, &b).unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));

        // The prefixed form of the author is still the author.
        let deleted = db
            .soft_delete_message(msg.id, &Identity::new("sso_1"))
            .unwrap();
        assert!(deleted.is_deleted);
        assert_eq!(deleted.body, TOMBSTONE);
    }

    #[test]
    fn deleted_messages_leave_history_but_keep_their_sequence() {
        let db = db();
        let (cid, a, _) = direct(&db);
        let m1 = db
            .append_message(cid, &a, "Alice", "one", MessageKind::Text, None)
            .unwrap();
        db.append_message(cid, &a, "Alice", "two", MessageKind::Text, None)
            .unwrap();

        db.soft_delete_message(m1.id, &a).unwrap();
        let (page, meta) = db.history(cid, Some(&a), 1, 50).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].body, "two");
        assert_eq!(meta.total_messages, 1);

        // The next append still gets seq 3; the tombstone keeps its slot.
        let m3 = db
            .append_message(cid, &a, "Alice", "three", MessageKind::Text, None)
            .unwrap();
        assert_eq!(m3.seq, 3);
    }

    #[test]
    fn history_pages_oldest_first_with_metadata() {
        let db = db();
        let (cid, a, _) = direct(&db);
        for i in 1..=5 {
            db.append_message(cid, &a, "Alice", &format!("m{i}"), MessageKind::Text, None)
                .unwrap();
        }

        let (page, meta) = db.history(cid, Some(&a), 1, 2).unwrap();
        assert_eq!(
            page.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
            vec!["m4", "m5"]
        );
        assert_eq!(meta.total_pages, 3);
        assert!(meta.has_more);

        let (page, meta) = db.history(cid, Some(&a), 3, 2).unwrap();
        assert_eq!(
            page.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
            vec!["m1"]
        );
        assert!(!meta.has_more);

        let err = db
            .history(cid, Some(&Identity::new("9")), 1, 2)
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
    }

    #[test]
    fn absurd_page_numbers_yield_an_empty_page() {
        let db = db();
        let (cid, a, _) = direct(&db);
        db.append_message(cid, &a, "Alice", "only", MessageKind::Text, None)
            .unwrap();

        let (page, meta) = db.history(cid, Some(&a), u32::MAX, 200).unwrap();
        assert!(page.is_empty());
        assert_eq!(meta.total_messages, 1);
        assert!(!meta.has_more);
    }
}
