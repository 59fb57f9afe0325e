//! Notification aggregation: per-identity unread summaries grouped by
//! conversation. Derived on demand from the message store, never persisted,
//! cheap enough to call on every poll or reconnect.

use rusqlite::params_from_iter;
use uuid::Uuid;

use atrium_types::identity::Identity;
use atrium_types::models::NotificationSummary;

use crate::conversations::load_conversation;
use crate::messages::unread_rows;
use crate::models::placeholders;
use crate::{Database, StoreError, StoreResult};

/// Candidates considered per conversation when computing the most-recent
/// summary. Keeps the poll path bounded for very stale readers.
const CANDIDATES_PER_CONVERSATION: u32 = 10;

const SNIPPET_CHARS: usize = 100;

impl Database {
    /// One summary per conversation with unread messages, newest first.
    /// Absence of data is success with an empty list. The optional username
    /// folds the legacy username-derived identity form into the lookup.
    pub fn compute_notifications(
        &self,
        identity: &Identity,
        username: Option<&str>,
    ) -> StoreResult<Vec<NotificationSummary>> {
        let forms = match username {
            Some(name) => identity.equivalent_forms_with_username(name),
            None => identity.equivalent_forms(),
        };

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT DISTINCT c.id FROM conversations c
                 JOIN participants p ON p.conversation_id = c.id
                 WHERE c.is_active = 1 AND p.identity IN ({})",
                placeholders(forms.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let conversation_ids = stmt
                .query_map(params_from_iter(forms.iter()), |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut summaries = Vec::new();
            for raw in conversation_ids {
                let conversation_id: Uuid = raw.parse().map_err(|e| {
                    StoreError::Internal(format!("corrupt conversation id '{raw}': {e}"))
                })?;
                let unread = unread_rows(
                    conn,
                    &forms,
                    Some(&conversation_id),
                    Some(CANDIDATES_PER_CONVERSATION),
                )?;
                let Some(latest) = unread.first() else {
                    continue;
                };

                let conv = load_conversation(conn, &conversation_id)?;
                let message_id: Uuid = latest.id.parse().map_err(|e| {
                    StoreError::Internal(format!("corrupt message id '{}': {e}", latest.id))
                })?;

                summaries.push(NotificationSummary {
                    id: format!("{conversation_id}_{message_id}"),
                    conversation_id,
                    conversation_name: conv.name_for(identity),
                    sender_name: latest.sender_name.clone(),
                    snippet: snippet(&latest.body),
                    timestamp: crate::models::parse_ts(&latest.created_at),
                    unread_count: unread.len(),
                    message_id,
                });
            }

            summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            Ok(summaries)
        })
    }
}

fn snippet(body: &str) -> String {
    if body.chars().count() <= SNIPPET_CHARS {
        body.to_string()
    } else {
        let truncated: String = body.chars().take(SNIPPET_CHARS).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_types::models::MessageKind;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn offline_recipient_sees_one_summary_until_read() {
        let db = db();
        let p1 = Identity::new("1");
        let p2 = Identity::new("2");
        let conv = db.create_direct(&p1, "Petro", &p2, "Olena").unwrap();

        // P1 sends while P2 is disconnected.
        db.append_message(conv.id, &p1, "Petro", "hello", MessageKind::Text, None)
            .unwrap();

        let summaries = db.compute_notifications(&p2, None).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread_count, 1);
        assert_eq!(summaries[0].snippet, "hello");
        assert_eq!(summaries[0].sender_name, "Petro");
        // Direct conversation names resolve to the other participant.
        assert_eq!(summaries[0].conversation_name, "Petro");

        // P2 reconnects and marks the conversation read.
        db.mark_all_read(conv.id, &p2).unwrap();
        assert!(db.compute_notifications(&p2, None).unwrap().is_empty());
    }

    #[test]
    fn summaries_sort_newest_first_across_conversations() {
        let db = db();
        let me = Identity::new("1");
        let x = Identity::new("2");
        let y = Identity::new("3");
        let first = db.create_direct(&me, "Me", &x, "X").unwrap();
        let second = db.create_direct(&me, "Me", &y, "Y").unwrap();

        db.append_message(first.id, &x, "X", "earlier", MessageKind::Text, None)
            .unwrap();
        db.append_message(second.id, &y, "Y", "later", MessageKind::Text, None)
            .unwrap();

        let summaries = db.compute_notifications(&me, None).unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(summaries[0].timestamp >= summaries[1].timestamp);
        assert_eq!(summaries[0].conversation_id, second.id);
    }

    #[test]
    fn unread_count_is_capped_by_the_candidate_window() {
        let db = db();
        let me = Identity::new("1");
        let peer = Identity::new("2");
        let conv = db.create_direct(&me, "Me", &peer, "Peer").unwrap();

        for i in 0..15 {
            db.append_message(conv.id, &peer, "Peer", &format!("m{i}"), MessageKind::Text, None)
                .unwrap();
        }

        let summaries = db.compute_notifications(&me, None).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread_count, 10);
        assert_eq!(summaries[0].snippet, "m14");
    }

    #[test]
    fn long_bodies_are_truncated_with_an_ellipsis() {
        let db = db();
        let me = Identity::new("1");
        let peer = Identity::new("2");
        let conv = db.create_direct(&me, "Me", &peer, "Peer").unwrap();

        let long = "x".repeat(150);
        db.append_message(conv.id, &peer, "Peer", &long, MessageKind::Text, None)
            .unwrap();

        let summaries = db.compute_notifications(&me, None).unwrap();
        assert_eq!(summaries[0].snippet.chars().count(), 103);
        assert!(summaries[0].snippet.ends_with("..."));
    }

    #[test]
    fn no_participation_means_an_empty_success() {
        let db = db();
        let summaries = db
            .compute_notifications(&Identity::new("nobody"), None)
            .unwrap();
        assert!(summaries.is_empty());
    }
}
