//! The ordered, duplicate-free list of messages shown for one channel.
use std::collections::{HashMap, HashSet};

use chrono::{FixedOffset, NaiveDate};
use thiserror::Error;
use tracing::{debug, warn};

use palaver_types::models::{ChannelId, Message, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimelineError {
    #[error("timeline is already seeded")]
    AlreadySeeded,

    #[error("page overlaps the loaded timeline at {0}")]
    Overlap(MessageId),

    #[error("page is not strictly ascending at {0}")]
    Unordered(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Already present; nothing changed.
    Duplicate,
    /// Older than the newest loaded message; dropped.
    OutOfOrder,
}

/// Ticket for one speculative reaction, handed back when it settles.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionUndo {
    pub message_id: MessageId,
    pub emoji: String,
    pub user_id: UserId,
    generation: u64,
}

/// Counter of one emoji on one message while speculative reactions to it are
/// unsettled. The shown count is `confirmed + in_flight`.
#[derive(Debug, Clone, Copy)]
struct PendingCount {
    confirmed: u64,
    in_flight: u64,
}

/// A user's emoji on one message while their speculative reactions to it
/// are unsettled. The newest unsettled one is shown, else the confirmed one.
#[derive(Debug, Clone)]
struct PendingChoice {
    confirmed: Option<String>,
    confirmed_generation: u64,
    in_flight: Vec<(u64, String)>,
}

impl PendingChoice {
    fn shown(&self) -> Option<&String> {
        self.in_flight.last().map(|(_, emoji)| emoji).or(self.confirmed.as_ref())
    }
}

#[derive(Debug, Clone)]
pub struct Timeline {
    channel_id: ChannelId,
    is_group: bool,
    local_user: Option<UserId>,
    offset: FixedOffset,
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    seeded: bool,
    pending_counts: HashMap<(MessageId, String), PendingCount>,
    pending_choices: HashMap<(MessageId, UserId), PendingChoice>,
    next_generation: u64,
}

impl Timeline {
    pub fn new(channel_id: ChannelId, is_group: bool, local_user: Option<UserId>, offset: FixedOffset) -> Self {
        Self {
            channel_id,
            is_group,
            local_user,
            offset,
            messages: Vec::new(),
            ids: HashSet::new(),
            seeded: false,
            pending_counts: HashMap::new(),
            pending_choices: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn position(&self, id: &MessageId) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        self.messages.binary_search_by(|m| m.id.cmp(id)).ok()
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.position(id).map(|i| &self.messages[i])
    }

    pub fn newest_id(&self) -> Option<&MessageId> {
        self.messages.last().map(|m| &m.id)
    }

    pub fn oldest_id(&self) -> Option<&MessageId> {
        self.messages.first().map(|m| &m.id)
    }

    // -- Mutations --

    /// Install the initial page. Only valid once, on an empty timeline.
    pub fn seed(&mut self, page: Vec<Message>) -> Result<(), TimelineError> {
        if self.seeded || !self.messages.is_empty() {
            return Err(TimelineError::AlreadySeeded);
        }
        check_ascending(&page)?;
        self.ids = page.iter().map(|m| m.id.clone()).collect();
        self.messages = page;
        self.seeded = true;
        debug!("Seeded {} with {} messages", self.channel_id, self.messages.len());
        Ok(())
    }

    /// Insert an older page in front. The whole page is rejected if any id is
    /// already loaded or not older than the oldest loaded message.
    pub fn prepend(&mut self, page: Vec<Message>) -> Result<usize, TimelineError> {
        check_ascending(&page)?;
        if let Some(clash) = page.iter().find(|m| self.ids.contains(&m.id)) {
            return Err(TimelineError::Overlap(clash.id.clone()));
        }
        if let (Some(newest_in_page), Some(oldest)) = (page.last(), self.oldest_id()) {
            if &newest_in_page.id >= oldest {
                return Err(TimelineError::Overlap(newest_in_page.id.clone()));
            }
        }

        let added = page.len();
        self.ids.extend(page.iter().map(|m| m.id.clone()));
        self.messages.splice(0..0, page);
        Ok(added)
    }

    pub fn append_live(&mut self, message: Message) -> AppendOutcome {
        if self.ids.contains(&message.id) {
            return AppendOutcome::Duplicate;
        }
        if let Some(newest) = self.newest_id() {
            if &message.id < newest {
                warn!(
                    "Dropping out-of-order live message {} in {} (newest is {})",
                    message.id, self.channel_id, newest
                );
                return AppendOutcome::OutOfOrder;
            }
        }
        self.ids.insert(message.id.clone());
        self.messages.push(message);
        AppendOutcome::Appended
    }

    /// Record a confirmed reaction: the counter takes the store's value and
    /// the user's choice is overwritten. A previously chosen emoji keeps its
    /// count. Returns false when the message is not loaded.
    pub fn apply_reaction_delta(&mut self, message_id: &MessageId, emoji: &str, user_id: &UserId, new_count: u64) -> bool {
        let Some(index) = self.position(message_id) else {
            return false;
        };
        let message = &mut self.messages[index];
        message.reactions.insert(emoji.to_string(), new_count);
        message.user_reactions.insert(user_id.clone(), emoji.to_string());
        true
    }

    /// Optimistically count a reaction before the store confirms it.
    pub fn apply_speculative_reaction(&mut self, message_id: &MessageId, emoji: &str, user_id: &UserId) -> Option<ReactionUndo> {
        let index = self.position(message_id)?;
        let message = &mut self.messages[index];
        self.next_generation += 1;
        let generation = self.next_generation;

        let count = self
            .pending_counts
            .entry((message_id.clone(), emoji.to_string()))
            .or_insert(PendingCount {
                confirmed: message.reaction_count(emoji),
                in_flight: 0,
            });
        count.in_flight += 1;
        message.reactions.insert(emoji.to_string(), count.confirmed + count.in_flight);

        self.pending_choices
            .entry((message_id.clone(), user_id.clone()))
            .or_insert_with(|| PendingChoice {
                confirmed: message.user_reactions.get(user_id).cloned(),
                confirmed_generation: 0,
                in_flight: Vec::new(),
            })
            .in_flight
            .push((generation, emoji.to_string()));
        message.user_reactions.insert(user_id.clone(), emoji.to_string());

        Some(ReactionUndo {
            message_id: message_id.clone(),
            emoji: emoji.to_string(),
            user_id: user_id.clone(),
            generation,
        })
    }

    /// Settle a speculative reaction the store counted. The counter shows the
    /// highest count the store has reported plus whatever is still in
    /// flight, and the user's newest reaction stays shown.
    pub fn confirm_reaction(&mut self, undo: &ReactionUndo, new_count: u64) {
        self.settle_reaction(undo, Some(new_count));
    }

    /// Take back a speculative reaction the store did not count. Only this
    /// reaction's own increment is removed, so confirmations that arrived
    /// meanwhile are kept.
    pub fn revert_reaction(&mut self, undo: ReactionUndo) {
        self.settle_reaction(&undo, None);
    }

    fn settle_reaction(&mut self, undo: &ReactionUndo, new_count: Option<u64>) {
        let Some(index) = self.position(&undo.message_id) else {
            return;
        };
        let count_key = (undo.message_id.clone(), undo.emoji.clone());
        let count = match self.pending_counts.remove(&count_key) {
            Some(mut pending) => {
                pending.in_flight = pending.in_flight.saturating_sub(1);
                if let Some(new_count) = new_count {
                    pending.confirmed = pending.confirmed.max(new_count);
                }
                if pending.in_flight > 0 {
                    self.pending_counts.insert(count_key, pending);
                }
                Some(pending.confirmed + pending.in_flight)
            }
            None => new_count,
        };

        let choice_key = (undo.message_id.clone(), undo.user_id.clone());
        let choice = self.pending_choices.remove(&choice_key).map(|mut pending| {
            pending.in_flight.retain(|(generation, _)| *generation != undo.generation);
            if new_count.is_some() && undo.generation > pending.confirmed_generation {
                pending.confirmed = Some(undo.emoji.clone());
                pending.confirmed_generation = undo.generation;
            }
            let shown = pending.shown().cloned();
            if !pending.in_flight.is_empty() {
                self.pending_choices.insert(choice_key, pending);
            }
            shown
        });

        match count {
            Some(0) => {
                self.messages[index].reactions.remove(&undo.emoji);
            }
            Some(count) if choice == Some(Some(undo.emoji.clone())) => {
                self.apply_reaction_delta(&undo.message_id, &undo.emoji, &undo.user_id, count);
                return;
            }
            Some(count) => {
                self.messages[index].reactions.insert(undo.emoji.clone(), count);
            }
            None => {}
        }
        let user_reactions = &mut self.messages[index].user_reactions;
        match choice {
            Some(Some(emoji)) => user_reactions.insert(undo.user_id.clone(), emoji),
            Some(None) => user_reactions.remove(&undo.user_id),
            None => None,
        };
    }

    // -- Presentation queries --

    /// Whether the message at `index` starts a new calendar day. The first
    /// message always does.
    pub fn is_new_day(&self, index: usize) -> bool {
        let Some(message) = self.messages.get(index) else {
            return false;
        };
        if index == 0 {
            return true;
        }
        self.day_of(&self.messages[index - 1]) != self.day_of(message)
    }

    /// Group channels label the first message of a run from the same
    /// sender, except the local user's own and admin events.
    pub fn show_sender_name(&self, index: usize) -> bool {
        let Some(message) = self.messages.get(index) else {
            return false;
        };
        if !self.is_group || message.kind.is_admin() || self.local_user.as_ref() == Some(&message.sender_id) {
            return false;
        }
        if index == 0 {
            return true;
        }
        let previous = &self.messages[index - 1];
        previous.sender_id != message.sender_id || previous.kind.is_admin() || self.is_new_day(index)
    }

    fn day_of(&self, message: &Message) -> NaiveDate {
        message.created_at.with_timezone(&self.offset).date_naive()
    }
}

fn check_ascending(page: &[Message]) -> Result<(), TimelineError> {
    match page.windows(2).find(|pair| pair[0].id >= pair[1].id) {
        Some(pair) => Err(TimelineError::Unordered(pair[1].id.clone())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use palaver_types::models::{AdminKind, Media, MessageKind};

    use super::*;

    fn msg(id: &str, sender: &str, hour: u32) -> Message {
        Message {
            id: MessageId::new(id),
            channel_id: ChannelId::new("c"),
            sender_id: UserId::new(sender),
            kind: MessageKind::Text,
            text: id.to_string(),
            media: Media::default(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(hour as i64),
            reactions: Default::default(),
            user_reactions: Default::default(),
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn timeline(group: bool) -> Timeline {
        Timeline::new(ChannelId::new("c"), group, Some(UserId::new("me")), utc())
    }

    fn ids(t: &Timeline) -> Vec<&str> {
        t.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn seed_then_prepend_keeps_order() {
        let mut t = timeline(false);
        t.seed(vec![msg("m6", "a", 6), msg("m7", "a", 7)]).unwrap();
        assert_eq!(t.prepend(vec![msg("m4", "a", 4), msg("m5", "a", 5)]).unwrap(), 2);
        assert_eq!(ids(&t), ["m4", "m5", "m6", "m7"]);
        assert_eq!(t.seed(vec![]), Err(TimelineError::AlreadySeeded));
    }

    #[test]
    fn overlapping_prepend_is_rejected_whole() {
        let mut t = timeline(false);
        t.seed(vec![msg("m5", "a", 5), msg("m6", "a", 6)]).unwrap();

        let err = t.prepend(vec![msg("m3", "a", 3), msg("m5", "a", 5)]).unwrap_err();
        assert_eq!(err, TimelineError::Overlap(MessageId::new("m5")));

        let err = t.prepend(vec![msg("m4", "a", 4), msg("m55", "a", 5)]).unwrap_err();
        assert_eq!(err, TimelineError::Overlap(MessageId::new("m55")));

        let err = t.prepend(vec![msg("m2", "a", 2), msg("m1", "a", 1)]).unwrap_err();
        assert_eq!(err, TimelineError::Unordered(MessageId::new("m1")));

        assert_eq!(ids(&t), ["m5", "m6"]);
    }

    #[test]
    fn live_appends_dedup_and_drop_out_of_order() {
        let mut t = timeline(false);
        t.seed(vec![msg("m2", "a", 2), msg("m4", "a", 4)]).unwrap();

        assert_eq!(t.append_live(msg("m4", "a", 4)), AppendOutcome::Duplicate);
        assert_eq!(t.append_live(msg("m3", "a", 3)), AppendOutcome::OutOfOrder);
        assert_eq!(t.append_live(msg("m5", "a", 5)), AppendOutcome::Appended);
        assert_eq!(t.append_live(msg("m2", "a", 2)), AppendOutcome::Duplicate);
        assert_eq!(ids(&t), ["m2", "m4", "m5"]);
    }

    #[test]
    fn switching_emoji_never_decrements() {
        let mut t = timeline(false);
        t.seed(vec![msg("m1", "a", 1)]).unwrap();
        let id = MessageId::new("m1");
        let u1 = UserId::new("u1");

        assert!(t.apply_reaction_delta(&id, "👍", &u1, 1));
        assert!(t.apply_reaction_delta(&id, "❤️", &u1, 1));

        let m = t.message(&id).unwrap();
        assert_eq!(m.reaction_count("👍"), 1, "old emoji keeps its count");
        assert_eq!(m.reaction_count("❤️"), 1);
        assert_eq!(m.user_reactions[&u1], "❤️");
        assert!(!t.apply_reaction_delta(&MessageId::new("nope"), "👍", &u1, 1));
    }

    #[test]
    fn speculative_reaction_reverts_exactly() {
        let mut t = timeline(false);
        let mut m = msg("m1", "a", 1);
        m.reactions.insert("👍".into(), 3);
        m.user_reactions.insert(UserId::new("u1"), "❤️".into());
        t.seed(vec![m.clone()]).unwrap();

        let undo = t
            .apply_speculative_reaction(&m.id, "👍", &UserId::new("u1"))
            .unwrap();
        assert_eq!(t.message(&m.id).unwrap().reaction_count("👍"), 4);

        t.revert_reaction(undo);
        assert_eq!(t.message(&m.id).unwrap(), &m);

        let undo = t
            .apply_speculative_reaction(&m.id, "🎉", &UserId::new("u2"))
            .unwrap();
        t.revert_reaction(undo);
        assert_eq!(t.message(&m.id).unwrap(), &m);
    }

    #[test]
    fn late_failure_keeps_newer_confirmation() {
        let mut t = timeline(true);
        let m = msg("m1", "a", 1);
        t.seed(vec![m.clone()]).unwrap();
        let (u1, u2) = (UserId::new("u1"), UserId::new("u2"));

        let first = t.apply_speculative_reaction(&m.id, "👍", &u1).unwrap();
        let second = t.apply_speculative_reaction(&m.id, "👍", &u2).unwrap();
        assert_eq!(t.message(&m.id).unwrap().reaction_count("👍"), 2);

        // The second commits first; the first then aborts.
        t.confirm_reaction(&second, 1);
        assert_eq!(t.message(&m.id).unwrap().reaction_count("👍"), 2, "first is still in flight");
        t.revert_reaction(first);

        let shown = t.message(&m.id).unwrap();
        assert_eq!(shown.reaction_count("👍"), 1);
        assert_eq!(shown.user_reactions.get(&u2).map(String::as_str), Some("👍"));
        assert!(!shown.user_reactions.contains_key(&u1));
    }

    #[test]
    fn confirmations_out_of_order_settle_on_the_highest_count() {
        let mut t = timeline(true);
        let m = msg("m1", "a", 1);
        t.seed(vec![m.clone()]).unwrap();

        let first = t.apply_speculative_reaction(&m.id, "🔥", &UserId::new("u1")).unwrap();
        let second = t.apply_speculative_reaction(&m.id, "🔥", &UserId::new("u2")).unwrap();
        t.confirm_reaction(&second, 2);
        t.confirm_reaction(&first, 1);
        assert_eq!(t.message(&m.id).unwrap().reaction_count("🔥"), 2);
    }

    #[test]
    fn reverting_an_older_choice_leaves_the_newer_one() {
        let mut t = timeline(false);
        let m = msg("m1", "a", 1);
        t.seed(vec![m.clone()]).unwrap();
        let me = UserId::new("me");

        let thumbs = t.apply_speculative_reaction(&m.id, "👍", &me).unwrap();
        let heart = t.apply_speculative_reaction(&m.id, "❤️", &me).unwrap();
        t.revert_reaction(thumbs);
        assert_eq!(t.message(&m.id).unwrap().user_reactions[&me], "❤️");
        assert_eq!(t.message(&m.id).unwrap().reaction_count("👍"), 0);

        t.revert_reaction(heart);
        assert_eq!(t.message(&m.id).unwrap(), &m);
    }

    #[test]
    fn day_boundaries_follow_the_offset() {
        // 20:00 and 23:00 UTC on March 1st, then 01:00 March 2nd
        let page = vec![msg("m1", "a", 20), msg("m2", "a", 23), msg("m3", "a", 25)];

        let mut t = timeline(false);
        t.seed(page.clone()).unwrap();
        assert!(t.is_new_day(0));
        assert!(!t.is_new_day(1));
        assert!(t.is_new_day(2));
        assert!(!t.is_new_day(3));

        // At UTC-05:00 all three fall on March 1st
        let mut shifted = Timeline::new(ChannelId::new("c"), false, None, FixedOffset::west_opt(5 * 3600).unwrap());
        shifted.seed(page).unwrap();
        assert!(!shifted.is_new_day(2));
    }

    #[test]
    fn sender_names_in_groups() {
        let mut t = timeline(true);
        let mut admin = msg("m0", "a", 0);
        admin.kind = MessageKind::Admin(AdminKind::MemberAdded);
        t.seed(vec![
            admin,
            msg("m1", "a", 1),
            msg("m2", "a", 2),
            msg("m3", "me", 3),
            msg("m4", "b", 4),
            msg("m5", "b", 30),
        ])
        .unwrap();

        assert!(!t.show_sender_name(0), "admin events never show a sender");
        assert!(t.show_sender_name(1), "first after an admin event");
        assert!(!t.show_sender_name(2), "same sender run");
        assert!(!t.show_sender_name(3), "local user");
        assert!(t.show_sender_name(4));
        assert!(t.show_sender_name(5), "after a day boundary");

        let mut direct = timeline(false);
        direct.seed(vec![msg("m1", "a", 1)]).unwrap();
        assert!(!direct.show_sender_name(0));
    }
}
