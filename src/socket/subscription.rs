#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bon::Builder;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::types::response::ErrorNotice;
use crate::topic;
use crate::ws::connection::Command;

/// Receives `(payload, topic)` for every frame whose topic matches the pattern.
pub type Handler = Arc<dyn Fn(&Value, &str) + Send + Sync>;
/// Receives the snapshot array carried by an `init` frame.
pub type InitHandler = Arc<dyn Fn(&[Value], &str) + Send + Sync>;
/// Receives `{code, detail}` error notices.
pub type ErrorHandler = Arc<dyn Fn(&ErrorNotice) + Send + Sync>;

/// The callbacks attached to one subscription.
///
/// ```
/// use std::sync::Arc;
///
/// use serde_json::Value;
/// use topic_socket::socket::Listener;
///
/// let listener = Listener::builder()
///     .on_message(Arc::new(|data: &Value, topic: &str| println!("{topic}: {data}")))
///     .on_init(Arc::new(|snapshot: &[Value], _topic: &str| println!("{} items", snapshot.len())))
///     .build();
/// # let _ = listener;
/// ```
#[non_exhaustive]
#[derive(Clone, Builder)]
pub struct Listener {
    pub on_message: Handler,
    /// Receives notices published on `{pattern}.err`
    pub on_error: Option<ErrorHandler>,
    pub on_init: Option<InitHandler>,
}

impl Listener {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        Self {
            on_message: Arc::new(handler),
            on_error: None,
            on_init: None,
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("on_error", &self.on_error.is_some())
            .field("on_init", &self.on_init.is_some())
            .finish_non_exhaustive()
    }
}

/// Reserved routes handled by the connection itself rather than by user code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Control {
    ForcedDisconnect,
    ErrorNotice,
    ChannelAnnounce,
    ChannelReply { topic: String },
    ChannelData { id: String },
    ChannelError { id: String },
    ChannelClose { id: String },
}

#[derive(Clone)]
pub(crate) enum Delivery {
    Handler {
        handler: Handler,
        init: Option<InitHandler>,
    },
    Control(Control),
}

#[derive(Clone)]
pub(crate) struct SubscriptionRecord {
    pub(crate) id: Uuid,
    pub(crate) pattern: String,
    pub(crate) delivery: Delivery,
    /// Record whose removal also removes this one
    owner: Option<Uuid>,
}

impl SubscriptionRecord {
    pub(crate) fn handler(pattern: &str, handler: Handler, init: Option<InitHandler>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pattern: pattern.to_owned(),
            delivery: Delivery::Handler { handler, init },
            owner: None,
        }
    }

    /// Tie this record's lifetime to the record `owner`.
    pub(crate) fn owned_by(mut self, owner: Uuid) -> Self {
        self.owner = Some(owner);
        self
    }

    pub(crate) fn control(pattern: &str, control: Control) -> Self {
        Self {
            id: Uuid::new_v4(),
            pattern: pattern.to_owned(),
            delivery: Delivery::Control(control),
            owner: None,
        }
    }

    fn is_handler(&self) -> bool {
        matches!(self.delivery, Delivery::Handler { .. })
    }
}

struct PatternEntry {
    pattern: String,
    records: Vec<SubscriptionRecord>,
}

/// Pattern-keyed handler records in insertion order.
///
/// The registry only answers whether a pattern gained its first record or lost its
/// last one; the connection turns those transitions into wire frames.
#[derive(Default)]
pub(crate) struct Registry {
    entries: Vec<PatternEntry>,
}

impl Registry {
    /// Add a record. Returns `true` when it is the first record for its pattern.
    pub(crate) fn insert(&mut self, record: SubscriptionRecord) -> bool {
        if let Some(entry) = self.entry_mut(&record.pattern) {
            entry.records.push(record);
            return false;
        }

        self.entries.push(PatternEntry {
            pattern: record.pattern.clone(),
            records: vec![record],
        });
        true
    }

    /// Remove the record with `id` and the records it owns.
    ///
    /// Returns the patterns left without records.
    pub(crate) fn remove_id(&mut self, id: Uuid) -> Vec<String> {
        let Some(position) = self
            .entries
            .iter()
            .position(|entry| entry.records.iter().any(|record| record.id == id))
        else {
            return Vec::new();
        };

        self.entries[position].records.retain(|record| record.id != id);
        let mut emptied: Vec<String> = self.prune(position).into_iter().collect();
        emptied.extend(self.remove_owned(&[id]));
        emptied
    }

    /// Remove `handler` from `pattern`, or every handler on `pattern` when `None`,
    /// together with the records they own.
    ///
    /// Reserved control records are left in place. Returns the patterns left without
    /// records.
    pub(crate) fn remove_handler(&mut self, pattern: &str, handler: Option<&Handler>) -> Vec<String> {
        let Some(position) = self.position(pattern) else {
            return Vec::new();
        };

        let entry = &mut self.entries[position];
        let removed: Vec<Uuid> = match handler {
            Some(target) => entry
                .records
                .iter()
                .position(|record| {
                    matches!(&record.delivery, Delivery::Handler { handler, .. } if same_handler(handler, target))
                })
                .map(|index| entry.records.remove(index).id)
                .into_iter()
                .collect(),
            None => {
                let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut entry.records)
                    .into_iter()
                    .partition(SubscriptionRecord::is_handler);
                entry.records = kept;
                removed.iter().map(|record| record.id).collect()
            }
        };

        let mut emptied: Vec<String> = self.prune(position).into_iter().collect();
        emptied.extend(self.remove_owned(&removed));
        emptied
    }

    fn remove_owned(&mut self, owners: &[Uuid]) -> Vec<String> {
        let mut emptied = Vec::new();
        if owners.is_empty() {
            return emptied;
        }

        self.entries.retain_mut(|entry| {
            entry
                .records
                .retain(|record| !record.owner.is_some_and(|owner| owners.contains(&owner)));
            if entry.records.is_empty() {
                emptied.push(entry.pattern.clone());
                false
            } else {
                true
            }
        });
        emptied
    }

    /// Remove every user handler. Returns the patterns left without records.
    pub(crate) fn clear_handlers(&mut self) -> Vec<String> {
        let mut emptied = Vec::new();
        self.entries.retain_mut(|entry| {
            entry.records.retain(|record| !record.is_handler());
            if entry.records.is_empty() {
                emptied.push(entry.pattern.clone());
                false
            } else {
                true
            }
        });
        emptied
    }

    pub(crate) fn contains_pattern(&self, pattern: &str) -> bool {
        self.position(pattern).is_some()
    }

    pub(crate) fn has_control(&self, pattern: &str, control: &Control) -> bool {
        self.position(pattern).is_some_and(|position| {
            self.entries[position]
                .records
                .iter()
                .any(|record| matches!(&record.delivery, Delivery::Control(c) if c == control))
        })
    }

    pub(crate) fn patterns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.pattern.as_str())
    }

    /// Records whose pattern matches `topic`, pattern by pattern in insertion order.
    pub(crate) fn matching<'a>(
        &'a self,
        topic: &'a str,
    ) -> impl Iterator<Item = &'a SubscriptionRecord> + 'a {
        self.entries
            .iter()
            .filter(move |entry| topic::matches(&entry.pattern, topic))
            .flat_map(|entry| entry.records.iter())
    }

    /// Number of user handler records.
    pub(crate) fn handler_count(&self) -> usize {
        self.entries
            .iter()
            .flat_map(|entry| entry.records.iter())
            .filter(|record| record.is_handler())
            .count()
    }

    fn position(&self, pattern: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.pattern == pattern)
    }

    fn entry_mut(&mut self, pattern: &str) -> Option<&mut PatternEntry> {
        self.entries.iter_mut().find(|entry| entry.pattern == pattern)
    }

    fn prune(&mut self, position: usize) -> Option<String> {
        if self.entries[position].records.is_empty() {
            Some(self.entries.remove(position).pattern)
        } else {
            None
        }
    }
}

fn same_handler(a: &Handler, b: &Handler) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[derive(Debug)]
pub(crate) enum Registration {
    Records(Vec<Uuid>),
    ChannelListener(Uuid),
}

/// Handle returned by subscribe calls.
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to remove it. Unsubscribing more than once is a no-op.
#[derive(Debug)]
pub struct Subscription {
    pattern: String,
    registration: Registration,
    commands: mpsc::UnboundedSender<Command>,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(
        pattern: &str,
        registration: Registration,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            pattern: pattern.to_owned(),
            registration,
            commands,
            active: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }

        let command = match &self.registration {
            Registration::Records(ids) => Command::RemoveRecords(ids.clone()),
            Registration::ChannelListener(id) => Command::UnregisterChannelOpen(*id),
        };
        // The connection may already be gone, in which case there is nothing to remove
        _ = self.commands.send(command);
    }
}

/// Unsubscribes the wrapped subscription when dropped.
#[derive(Debug)]
pub(crate) struct UnsubscribeOnDrop(Subscription);

impl UnsubscribeOnDrop {
    pub(crate) fn new(subscription: Subscription) -> Self {
        Self(subscription)
    }
}

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}
