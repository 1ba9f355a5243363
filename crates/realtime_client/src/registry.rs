use std::collections::HashMap;

use shared::domain::{ChannelTarget, ThreadId};

use crate::dispatch::ThreadCallbacks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    /// Waiting on `broadcasting/auth`.
    Authorizing,
    /// `pusher:subscribe` sent, broker has not confirmed yet.
    Subscribing,
    Joined,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ChannelSubscription {
    pub seq: u64,
    pub target: ChannelTarget,
    pub callbacks: ThreadCallbacks,
    pub state: JoinState,
}

impl ChannelSubscription {
    pub fn joined(&self) -> bool {
        self.state == JoinState::Joined
    }

    /// Whether the broker has been asked for this channel and needs an
    /// explicit `pusher:unsubscribe` to leave it.
    pub fn subscribe_sent(&self) -> bool {
        matches!(self.state, JoinState::Subscribing | JoinState::Joined)
    }
}

#[derive(Debug, Clone)]
pub struct PendingSubscription {
    pub seq: u64,
    pub thread_id: ThreadId,
    pub callbacks: ThreadCallbacks,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub channel: String,
    pub seq: u64,
}

#[derive(Debug, Default)]
pub struct Removal {
    pub cancelled_pending: bool,
    pub channel: Option<(String, ChannelSubscription)>,
}

impl Removal {
    pub fn removed_anything(&self) -> bool {
        self.cancelled_pending || self.channel.is_some()
    }
}

/// Pending queue plus active channel map. A thread lives in at most one of
/// the two at any time; `seq` records registration order.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    next_seq: u64,
    pending: Vec<PendingSubscription>,
    channels: HashMap<String, ChannelSubscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, thread_id: &ThreadId) -> bool {
        self.pending.iter().any(|entry| &entry.thread_id == thread_id)
    }

    pub fn channel(&self, channel: &str) -> Option<&ChannelSubscription> {
        self.channels.get(channel)
    }

    pub fn thread_channel(&self, thread_id: &ThreadId) -> Option<&ChannelSubscription> {
        self.channels
            .get(&ChannelTarget::Thread(thread_id.clone()).channel_name())
    }

    pub fn pending_threads(&self) -> Vec<ThreadId> {
        self.pending
            .iter()
            .map(|entry| entry.thread_id.clone())
            .collect()
    }

    /// Channel names ordered by registration.
    pub fn active_channels(&self) -> Vec<String> {
        let mut active: Vec<(&String, u64)> = self
            .channels
            .iter()
            .map(|(name, subscription)| (name, subscription.seq))
            .collect();
        active.sort_by_key(|(_, seq)| *seq);
        active.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// Returns false when the thread is already pending or active.
    pub fn queue(&mut self, thread_id: ThreadId, callbacks: ThreadCallbacks) -> bool {
        if self.is_pending(&thread_id) || self.thread_channel(&thread_id).is_some() {
            return false;
        }
        let seq = self.allocate_seq();
        self.pending.push(PendingSubscription {
            seq,
            thread_id,
            callbacks,
        });
        true
    }

    /// Creates a channel entry in `Authorizing`. Returns `None` when the
    /// channel (or, for threads, a pending entry) already exists.
    pub fn activate(
        &mut self,
        target: ChannelTarget,
        callbacks: ThreadCallbacks,
    ) -> Option<JoinRequest> {
        if let ChannelTarget::Thread(thread_id) = &target {
            if self.is_pending(thread_id) {
                return None;
            }
        }
        let seq = self.allocate_seq();
        self.insert_channel(seq, target, callbacks)
    }

    /// Re-arms a failed thread channel with fresh callbacks.
    pub fn retry_failed(
        &mut self,
        thread_id: &ThreadId,
        callbacks: ThreadCallbacks,
    ) -> Option<JoinRequest> {
        let channel = ChannelTarget::Thread(thread_id.clone()).channel_name();
        let subscription = self.channels.get_mut(&channel)?;
        if subscription.state != JoinState::Failed {
            return None;
        }
        subscription.state = JoinState::Authorizing;
        subscription.callbacks = callbacks;
        Some(JoinRequest {
            channel,
            seq: subscription.seq,
        })
    }

    /// Moves every pending entry into the channel map, in registration order.
    pub fn flush_pending(&mut self) -> Vec<JoinRequest> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .filter_map(|entry| {
                self.insert_channel(
                    entry.seq,
                    ChannelTarget::Thread(entry.thread_id),
                    entry.callbacks,
                )
            })
            .collect()
    }

    pub fn remove_thread(&mut self, thread_id: &ThreadId) -> Removal {
        let before = self.pending.len();
        self.pending.retain(|entry| &entry.thread_id != thread_id);
        let channel_name = ChannelTarget::Thread(thread_id.clone()).channel_name();
        Removal {
            cancelled_pending: self.pending.len() != before,
            channel: self
                .channels
                .remove(&channel_name)
                .map(|subscription| (channel_name, subscription)),
        }
    }

    /// `Authorizing` → `Subscribing`, only for the attempt identified by `seq`.
    pub fn begin_subscribe(&mut self, channel: &str, seq: u64) -> bool {
        self.advance(channel, seq, JoinState::Subscribing)
    }

    /// `Authorizing` → `Failed`, only for the attempt identified by `seq`.
    pub fn fail_authorization(&mut self, channel: &str, seq: u64) -> bool {
        self.advance(channel, seq, JoinState::Failed)
    }

    pub fn mark_joined(&mut self, channel: &str) -> bool {
        match self.channels.get_mut(channel) {
            Some(subscription) if subscription.state == JoinState::Subscribing => {
                subscription.state = JoinState::Joined;
                true
            }
            _ => false,
        }
    }

    pub fn mark_rejected(&mut self, channel: &str) -> bool {
        match self.channels.get_mut(channel) {
            Some(subscription) if subscription.state != JoinState::Failed => {
                subscription.state = JoinState::Failed;
                true
            }
            _ => false,
        }
    }

    /// Target and handlers of a joined channel; events for channels that are
    /// not joined yet are not delivered.
    pub fn dispatch_target(&self, channel: &str) -> Option<(ChannelTarget, ThreadCallbacks)> {
        self.channels
            .get(channel)
            .filter(|subscription| subscription.joined())
            .map(|subscription| (subscription.target.clone(), subscription.callbacks.clone()))
    }

    /// On connection loss: thread channels go back to the pending queue
    /// (keeping their registration order), user channels are dropped and get
    /// re-created by the next flush.
    pub fn requeue_active(&mut self) -> usize {
        let mut requeued = 0;
        for (_, subscription) in self.channels.drain() {
            if let ChannelTarget::Thread(thread_id) = subscription.target {
                self.pending.push(PendingSubscription {
                    seq: subscription.seq,
                    thread_id,
                    callbacks: subscription.callbacks,
                });
                requeued += 1;
            }
        }
        self.pending.sort_by_key(|entry| entry.seq);
        requeued
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.channels.clear();
    }

    fn advance(&mut self, channel: &str, seq: u64, next: JoinState) -> bool {
        match self.channels.get_mut(channel) {
            Some(subscription)
                if subscription.seq == seq && subscription.state == JoinState::Authorizing =>
            {
                subscription.state = next;
                true
            }
            _ => false,
        }
    }

    fn insert_channel(
        &mut self,
        seq: u64,
        target: ChannelTarget,
        callbacks: ThreadCallbacks,
    ) -> Option<JoinRequest> {
        let channel = target.channel_name();
        if self.channels.contains_key(&channel) {
            return None;
        }
        self.channels.insert(
            channel.clone(),
            ChannelSubscription {
                seq,
                target,
                callbacks,
                state: JoinState::Authorizing,
            },
        );
        Some(JoinRequest { channel, seq })
    }

    fn allocate_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
