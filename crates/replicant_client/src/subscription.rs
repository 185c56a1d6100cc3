//! Client-side subscription records.

use crate::error::{ClientError, ClientResult};
use replicant_protocol::{ChannelAddress, EntityKey};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// One established channel subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// The subscribed channel.
    pub address: ChannelAddress,
    /// The filter in effect.
    pub filter: Option<Value>,
    /// True when the client asked for this subscription directly; false for
    /// subscriptions the server established implicitly via channel links.
    pub explicit: bool,
    /// Entities currently linked to this subscription.
    pub entities: HashSet<EntityKey>,
}

impl Subscription {
    fn new(address: ChannelAddress, filter: Option<Value>, explicit: bool) -> Self {
        Self {
            address,
            filter,
            explicit,
            entities: HashSet::new(),
        }
    }
}

/// The set of live subscriptions for one connection, keyed by address.
#[derive(Debug, Default)]
pub struct SubscriptionMap {
    subscriptions: BTreeMap<ChannelAddress, Subscription>,
}

impl SubscriptionMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new subscription. A second ADD for the same address is a
    /// protocol violation.
    pub fn create(
        &mut self,
        address: ChannelAddress,
        filter: Option<Value>,
        explicit: bool,
    ) -> ClientResult<&mut Subscription> {
        if self.subscriptions.contains_key(&address) {
            return Err(ClientError::DuplicateSubscription { address });
        }
        Ok(self
            .subscriptions
            .entry(address)
            .or_insert_with(|| Subscription::new(address, filter, explicit)))
    }

    /// Looks up a subscription.
    pub fn get(&self, address: &ChannelAddress) -> Option<&Subscription> {
        self.subscriptions.get(address)
    }

    /// Looks up a subscription mutably.
    pub fn get_mut(&mut self, address: &ChannelAddress) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(address)
    }

    /// Returns true if the channel is subscribed.
    pub fn contains(&self, address: &ChannelAddress) -> bool {
        self.subscriptions.contains_key(address)
    }

    /// Removes a subscription, returning it.
    pub fn remove(&mut self, address: &ChannelAddress) -> Option<Subscription> {
        self.subscriptions.remove(address)
    }

    /// Iterates subscriptions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    /// Returns the subscribed addresses in order.
    pub fn addresses(&self) -> Vec<ChannelAddress> {
        self.subscriptions.keys().copied().collect()
    }

    /// Returns the number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns true if no subscriptions exist.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Drops every subscription (connection disposal path).
    pub fn clear(&mut self) -> Vec<Subscription> {
        let drained: Vec<Subscription> = std::mem::take(&mut self.subscriptions)
            .into_values()
            .collect();
        drained
    }
}
