//! Areas of interest: declared desired subscription state.

use replicant_protocol::ChannelAddress;
use serde_json::Value;
use std::collections::BTreeMap;

/// Lifecycle status of an area of interest.
///
/// Statuses in `{Loaded, Updating, Updated, UpdateFailed, Unloading}` imply
/// a matching subscription exists; `Unloaded` implies none does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaOfInterestStatus {
    /// No action has been taken yet.
    NotAsked,
    /// A subscribe request is in flight.
    Loading,
    /// The subscription is established and current.
    Loaded,
    /// The subscribe request failed.
    LoadFailed,
    /// A filter-update request is in flight.
    Updating,
    /// The filter update completed.
    Updated,
    /// The filter update failed.
    UpdateFailed,
    /// An unsubscribe request is in flight.
    Unloading,
    /// The subscription was removed.
    Unloaded,
    /// The area has been disposed and must not be used.
    Deleted,
}

impl AreaOfInterestStatus {
    /// Returns true for failure statuses.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            AreaOfInterestStatus::LoadFailed | AreaOfInterestStatus::UpdateFailed
        )
    }
}

/// A declaration that the client wants a channel subscribed with a filter.
///
/// Independent of the actual subscription; the converger reconciles the two.
#[derive(Debug, Clone)]
pub struct AreaOfInterest {
    /// Target channel.
    pub address: ChannelAddress,
    /// Desired filter.
    pub filter: Option<Value>,
    /// Current lifecycle status.
    pub status: AreaOfInterestStatus,
    /// Description of the last failure, for error statuses.
    pub error: Option<String>,
    ref_count: u32,
    /// Convergence passes left before disposal once unreferenced.
    grace_remaining: Option<u32>,
}

impl AreaOfInterest {
    fn new(address: ChannelAddress, filter: Option<Value>) -> Self {
        Self {
            address,
            filter,
            status: AreaOfInterestStatus::NotAsked,
            error: None,
            ref_count: 1,
            grace_remaining: None,
        }
    }

    /// Returns the current reference count.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Returns true once the area has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.status == AreaOfInterestStatus::Deleted
    }

    /// Records a failure.
    pub(crate) fn fail(&mut self, status: AreaOfInterestStatus, error: String) {
        self.status = status;
        self.error = Some(error);
    }
}

/// The set of areas of interest for one connector, keyed by address.
#[derive(Debug, Default)]
pub struct AreaOfInterestService {
    areas: BTreeMap<ChannelAddress, AreaOfInterest>,
}

impl AreaOfInterestService {
    /// Creates an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert keyed by address: creates the area or updates its
    /// filter, and takes a reference either way. Re-acquiring an area that
    /// was waiting out its grace period cancels the disposal.
    pub fn create_or_update(
        &mut self,
        address: ChannelAddress,
        filter: Option<Value>,
    ) -> &AreaOfInterest {
        let area = self
            .areas
            .entry(address)
            .and_modify(|a| {
                a.filter = filter.clone();
                a.ref_count += 1;
                a.grace_remaining = None;
            })
            .or_insert_with(|| AreaOfInterest::new(address, filter));
        &*area
    }

    /// Releases one reference. When the count reaches zero the area enters
    /// its grace period; it is disposed by a later [`Self::sweep`] unless
    /// new interest arrives first.
    pub fn release(&mut self, address: &ChannelAddress, grace_passes: u32) {
        if let Some(area) = self.areas.get_mut(address) {
            area.ref_count = area.ref_count.saturating_sub(1);
            if area.ref_count == 0 {
                area.grace_remaining = Some(grace_passes);
            }
        }
    }

    /// Advances grace countdowns by one pass and disposes expired areas.
    /// Returns the disposed addresses.
    pub fn sweep(&mut self) -> Vec<ChannelAddress> {
        let mut expired = Vec::new();
        for (address, area) in self.areas.iter_mut() {
            if let Some(remaining) = area.grace_remaining {
                if remaining == 0 {
                    expired.push(*address);
                } else {
                    area.grace_remaining = Some(remaining - 1);
                }
            }
        }
        for address in &expired {
            if let Some(mut area) = self.areas.remove(address) {
                area.status = AreaOfInterestStatus::Deleted;
            }
        }
        expired
    }

    /// Looks up an area.
    pub fn get(&self, address: &ChannelAddress) -> Option<&AreaOfInterest> {
        self.areas.get(address)
    }

    pub(crate) fn get_mut(&mut self, address: &ChannelAddress) -> Option<&mut AreaOfInterest> {
        self.areas.get_mut(address)
    }

    /// Removes an area outright (subscription REMOVE action path).
    pub(crate) fn dispose(&mut self, address: &ChannelAddress) -> bool {
        self.areas.remove(address).is_some()
    }

    /// Iterates areas in address order.
    pub fn iter(&self) -> impl Iterator<Item = &AreaOfInterest> {
        self.areas.values()
    }

    /// Returns the addresses in address order.
    pub fn addresses(&self) -> Vec<ChannelAddress> {
        self.areas.keys().copied().collect()
    }

    /// Returns the number of live areas.
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    /// Returns true if no areas exist.
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}
