//! Convergence: reconciling areas of interest with subscriptions.
//!
//! Once per tick the connector walks its areas of interest and compares each
//! against the live subscription map, enqueueing the subscribe, unsubscribe
//! or filter-update request that moves reality toward the declaration.
//! Convergence is idempotent: a request already pending or in flight yields
//! [`ConvergeAction::InProgress`] rather than a duplicate.

use crate::cache::CacheService;
use crate::connector::{Connector, ConnectorState};
use crate::error::{ClientError, ClientResult};
use crate::events::ClientEvent;
use crate::interest::AreaOfInterestStatus;
use crate::request::{AoiAction, AreaOfInterestRequest};
use crate::transport::Transport;
use replicant_protocol::{ChannelAddress, ChannelSchema, FilterType};
use tracing::warn;

/// Outcome of converging one area of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergeAction {
    /// A subscribe request was enqueued.
    SubmittedAdd,
    /// A filter-update request was enqueued.
    SubmittedUpdate,
    /// An unsubscribe request was enqueued; the fresh subscribe follows on a
    /// later pass, once the removal lands.
    SubmittedRemove,
    /// A matching request is already pending or in flight.
    InProgress,
    /// Reality already matches the declaration.
    NoAction,
    /// The area no longer exists; stop converging it.
    Terminate,
}

/// Returns true if `candidate` can ride in the same bulk request as the
/// group leader: same action, same channel id and address shape (both
/// instances or both plain channels), same filter (removes ignore filters)
/// and bulk support on the channel for that action.
pub(crate) fn can_group(
    leader: &AreaOfInterestRequest,
    candidate: &AreaOfInterestRequest,
    schema: &ChannelSchema,
) -> bool {
    if leader.action != candidate.action {
        return false;
    }
    if leader.address.channel_id != candidate.address.channel_id
        || leader.address.sub_channel_id.is_some() != candidate.address.sub_channel_id.is_some()
    {
        return false;
    }
    let bulk_supported = match leader.action {
        AoiAction::Add => schema.bulk_load_supported,
        AoiAction::Update => schema.bulk_update_supported,
        AoiAction::Remove => true,
    };
    if !bulk_supported {
        return false;
    }
    leader.action == AoiAction::Remove || leader.filter == candidate.filter
}

impl<T: Transport, C: CacheService> Connector<T, C> {
    /// Runs one convergence pass: sweeps released areas, converges each
    /// remaining area and unsubscribes orphaned explicit subscriptions.
    pub(crate) fn converge(&mut self) -> ClientResult<()> {
        if self.state != ConnectorState::Connected || self.connection.is_none() {
            return Ok(());
        }
        self.interests.sweep();
        for address in self.interests.addresses() {
            self.converge_area_of_interest(&address)?;
        }
        self.remove_orphan_subscriptions();
        Ok(())
    }

    /// Converges a single area of interest against the subscription map.
    pub(crate) fn converge_area_of_interest(
        &mut self,
        address: &ChannelAddress,
    ) -> ClientResult<ConvergeAction> {
        let (filter, disposed) = match self.interests.get(address) {
            Some(area) => (area.filter.clone(), area.is_disposed()),
            None => return Ok(ConvergeAction::Terminate),
        };
        if disposed {
            return Err(ClientError::AreaOfInterestDisposed { address: *address });
        }
        let Some(connection) = self.connection.as_ref() else {
            return Ok(ConvergeAction::NoAction);
        };
        if connection.is_aoi_request_pending(address, AoiAction::Add, &filter)
            || connection.is_aoi_request_pending(address, AoiAction::Update, &filter)
            || connection.is_aoi_action_pending(address, AoiAction::Remove)
        {
            return Ok(ConvergeAction::InProgress);
        }

        let schema = self
            .context
            .registry()
            .channel(self.system_id, address.channel_id)?;
        if filter.is_some() && !schema.filtered() {
            return Err(ClientError::UnexpectedFilter { address: *address });
        }
        let filter_type = schema.filter_type;

        match self.subscriptions.get(address) {
            None => {
                if let Some(connection) = self.connection.as_mut() {
                    connection.enqueue_aoi_request(AreaOfInterestRequest::new(
                        *address,
                        AoiAction::Add,
                        filter,
                    ));
                }
                if let Some(area) = self.interests.get_mut(address) {
                    area.status = AreaOfInterestStatus::Loading;
                }
                Ok(ConvergeAction::SubmittedAdd)
            }
            Some(subscription) if subscription.filter == filter => {
                if let Some(area) = self.interests.get_mut(address) {
                    match area.status {
                        AreaOfInterestStatus::NotAsked | AreaOfInterestStatus::Loading => {
                            area.status = AreaOfInterestStatus::Loaded;
                        }
                        AreaOfInterestStatus::Updating => {
                            area.status = AreaOfInterestStatus::Updated;
                        }
                        _ => {}
                    }
                }
                Ok(ConvergeAction::NoAction)
            }
            Some(subscription) => match filter_type {
                FilterType::Dynamic => {
                    if !subscription.explicit {
                        // Implicit subscriptions are owned by the server's
                        // link graph; the client must not refilter them.
                        return Err(ClientError::FilterUpdateUnsupported { address: *address });
                    }
                    if let Some(connection) = self.connection.as_mut() {
                        connection.enqueue_aoi_request(AreaOfInterestRequest::new(
                            *address,
                            AoiAction::Update,
                            filter,
                        ));
                    }
                    if let Some(area) = self.interests.get_mut(address) {
                        area.status = AreaOfInterestStatus::Updating;
                    }
                    Ok(ConvergeAction::SubmittedUpdate)
                }
                FilterType::Static => {
                    if let Some(connection) = self.connection.as_mut() {
                        connection.enqueue_aoi_request(AreaOfInterestRequest::new(
                            *address,
                            AoiAction::Remove,
                            None,
                        ));
                    }
                    if let Some(area) = self.interests.get_mut(address) {
                        area.status = AreaOfInterestStatus::Unloading;
                    }
                    Ok(ConvergeAction::SubmittedRemove)
                }
                FilterType::None => Err(ClientError::UnexpectedFilter { address: *address }),
            },
        }
    }

    /// Unsubscribes every explicit subscription with no backing area of
    /// interest. Idempotent: a subscription with an unsubscribe already
    /// pending is skipped.
    pub(crate) fn remove_orphan_subscriptions(&mut self) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        let mut orphans = Vec::new();
        for subscription in self.subscriptions.iter() {
            if !subscription.explicit {
                continue;
            }
            if self.interests.get(&subscription.address).is_some() {
                continue;
            }
            if connection.is_aoi_action_pending(&subscription.address, AoiAction::Remove) {
                continue;
            }
            orphans.push(subscription.address);
        }
        for address in orphans {
            warn!(%address, "unsubscribing orphaned subscription");
            self.events.emit(ClientEvent::SubscriptionOrphaned { address });
            if let Some(connection) = self.connection.as_mut() {
                connection.enqueue_aoi_request(AreaOfInterestRequest::new(
                    address,
                    AoiAction::Remove,
                    None,
                ));
            }
        }
    }
}
