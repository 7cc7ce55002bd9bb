//! A venue gateway that records every call, tracks room membership, and
//! fails on demand.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::entities::{UserId, VenueId};
use crate::messaging::{GatewayError, MessageRef, VenueGateway};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    SendMessage { venue: VenueId, text: String },
    EditMessage { venue: VenueId, message: MessageRef, text: String },
    ApproveJoin { venue: VenueId, user: UserId },
    DeclineJoin { venue: VenueId, user: UserId },
    RemoveMember { venue: VenueId, user: UserId },
    RotateInvite { venue: VenueId },
    IsMember { venue: VenueId, user: UserId },
}

#[derive(Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<GatewayCall>>,
    members: Mutex<BTreeSet<(VenueId, UserId)>>,
    /// Failures queued per operation name, consumed one per call.
    failures: Mutex<HashMap<&'static str, VecDeque<GatewayError>>>,
    next_message: AtomicI64,
    invites_rotated: AtomicU64,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one failure for the next call to `op` ("send_message",
    /// "rotate_invite", "remove_member", ...).
    pub fn queue_failure(&self, op: &'static str, err: GatewayError) {
        self.lock_failures().entry(op).or_default().push_back(err);
    }

    /// Put a user in the room without going through a join request.
    pub fn join(&self, venue: VenueId, user: UserId) {
        self.lock_members().insert((venue, user));
    }

    /// Take a user out of the room, as if they left on their own.
    pub fn leave(&self, venue: VenueId, user: UserId) {
        self.lock_members().remove(&(venue, user));
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.lock_calls().clone()
    }

    /// Texts sent to `venue`, in order.
    pub fn sent_texts(&self, venue: VenueId) -> Vec<String> {
        self.lock_calls()
            .iter()
            .filter_map(|call| match call {
                GatewayCall::SendMessage { venue: v, text } if *v == venue => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<GatewayCall>> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_members(&self) -> MutexGuard<'_, BTreeSet<(VenueId, UserId)>> {
        self.members.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_failures(&self) -> MutexGuard<'_, HashMap<&'static str, VecDeque<GatewayError>>> {
        self.failures.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn take_failure(&self, op: &'static str) -> Option<GatewayError> {
        self.lock_failures().get_mut(op).and_then(VecDeque::pop_front)
    }

    fn record(&self, call: GatewayCall) {
        self.lock_calls().push(call);
    }
}

#[async_trait]
impl VenueGateway for RecordingGateway {
    async fn send_message(&self, venue: VenueId, text: &str) -> Result<MessageRef, GatewayError> {
        self.record(GatewayCall::SendMessage {
            venue,
            text: text.to_owned(),
        });
        if let Some(err) = self.take_failure("send_message") {
            return Err(err);
        }
        Ok(self.next_message.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn edit_message(
        &self,
        venue: VenueId,
        message: MessageRef,
        text: &str,
    ) -> Result<(), GatewayError> {
        self.record(GatewayCall::EditMessage {
            venue,
            message,
            text: text.to_owned(),
        });
        if let Some(err) = self.take_failure("edit_message") {
            return Err(err);
        }
        Ok(())
    }

    async fn approve_join(&self, venue: VenueId, user: UserId) -> Result<(), GatewayError> {
        self.record(GatewayCall::ApproveJoin { venue, user });
        if let Some(err) = self.take_failure("approve_join") {
            return Err(err);
        }
        self.lock_members().insert((venue, user));
        Ok(())
    }

    async fn decline_join(&self, venue: VenueId, user: UserId) -> Result<(), GatewayError> {
        self.record(GatewayCall::DeclineJoin { venue, user });
        if let Some(err) = self.take_failure("decline_join") {
            return Err(err);
        }
        Ok(())
    }

    async fn remove_member(&self, venue: VenueId, user: UserId) -> Result<(), GatewayError> {
        self.record(GatewayCall::RemoveMember { venue, user });
        if let Some(err) = self.take_failure("remove_member") {
            return Err(err);
        }
        self.lock_members().remove(&(venue, user));
        Ok(())
    }

    async fn rotate_invite(&self, venue: VenueId) -> Result<String, GatewayError> {
        self.record(GatewayCall::RotateInvite { venue });
        if let Some(err) = self.take_failure("rotate_invite") {
            return Err(err);
        }
        let n = self.invites_rotated.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("https://invite.test/{}/{n}", venue.0))
    }

    async fn is_member(&self, venue: VenueId, user: UserId) -> Result<bool, GatewayError> {
        self.record(GatewayCall::IsMember { venue, user });
        if let Some(err) = self.take_failure("is_member") {
            return Err(err);
        }
        Ok(self.lock_members().contains(&(venue, user)))
    }
}
