//! Pairs a submitted group against whatever the peer has queued, or parks it
//! if nothing compatible is waiting yet.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::{flow, Action, GroupResult, Lane, Outcome, PendingGroup, SubmitOutcome};
use crate::error::HelError;

fn queue_of<'a>(lane: &'a Lane, ancillary: bool) -> &'a Mutex<alloc::collections::VecDeque<PendingGroup>> {
    if ancillary {
        &lane.queues.ancillary
    } else {
        &lane.queues.root
    }
}

/// Try to match `actions` (submitted on `lane`, destined for `peer`) against
/// whatever `peer` already has queued on the same queue kind. On a miss,
/// park the group on `lane`'s own queue for `peer` to find later.
pub(crate) fn match_or_enqueue(
    lane: &Arc<Lane>,
    peer: &Arc<Lane>,
    ancillary: bool,
    actions: Vec<Action>,
) -> SubmitOutcome {
    let peer_queue = queue_of(peer, ancillary);
    let waiting = peer_queue.lock().pop_front();
    match waiting {
        Some(partner) => {
            let (local_result, partner_result) = run_pair(&actions, &partner.actions);
            *partner.slot.lock() = Some(partner_result);
            SubmitOutcome::Ready(local_result)
        }
        None => {
            let slot = Arc::new(Mutex::new(None));
            queue_of(lane, ancillary).lock().push_back(PendingGroup {
                actions,
                slot: slot.clone(),
            });
            SubmitOutcome::Pending(slot)
        }
    }
}

/// Run a matched pair of groups action-by-action. A tag mismatch at any
/// position fails both sides with `transmissionMismatch` from that point on.
fn run_pair(local: &[Action], remote: &[Action]) -> (GroupResult, GroupResult) {
    let len = local.len().max(remote.len());
    let mut local_out = Vec::with_capacity(len);
    let mut remote_out = Vec::with_capacity(len);
    for i in 0..len {
        match (local.get(i), remote.get(i)) {
            (Some(l), Some(r)) => {
                let (lo, ro) = run_action_pair(l, r);
                local_out.push(lo);
                remote_out.push(ro);
            }
            _ => {
                local_out.push(Err(HelError::TransmissionMismatch));
                remote_out.push(Err(HelError::TransmissionMismatch));
            }
        }
    }
    (local_out, remote_out)
}

fn run_action_pair(
    local: &Action,
    remote: &Action,
) -> (Result<Outcome, HelError>, Result<Outcome, HelError>) {
    use Action::*;
    match (local, remote) {
        (Offer, Accept) => {
            let (offer_lane, accept_lane) = Lane::new_pair();
            (Ok(Outcome::NewLane(offer_lane)), Ok(Outcome::NewLane(accept_lane)))
        }
        (Accept, Offer) => {
            let (offer_lane, accept_lane) = Lane::new_pair();
            (Ok(Outcome::NewLane(accept_lane)), Ok(Outcome::NewLane(offer_lane)))
        }
        (ImbueCredentials(bytes), ExtractCredentials) => (Ok(Outcome::Ack), Ok(Outcome::Credentials(*bytes))),
        (ExtractCredentials, ImbueCredentials(bytes)) => (Ok(Outcome::Credentials(*bytes)), Ok(Outcome::Ack)),
        (SendFromBuffer(data), RecvInline) => {
            if data.len() > crate::memory::PAGE_SIZE {
                (Err(HelError::BufferTooSmall), Err(HelError::TransmissionMismatch))
            } else {
                (Ok(Outcome::Ack), Ok(Outcome::Data(data.clone())))
            }
        }
        (RecvInline, SendFromBuffer(data)) => {
            if data.len() > crate::memory::PAGE_SIZE {
                (Err(HelError::TransmissionMismatch), Err(HelError::BufferTooSmall))
            } else {
                (Ok(Outcome::Data(data.clone())), Ok(Outcome::Ack))
            }
        }
        (SendFlow(data), RecvToBuffer) => flow::transfer(data.clone()),
        (RecvToBuffer, SendFlow(data)) => {
            let (send_out, recv_out) = flow::transfer(data.clone());
            (recv_out, send_out)
        }
        (SendFromBuffer(data), RecvToBuffer) => flow::transfer(data.clone()),
        (RecvToBuffer, SendFromBuffer(data)) => {
            let (send_out, recv_out) = flow::transfer(data.clone());
            (recv_out, send_out)
        }
        (SendFromBufferSg(chunks), RecvToBuffer) => {
            flow::transfer(chunks.iter().flatten().copied().collect())
        }
        (RecvToBuffer, SendFromBufferSg(chunks)) => {
            let (send_out, recv_out) = flow::transfer(chunks.iter().flatten().copied().collect());
            (recv_out, send_out)
        }
        (PushDescriptor(token), PullDescriptor) => (Ok(Outcome::Ack), Ok(Outcome::Descriptor(*token))),
        (PullDescriptor, PushDescriptor(token)) => (Ok(Outcome::Descriptor(*token)), Ok(Outcome::Ack)),
        _ => (Err(HelError::TransmissionMismatch), Err(HelError::TransmissionMismatch)),
    }
}
