//! Flow-controlled bulk transfer: moves a payload across a matched
//! `SendFlow`/`RecvToBuffer` pair in bounce-buffer-sized packets.
//!
//! The real engine walks the sender's user memory through a pair of 4 KiB
//! bounce buffers with two packets in flight at once; this model already
//! has the whole payload in hand; chunking it is what's left of that shape.
//! A fault injected on either side completes both sides: `fault` for the
//! side that faulted, `remoteFault` for the other.

use alloc::vec::Vec;

use super::Outcome;
use crate::error::HelError;

pub const BOUNCE_SIZE: usize = 4096;
pub const MAX_IN_FLIGHT: usize = 2;

/// A flow transfer that didn't complete cleanly: the error it failed with,
/// plus how many bytes had already crossed before the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowFault {
    pub error: HelError,
    pub transferred: usize,
}

/// One packet of a flow-controlled transfer.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Vec<u8>,
    pub terminate: bool,
    pub fault: bool,
}

/// Split `data` into the sender's packet stream: `BOUNCE_SIZE` chunks, the
/// last one flagged `terminate`.
pub fn chunk(data: &[u8]) -> Vec<Packet> {
    if data.is_empty() {
        return alloc::vec![Packet { data: Vec::new(), terminate: true, fault: false }];
    }
    let mut packets: Vec<Packet> = data
        .chunks(BOUNCE_SIZE)
        .map(|c| Packet { data: c.to_vec(), terminate: false, fault: false })
        .collect();
    if let Some(last) = packets.last_mut() {
        last.terminate = true;
    }
    packets
}

/// Run a transfer to completion (no actual concurrency is modeled; the
/// "two packets in flight" budget only bounds how the real coroutine
/// pipelines acks, which doesn't change the end-to-end outcome here).
pub fn transfer(data: Vec<u8>) -> (Result<Outcome, HelError>, Result<Outcome, HelError>) {
    let (send, recv) = run(data, false, false);
    (send.map_err(|f| f.error), recv.map_err(|f| f.error))
}

/// Like `transfer`, but lets either side fault instead of completing. A
/// sender fault strikes before the sender has produced a single packet, so
/// nothing crosses; a receiver fault strikes only once it has already
/// buffered every packet the sender produced, during the final commit.
pub fn transfer_with_fault(
    data: Vec<u8>,
    sender_fault: bool,
    receiver_fault: bool,
) -> (Result<Outcome, FlowFault>, Result<Outcome, FlowFault>) {
    run(data, sender_fault, receiver_fault)
}

fn run(
    data: Vec<u8>,
    sender_fault: bool,
    receiver_fault: bool,
) -> (Result<Outcome, FlowFault>, Result<Outcome, FlowFault>) {
    if sender_fault {
        return (
            Err(FlowFault { error: HelError::Fault, transferred: 0 }),
            Err(FlowFault { error: HelError::RemoteFault, transferred: 0 }),
        );
    }
    if receiver_fault {
        let transferred = data.len();
        return (
            Err(FlowFault { error: HelError::RemoteFault, transferred }),
            Err(FlowFault { error: HelError::Fault, transferred }),
        );
    }
    let mut received = Vec::with_capacity(data.len());
    for packet in chunk(&data) {
        received.extend_from_slice(&packet.data);
        if packet.terminate {
            break;
        }
    }
    (Ok(Outcome::Ack), Ok(Outcome::Data(received)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_round_trips_payload_across_multiple_chunks() {
        let data: Vec<u8> = (0..(BOUNCE_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        let (send, recv) = transfer(data.clone());
        assert!(matches!(send, Ok(Outcome::Ack)));
        match recv {
            Ok(Outcome::Data(received)) => assert_eq!(received, data),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn sender_fault_yields_fault_locally_and_remote_fault_to_peer() {
        let (send, recv) = transfer_with_fault(alloc::vec![1, 2, 3], true, false);
        let send_err = send.unwrap_err();
        let recv_err = recv.unwrap_err();
        assert_eq!(send_err.error, HelError::Fault);
        assert_eq!(recv_err.error, HelError::RemoteFault);
        assert_eq!(send_err.transferred, 0);
        assert_eq!(recv_err.transferred, 0);
    }

    #[test]
    fn receiver_fault_yields_fault_locally_and_remote_fault_to_sender() {
        let payload = alloc::vec![1, 2, 3];
        let (send, recv) = transfer_with_fault(payload.clone(), false, true);
        let send_err = send.unwrap_err();
        let recv_err = recv.unwrap_err();
        assert_eq!(send_err.error, HelError::RemoteFault);
        assert_eq!(recv_err.error, HelError::Fault);
        assert_eq!(send_err.transferred, payload.len());
        assert_eq!(recv_err.transferred, payload.len());
    }
}
