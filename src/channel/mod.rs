//! Request/response channel to the kernel page-walk collaborator.
//!
//! Requests are 12-byte little-endian records carried in a fixed-size
//! netlink packet; responses arrive as up to [MAX_PACKETS] packets of 16-byte
//! candidate records, reassembled here into one raw record vector. The
//! channel never has two requests in flight: [KernelChannel::request] owns
//! the transport mutably and the controller wraps the channel in a mutex for
//! the full round trip.

use std::io;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::topology::Tier;

mod netlink;

pub use netlink::NetlinkTransport;

/// Netlink protocol family of the collaborator.
pub const NETLINK_FAMILY: i32 = 31;
/// Payload bytes per packet.
pub const MAX_PAYLOAD: usize = 4096;
/// Upper bound on response packets per request.
pub const MAX_PACKETS: usize = 512;
/// Wire size of one candidate record (u64 addr, i32 pid, natural alignment).
pub const RECORD_SIZE: usize = 16;
/// Candidate records fitting one packet.
pub const MAX_N_PER_PACKET: usize = MAX_PAYLOAD / RECORD_SIZE;
/// Most candidates a find may return, leaving room for the retval record.
pub const MAX_N_FIND: usize = MAX_N_PER_PACKET * MAX_PACKETS - 1;
/// Most exchange pairs a switch may return, leaving room for both sentinels.
pub const MAX_N_SWITCH: usize = (MAX_N_FIND - 1) / 2;

const NLMSG_HDRLEN: usize = 16;

const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
    #[error("collaborator replied with an error packet")]
    Collaborator,
    #[error("malformed response packet")]
    Malformed,
    #[error("collaborator rejected the request (retval {0})")]
    Rejected(i32),
}

/// Request kinds understood by the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Find = 0,
    Bind = 1,
    Unbind = 2,
}

impl OpCode {
    pub fn from_wire(raw: i32) -> Option<OpCode> {
        match raw {
            0 => Some(OpCode::Find),
            1 => Some(OpCode::Bind),
            2 => Some(OpCode::Unbind),
            _ => None,
        }
    }
}

/// Discovery modes of a `FIND` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementMode {
    /// Walk DRAM for cold pages to push down.
    DramPull = 0,
    /// Walk NVRAM for hot pages to pull up.
    NvramPull = 1,
    /// Exchange equal counts between the tiers.
    Switch = 2,
    /// Walk NVRAM for access-intensive pages.
    NvramIntensive = 3,
    /// Walk NVRAM for write-heavy pages.
    NvramWrite = 4,
    /// Clear access bits kernel-side; returns no candidates.
    NvramClear = 5,
}

impl PlacementMode {
    pub fn wire(self) -> i32 {
        self as i32
    }

    /// The tier migrated *to* under this mode, if it migrates at all.
    pub fn destination(self) -> Option<Tier> {
        match self {
            PlacementMode::DramPull => Some(Tier::Nvram),
            PlacementMode::NvramPull
            | PlacementMode::NvramIntensive
            | PlacementMode::NvramWrite => Some(Tier::Dram),
            PlacementMode::Switch | PlacementMode::NvramClear => None,
        }
    }
}

/// One request record as it goes over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub op: OpCode,
    pub pid_or_n: i32,
    pub mode: i32,
}

impl Request {
    pub fn bind(pid: i32) -> Request {
        Request {
            op: OpCode::Bind,
            pid_or_n: pid,
            mode: 0,
        }
    }

    pub fn unbind(pid: i32) -> Request {
        Request {
            op: OpCode::Unbind,
            pid_or_n: pid,
            mode: 0,
        }
    }

    pub fn find(n: usize, mode: PlacementMode) -> Request {
        Request {
            op: OpCode::Find,
            pid_or_n: n as i32,
            mode: mode.wire(),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(&mut buf[0..], self.op as i32);
        LittleEndian::write_i32(&mut buf[4..], self.pid_or_n);
        LittleEndian::write_i32(&mut buf[8..], self.mode);
    }
}

/// One response record before sentinel interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord {
    pub addr: u64,
    pub pid_retval: i32,
}

/// Packet kinds of the response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Intermediate packet of a multi-packet response.
    Multi,
    /// Final packet; may still carry records.
    Done,
    /// Collaborator-side failure; aborts the call.
    Error,
}

/// Encodes a request as the single netlink packet the collaborator expects.
pub fn encode_request_packet(req: Request, pid: u32) -> Vec<u8> {
    let mut packet = vec![0u8; NLMSG_HDRLEN + MAX_PAYLOAD];
    LittleEndian::write_u32(&mut packet[0..], (NLMSG_HDRLEN + MAX_PAYLOAD) as u32);
    // type and flags stay zero, seq is unused by the collaborator
    LittleEndian::write_u32(&mut packet[12..], pid);
    req.encode(&mut packet[NLMSG_HDRLEN..]);
    packet
}

/// Encodes one response packet. This is the collaborator's side of the
/// codec; the controller only uses it from tests and diagnostic tooling.
pub fn encode_response_packet(records: &[RawRecord], kind: PacketKind) -> Vec<u8> {
    assert!(records.len() <= MAX_N_PER_PACKET);
    let len = NLMSG_HDRLEN + records.len() * RECORD_SIZE;
    let mut packet = vec![0u8; len];
    LittleEndian::write_u32(&mut packet[0..], len as u32);
    let (msg_type, flags): (u16, u16) = match kind {
        PacketKind::Multi => (0, libc::NLM_F_MULTI as u16),
        PacketKind::Done => (libc::NLMSG_DONE as u16, 0),
        PacketKind::Error => (libc::NLMSG_ERROR as u16, 0),
    };
    LittleEndian::write_u16(&mut packet[4..], msg_type);
    LittleEndian::write_u16(&mut packet[6..], flags);
    for (i, record) in records.iter().enumerate() {
        let off = NLMSG_HDRLEN + i * RECORD_SIZE;
        LittleEndian::write_u64(&mut packet[off..], record.addr);
        LittleEndian::write_i32(&mut packet[off + 8..], record.pid_retval);
    }
    packet
}

fn decode_records(payload: &[u8], cap: usize, out: &mut Vec<RawRecord>) {
    for chunk in payload.chunks_exact(RECORD_SIZE) {
        if out.len() >= cap {
            return;
        }
        out.push(RawRecord {
            addr: LittleEndian::read_u64(&chunk[0..]),
            pid_retval: LittleEndian::read_i32(&chunk[8..]),
        });
    }
}

/// Datagram transport to the collaborator. Production uses netlink; tests
/// script the packets, which is also how the no-interleaving invariant is
/// observed.
pub trait Transport: Send {
    /// Sends one request datagram.
    fn send(&mut self, packet: &[u8]) -> io::Result<()>;
    /// Receives one response datagram into `buf`, returning its length.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// The reassembling request channel.
pub struct KernelChannel {
    transport: Box<dyn Transport>,
    recv_buf: Vec<u8>,
    pid: u32,
}

impl KernelChannel {
    pub fn new(transport: Box<dyn Transport>) -> KernelChannel {
        KernelChannel {
            transport,
            // every response packet of a maximal reply may land in one datagram
            recv_buf: vec![0u8; nlmsg_align(NLMSG_HDRLEN + MAX_PAYLOAD) * MAX_PACKETS],
            pid: std::process::id(),
        }
    }

    /// Performs one blocking request/response round trip and returns the
    /// concatenated raw records, capped at [MAX_N_FIND] + 1 entries.
    pub fn request(&mut self, req: Request) -> Result<Vec<RawRecord>, ChannelError> {
        self.transport.send(&encode_request_packet(req, self.pid))?;

        let mut records = Vec::new();
        loop {
            let len = self.transport.recv(&mut self.recv_buf)?;
            let mut off = 0;
            while off + NLMSG_HDRLEN <= len {
                let msg_len = LittleEndian::read_u32(&self.recv_buf[off..]) as usize;
                let msg_type = LittleEndian::read_u16(&self.recv_buf[off + 4..]) as i32;
                if msg_len < NLMSG_HDRLEN || off + msg_len > len {
                    return Err(ChannelError::Malformed);
                }
                if msg_type == libc::NLMSG_ERROR {
                    return Err(ChannelError::Collaborator);
                }
                decode_records(
                    &self.recv_buf[off + NLMSG_HDRLEN..off + msg_len],
                    MAX_N_FIND + 1,
                    &mut records,
                );
                if msg_type == libc::NLMSG_DONE {
                    log::trace!("channel: reassembled {} records", records.len());
                    return Ok(records);
                }
                off += nlmsg_align(msg_len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedTransport {
        sent: Vec<Vec<u8>>,
        datagrams: VecDeque<Vec<u8>>,
    }

    impl ScriptedTransport {
        fn new(datagrams: Vec<Vec<u8>>) -> Self {
            ScriptedTransport {
                sent: Vec::new(),
                datagrams: datagrams.into(),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&mut self, packet: &[u8]) -> io::Result<()> {
            self.sent.push(packet.to_vec());
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let datagram = self
                .datagrams
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no reply scripted"))?;
            buf[..datagram.len()].copy_from_slice(&datagram);
            Ok(datagram.len())
        }
    }

    fn candidate(addr: u64, pid: i32) -> RawRecord {
        RawRecord {
            addr,
            pid_retval: pid,
        }
    }

    #[test]
    fn request_encoding() {
        let packet = encode_request_packet(Request::find(42, PlacementMode::Switch), 777);
        assert_eq!(packet.len(), NLMSG_HDRLEN + MAX_PAYLOAD);
        assert_eq!(
            LittleEndian::read_u32(&packet[0..]),
            (NLMSG_HDRLEN + MAX_PAYLOAD) as u32
        );
        assert_eq!(LittleEndian::read_u32(&packet[12..]), 777);
        assert_eq!(LittleEndian::read_i32(&packet[16..]), 0); // FIND
        assert_eq!(LittleEndian::read_i32(&packet[20..]), 42);
        assert_eq!(LittleEndian::read_i32(&packet[24..]), 2); // SWITCH
    }

    #[test]
    fn single_packet_reply() {
        let reply = encode_response_packet(
            &[candidate(0x1000, 7), candidate(0, 0)],
            PacketKind::Done,
        );
        let mut channel = KernelChannel::new(Box::new(ScriptedTransport::new(vec![reply])));
        let records = channel.request(Request::bind(7)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], candidate(0x1000, 7));
    }

    #[test]
    fn multi_packet_reply_is_reassembled_in_order() {
        let first: Vec<RawRecord> = (0..MAX_N_PER_PACKET)
            .map(|i| candidate(i as u64, 1))
            .collect();
        let second = vec![candidate(0xdead, 2), candidate(0, 0)];
        let datagrams = vec![
            encode_response_packet(&first, PacketKind::Multi),
            encode_response_packet(&second, PacketKind::Done),
        ];
        let mut channel = KernelChannel::new(Box::new(ScriptedTransport::new(datagrams)));
        let records = channel
            .request(Request::find(300, PlacementMode::DramPull))
            .unwrap();
        assert_eq!(records.len(), MAX_N_PER_PACKET + 2);
        assert_eq!(records[MAX_N_PER_PACKET], candidate(0xdead, 2));
        assert_eq!(records.last().unwrap().pid_retval, 0);
    }

    #[test]
    fn packets_in_one_datagram() {
        // the collaborator puts all messages in a single skb
        let mut datagram = encode_response_packet(&[candidate(1, 1)], PacketKind::Multi);
        datagram.extend(encode_response_packet(&[candidate(0, 0)], PacketKind::Done));
        let mut channel = KernelChannel::new(Box::new(ScriptedTransport::new(vec![datagram])));
        let records = channel
            .request(Request::find(1, PlacementMode::NvramPull))
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn error_packet_aborts_the_call() {
        let datagrams = vec![
            encode_response_packet(&[candidate(1, 1)], PacketKind::Multi),
            encode_response_packet(&[], PacketKind::Error),
        ];
        let mut channel = KernelChannel::new(Box::new(ScriptedTransport::new(datagrams)));
        assert!(matches!(
            channel.request(Request::find(1, PlacementMode::DramPull)),
            Err(ChannelError::Collaborator)
        ));
    }

    #[test]
    fn truncated_header_is_malformed() {
        let mut packet = encode_response_packet(&[candidate(1, 1)], PacketKind::Done);
        let bogus_len = (packet.len() + 64) as u32;
        LittleEndian::write_u32(&mut packet[0..], bogus_len);
        let mut channel = KernelChannel::new(Box::new(ScriptedTransport::new(vec![packet])));
        assert!(matches!(
            channel.request(Request::find(1, PlacementMode::DramPull)),
            Err(ChannelError::Malformed)
        ));
    }

    #[test]
    fn reply_is_capped() {
        // more full packets than the cap admits
        let full: Vec<RawRecord> = (0..MAX_N_PER_PACKET)
            .map(|i| candidate(i as u64, 3))
            .collect();
        let mut datagrams: Vec<Vec<u8>> = (0..MAX_PACKETS)
            .map(|_| encode_response_packet(&full, PacketKind::Multi))
            .collect();
        datagrams.push(encode_response_packet(&full, PacketKind::Done));
        let mut channel = KernelChannel::new(Box::new(ScriptedTransport::new(datagrams)));
        let records = channel
            .request(Request::find(MAX_N_FIND, PlacementMode::DramPull))
            .unwrap();
        assert_eq!(records.len(), MAX_N_FIND + 1);
    }

    #[test]
    fn mode_destinations() {
        assert_eq!(PlacementMode::DramPull.destination(), Some(Tier::Nvram));
        assert_eq!(PlacementMode::NvramPull.destination(), Some(Tier::Dram));
        assert_eq!(PlacementMode::NvramIntensive.destination(), Some(Tier::Dram));
        assert_eq!(PlacementMode::Switch.destination(), None);
        assert_eq!(PlacementMode::NvramClear.destination(), None);
    }
}
