//! Inbound decoder: consumer write buffers to network stack indications

use smoltcp::wire::{IPV4_HEADER_LEN, IPV6_HEADER_LEN, IpVersion};
use tracing::{trace, warn};

use crate::adapter::NetworkStack;
use crate::exchange::Records;
use crate::stats::Statistics;

/// A packet handed to the network stack.
///
/// `data` borrows the consumer's write buffer and is only valid for the
/// duration of [`NetworkStack::indicate`]. A stack that keeps the packet must
/// copy it.
#[derive(Debug)]
pub struct InboundPacket<'a> {
    data: &'a [u8],
    version: IpVersion,
    rejected: bool,
}

impl<'a> InboundPacket<'a> {
    pub fn new(data: &'a [u8], version: IpVersion) -> Self {
        Self {
            data,
            version,
            rejected: false,
        }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// IP version from the header nibble
    pub fn version(&self) -> IpVersion {
        self.version
    }

    /// Mark the packet as not accepted; it is counted as an inbound error.
    pub fn reject(&mut self) {
        self.rejected = true;
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }
}

/// Outcome of decoding one write buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeReport {
    /// Bytes covered by well-framed records
    pub consumed: usize,
    /// Packets accepted by the network stack
    pub packets: usize,
    pub octets: usize,
    /// Malformed, truncated and rejected packets
    pub errors: usize,
}

/// Classify a packet by its version nibble and minimum header length.
pub fn classify(data: &[u8]) -> Option<IpVersion> {
    if data.is_empty() {
        return None;
    }
    match IpVersion::of_packet(data) {
        Ok(IpVersion::Ipv4) if data.len() >= IPV4_HEADER_LEN => Some(IpVersion::Ipv4),
        Ok(IpVersion::Ipv6) if data.len() >= IPV6_HEADER_LEN => Some(IpVersion::Ipv6),
        _ => None,
    }
}

/// Decode a write buffer and indicate its packets in one call.
///
/// Parsing stops at the first record that cannot be framed; that record
/// counts as one error. Packets that are framed but not IP are skipped and
/// counted.
pub fn decode(buf: &[u8], stack: &dyn NetworkStack, stats: &Statistics) -> DecodeReport {
    let mut report = DecodeReport::default();
    let mut packets = Vec::new();

    let mut records = Records::new(buf);
    for record in records.by_ref() {
        match record {
            Ok(data) => match classify(data) {
                Some(version) => packets.push(InboundPacket::new(data, version)),
                None => {
                    trace!(len = data.len(), "Skipping malformed packet");
                    report.errors += 1;
                }
            },
            Err(e) => {
                warn!(error = %e, "Truncated write buffer");
                report.errors += 1;
            }
        }
    }
    report.consumed = records.consumed();

    if !packets.is_empty() {
        stack.indicate(&mut packets);
    }

    for packet in &packets {
        if packet.is_rejected() {
            report.errors += 1;
        } else {
            report.packets += 1;
            report.octets += packet.len();
        }
    }

    stats.packets_received(
        report.octets as u64,
        report.packets as u64,
        report.errors as u64,
    );
    report
}
