//! Raw IP packet builders (no link-layer header)

use mvirt_tun::exchange::{ExchangeBuilder, Records};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    Icmpv4Packet, Icmpv4Repr, Icmpv6Packet, Icmpv6Repr, IpProtocol, Ipv4Address, Ipv4Packet,
    Ipv4Repr, Ipv6Address, Ipv6Packet, Ipv6Repr,
};

/// Build an IPv4 ICMP echo request
pub fn icmpv4_echo_request(
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    ident: u16,
    seq_no: u16,
    payload: &[u8],
) -> Vec<u8> {
    let icmp_repr = Icmpv4Repr::EchoRequest {
        ident,
        seq_no,
        data: payload,
    };

    let ip_repr = Ipv4Repr {
        src_addr: Ipv4Address::from(src_ip),
        dst_addr: Ipv4Address::from(dst_ip),
        next_header: IpProtocol::Icmp,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 64,
    };

    let mut buffer = vec![0u8; ip_repr.buffer_len() + icmp_repr.buffer_len()];
    let caps = ChecksumCapabilities::default();

    let mut ip_packet = Ipv4Packet::new_unchecked(&mut buffer[..]);
    ip_repr.emit(&mut ip_packet, &caps);

    let mut icmp_packet = Icmpv4Packet::new_unchecked(ip_packet.payload_mut());
    icmp_repr.emit(&mut icmp_packet, &caps);

    buffer
}

/// Build an IPv6 ICMPv6 echo request
pub fn icmpv6_echo_request(
    src_ip: [u8; 16],
    dst_ip: [u8; 16],
    ident: u16,
    seq_no: u16,
    payload: &[u8],
) -> Vec<u8> {
    let src_addr = Ipv6Address::from(src_ip);
    let dst_addr = Ipv6Address::from(dst_ip);

    let icmp_repr = Icmpv6Repr::EchoRequest {
        ident,
        seq_no,
        data: payload,
    };

    let ip_repr = Ipv6Repr {
        src_addr,
        dst_addr,
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 64,
    };

    let mut buffer = vec![0u8; ip_repr.buffer_len() + icmp_repr.buffer_len()];
    let caps = ChecksumCapabilities::default();

    let mut ip_packet = Ipv6Packet::new_unchecked(&mut buffer[..]);
    ip_repr.emit(&mut ip_packet);

    let mut icmp_packet = Icmpv6Packet::new_unchecked(ip_packet.payload_mut());
    icmp_repr.emit(&src_addr, &dst_addr, &mut icmp_packet, &caps);

    buffer
}

/// IPv4-looking packet of exactly `len` bytes, filled with `fill` after the
/// version byte.
pub fn ipv4_filler(len: usize, fill: u8) -> Vec<u8> {
    let mut packet = vec![fill; len];
    packet[0] = 0x45;
    packet
}

/// Echo request from 10.0.0.1 to 10.0.0.2 with `seq_no`.
pub fn echo(seq_no: u16) -> Vec<u8> {
    icmpv4_echo_request([10, 0, 0, 1], [10, 0, 0, 2], 0x1234, seq_no, b"ping")
}

/// Build a write buffer from packets.
pub fn exchange_buffer(packets: &[Vec<u8>]) -> Vec<u8> {
    let mut builder = ExchangeBuilder::new();
    for packet in packets {
        builder.push(packet).expect("packet fits exchange buffer");
    }
    builder.finish()
}

/// Split a read buffer into its packets.
pub fn parse_exchange(buf: &[u8]) -> Vec<Vec<u8>> {
    Records::new(buf)
        .map(|record| record.expect("well-framed read buffer").to_vec())
        .collect()
}
