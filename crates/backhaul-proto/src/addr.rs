//! Address helpers for handshake payloads and P2P rendezvous

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Encoded IP length: one family byte followed by the 16-byte IPv6 form
pub const ENCODED_IP_LEN: usize = 17;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Encode an IP address into its fixed-width wire form
pub fn encode_ip(ip: IpAddr) -> [u8; ENCODED_IP_LEN] {
    let mut out = [0u8; ENCODED_IP_LEN];
    match ip {
        IpAddr::V4(v4) => {
            out[0] = FAMILY_V4;
            out[1..].copy_from_slice(&v4.to_ipv6_mapped().octets());
        }
        IpAddr::V6(v6) => {
            out[0] = FAMILY_V6;
            out[1..].copy_from_slice(&v6.octets());
        }
    }
    out
}

/// Decode a fixed-width IP; returns `None` for short input or unknown family
pub fn decode_ip(buf: &[u8]) -> Option<IpAddr> {
    if buf.len() < ENCODED_IP_LEN {
        return None;
    }

    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buf[1..ENCODED_IP_LEN]);
    let v6 = Ipv6Addr::from(octets);

    match buf[0] {
        FAMILY_V4 => v6.to_ipv4_mapped().map(IpAddr::V4),
        FAMILY_V6 => Some(IpAddr::V6(v6)),
        _ => None,
    }
}

/// Private, loopback or link-local: peers behind such addresses share a host
/// or LAN with the bridge and should be offered a locally reachable endpoint.
pub fn is_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_local_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_local_v4(v4);
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link-local
        }
    }
}

fn is_local_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}
