// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Key scheme for the backing store.
//!
//! Every key is a flat byte string composed of a family prefix and an
//! identifier. Prefixes are chosen so no two families can collide. Endpoint
//! names are UTF-8; socket addresses use their stable textual form.

use std::net::SocketAddr;

// (endpoint => serialized registration)
const REG_EP: &[u8] = b"REG:EP:";
// secondary index (registration id => endpoint)
const EP_REGID_IDX: &[u8] = b"EP:REGID:";
// secondary index (socket address => endpoint)
const EP_ADDR_IDX: &[u8] = b"EP:ADDR:";
const LOCK_EP: &[u8] = b"LOCK:EP:";
// (token => serialized observation)
const OBS_TKN: &[u8] = b"OBS:TKN:";
// secondary index (registration id => token list)
const TKNS_REGID_IDX: &[u8] = b"TKNS:REGID:";

/// Sorted set of (endpoint, expiration timestamp), shared by all endpoints.
pub(crate) const EXP_EP: &[u8] = b"EXP:EP";

fn join(prefix: &[u8], id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + id.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(id);
    key
}

/// Primary record key for an endpoint.
pub(crate) fn endpoint_key(endpoint: &str) -> Vec<u8> {
    join(REG_EP, endpoint.as_bytes())
}

pub(crate) fn endpoint_key_raw(endpoint: &[u8]) -> Vec<u8> {
    join(REG_EP, endpoint)
}

/// Id-index key mapping a registration id to its endpoint.
pub(crate) fn registration_id_key(registration_id: &str) -> Vec<u8> {
    join(EP_REGID_IDX, registration_id.as_bytes())
}

/// Address-index key mapping a socket address to its endpoint.
///
/// Uses `SocketAddr`'s textual form, which round-trips both IPv4 and IPv6
/// (including a nonzero scope id, rendered as `[ip%scope]:port`).
pub(crate) fn address_key(address: &SocketAddr) -> Vec<u8> {
    join(EP_ADDR_IDX, address.to_string().as_bytes())
}

/// Per-endpoint advisory lock key.
pub(crate) fn lock_key(endpoint: &str) -> Vec<u8> {
    join(LOCK_EP, endpoint.as_bytes())
}

/// Observation record key for a token.
pub(crate) fn observation_key(token: &[u8]) -> Vec<u8> {
    join(OBS_TKN, token)
}

/// Key of the token list held by a registration.
pub(crate) fn token_list_key(registration_id: &str) -> Vec<u8> {
    join(TKNS_REGID_IDX, registration_id.as_bytes())
}

/// Scan pattern matching every primary record key.
pub(crate) fn registration_scan_pattern() -> Vec<u8> {
    join(REG_EP, b"*")
}

/// Decode an endpoint name read back from an index value.
///
/// Index values are written by us and always UTF-8; anything else is a
/// corrupt row and treated as absent.
pub(crate) fn endpoint_from_bytes(bytes: Vec<u8>) -> Option<String> {
    match String::from_utf8(bytes) {
        Ok(endpoint) => Some(endpoint),
        Err(_) => {
            tracing::warn!("Skipping index entry with non-UTF-8 endpoint value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_families_do_not_collide() {
        let keys = [
            endpoint_key("x"),
            registration_id_key("x"),
            address_key(&"10.0.0.1:5683".parse().unwrap()),
            lock_key("x"),
            observation_key(b"x"),
            token_list_key("x"),
            EXP_EP.to_vec(),
        ];
        for (i, a) in keys.iter().enumerate() {
            for (j, b) in keys.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }

    #[test]
    fn test_endpoint_key_utf8() {
        assert_eq!(endpoint_key("capteur-é"), b"REG:EP:capteur-\xc3\xa9".to_vec());
        assert_eq!(endpoint_key_raw("dev".as_bytes()), endpoint_key("dev"));
    }

    #[test]
    fn test_address_key_ipv4() {
        let addr: SocketAddr = "10.0.0.1:5683".parse().unwrap();
        assert_eq!(address_key(&addr), b"EP:ADDR:10.0.0.1:5683".to_vec());
    }

    #[test]
    fn test_address_key_ipv6_with_scope() {
        use std::net::{Ipv6Addr, SocketAddrV6};

        let plain = SocketAddr::from(SocketAddrV6::new(
            "fe80::1".parse::<Ipv6Addr>().unwrap(),
            5683,
            0,
            0,
        ));
        let scoped = SocketAddr::from(SocketAddrV6::new(
            "fe80::1".parse::<Ipv6Addr>().unwrap(),
            5683,
            0,
            3,
        ));
        assert_ne!(address_key(&plain), address_key(&scoped));

        // the text form must parse back to the same address
        let text = String::from_utf8(address_key(&scoped)["EP:ADDR:".len()..].to_vec()).unwrap();
        assert_eq!(text.parse::<SocketAddr>().unwrap(), scoped);
    }

    #[test]
    fn test_scan_pattern_matches_primary_family() {
        let pattern = registration_scan_pattern();
        assert_eq!(pattern, b"REG:EP:*".to_vec());
        assert!(endpoint_key("dev").starts_with(&pattern[..pattern.len() - 1]));
        assert!(!registration_id_key("dev").starts_with(&pattern[..pattern.len() - 1]));
    }
}
