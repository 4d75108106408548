//! Client IP extraction
//!
//! The server sits behind a load balancer (and sometimes a CDN), so the
//! socket peer address is a proxy, not the user. The real client IP is
//! taken from, in order:
//!
//! 1. `X-Forwarded-For`, taking the first public address in the list
//! 2. `CloudFront-Viewer-Address` (`ip:port`, port stripped)
//! 3. The socket peer address
//!
//! Private, loopback, and link-local addresses never qualify; when
//! nothing does, the result is an empty string.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

/// Extract the best client IP for an incoming request.
pub fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    if let Some(xff) = header_str(headers, "x-forwarded-for") {
        // e.g. "203.0.113.1, 10.0.1.24"
        for part in xff.split(',') {
            if let Some(ip) = parse_public(part) {
                return ip.to_string();
            }
        }
    }

    if let Some(viewer) = header_str(headers, "cloudfront-viewer-address") {
        // "203.0.113.55:44321" or "2404:6800:4004::200e:44321"; the
        // last colon separates the port for both families.
        let host = match viewer.rfind(':') {
            Some(i) => &viewer[..i],
            None => viewer,
        };
        if let Some(ip) = parse_public(host) {
            return ip.to_string();
        }
    }

    if is_public(&remote.ip()) {
        return remote.ip().to_string();
    }

    String::new()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_public(s: &str) -> Option<IpAddr> {
    let ip: IpAddr = s.trim().parse().ok()?;
    is_public(&ip).then_some(ip)
}

fn is_public(ip: &IpAddr) -> bool {
    if ip.is_loopback() {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => {
            // Link-local multicast is 224.0.0.0/24.
            let o = v4.octets();
            !v4.is_private()
                && !v4.is_link_local()
                && !(o[0] == 224 && o[1] == 0 && o[2] == 0)
        }
        IpAddr::V6(v6) => {
            // Link-local multicast is ff?2::/16 (scope nibble 2).
            let link_local_multicast = (v6.segments()[0] & 0xff0f) == 0xff02;
            !v6.is_unicast_link_local() && !v6.is_unique_local() && !link_local_multicast
        }
    }
}
