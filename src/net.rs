//! Address helpers and WAN interface discovery
//!
//! `"auto"` multi-route bindings are resolved here, once, before the ingest
//! manager starts.

use std::net::{IpAddr, Ipv4Addr};
use std::process::Command;

use crate::config::MultiRouteConfig;
use crate::constants::AUTO_INTERFACE;
use crate::error::{Error, Result};

/// Split `scheme://host:port` into host and port
///
/// Accepts bracketed IPv6 (`[::1]:9000`), `host:port`, and a bare host, in
/// which case `default_port` is used. Unbracketed IPv6 is taken as a bare host.
pub fn parse_host_port(url: &str, default_port: u16) -> std::result::Result<(String, u16), String> {
    let rest = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };

    let mut host = String::new();
    let mut port_str = "";

    if let Some(bracketed) = rest.strip_prefix('[') {
        if let Some(end) = bracketed.find(']') {
            host = bracketed[..end].to_string();
            if let Some(port) = bracketed[end + 1..].strip_prefix(':') {
                port_str = port;
            }
        }
    }

    if host.is_empty() {
        match (rest.find(':'), rest.rfind(':')) {
            (Some(first), Some(last)) if first == last => {
                host = rest[..last].to_string();
                port_str = &rest[last + 1..];
            }
            _ => host = rest.to_string(),
        }
    }

    if host.is_empty() {
        return Err(format!("missing host in '{}'", url));
    }

    let port = if port_str.is_empty() {
        default_port
    } else {
        port_str
            .parse::<u16>()
            .map_err(|_| format!("invalid port '{}' in '{}'", port_str, url))?
    };

    Ok((host, port))
}

/// Source of WAN-facing local addresses
pub trait WanResolver {
    fn wan_ips(&self) -> Vec<String>;
}

/// Resolver backed by the host's interface table
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWanResolver;

impl WanResolver for SystemWanResolver {
    fn wan_ips(&self) -> Vec<String> {
        let interfaces = ipv4_interfaces();

        let wan: Vec<String> = interfaces
            .iter()
            .filter(|(name, _)| is_wan_interface(name))
            .map(|(name, ip)| {
                tracing::info!("Found WAN interface {} with IP {}", name, ip);
                ip.to_string()
            })
            .collect();

        if !wan.is_empty() {
            return wan;
        }

        tracing::info!("No WAN interfaces found, falling back to all interfaces");
        interfaces
            .into_iter()
            .map(|(name, ip)| {
                tracing::info!("Found interface {} with IP {}", name, ip);
                ip.to_string()
            })
            .collect()
    }
}

/// Classify an interface name as WAN-facing by naming convention
pub fn is_wan_interface(name: &str) -> bool {
    if let Some(known) = classify_interface_name(name) {
        return known;
    }
    uci_lists_wan_interface(name)
}

/// Name-only classification; `None` when the name gives no hint
pub fn classify_interface_name(name: &str) -> Option<bool> {
    if name == "lo" {
        return Some(false);
    }
    if name.starts_with("docker") || name.starts_with("br") || name.starts_with("virbr") {
        return Some(false);
    }
    if name == "eth0" || name == "ppp0" || name == "wwan0" || name.starts_with("wan") {
        return Some(true);
    }
    None
}

/// Ask OpenWrt's config store whether the interface backs the WAN network
fn uci_lists_wan_interface(name: &str) -> bool {
    match Command::new("uci").args(["show", "network.wan.ifname"]).output() {
        Ok(output) => String::from_utf8_lossy(&output.stdout).contains(name),
        Err(e) => {
            tracing::debug!("uci lookup unavailable: {}", e);
            false
        }
    }
}

/// Non-loopback IPv4 addresses keyed by interface name
#[cfg(unix)]
fn ipv4_interfaces() -> Vec<(String, Ipv4Addr)> {
    use std::ffi::CStr;

    let mut found = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(std::ptr::addr_of_mut!(ifaddrs)) != 0 {
            tracing::error!("getifaddrs failed: {}", std::io::Error::last_os_error());
            return found;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            if !ifa.ifa_name.is_null()
                && !ifa.ifa_addr.is_null()
                && i32::from((*ifa.ifa_addr).sa_family) == libc::AF_INET
            {
                let name = CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned();
                #[allow(clippy::cast_ptr_alignment)]
                let sockaddr = ifa.ifa_addr.cast::<libc::sockaddr_in>();
                let ip = Ipv4Addr::from(u32::from_be((*sockaddr).sin_addr.s_addr));

                if !ip.is_loopback() {
                    found.push((name, ip));
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    found
}

#[cfg(not(unix))]
fn ipv4_interfaces() -> Vec<(String, Ipv4Addr)> {
    Vec::new()
}

/// Replace every `"auto"` interface with the next WAN address, in order
pub fn resolve_auto_routes(routes: &mut [MultiRouteConfig], resolver: &dyn WanResolver) -> Result<()> {
    if !routes.iter().any(|r| r.interface_ip == AUTO_INTERFACE) {
        return Ok(());
    }

    let wan_ips = resolver.wan_ips();
    if wan_ips.is_empty() {
        return Err(Error::Config("No WAN interfaces found".into()));
    }

    let mut next = wan_ips.into_iter();
    for (index, route) in routes.iter_mut().enumerate() {
        if route.interface_ip != AUTO_INTERFACE {
            continue;
        }
        match next.next() {
            Some(ip) => {
                tracing::info!("Assigned WAN IP {} to route {}", ip, index + 1);
                route.interface_ip = ip;
            }
            None => {
                return Err(Error::Config(
                    "Not enough WAN interfaces for configured routes".into(),
                ))
            }
        }
    }

    Ok(())
}

/// Whether a configured interface string names a concrete address
pub fn is_concrete_identity(identity: &str) -> bool {
    identity.parse::<IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResolver(Vec<&'static str>);

    impl WanResolver for FixedResolver {
        fn wan_ips(&self) -> Vec<String> {
            self.0.iter().map(|s| s.to_string()).collect()
        }
    }

    fn route(ip: &str) -> MultiRouteConfig {
        MultiRouteConfig {
            interface_ip: ip.to_string(),
            rist_dst: "203.0.113.10".to_string(),
            rist_port: 8000,
        }
    }

    #[test]
    fn test_parse_host_port_variants() {
        assert_eq!(parse_host_port("srt://example.com:9000", 1234).unwrap(), ("example.com".into(), 9000));
        assert_eq!(parse_host_port("srt://10.0.0.5", 1234).unwrap(), ("10.0.0.5".into(), 1234));
        assert_eq!(parse_host_port("[::1]:7000", 1234).unwrap(), ("::1".into(), 7000));
        assert_eq!(parse_host_port("srt://[fe80::1]", 1234).unwrap(), ("fe80::1".into(), 1234));
        assert_eq!(parse_host_port("fe80::2", 1234).unwrap(), ("fe80::2".into(), 1234));
        assert!(parse_host_port("srt://host:notaport", 1234).is_err());
        assert!(parse_host_port("srt://", 1234).is_err());
    }

    #[test]
    fn test_interface_name_classification() {
        assert_eq!(classify_interface_name("lo"), Some(false));
        assert_eq!(classify_interface_name("docker0"), Some(false));
        assert_eq!(classify_interface_name("br-lan"), Some(false));
        assert_eq!(classify_interface_name("virbr0"), Some(false));
        assert_eq!(classify_interface_name("eth0"), Some(true));
        assert_eq!(classify_interface_name("ppp0"), Some(true));
        assert_eq!(classify_interface_name("wan2"), Some(true));
        assert_eq!(classify_interface_name("enp3s0"), None);
    }

    #[test]
    fn test_auto_routes_resolved_in_order() {
        let mut routes = vec![route("auto"), route("192.0.2.7"), route("auto")];
        resolve_auto_routes(&mut routes, &FixedResolver(vec!["198.51.100.1", "198.51.100.2"])).unwrap();

        assert_eq!(routes[0].interface_ip, "198.51.100.1");
        assert_eq!(routes[1].interface_ip, "192.0.2.7");
        assert_eq!(routes[2].interface_ip, "198.51.100.2");
        assert!(routes.iter().all(|r| is_concrete_identity(&r.interface_ip)));
    }

    #[test]
    fn test_auto_routes_need_enough_wan_ips() {
        let mut routes = vec![route("auto"), route("auto")];
        assert!(resolve_auto_routes(&mut routes, &FixedResolver(vec!["198.51.100.1"])).is_err());

        let mut routes = vec![route("auto")];
        assert!(resolve_auto_routes(&mut routes, &FixedResolver(vec![])).is_err());
    }

    #[test]
    fn test_no_auto_routes_skip_resolver() {
        let mut routes = vec![route("192.0.2.1")];
        resolve_auto_routes(&mut routes, &FixedResolver(vec![])).unwrap();
        assert_eq!(routes[0].interface_ip, "192.0.2.1");
    }
}
