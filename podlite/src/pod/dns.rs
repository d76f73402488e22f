//! resolv.conf handling for the stager.

use std::fmt::Write as _;
use std::net::IpAddr;

use podlite_shared::schema::{Dns, IpResult};

/// resolv.conf(5) caps the number of nameservers.
const MAX_NAMESERVERS: usize = 3;

/// Parses resolv.conf content, keeping only IP-literal nameservers.
pub fn parse_resolv_conf(content: &str) -> Dns {
    let mut dns = Dns::default();

    for line in content.lines() {
        if line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some((&keyword, args)) = fields.split_first() else {
            continue;
        };

        match keyword {
            "nameserver" => {
                if let Some(server) = args.first()
                    && dns.nameservers.len() < MAX_NAMESERVERS
                    && server.parse::<IpAddr>().is_ok()
                {
                    dns.nameservers.push(server.to_string());
                }
            }
            "domain" => {
                if let Some(domain) = args.first() {
                    dns.domain = domain.to_string();
                }
            }
            "search" => dns.search = args.iter().map(|s| s.to_string()).collect(),
            "options" => dns.options = args.iter().map(|s| s.to_string()).collect(),
            _ => {}
        }
    }

    dns
}

pub fn render_resolv_conf(dns: &Dns) -> String {
    let mut out = String::new();
    if !dns.domain.is_empty() {
        let _ = writeln!(out, "domain {}", dns.domain);
    }
    if !dns.search.is_empty() {
        let _ = writeln!(out, "search {}", dns.search.join(" "));
    }
    for ns in &dns.nameservers {
        let _ = writeln!(out, "nameserver {}", ns);
    }
    if !dns.options.is_empty() {
        let _ = writeln!(out, "options {}", dns.options.join(" "));
    }
    out
}

/// First DNS block from the network results that carries any data.
///
/// Some drivers report `"dns": {}`, which must not shadow the host config.
pub fn from_results(results: &[IpResult]) -> Option<Dns> {
    results
        .iter()
        .filter_map(|r| r.dns.as_ref())
        .find(|dns| !dns.is_blank())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_config() {
        let conf = "\
# generated
; also a comment
domain corp.example
search corp.example example
nameserver 10.0.0.1
nameserver dns.example
nameserver 10.0.0.2
nameserver fd00::53
nameserver 10.0.0.4
options ndots:2 timeout:1
";
        let dns = parse_resolv_conf(conf);
        assert_eq!(dns.domain, "corp.example");
        assert_eq!(dns.search, vec!["corp.example", "example"]);
        assert_eq!(dns.nameservers, vec!["10.0.0.1", "10.0.0.2", "fd00::53"]);
        assert_eq!(dns.options, vec!["ndots:2", "timeout:1"]);
    }

    #[test]
    fn renders_in_resolv_order() {
        let dns = Dns {
            nameservers: vec!["1.1.1.1".into()],
            domain: "local".into(),
            search: vec!["a".into(), "b".into()],
            options: vec!["rotate".into()],
        };
        assert_eq!(
            render_resolv_conf(&dns),
            "domain local\nsearch a b\nnameserver 1.1.1.1\noptions rotate\n"
        );
    }

    #[test]
    fn skips_blank_driver_dns() {
        let results = vec![
            IpResult {
                dns: Some(Dns::default()),
                ..Default::default()
            },
            IpResult {
                dns: Some(Dns {
                    nameservers: vec!["8.8.8.8".into()],
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];
        assert_eq!(from_results(&results).unwrap().nameservers, vec!["8.8.8.8"]);
        assert!(from_results(&[]).is_none());
    }
}
