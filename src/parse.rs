//! Text-level interpretation of control-port reply payloads.
//!
//! The transport collaborator delivers reply bodies as plain lines; this
//! module turns those lines into circuit entries, router addresses, bridge
//! configuration, and unescaped credential strings.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::control::ControlReply;
use crate::types::{CircuitId, Fingerprint, SocksCredential};

/// One entry from a `circuit-status` reply.
#[derive(Debug, Clone)]
pub struct CircuitStatusEntry {
    pub id: CircuitId,
    pub status: String,
    pub path: Vec<Fingerprint>,
    /// K=V arguments with values still in wire form (possibly quoted).
    pub args: HashMap<String, String>,
}

impl CircuitStatusEntry {
    /// Extracts and unescapes the stream-isolation credential, if both
    /// fields are present. Either field missing means isolation was not in
    /// effect for this circuit.
    pub fn socks_credential(&self) -> Option<SocksCredential> {
        let username = unquote(self.args.get("SOCKS_USERNAME")?)?;
        let password = unquote(self.args.get("SOCKS_PASSWORD")?)?;
        Some(SocksCredential::from_parts(&username, &password))
    }
}

/// Finds the entry for `id` in a `circuit-status` reply. `None` means the
/// circuit is already gone.
pub fn find_circuit_entry(reply: &ControlReply, id: &CircuitId) -> Option<CircuitStatusEntry> {
    reply
        .lines
        .iter()
        .filter_map(|line| parse_circuit_entry(line))
        .find(|entry| &entry.id == id)
}

/// Parses one circuit-status line: `<id> <status> [path] [K=V ...]`.
pub fn parse_circuit_entry(line: &str) -> Option<CircuitStatusEntry> {
    let tokens = split_quoted_tokens(line);
    let mut iter = tokens.into_iter();
    let id = CircuitId::new(iter.next()?);
    let status = iter.next()?;

    let mut path = Vec::new();
    let mut args = HashMap::new();
    for token in iter {
        // The path arrives as one comma-joined token whose first hop
        // carries a `$` prefix; K=V values may legally contain `~` or `,`.
        if token.starts_with('$') {
            for hop in token.split(',') {
                // Hop form is $fingerprint~nickname or $fingerprint=nickname.
                let fingerprint = hop.split(['~', '=']).next().unwrap_or(hop);
                if !fingerprint.is_empty() {
                    path.push(Fingerprint::normalize(fingerprint));
                }
            }
        } else if let Some((key, value)) = token.split_once('=') {
            args.insert(key.to_string(), value.to_string());
        }
    }

    Some(CircuitStatusEntry {
        id,
        status,
        path,
        args,
    })
}

/// Splits a reply line on whitespace, keeping quoted values (which may
/// contain spaces and escaped quotes) as single tokens.
fn split_quoted_tokens(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Removes surrounding quotes and resolves backslash escapes. A value
/// without quotes is passed through as-is. `None` on a malformed escape.
pub fn unquote(raw: &str) -> Option<String> {
    let inner = match raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(inner) => inner,
        None => return Some(raw.to_string()),
    };
    unescape(inner)
}

/// Resolves control-protocol string escapes at the byte level, then
/// decodes UTF-8. Invalid UTF-8 after unescaping degrades lossily rather
/// than failing; a dangling or unknown escape fails.
fn unescape(inner: &str) -> Option<String> {
    let bytes = inner.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        i += 1;
        let escape = *bytes.get(i)?;
        match escape {
            b'n' => {
                out.push(b'\n');
                i += 1;
            }
            b't' => {
                out.push(b'\t');
                i += 1;
            }
            b'r' => {
                out.push(b'\r');
                i += 1;
            }
            b'\\' | b'"' | b'\'' => {
                out.push(escape);
                i += 1;
            }
            b'x' => {
                let hex = inner.get(i + 1..i + 3)?;
                let value = u8::from_str_radix(hex, 16).ok()?;
                out.push(value);
                i += 3;
            }
            b'0'..=b'7' => {
                // One to three octal digits.
                let mut value: u32 = 0;
                let mut digits = 0;
                while digits < 3 {
                    match bytes.get(i) {
                        Some(d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            digits += 1;
                            i += 1;
                        }
                        _ => break,
                    }
                }
                out.push((value & 0xff) as u8);
            }
            _ => return None,
        }
    }
    Some(String::from_utf8_lossy(&out).into_owned())
}

/// Quotes a value for use in a configuration-set command.
pub fn quote_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' | '"' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Extracts the router address from an `ns/id/<fp>` reply.
///
/// The `r` line ends with `<address> <or-port> <dir-port>`; indexing from
/// the end tolerates both the full and microdesc field layouts.
pub fn router_status_ip(reply: &ControlReply) -> Option<IpAddr> {
    let line = reply.lines.iter().find(|l| l.starts_with("r "))?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 6 {
        return None;
    }
    parts[parts.len() - 3].parse().ok()
}

/// One configured bridge line.
#[derive(Debug, Clone)]
pub struct BridgeEntry {
    /// Pluggable-transport name; `None` for a vanilla bridge line.
    pub transport: Option<String>,
    pub address: String,
    pub fingerprint: Option<Fingerprint>,
}

impl BridgeEntry {
    /// Best-effort address parse; bridge lines may carry hostnames that
    /// never parse, which is fine.
    pub fn ip(&self) -> Option<IpAddr> {
        host_part(&self.address).parse().ok()
    }
}

/// Parses the configured-bridges reply into entries. Accepts lines with or
/// without the `Bridge=` key prefix.
pub fn parse_bridge_lines(reply: &ControlReply) -> Vec<BridgeEntry> {
    reply
        .lines
        .iter()
        .filter_map(|line| parse_bridge_line(line))
        .collect()
}

fn parse_bridge_line(line: &str) -> Option<BridgeEntry> {
    let value = match line.split_once('=') {
        Some((key, value)) if key.eq_ignore_ascii_case("bridge") => value,
        _ => line,
    };
    let mut tokens = value.split_whitespace().peekable();
    let first = *tokens.peek()?;

    let transport = if looks_like_address(first) {
        None
    } else {
        tokens.next().map(str::to_string)
    };
    let address = tokens.next()?.to_string();
    let fingerprint = tokens
        .find(|t| is_hex_fingerprint(t))
        .map(Fingerprint::normalize);

    Some(BridgeEntry {
        transport,
        address,
        fingerprint,
    })
}

fn looks_like_address(token: &str) -> bool {
    // Every address form carries a port separator (hostnames included);
    // transport names never do.
    token.starts_with('[') || token.contains(':')
}

fn is_hex_fingerprint(token: &str) -> bool {
    token.len() == 40 && token.chars().all(|c| c.is_ascii_hexdigit())
}

fn host_part(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    address.rsplit_once(':').map(|(host, _)| host).unwrap_or(address)
}

/// Reads the country code out of an `ip-to-country/<ip>` reply. `"??"`
/// means the daemon has no geo data for that address.
pub fn country_code(reply: &ControlReply) -> Option<String> {
    let line = reply.lines.first()?;
    let value = line.split_once('=').map(|(_, v)| v).unwrap_or(line).trim();
    if value.is_empty() || value == "??" {
        return None;
    }
    Some(value.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FPA: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA1234";
    const FPB: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB5678";

    #[test]
    fn circuit_entry_with_path_and_credentials() {
        let line = format!(
            "7 BUILT ${}~guard,{}=middle BUILD_FLAGS=NEED_CAPACITY \
             SOCKS_USERNAME=\"alice\" SOCKS_PASSWORD=\"secret\"",
            FPA, FPB
        );
        let entry = parse_circuit_entry(&line).expect("entry parses");
        assert_eq!(entry.id, CircuitId::new("7"));
        assert_eq!(entry.status, "BUILT");
        assert_eq!(
            entry.path,
            vec![Fingerprint::normalize(FPA), Fingerprint::normalize(FPB)]
        );
        let cred = entry.socks_credential().expect("credential present");
        assert_eq!(cred.as_str(), "alice|secret");
    }

    #[test]
    fn circuit_entry_without_credentials_yields_none() {
        let entry = parse_circuit_entry("9 EXTENDED $AA~n PURPOSE=GENERAL").unwrap();
        assert!(entry.socks_credential().is_none());
    }

    #[test]
    fn quoted_username_with_spaces_survives_tokenizing() {
        let line = "3 BUILT SOCKS_USERNAME=\"a b\" SOCKS_PASSWORD=\"c\\\"d\"";
        let entry = parse_circuit_entry(line).unwrap();
        let cred = entry.socks_credential().unwrap();
        assert_eq!(cred.as_str(), "a b|c\"d");
    }

    #[test]
    fn credential_containing_path_separators_stays_an_argument() {
        let line = format!(
            "8 BUILT ${}~guard SOCKS_USERNAME=\"u,v\" SOCKS_PASSWORD=\"p~q\"",
            FPA
        );
        let entry = parse_circuit_entry(&line).unwrap();
        assert_eq!(entry.path, vec![Fingerprint::normalize(FPA)]);
        assert_eq!(entry.socks_credential().unwrap().as_str(), "u,v|p~q");
    }

    #[test]
    fn find_circuit_entry_misses_torn_down_circuit() {
        let reply = ControlReply::from_lines(vec!["4 BUILT $AA~n", "5 BUILT $BB~n"]);
        assert!(find_circuit_entry(&reply, &CircuitId::new("7")).is_none());
        assert!(find_circuit_entry(&reply, &CircuitId::new("5")).is_some());
    }

    #[test]
    fn unquote_resolves_backslash_escapes() {
        assert_eq!(unquote("\"a\\nb\"").unwrap(), "a\nb");
        assert_eq!(unquote("\"tab\\there\"").unwrap(), "tab\there");
        assert_eq!(unquote("\"q\\\"q\\\\\"").unwrap(), "q\"q\\");
        // Unquoted values pass through.
        assert_eq!(unquote("plain").unwrap(), "plain");
    }

    #[test]
    fn unquote_resolves_octal_and_hex_escapes() {
        assert_eq!(unquote("\"\\x41\\102\"").unwrap(), "AB");
        // Two-byte UTF-8 sequence written as octal escapes.
        assert_eq!(unquote("\"\\303\\251\"").unwrap(), "é");
    }

    #[test]
    fn unquote_rejects_dangling_escape() {
        assert!(unquote("\"oops\\\"").is_none());
    }

    #[test]
    fn quote_string_escapes_specials() {
        assert_eq!(quote_string("a\"b\\c"), "\"a\\\"b\\\\c\"");
        assert_eq!(quote_string("x.onion pw"), "\"x.onion pw\"");
    }

    #[test]
    fn router_status_ip_reads_address_field() {
        let reply = ControlReply::from_lines(vec![
            format!("r mid {} dig 2026-01-01 00:00:00 203.0.113.5 9001 0", FPB),
            "s Fast Running Valid".to_string(),
        ]);
        assert_eq!(
            router_status_ip(&reply),
            Some("203.0.113.5".parse().unwrap())
        );
    }

    #[test]
    fn router_status_ip_handles_microdesc_layout() {
        let reply =
            ControlReply::from_lines(vec!["r mid aWRlbnRpdHk 2026-01-01 00:00:00 198.51.100.9 443 80"]);
        assert_eq!(
            router_status_ip(&reply),
            Some("198.51.100.9".parse().unwrap())
        );
    }

    #[test]
    fn bridge_line_with_transport() {
        let reply = ControlReply::from_lines(vec![format!(
            "Bridge=obfs4 192.0.2.7:443 {} cert=abcd iat-mode=0",
            FPA
        )]);
        let bridges = parse_bridge_lines(&reply);
        assert_eq!(bridges.len(), 1);
        assert_eq!(bridges[0].transport.as_deref(), Some("obfs4"));
        assert_eq!(bridges[0].fingerprint, Some(Fingerprint::normalize(FPA)));
        assert_eq!(bridges[0].ip(), Some("192.0.2.7".parse().unwrap()));
    }

    #[test]
    fn vanilla_bridge_line_has_no_transport_token() {
        let reply = ControlReply::from_lines(vec![format!("192.0.2.8:9001 {}", FPB)]);
        let bridges = parse_bridge_lines(&reply);
        assert_eq!(bridges[0].transport, None);
        assert_eq!(bridges[0].ip(), Some("192.0.2.8".parse().unwrap()));
    }

    #[test]
    fn vanilla_bridge_line_with_hostname_address() {
        let reply =
            ControlReply::from_lines(vec![format!("bridge.example.net:443 {}", FPA)]);
        let bridges = parse_bridge_lines(&reply);
        assert_eq!(bridges[0].transport, None);
        assert_eq!(bridges[0].address, "bridge.example.net:443");
        assert_eq!(bridges[0].fingerprint, Some(Fingerprint::normalize(FPA)));
        // Hostnames never parse to an IP; the field stays blank.
        assert_eq!(bridges[0].ip(), None);
    }

    #[test]
    fn bridge_line_without_fingerprint() {
        let bridges = parse_bridge_lines(&ControlReply::from_lines(vec!["meek 198.51.100.3:80"]));
        assert_eq!(bridges[0].transport.as_deref(), Some("meek"));
        assert_eq!(bridges[0].fingerprint, None);
    }

    #[test]
    fn country_code_unknown_values() {
        assert_eq!(
            country_code(&ControlReply::from_lines(vec!["ip-to-country/203.0.113.5=FR"])),
            Some("fr".to_string())
        );
        assert_eq!(country_code(&ControlReply::from_lines(vec!["??"])), None);
        assert_eq!(country_code(&ControlReply::default()), None);
    }
}
