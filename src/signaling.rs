//! Signaling codec: compaction of session descriptions into short,
//! role-tagged codes suitable for a QR frame or a manual paste.
//!
//! The codec is lossy by design. Everything the handshake does not
//! strictly need - media attribute noise, bundle grouping, relay and
//! IPv6 candidates - is stripped so the code stays small enough to scan.
//! ICE credentials, the DTLS fingerprint, the data-channel declaration
//! and at least one usable UDP candidate survive, which is the subset
//! the receiving stack requires to accept the description.

use crate::error::SignalError;

/// Separator between the role marker and the compacted payload.
const CODE_SEPARATOR: char = '|';

/// Which side of the handshake a code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalRole {
    Offer,
    Answer,
}

impl SignalRole {
    pub fn marker(self) -> char {
        match self {
            SignalRole::Offer => 'o',
            SignalRole::Answer => 'a',
        }
    }

    fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "o" => Some(SignalRole::Offer),
            "a" => Some(SignalRole::Answer),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SignalRole::Offer => "offer",
            SignalRole::Answer => "answer",
        }
    }
}

/// Compact an SDP document: drop non-essential directive lines and join
/// with a single LF instead of CRLF.
pub fn compact(sdp: &str) -> String {
    sdp.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty() && keep_line(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the full code text form: `<role>|<compacted sdp>`.
pub fn encode(role: SignalRole, sdp: &str) -> String {
    format!("{}{}{}", role.marker(), CODE_SEPARATOR, compact(sdp))
}

/// Expand a code back into a role and a CRLF-terminated SDP document.
pub fn expand(code: &str) -> Result<(SignalRole, String), SignalError> {
    let code = code.trim();
    let (marker, payload) = code
        .split_once(CODE_SEPARATOR)
        .ok_or(SignalError::MalformedCode("missing role separator"))?;
    let role = SignalRole::from_marker(marker)
        .ok_or(SignalError::MalformedCode("unrecognized role marker"))?;
    if payload.is_empty() {
        return Err(SignalError::MalformedCode("empty payload"));
    }
    // SDP parsers expect CRLF line endings and a terminated final line.
    let mut sdp = payload.replace('\n', "\r\n");
    sdp.push_str("\r\n");
    Ok((role, sdp))
}

/// Expand a code and require a specific role, mapping a mismatch to
/// `ProtocolMismatch`.
pub fn expand_as(code: &str, expected: SignalRole) -> Result<String, SignalError> {
    let (role, sdp) = expand(code)?;
    if role != expected {
        return Err(SignalError::ProtocolMismatch {
            expected: expected.name(),
            found: role.name(),
        });
    }
    Ok(sdp)
}

fn keep_line(line: &str) -> bool {
    const DROPPED_PREFIXES: [&str; 7] = [
        "a=extmap",
        "a=rtcp-fb",
        "a=fmtp",
        "a=rtpmap",
        "a=msid",
        "a=ssrc",
        "a=group:BUNDLE",
    ];

    if DROPPED_PREFIXES.iter().any(|p| line.starts_with(p)) {
        return false;
    }
    if line.starts_with("a=candidate:") {
        return keep_candidate(line);
    }
    true
}

/// Keep only UDP host and server-reflexive candidates with IPv4
/// addresses. Relay candidates are useless without a relay non-goal,
/// and IPv6 candidates roughly double the code length.
fn keep_candidate(line: &str) -> bool {
    let fields: Vec<&str> = line.split(' ').collect();
    // a=candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type> ...
    if fields.len() < 8 {
        return false;
    }
    if !fields[2].eq_ignore_ascii_case("udp") {
        return false;
    }
    let address = fields[4];
    if address.contains(':') {
        return false;
    }
    matches!(fields[7], "host" | "srflx")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_SDP: &str = "v=0\r\n\
        o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        a=group:BUNDLE 0\r\n\
        a=extmap-allow-mixed\r\n\
        m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=ice-ufrag:EsAw\r\n\
        a=ice-pwd:P2uYro0UCOQ4zxjKXaWCBui1\r\n\
        a=fingerprint:sha-256 0F:74:31:25:CB:A2:13:EC:28:6F:6D:2C:61:FF:5D:C2:BC:B9:DB:3D:98:14:8D:1A:BB:EA:33:0C:A4:60:A8:8E\r\n\
        a=setup:actpass\r\n\
        a=mid:0\r\n\
        a=sctp-port:5000\r\n\
        a=candidate:1 1 udp 2130706431 192.168.1.5 54321 typ host generation 0\r\n\
        a=candidate:2 1 udp 1694498815 203.0.113.9 54321 typ srflx raddr 0.0.0.0 rport 0\r\n\
        a=candidate:3 1 udp 41885439 198.51.100.7 3478 typ relay raddr 0.0.0.0 rport 0\r\n\
        a=candidate:4 1 tcp 1518280447 192.168.1.5 9 typ host tcptype active\r\n\
        a=candidate:5 1 udp 2130706431 fe80::1ff:fe23:4567:890a 54322 typ host generation 0\r\n";

    #[test]
    fn test_compact_strips_noise_lines() {
        let compacted = compact(SAMPLE_SDP);
        assert!(!compacted.contains("a=group:BUNDLE"));
        assert!(!compacted.contains("a=extmap"));
        assert!(!compacted.contains('\r'));
    }

    #[test]
    fn test_compact_keeps_handshake_essentials() {
        let compacted = compact(SAMPLE_SDP);
        assert!(compacted.contains("a=ice-ufrag:EsAw"));
        assert!(compacted.contains("a=ice-pwd:"));
        assert!(compacted.contains("a=fingerprint:sha-256"));
        assert!(compacted.contains("m=application 9 UDP/DTLS/SCTP webrtc-datachannel"));
    }

    #[test]
    fn test_candidate_filtering() {
        let compacted = compact(SAMPLE_SDP);
        // host + srflx over UDP/IPv4 survive
        assert!(compacted.contains("192.168.1.5 54321 typ host"));
        assert!(compacted.contains("typ srflx"));
        // relay, tcp and IPv6 are dropped
        assert!(!compacted.contains("typ relay"));
        assert!(!compacted.contains("tcp"));
        assert!(!compacted.contains("fe80::"));
    }

    #[test]
    fn test_round_trip_restores_crlf() {
        let code = encode(SignalRole::Offer, SAMPLE_SDP);
        let (role, sdp) = expand(&code).unwrap();
        assert_eq!(role, SignalRole::Offer);
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.ends_with("\r\n"));
        assert!(sdp.contains("a=ice-ufrag:EsAw\r\n"));
        // expand(compact(d)) keeps at least one usable candidate
        assert!(sdp.contains("typ host"));
    }

    #[test]
    fn test_expand_rejects_missing_separator() {
        assert!(matches!(
            expand("v=0"),
            Err(SignalError::MalformedCode(_))
        ));
    }

    #[test]
    fn test_expand_rejects_unknown_role() {
        assert!(matches!(
            expand("x|v=0"),
            Err(SignalError::MalformedCode(_))
        ));
    }

    #[test]
    fn test_expand_rejects_empty_payload() {
        assert!(matches!(
            expand("o|"),
            Err(SignalError::MalformedCode(_))
        ));
    }

    #[test]
    fn test_expand_as_role_mismatch() {
        let code = encode(SignalRole::Answer, SAMPLE_SDP);
        let err = expand_as(&code, SignalRole::Offer).unwrap_err();
        assert!(matches!(
            err,
            SignalError::ProtocolMismatch {
                expected: "offer",
                found: "answer"
            }
        ));
    }
}
