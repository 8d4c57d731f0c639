//! Header helpers for the rewrites a relaying hop performs
//!
//! Via handling follows RFC 3261 (section 16.6 / 16.7 / 18.2) and the
//! `received` / `rport` annotations of RFC 3581.

use rand::Rng;
use rsip::headers::{ToTypedHeader, UntypedHeader};
use rsip::param::{OtherParamValue, Received};
use rsip::{typed, Header, Headers, Host, HostWithPort, Param};
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

pub const DEFAULT_SIP_PORT: u16 = 5060;
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

/// RFC 3261 magic cookie every branch must start with
pub const BRANCH_MAGIC: &str = "z9hG4bK";

pub fn generate_branch() -> String {
    let random: u64 = rand::thread_rng().gen();
    format!("{}{:x}", BRANCH_MAGIC, random)
}

pub fn generate_tag() -> String {
    let random: u32 = rand::thread_rng().gen();
    format!("{:08x}", random)
}

/// Split a comma separated header value, ignoring commas inside `<...>` and quotes.
fn split_elements(value: &str) -> Vec<&str> {
    let mut elements = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;

    for (idx, ch) in value.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                elements.push(value[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    elements.push(value[start..].trim());
    elements.retain(|e| !e.is_empty());
    elements
}

/// Format a socket address the way it appears in SIP headers
pub fn format_socket(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("{}:{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("[{}]:{}", v6.ip(), v6.port()),
    }
}

/// `host:port` of a URI or sent-by, with the default SIP port filled in
pub fn host_port(host_with_port: &HostWithPort) -> String {
    let port = host_with_port
        .port
        .map(u16::from)
        .unwrap_or(DEFAULT_SIP_PORT);
    match &host_with_port.host {
        Host::IpAddr(ip) => format_socket(&SocketAddr::new(*ip, port)),
        Host::Domain(domain) => format!("{}:{}", domain, port),
    }
}

/// First entry of a Contact header, which may list several
pub fn first_contact(contact: &rsip::headers::Contact) -> Option<typed::Contact> {
    let first = split_elements(contact.value()).first()?.to_string();
    match rsip::headers::Contact::new(first).typed() {
        Ok(contact) => Some(contact),
        Err(e) => {
            debug!("Unparseable Contact {:?}: {}", contact.value(), e);
            None
        }
    }
}

// ----------------------------------------------------------------------------
// Via
// ----------------------------------------------------------------------------

/// Raw value of the top-most Via entry
pub fn top_via(headers: &Headers) -> Option<String> {
    headers.iter().find_map(|h| match h {
        Header::Via(via) => split_elements(via.value()).first().map(|v| v.to_string()),
        _ => None,
    })
}

/// Top-most Via entry in its typed form
pub fn top_typed_via(headers: &Headers) -> Option<typed::Via> {
    let value = top_via(headers)?;
    match rsip::headers::Via::new(value.clone()).typed() {
        Ok(via) => Some(via),
        Err(e) => {
            debug!("Unparseable Via {:?}: {}", value, e);
            None
        }
    }
}

/// Number of Via entries, counting comma separated values individually
pub fn via_count(headers: &Headers) -> usize {
    headers
        .iter()
        .map(|h| match h {
            Header::Via(via) => split_elements(via.value()).len(),
            _ => 0,
        })
        .sum()
}

/// Value of a parameter rsip has no variant for (`rport`); `Some(None)` for a bare flag
fn other_param<'a>(params: &'a [Param], name: &str) -> Option<Option<&'a str>> {
    params.iter().find_map(|param| match param {
        Param::Other(key, value) if key.value().eq_ignore_ascii_case(name) => {
            Some(value.as_ref().map(|v| v.value()))
        }
        _ => None,
    })
}

fn received(via: &typed::Via) -> Option<&str> {
    via.params.iter().find_map(|param| match param {
        Param::Received(received) => Some(received.value()),
        _ => None,
    })
}

/// Where a response for this Via entry has to go.
///
/// `received` overrides the sent-by host and `rport` the sent-by port.
pub fn response_target(via: &typed::Via) -> String {
    let sent_by = &via.uri.host_with_port;
    let host = received(via)
        .and_then(|received| received.parse::<IpAddr>().ok())
        .map(Host::IpAddr)
        .unwrap_or_else(|| sent_by.host.clone());
    let port = other_param(&via.params, "rport")
        .flatten()
        .and_then(|rport| rport.parse::<u16>().ok())
        .or_else(|| sent_by.port.map(u16::from))
        .unwrap_or(DEFAULT_SIP_PORT);

    host_port(&HostWithPort::from((host, port)))
}

/// Add `received` (and fill an empty `rport`) based on the actual source address
pub fn annotate_received(via: &typed::Via, source: SocketAddr) -> typed::Via {
    let mut annotated = via.clone();
    let mut rport_requested = false;

    for param in annotated.params.iter_mut() {
        if let Param::Other(name, value) = param {
            if value.is_none() && name.value().eq_ignore_ascii_case("rport") {
                *value = Some(OtherParamValue::new(source.port().to_string()));
                rport_requested = true;
            }
        }
    }

    let sent_by_matches = via.uri.host_with_port.host == Host::IpAddr(source.ip());
    if received(&annotated).is_none() && (rport_requested || !sent_by_matches) {
        annotated
            .params
            .push(Param::Received(Received::new(source.ip().to_string())));
        debug!("Annotated Via with received={}", source.ip());
    }

    annotated
}

/// Insert a Via entry above all existing ones
pub fn prepend_via(headers: &mut Headers, via: String) {
    let mut list: Vec<Header> = headers.iter().cloned().collect();
    let index = list
        .iter()
        .position(|h| matches!(h, Header::Via(_)))
        .unwrap_or(0);
    list.insert(index, Header::Via(rsip::headers::Via::new(via)));
    *headers = Headers::from(list);
}

/// Remove exactly the top-most Via entry and return it
pub fn remove_top_via(headers: &mut Headers) -> Option<String> {
    let mut list: Vec<Header> = headers.iter().cloned().collect();
    let index = list.iter().position(|h| matches!(h, Header::Via(_)))?;

    let removed = match &list[index] {
        Header::Via(via) => {
            let elements = split_elements(via.value());
            let top = elements.first().map(|v| v.to_string());
            if elements.len() > 1 {
                list[index] = Header::Via(rsip::headers::Via::new(elements[1..].join(", ")));
            } else {
                list.remove(index);
            }
            top
        }
        _ => None,
    };

    *headers = Headers::from(list);
    removed
}

/// Replace the top-most Via entry, keeping any entries below it
pub fn replace_top_via(headers: &mut Headers, via: String) {
    if remove_top_via(headers).is_some() {
        prepend_via(headers, via);
    }
}

// ----------------------------------------------------------------------------
// Routing headers
// ----------------------------------------------------------------------------

/// Insert a Record-Route entry above any existing ones
pub fn prepend_record_route(headers: &mut Headers, value: String) {
    let mut list: Vec<Header> = headers.iter().cloned().collect();
    let header = Header::RecordRoute(rsip::headers::RecordRoute::new(value));
    match list.iter().position(|h| matches!(h, Header::RecordRoute(_))) {
        Some(index) => list.insert(index, header),
        None => list.push(header),
    }
    *headers = Headers::from(list);
}

pub fn record_route_count(headers: &Headers) -> usize {
    headers
        .iter()
        .map(|h| match h {
            Header::RecordRoute(rr) => split_elements(rr.value()).len(),
            _ => 0,
        })
        .sum()
}

pub fn set_max_forwards(headers: &mut Headers, value: u32) {
    headers.unique_push(Header::MaxForwards(rsip::headers::MaxForwards::from(value)));
}
