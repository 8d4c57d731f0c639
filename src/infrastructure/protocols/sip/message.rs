//! SIP message types and parsing

use super::headers;
use super::transport::TransportProtocol;
use bytes::Bytes;
use rsip::headers::{ToTypedHeader, UntypedHeader};
use rsip::{typed, Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::TransportError(err.to_string())
    }
}

/// SIP method types the router distinguishes.
///
/// Everything the dispatcher has no dedicated behaviour for collapses into
/// `Other` and is routed like any in-dialog request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Message,
    Other,
}

impl SipMethod {
    pub fn from_rsip(method: &Method) -> Self {
        match method {
            Method::Register => SipMethod::Register,
            Method::Invite => SipMethod::Invite,
            Method::Ack => SipMethod::Ack,
            Method::Cancel => SipMethod::Cancel,
            Method::Bye => SipMethod::Bye,
            Method::Message => SipMethod::Message,
            _ => SipMethod::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Message => "MESSAGE",
            SipMethod::Other => "OTHER",
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SIP Request wrapper
///
/// Besides the parsed message it carries where and how the request arrived,
/// and the forward destination the router picks before sending it on.
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
    pub source: Option<SocketAddr>,
    /// Transport the request arrived on
    pub protocol: TransportProtocol,
    pub destination: Option<String>,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self {
            inner,
            source: None,
            protocol: TransportProtocol::Udp,
            destination: None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_protocol(mut self, protocol: TransportProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn method(&self) -> SipMethod {
        SipMethod::from_rsip(&self.inner.method)
    }

    /// Method name as it appears on the wire, including extension methods.
    pub fn method_name(&self) -> String {
        self.inner.method.to_string()
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.destination = Some(destination.into());
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CallId(cid) => Some(cid.value().trim().to_string()),
            _ => None,
        })
    }

    pub fn cseq(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CSeq(cseq) => cseq.typed().ok().map(|cseq| cseq.seq),
            _ => None,
        })
    }

    /// Branch parameter of the top-most Via
    pub fn branch(&self) -> Option<String> {
        headers::top_typed_via(&self.inner.headers)
            .and_then(|via| via.branch().map(|branch| branch.to_string()))
    }

    /// Transport the request arrived on, whatever its Via claims
    pub fn transport(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn to_header(&self) -> Option<typed::To> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::To(to) => to.typed().ok(),
            _ => None,
        })
    }

    pub fn from_header(&self) -> Option<typed::From> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::From(from) => from.typed().ok(),
            _ => None,
        })
    }

    pub fn contact(&self) -> Option<typed::Contact> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Contact(contact) => headers::first_contact(contact),
            _ => None,
        })
    }

    /// User identity the request is addressed to (user part of the To URI)
    pub fn to_user(&self) -> Option<String> {
        self.to_header()
            .and_then(|to| to.uri.user().map(str::to_string))
    }

    pub fn max_forwards(&self) -> Option<u32> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::MaxForwards(mf) => mf.num().ok(),
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
    pub destination: Option<String>,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self {
            inner,
            destination: None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code() < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.destination = Some(destination.into());
    }

    pub fn branch(&self) -> Option<String> {
        headers::top_typed_via(&self.inner.headers)
            .and_then(|via| via.branch().map(|branch| branch.to_string()))
    }

    /// Method named in the CSeq header
    pub fn cseq_method(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CSeq(cseq) => cseq.typed().ok().map(|cseq| cseq.method.to_string()),
            _ => None,
        })
    }

    pub fn via_count(&self) -> usize {
        headers::via_count(&self.inner.headers)
    }

    pub fn contact(&self) -> Option<typed::Contact> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Contact(contact) => headers::first_contact(contact),
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Try parsing as request first
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }

        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }

        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}
