//! SIP response builder

use super::headers;
use super::message::{SipRequest, SipResponse};
use rsip::headers::{ToTypedHeader, UntypedHeader};
use rsip::{Header, Headers, Response, StatusCode, Version};

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<Header>,
    body: Vec<u8>,
    to_tag: Option<String>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: Vec::new(),
            to_tag: None,
        }
    }

    pub fn trying() -> Self {
        Self::new(100)
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn unauthorized() -> Self {
        Self::new(401)
    }

    pub fn not_found() -> Self {
        Self::new(404)
    }

    pub fn request_timeout() -> Self {
        Self::new(408)
    }

    pub fn too_many_hops() -> Self {
        Self::new(483)
    }

    pub fn server_internal_error() -> Self {
        Self::new(500)
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn server(self, name: &str) -> Self {
        self.header(Header::Server(rsip::headers::Server::new(name)))
    }

    /// Use a fixed To tag instead of a generated one
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    /// Build the response; its destination is the request's source address.
    pub fn build_for_request(self, request: &SipRequest) -> SipResponse {
        let mut response = self.build_headers_from(request.headers());
        if let Some(source) = request.source {
            response.set_destination(headers::format_socket(&source));
        }
        response
    }

    /// Build a response that only copies the dialog headers of `request_headers`.
    ///
    /// Used by the transaction layer for locally generated timeouts.
    pub fn build_headers_from(mut self, request_headers: &Headers) -> SipResponse {
        let tag_needed = self.status_code > 100;
        let mut copied = Vec::new();

        for header in request_headers.iter() {
            match header {
                Header::To(to) if tag_needed => copied.push(self.tagged_to(to)),
                Header::Via(_)
                | Header::From(_)
                | Header::To(_)
                | Header::CallId(_)
                | Header::CSeq(_) => copied.push(header.clone()),
                _ => {}
            }
        }

        copied.append(&mut self.headers);
        copied.push(Header::ContentLength(self.body.len().to_string().into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(copied),
            body: self.body,
            version: Version::V2,
        };

        SipResponse::new(response)
    }

    fn tagged_to(&self, to: &rsip::headers::To) -> Header {
        match to.typed() {
            Ok(typed) if typed.tag().is_none() => {
                let tag = self.to_tag.clone().unwrap_or_else(headers::generate_tag);
                Header::To(rsip::headers::To::new(format!("{};tag={}", to.value().trim(), tag)))
            }
            _ => Header::To(to.clone()),
        }
    }
}
