//! SIP Registrar - records which address serves a user identity

use super::builder::ResponseBuilder;
use super::headers;
use super::message::{SipRequest, SipResponse};
use crate::domain::registry::Registry;
use metrics::{counter, gauge};
use rsip::headers::UntypedHeader;
use rsip::param::{OtherParam, OtherParamValue};
use rsip::{typed, Header, Param};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of processing one REGISTER
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Accepted { user: String, address: String },
    Rejected(&'static str),
}

pub struct Registrar {
    registry: Arc<dyn Registry>,
    /// `host:port` this server listens on
    own_address: String,
    user_agent: String,
}

impl Registrar {
    pub fn new(
        registry: Arc<dyn Registry>,
        host: &str,
        port: u16,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            own_address: format!("{}:{}", host, port),
            user_agent: user_agent.into(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Store the binding carried by `request` and build the reply
    pub async fn handle_register(&self, request: &SipRequest) -> (Registration, SipResponse) {
        let bound = match request.contact() {
            Some(contact) => self.bind(request, contact).await,
            None => Err("Contact address not provided"),
        };

        match bound {
            Ok((user, address, contact)) => {
                counter!("sip_registrations_total", "success" => "true").increment(1);
                info!(user = %user, client = %address, "REGISTER OK");

                let response = ResponseBuilder::ok()
                    .header(Header::Contact(contact.into()))
                    .header(Header::ContentType(rsip::headers::ContentType::new(
                        "text/plain",
                    )))
                    .server(&self.user_agent)
                    .body(format!("Registered {} at {}", user, address).into_bytes())
                    .build_for_request(request);
                (Registration::Accepted { user, address }, response)
            }
            Err(reason) => {
                counter!("sip_registrations_total", "success" => "false").increment(1);
                warn!("REGISTER rejected from {:?}: {}", request.source, reason);

                let response = ResponseBuilder::unauthorized()
                    .server(&self.user_agent)
                    .body(reason.as_bytes().to_vec())
                    .build_for_request(request);
                (Registration::Rejected(reason), response)
            }
        }
    }

    async fn bind(
        &self,
        request: &SipRequest,
        mut contact: typed::Contact,
    ) -> Result<(String, String, typed::Contact), &'static str> {
        let address = headers::host_port(&contact.uri.host_with_port);
        if address == self.own_address {
            return Err("Contact address not provided");
        }

        let user = contact
            .uri
            .user()
            .map(str::to_string)
            .or_else(|| request.to_user())
            .ok_or("Contact user not provided")?;

        self.registry.add(&user, &address).await;
        gauge!("sip_registered_users").set(self.registry.len().await as f64);
        debug!("Contact added {} -> {}", user, address);

        // Echoed contact carries only the transport the request arrived over
        contact.uri.params = vec![Param::Other(
            OtherParam::new("transport"),
            Some(OtherParamValue::new(request.transport().param())),
        )];

        Ok((user, address, contact))
    }
}
