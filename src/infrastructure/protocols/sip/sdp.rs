//! Simple SDP (Session Description Protocol) handling

use std::fmt;
use std::net::IpAddr;

/// Simple SDP session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: Option<SdpConnection>,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpConnection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

impl SdpConnection {
    pub fn internet(address: &str) -> Self {
        Self {
            network_type: "IN".to_string(),
            address_type: address_type(address).to_string(),
            address: address.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    pub media_type: String,  // "audio", "video"
    pub port: u16,
    pub protocol: String,    // "RTP/AVP"
    pub formats: Vec<String>, // Codec payload types
    /// `a=` lines in order, `(key, value)`; flags have no value
    pub attributes: Vec<(String, Option<String>)>,
}

impl SdpMedia {
    pub fn attribute(&self, key: &str) -> Option<Option<&str>> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref())
    }
}

fn address_type(address: &str) -> &'static str {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => "IP6",
        _ => "IP4",
    }
}

impl SdpSession {
    /// Receive-only PCMU answer for `offer`.
    ///
    /// The origin keeps the offer's session id; its version is that id plus two.
    /// Returns `None` when the offer's session id is not numeric.
    pub fn pcmu_answer(offer: &SdpSession, local_address: &str, port: u16) -> Option<Self> {
        let session_id: u64 = offer.origin.session_id.parse().ok()?;

        Some(Self {
            version: 0,
            origin: SdpOrigin {
                username: "-".to_string(),
                session_id: session_id.to_string(),
                session_version: session_id.wrapping_add(2).to_string(),
                network_type: "IN".to_string(),
                address_type: address_type(local_address).to_string(),
                address: local_address.to_string(),
            },
            session_name: "Beowulf".to_string(),
            connection: Some(SdpConnection::internet(local_address)),
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port,
                protocol: "RTP/AVP".to_string(),
                formats: vec!["0".to_string()],
                attributes: vec![
                    ("rtpmap".to_string(), Some("0 PCMU/8000".to_string())),
                    ("ptime".to_string(), Some("20".to_string())),
                    ("maxptime".to_string(), Some("150".to_string())),
                    ("recvonly".to_string(), None),
                ],
            }],
        })
    }

    /// Parse SDP from string
    pub fn parse(sdp_body: &str) -> Option<Self> {
        let mut version = 0;
        let mut origin: Option<SdpOrigin> = None;
        let mut session_name = String::new();
        let mut connection: Option<SdpConnection> = None;
        let mut media: Vec<SdpMedia> = Vec::new();
        let mut current_media: Option<SdpMedia> = None;

        for line in sdp_body.lines() {
            let line = line.trim();
            if line.len() < 2 || !line.contains('=') {
                continue;
            }

            let (field_type, value) = line.split_at(2);
            let value = value.trim();

            match field_type {
                "v=" => {
                    version = value.parse().ok()?;
                }
                "o=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 6 {
                        return None;
                    }
                    origin = Some(SdpOrigin {
                        username: parts[0].to_string(),
                        session_id: parts[1].to_string(),
                        session_version: parts[2].to_string(),
                        network_type: parts[3].to_string(),
                        address_type: parts[4].to_string(),
                        address: parts[5].to_string(),
                    });
                }
                "s=" => {
                    session_name = value.to_string();
                }
                "c=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    // Media-level connection is ignored
                    if parts.len() >= 3 && current_media.is_none() {
                        connection = Some(SdpConnection {
                            network_type: parts[0].to_string(),
                            address_type: parts[1].to_string(),
                            address: parts[2].to_string(),
                        });
                    }
                }
                "m=" => {
                    if let Some(m) = current_media.take() {
                        media.push(m);
                    }

                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 4 {
                        current_media = Some(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].split('/').next()?.parse().ok()?,
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().map(|s| s.to_string()).collect(),
                            attributes: Vec::new(),
                        });
                    }
                }
                "a=" => {
                    if let Some(media) = current_media.as_mut() {
                        let attribute = match value.split_once(':') {
                            Some((key, val)) => (key.to_string(), Some(val.to_string())),
                            None => (value.to_string(), None),
                        };
                        media.attributes.push(attribute);
                    }
                }
                _ => {}
            }
        }

        if let Some(m) = current_media.take() {
            media.push(m);
        }

        Some(Self {
            version,
            origin: origin?,
            session_name,
            connection,
            media,
        })
    }

    /// Get media description for audio
    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(
            f,
            "o={} {} {} {} {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.network_type,
            self.origin.address_type,
            self.origin.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;

        if let Some(connection) = &self.connection {
            write!(
                f,
                "c={} {} {}\r\n",
                connection.network_type, connection.address_type, connection.address
            )?;
        }

        write!(f, "t=0 0\r\n")?;

        for media in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            )?;
            for (key, value) in &media.attributes {
                match value {
                    Some(value) => write!(f, "a={}:{}\r\n", key, value)?,
                    None => write!(f, "a={}\r\n", key)?,
                }
            }
        }

        Ok(())
    }
}
