//! Message model for v1 of the external address-translation protocol spoken
//! between a stateless NAT64 translator and its addressing oracle.
//!
//! The translator asks, per packet, what the translated source / destination
//! addresses should be; the oracle answers with either a successful or an
//! erroneous response. Every message occupies exactly one 40-byte frame, see
//! [`wire`].
//!
//! Messages are immutable: they are constructed either by decoding a frame or
//! through the factory methods on [`Request`], and all invariants are checked
//! at construction. A value you hold is always well-formed.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod wire;

use std::net::IpAddr;

/// The version of an IP address, without the address itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }
}

/// What kind of packet a message is about and in which direction it travels.
///
/// The discriminants are the on-wire type codes (lower 5 bits of the type
/// byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ipv4ToIpv6Main = 1,
    Ipv4ToIpv6IcmpError = 2,
    Ipv6ToIpv4Main = 3,
    Ipv6ToIpv4IcmpError = 4,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MessageType::Ipv4ToIpv6Main),
            2 => Some(MessageType::Ipv4ToIpv6IcmpError),
            3 => Some(MessageType::Ipv6ToIpv4Main),
            4 => Some(MessageType::Ipv6ToIpv4IcmpError),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether this is a regular data packet (as opposed to an ICMP error
    /// message about another packet).
    pub fn is_main_packet(self) -> bool {
        matches!(
            self,
            MessageType::Ipv4ToIpv6Main | MessageType::Ipv6ToIpv4Main
        )
    }

    /// The IP version of the addresses *before* translation.
    ///
    /// Requests carry addresses of this version.
    pub fn pre_translation_version(self) -> IpVersion {
        match self {
            MessageType::Ipv4ToIpv6Main | MessageType::Ipv4ToIpv6IcmpError => IpVersion::V4,
            MessageType::Ipv6ToIpv4Main | MessageType::Ipv6ToIpv4IcmpError => IpVersion::V6,
        }
    }

    /// The IP version of the addresses *after* translation.
    ///
    /// Successful responses carry addresses of this version.
    pub fn post_translation_version(self) -> IpVersion {
        match self.pre_translation_version() {
            IpVersion::V4 => IpVersion::V6,
            IpVersion::V6 => IpVersion::V4,
        }
    }
}

/// A logical violation of the message model.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidMessage {
    #[error("{message_type:?} messages must carry {expected:?} source and destination addresses")]
    AddressVersion {
        message_type: MessageType,
        expected: IpVersion,
    },
    #[error("the icmp bit may only be set for main-packet message types, got {0:?}")]
    IcmpBitNotAllowed(MessageType),
    #[error(transparent)]
    Frame(#[from] InvalidFrame),
}

/// A structural violation of a 40-byte frame.
///
/// Converts into [`InvalidMessage`]: code that handles bad messages handles
/// bad frames too.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidFrame {
    #[error("frames are exactly 40 bytes, got {0}")]
    FrameSize(usize),
    #[error("bad magic byte {0:#04x}")]
    Magic(u8),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("unknown message type code {0}")]
    UnknownMessageType(u8),
    #[error("an IPv4 address field must be zero-padded in its last 12 bytes")]
    AddressPadding,
    #[error("an absent address field must be all-zero")]
    AddressNotAbsent,
    #[error("a request must have the response, error and icmp bits all unset")]
    RequestFlags,
    #[error("a successful response must have the response bit set and the error and icmp bits unset")]
    SuccessfulResponseFlags,
    #[error("an erroneous response must have both the response and error bits set")]
    ErroneousResponseFlags,
}

fn check_address_versions(
    message_type: MessageType,
    expected: IpVersion,
    source: IpAddr,
    destination: IpAddr,
) -> Result<(), InvalidMessage> {
    if IpVersion::of(source) != expected || IpVersion::of(destination) != expected {
        return Err(InvalidMessage::AddressVersion {
            message_type,
            expected,
        });
    }

    Ok(())
}

/// A translator asking what the translated addresses of one packet should be.
///
/// Carries the pre-translation addresses: IPv4 for `Ipv4ToIpv6*` types, IPv6
/// for `Ipv6ToIpv4*` types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    message_type: MessageType,
    message_identifier: u32,
    source: IpAddr,
    destination: IpAddr,
}

impl Request {
    pub fn new(
        message_type: MessageType,
        message_identifier: u32,
        source: IpAddr,
        destination: IpAddr,
    ) -> Result<Self, InvalidMessage> {
        check_address_versions(
            message_type,
            message_type.pre_translation_version(),
            source,
            destination,
        )?;

        Ok(Self {
            message_type,
            message_identifier,
            source,
            destination,
        })
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The correlation token chosen by the translator.
    ///
    /// Opaque: it is echoed unmodified in responses and never interpreted.
    pub fn message_identifier(&self) -> u32 {
        self.message_identifier
    }

    pub fn source(&self) -> IpAddr {
        self.source
    }

    pub fn destination(&self) -> IpAddr {
        self.destination
    }

    /// Builds the successful response to this request, inheriting its message
    /// type and identifier.
    ///
    /// Fails if the translated addresses do not match the post-translation IP
    /// version of the message type.
    pub fn successful_response(
        &self,
        cache_lifetime: u8,
        source: IpAddr,
        destination: IpAddr,
    ) -> Result<SuccessfulResponse, InvalidMessage> {
        SuccessfulResponse::new(
            self.message_type,
            cache_lifetime,
            self.message_identifier,
            source,
            destination,
        )
    }

    /// Builds the erroneous response to this request, inheriting its message
    /// type and identifier.
    pub fn erroneous_response(&self, icmp: bool) -> Result<ErroneousResponse, InvalidMessage> {
        ErroneousResponse::new(icmp, self.message_type, self.message_identifier)
    }
}

/// The oracle's answer when translation succeeded.
///
/// Carries the post-translation addresses: IPv6 for `Ipv4ToIpv6*` types, IPv4
/// for `Ipv6ToIpv4*` types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuccessfulResponse {
    message_type: MessageType,
    cache_lifetime: u8,
    message_identifier: u32,
    source: IpAddr,
    destination: IpAddr,
}

impl SuccessfulResponse {
    pub fn new(
        message_type: MessageType,
        cache_lifetime: u8,
        message_identifier: u32,
        source: IpAddr,
        destination: IpAddr,
    ) -> Result<Self, InvalidMessage> {
        check_address_versions(
            message_type,
            message_type.post_translation_version(),
            source,
            destination,
        )?;

        Ok(Self {
            message_type,
            cache_lifetime,
            message_identifier,
            source,
            destination,
        })
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// How long the translator may reuse this answer for identical requests.
    ///
    /// The unit is a convention between translator and oracle; the protocol
    /// treats it as opaque.
    pub fn cache_lifetime(&self) -> u8 {
        self.cache_lifetime
    }

    pub fn message_identifier(&self) -> u32 {
        self.message_identifier
    }

    pub fn source(&self) -> IpAddr {
        self.source
    }

    pub fn destination(&self) -> IpAddr {
        self.destination
    }
}

/// The oracle's answer when translation failed.
///
/// `icmp` tells the translator what to do with the untranslatable packet:
/// `true` means "answer it with an ICMP unreachable", `false` means "drop it
/// silently". Because ICMP errors are never themselves answered with ICMP,
/// the bit may only be set for main-packet message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErroneousResponse {
    icmp: bool,
    message_type: MessageType,
    message_identifier: u32,
}

impl ErroneousResponse {
    pub fn new(
        icmp: bool,
        message_type: MessageType,
        message_identifier: u32,
    ) -> Result<Self, InvalidMessage> {
        if icmp && !message_type.is_main_packet() {
            return Err(InvalidMessage::IcmpBitNotAllowed(message_type));
        }

        Ok(Self {
            icmp,
            message_type,
            message_identifier,
        })
    }

    pub fn icmp(&self) -> bool {
        self.icmp
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn message_identifier(&self) -> u32 {
        self.message_identifier
    }
}

/// Any protocol message; the closed sum of the three variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    SuccessfulResponse(SuccessfulResponse),
    ErroneousResponse(ErroneousResponse),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(m) => m.message_type(),
            Message::SuccessfulResponse(m) => m.message_type(),
            Message::ErroneousResponse(m) => m.message_type(),
        }
    }

    pub fn message_identifier(&self) -> u32 {
        match self {
            Message::Request(m) => m.message_identifier(),
            Message::SuccessfulResponse(m) => m.message_identifier(),
            Message::ErroneousResponse(m) => m.message_identifier(),
        }
    }
}

impl From<Request> for Message {
    fn from(m: Request) -> Self {
        Message::Request(m)
    }
}

impl From<SuccessfulResponse> for Message {
    fn from(m: SuccessfulResponse) -> Self {
        Message::SuccessfulResponse(m)
    }
}

impl From<ErroneousResponse> for Message {
    fn from(m: ErroneousResponse) -> Self {
        Message::ErroneousResponse(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const ID: u32 = 0xDEAD_BEEF;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        Ipv4Addr::new(a, b, c, d).into()
    }

    fn v6(segments: [u16; 8]) -> IpAddr {
        Ipv6Addr::from(segments).into()
    }

    #[test]
    fn request_requires_pre_translation_versions() {
        let err = Request::new(
            MessageType::Ipv4ToIpv6Main,
            ID,
            v6([0xfd64, 0, 0, 0, 0, 0, 0, 2]),
            v4(192, 168, 64, 2),
        )
        .unwrap_err();

        assert_eq!(
            err,
            InvalidMessage::AddressVersion {
                message_type: MessageType::Ipv4ToIpv6Main,
                expected: IpVersion::V4,
            }
        );
    }

    #[test]
    fn successful_response_requires_post_translation_versions() {
        let request = Request::new(
            MessageType::Ipv4ToIpv6Main,
            ID,
            v4(8, 8, 8, 8),
            v4(192, 168, 64, 2),
        )
        .unwrap();

        // Echoing the request's own (IPv4) addresses back is a version error.
        let err = request
            .successful_response(5, request.source(), request.destination())
            .unwrap_err();

        assert_eq!(
            err,
            InvalidMessage::AddressVersion {
                message_type: MessageType::Ipv4ToIpv6Main,
                expected: IpVersion::V6,
            }
        );
    }

    #[test]
    fn icmp_bit_is_rejected_for_icmp_error_types() {
        let request = Request::new(
            MessageType::Ipv4ToIpv6IcmpError,
            ID,
            v4(192, 168, 64, 2),
            v4(1, 2, 3, 4),
        )
        .unwrap();

        assert_eq!(
            request.erroneous_response(true).unwrap_err(),
            InvalidMessage::IcmpBitNotAllowed(MessageType::Ipv4ToIpv6IcmpError)
        );
        assert!(request.erroneous_response(false).is_ok());
    }

    #[test]
    fn responses_echo_the_message_identifier() {
        let request = Request::new(
            MessageType::Ipv6ToIpv4Main,
            ID,
            v6([0xfd64, 0, 0, 0, 0, 0, 0, 2]),
            v6([0x64, 0xff9b, 0, 0, 0, 0, 0x0808, 0x0808]),
        )
        .unwrap();

        let successful = request
            .successful_response(5, v4(192, 168, 64, 2), v4(8, 8, 8, 8))
            .unwrap();
        let erroneous = request.erroneous_response(true).unwrap();

        assert_eq!(successful.message_identifier(), ID);
        assert_eq!(erroneous.message_identifier(), ID);
        assert_eq!(successful.message_type(), request.message_type());
        assert_eq!(erroneous.message_type(), request.message_type());
    }

    #[test]
    fn message_type_codes_roundtrip() {
        for code in 1..=4 {
            assert_eq!(MessageType::from_code(code).unwrap().code(), code);
        }
        assert_eq!(MessageType::from_code(0), None);
        assert_eq!(MessageType::from_code(5), None);
    }
}
