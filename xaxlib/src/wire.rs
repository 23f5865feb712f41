//! The 40-byte wire frame.
//!
//! Every message occupies exactly [`MESSAGE_SIZE`] bytes, laid out big-endian:
//!
//! | Offset | Size | Field                 |
//! |--------|------|-----------------------|
//! | 0      | 1    | magic byte (`0x54`)   |
//! | 1      | 1    | protocol version (1)  |
//! | 2      | 1    | type byte             |
//! | 3      | 1    | cache lifetime        |
//! | 4      | 4    | message identifier    |
//! | 8      | 16   | source address        |
//! | 24     | 16   | destination address   |
//!
//! The type byte packs the variant flags and the message type code: bit 7 is
//! the response bit, bit 6 the error bit, bit 5 the icmp bit, bits 4..0 the
//! type code. An IPv4 address occupies the first 4 bytes of its 16-byte field
//! with the remaining 12 required to be zero; an absent address (erroneous
//! responses) is 16 zero bytes.

use crate::{
    ErroneousResponse, InvalidFrame, InvalidMessage, IpVersion, Message, MessageType, Request,
    SuccessfulResponse,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const MESSAGE_SIZE: usize = 40;
pub const MAGIC: u8 = 0x54; // ASCII 'T'
pub const PROTOCOL_VERSION: u8 = 1;

const RESPONSE_BIT: u8 = 0b1000_0000;
const ERROR_BIT: u8 = 0b0100_0000;
const ICMP_BIT: u8 = 0b0010_0000;
const MESSAGE_TYPE_MASK: u8 = 0b0001_1111;

/// The message variant a frame claims to be, recovered from the type byte
/// alone.
///
/// This is a dispatch hint, not a validation: a frame that classifies
/// successfully may still fail to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Request,
    SuccessfulResponse,
    ErroneousResponse,
}

/// Classifies a frame by its response / error bits without a full decode.
pub fn classify(frame: &[u8]) -> Result<FrameClass, InvalidFrame> {
    let frame = check_size(frame)?;
    let type_byte = frame[2];

    if type_byte & RESPONSE_BIT == 0 {
        return Ok(FrameClass::Request);
    }

    if type_byte & ERROR_BIT == 0 {
        return Ok(FrameClass::SuccessfulResponse);
    }

    Ok(FrameClass::ErroneousResponse)
}

fn check_size(frame: &[u8]) -> Result<&[u8; MESSAGE_SIZE], InvalidFrame> {
    frame
        .try_into()
        .map_err(|_| InvalidFrame::FrameSize(frame.len()))
}

/// All fields of a frame, validated structurally but not yet classified.
struct RawFrame {
    response: bool,
    error: bool,
    icmp: bool,
    message_type: MessageType,
    cache_lifetime: u8,
    message_identifier: u32,
    source: [u8; 16],
    destination: [u8; 16],
}

fn parse(frame: &[u8]) -> Result<RawFrame, InvalidFrame> {
    let frame = check_size(frame)?;

    if frame[0] != MAGIC {
        return Err(InvalidFrame::Magic(frame[0]));
    }
    if frame[1] != PROTOCOL_VERSION {
        return Err(InvalidFrame::Version(frame[1]));
    }

    let type_byte = frame[2];
    let type_code = type_byte & MESSAGE_TYPE_MASK;
    let message_type =
        MessageType::from_code(type_code).ok_or(InvalidFrame::UnknownMessageType(type_code))?;

    let mut message_identifier = [0u8; 4];
    message_identifier.copy_from_slice(&frame[4..8]);
    let mut source = [0u8; 16];
    source.copy_from_slice(&frame[8..24]);
    let mut destination = [0u8; 16];
    destination.copy_from_slice(&frame[24..40]);

    Ok(RawFrame {
        response: type_byte & RESPONSE_BIT != 0,
        error: type_byte & ERROR_BIT != 0,
        icmp: type_byte & ICMP_BIT != 0,
        message_type,
        cache_lifetime: frame[3],
        message_identifier: u32::from_be_bytes(message_identifier),
        source,
        destination,
    })
}

fn decode_address(bytes: [u8; 16], expected: IpVersion) -> Result<IpAddr, InvalidFrame> {
    match expected {
        IpVersion::V4 => {
            if bytes[4..] != [0; 12] {
                return Err(InvalidFrame::AddressPadding);
            }

            let mut octets = [0u8; 4];
            octets.copy_from_slice(&bytes[..4]);
            Ok(Ipv4Addr::from(octets).into())
        }
        IpVersion::V6 => Ok(Ipv6Addr::from(bytes).into()),
    }
}

fn decode_absent_address(bytes: [u8; 16]) -> Result<(), InvalidFrame> {
    if bytes != [0; 16] {
        return Err(InvalidFrame::AddressNotAbsent);
    }

    Ok(())
}

fn encode_address(addr: Option<IpAddr>) -> [u8; 16] {
    let mut bytes = [0u8; 16];

    match addr {
        Some(IpAddr::V4(v4)) => bytes[..4].copy_from_slice(&v4.octets()),
        Some(IpAddr::V6(v6)) => bytes.copy_from_slice(&v6.octets()),
        None => {}
    }

    bytes
}

fn encode(
    type_bits: u8,
    message_type: MessageType,
    cache_lifetime: u8,
    message_identifier: u32,
    source: Option<IpAddr>,
    destination: Option<IpAddr>,
) -> [u8; MESSAGE_SIZE] {
    let mut frame = [0u8; MESSAGE_SIZE];

    frame[0] = MAGIC;
    frame[1] = PROTOCOL_VERSION;
    frame[2] = type_bits | message_type.code();
    frame[3] = cache_lifetime;
    frame[4..8].copy_from_slice(&message_identifier.to_be_bytes());
    frame[8..24].copy_from_slice(&encode_address(source));
    frame[24..40].copy_from_slice(&encode_address(destination));

    frame
}

impl Request {
    pub fn from_wire(frame: &[u8]) -> Result<Self, InvalidMessage> {
        let raw = parse(frame)?;

        if raw.response || raw.error || raw.icmp {
            return Err(InvalidFrame::RequestFlags.into());
        }

        let expected = raw.message_type.pre_translation_version();
        let source = decode_address(raw.source, expected)?;
        let destination = decode_address(raw.destination, expected)?;

        Request::new(raw.message_type, raw.message_identifier, source, destination)
    }

    pub fn to_wire(&self) -> [u8; MESSAGE_SIZE] {
        encode(
            0,
            self.message_type(),
            0,
            self.message_identifier(),
            Some(self.source()),
            Some(self.destination()),
        )
    }
}

impl SuccessfulResponse {
    pub fn from_wire(frame: &[u8]) -> Result<Self, InvalidMessage> {
        let raw = parse(frame)?;

        if !raw.response || raw.error || raw.icmp {
            return Err(InvalidFrame::SuccessfulResponseFlags.into());
        }

        let expected = raw.message_type.post_translation_version();
        let source = decode_address(raw.source, expected)?;
        let destination = decode_address(raw.destination, expected)?;

        SuccessfulResponse::new(
            raw.message_type,
            raw.cache_lifetime,
            raw.message_identifier,
            source,
            destination,
        )
    }

    pub fn to_wire(&self) -> [u8; MESSAGE_SIZE] {
        encode(
            RESPONSE_BIT,
            self.message_type(),
            self.cache_lifetime(),
            self.message_identifier(),
            Some(self.source()),
            Some(self.destination()),
        )
    }
}

impl ErroneousResponse {
    pub fn from_wire(frame: &[u8]) -> Result<Self, InvalidMessage> {
        let raw = parse(frame)?;

        if !raw.response || !raw.error {
            return Err(InvalidFrame::ErroneousResponseFlags.into());
        }

        decode_absent_address(raw.source)?;
        decode_absent_address(raw.destination)?;

        ErroneousResponse::new(raw.icmp, raw.message_type, raw.message_identifier)
    }

    pub fn to_wire(&self) -> [u8; MESSAGE_SIZE] {
        let icmp = if self.icmp() { ICMP_BIT } else { 0 };

        encode(
            RESPONSE_BIT | ERROR_BIT | icmp,
            self.message_type(),
            0,
            self.message_identifier(),
            None,
            None,
        )
    }
}

impl Message {
    /// Decodes a frame as whichever variant its type byte claims.
    pub fn from_wire(frame: &[u8]) -> Result<Self, InvalidMessage> {
        match classify(frame)? {
            FrameClass::Request => Request::from_wire(frame).map(Message::Request),
            FrameClass::SuccessfulResponse => {
                SuccessfulResponse::from_wire(frame).map(Message::SuccessfulResponse)
            }
            FrameClass::ErroneousResponse => {
                ErroneousResponse::from_wire(frame).map(Message::ErroneousResponse)
            }
        }
    }

    pub fn to_wire(&self) -> [u8; MESSAGE_SIZE] {
        match self {
            Message::Request(m) => m.to_wire(),
            Message::SuccessfulResponse(m) => m.to_wire(),
            Message::ErroneousResponse(m) => m.to_wire(),
        }
    }
}
