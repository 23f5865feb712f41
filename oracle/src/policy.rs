//! The `nat64` addressing policy: stateless RFC 6052 prefix embedding around
//! a single translator identity pair.
//!
//! Packets travelling 4→6 get their source embedded into the NAT64 prefix and
//! their destination mapped onto the translator's IPv6 identity; 6→4 is the
//! mirror image. ICMP error packets reverse which side gets which transform,
//! because the failure they report originates on the translator side.

use ip_network::Ipv6Network;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use xaxlib::{InvalidMessage, Message, MessageType, Request};

/// Why a request could not be translated.
///
/// `icmp` is the hint forwarded to the translator: answer the packet with an
/// ICMP unreachable (`true`) or drop it silently (`false`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("address translation failed")]
pub struct TranslationFailed {
    pub icmp: bool,
}

/// Drop the packet without telling the origin.
const DROP: TranslationFailed = TranslationFailed { icmp: false };
/// Answer the origin with an ICMP unreachable.
const REJECT: TranslationFailed = TranslationFailed { icmp: true };

#[derive(Debug, Clone, Copy)]
pub struct Nat64Policy {
    ipv4: Ipv4Addr,
    ipv6: Ipv6Addr,
    prefix: Ipv6Network,
    allow_private: bool,
}

impl Nat64Policy {
    pub fn new(
        ipv4: Ipv4Addr,
        ipv6: Ipv6Addr,
        prefix: Ipv6Network,
        allow_private: bool,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            prefix.netmask() == 96,
            "the NAT64 prefix must be a /96, got /{}",
            prefix.netmask()
        );

        Ok(Self {
            ipv4,
            ipv6,
            prefix,
            allow_private,
        })
    }

    /// Maps a request's addresses to their translated counterparts.
    ///
    /// Pure: same inputs, same answer.
    pub fn translate(
        &self,
        message_type: MessageType,
        source: IpAddr,
        destination: IpAddr,
    ) -> Result<(IpAddr, IpAddr), TranslationFailed> {
        match message_type {
            MessageType::Ipv4ToIpv6Main => {
                self.check_main_packet(source, destination)?;

                Ok((
                    self.embed(source)?.into(),
                    self.translator_ip_4to6(destination)?.into(),
                ))
            }
            MessageType::Ipv4ToIpv6IcmpError => Ok((
                self.translator_ip_4to6(source)?.into(),
                self.embed(destination)?.into(),
            )),
            MessageType::Ipv6ToIpv4Main => {
                self.check_main_packet(source, destination)?;

                Ok((
                    self.translator_ip_6to4(source)?.into(),
                    self.extract(destination)?.into(),
                ))
            }
            MessageType::Ipv6ToIpv4IcmpError => Ok((
                self.extract(source)?.into(),
                self.translator_ip_6to4(destination)?.into(),
            )),
        }
    }

    /// Sanity checks applied to main packets only.
    ///
    /// ICMP error packets skip them: their failures must never generate
    /// further ICMP, and the inner packet already passed these checks once.
    fn check_main_packet(
        &self,
        source: IpAddr,
        destination: IpAddr,
    ) -> Result<(), TranslationFailed> {
        check_usable(source)?;
        check_usable(destination)?;
        self.check_not_private(source)?;
        self.check_not_private(destination)?;

        Ok(())
    }

    fn check_not_private(&self, addr: IpAddr) -> Result<(), TranslationFailed> {
        if !self.allow_private && is_private(addr) {
            return Err(REJECT);
        }

        Ok(())
    }

    /// Embeds an IPv4 address into the low 32 bits of the NAT64 prefix.
    fn embed(&self, addr: IpAddr) -> Result<Ipv6Addr, TranslationFailed> {
        let IpAddr::V4(v4) = addr else {
            return Err(DROP);
        };

        let mut octets = self.prefix.network_address().octets();
        octets[12..].copy_from_slice(&v4.octets());

        Ok(Ipv6Addr::from(octets))
    }

    /// Recovers the IPv4 address embedded in the NAT64 prefix.
    fn extract(&self, addr: IpAddr) -> Result<Ipv4Addr, TranslationFailed> {
        let IpAddr::V6(v6) = addr else {
            return Err(DROP);
        };

        if !self.prefix.contains(v6) {
            return Err(DROP);
        }

        let mut v4 = [0u8; 4];
        v4.copy_from_slice(&v6.octets()[12..]);

        Ok(Ipv4Addr::from(v4))
    }

    fn translator_ip_4to6(&self, addr: IpAddr) -> Result<Ipv6Addr, TranslationFailed> {
        if addr != IpAddr::V4(self.ipv4) {
            return Err(DROP);
        }

        Ok(self.ipv6)
    }

    fn translator_ip_6to4(&self, addr: IpAddr) -> Result<Ipv4Addr, TranslationFailed> {
        if addr != IpAddr::V6(self.ipv6) {
            return Err(DROP);
        }

        Ok(self.ipv4)
    }
}

fn check_usable(addr: IpAddr) -> Result<(), TranslationFailed> {
    let unusable = match addr {
        IpAddr::V4(v4) => {
            v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.octets()[0] == 0
        }
        IpAddr::V6(v6) => v6.is_unspecified() || v6.is_loopback() || v6.is_multicast(),
    };

    if unusable {
        return Err(DROP);
    }

    Ok(())
}

fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let shared = v4.octets()[0] == 100 && (v4.octets()[1] & 0b1100_0000) == 64;

            v4.is_private() || v4.is_link_local() || shared
        }
        IpAddr::V6(v6) => v6.is_unique_local() || v6.is_unicast_link_local(),
    }
}

/// A [`Nat64Policy`] plus the lifetime it advertises for its answers.
#[derive(Debug, Clone, Copy)]
pub struct Oracle {
    policy: Nat64Policy,
    cache_lifetime: u8,
}

impl Oracle {
    pub fn new(policy: Nat64Policy, cache_lifetime: u8) -> Self {
        Self {
            policy,
            cache_lifetime,
        }
    }

    /// Answers one request with either response variant.
    pub fn respond(&self, request: &Request) -> Result<Message, InvalidMessage> {
        let message_type = request.message_type();

        match self
            .policy
            .translate(message_type, request.source(), request.destination())
        {
            Ok((source, destination)) => {
                tracing::debug!(
                    ?message_type,
                    src = %request.source(),
                    dst = %request.destination(),
                    translated_src = %source,
                    translated_dst = %destination,
                    "Translated addresses"
                );

                Ok(request
                    .successful_response(self.cache_lifetime, source, destination)?
                    .into())
            }
            Err(TranslationFailed { icmp }) => {
                tracing::debug!(
                    ?message_type,
                    src = %request.source(),
                    dst = %request.destination(),
                    icmp,
                    "Translation failed"
                );

                Ok(request.erroneous_response(icmp)?.into())
            }
        }
    }
}
