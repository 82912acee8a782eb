//! Checks stored server certificates against the CA.

use std::collections::BTreeSet;
use std::net::IpAddr;

use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::{Pem, parse_x509_pem};

/// Outcome of checking a stored server certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Validation {
    /// The certificate chains to the CA, is within its validity window and
    /// names exactly the expected SANs.
    Valid,
    /// The certificate should be regenerated.
    Invalid {
        /// Why the certificate was rejected.
        reason: String,
    },
}

impl Validation {
    /// Returns `true` for [`Validation::Valid`].
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

fn pem_block(label: &str, text: &str) -> Result<Pem, Validation> {
    parse_x509_pem(text.as_bytes())
        .map(|(_, pem)| pem)
        .map_err(|err| Validation::invalid(format!("{label} is not PEM: {err}")))
}

fn san_set(cert: &X509Certificate<'_>) -> Result<BTreeSet<String>, Validation> {
    let extension = cert
        .subject_alternative_name()
        .map_err(|err| Validation::invalid(format!("unreadable SAN extension: {err}")))?;
    let Some(extension) = extension else {
        return Ok(BTreeSet::new());
    };
    Ok(extension
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some((*dns).to_owned()),
            GeneralName::IPAddress(raw) => ip_text(raw),
            _ => None,
        })
        .collect())
}

fn ip_text(raw: &[u8]) -> Option<String> {
    if let Ok(octets) = <[u8; 4]>::try_from(raw) {
        return Some(IpAddr::from(octets).to_string());
    }
    <[u8; 16]>::try_from(raw)
        .ok()
        .map(|octets| IpAddr::from(octets).to_string())
}

fn normalise(san: &str) -> String {
    san.parse::<IpAddr>()
        .map_or_else(|_| san.to_owned(), |ip| ip.to_string())
}

fn check(ca_pem: &str, server_pem: &str, sans: &[String]) -> Result<(), Validation> {
    let ca_block = pem_block("CA certificate", ca_pem)?;
    let server_block = pem_block("server certificate", server_pem)?;
    let ca = ca_block
        .parse_x509()
        .map_err(|err| Validation::invalid(format!("CA certificate does not parse: {err}")))?;
    let server = server_block
        .parse_x509()
        .map_err(|err| Validation::invalid(format!("server certificate does not parse: {err}")))?;

    server.verify_signature(Some(ca.public_key())).map_err(|err| {
        Validation::invalid(format!("server certificate does not chain to the CA: {err}"))
    })?;
    if !server.validity().is_valid() {
        return Err(Validation::invalid("server certificate is outside its validity period"));
    }

    let present = san_set(&server)?;
    let expected: BTreeSet<String> = sans.iter().map(|san| normalise(san)).collect();
    if present != expected {
        return Err(Validation::invalid(format!(
            "SANs {present:?} differ from {expected:?}"
        )));
    }
    Ok(())
}

/// Validates `server_pem` against `ca_pem` and the expected SAN list.
pub(super) fn server(ca_pem: &str, server_pem: &str, sans: &[String]) -> Validation {
    match check(ca_pem, server_pem, sans) {
        Ok(()) => Validation::Valid,
        Err(invalid) => invalid,
    }
}
