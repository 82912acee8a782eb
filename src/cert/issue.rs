//! Certificate parameter construction and signing.

use std::net::IpAddr;

use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_RSA_SHA256, SanType,
};
use time::{Duration, OffsetDateTime};

use super::CertError;

/// Lifetime of every certificate the authority mints.
pub const CERT_VALIDITY_DAYS: i64 = 1080;

const BACKDATE_MINUTES: i64 = 5;

/// Modulus length of every generated RSA key.
pub const KEY_BITS: u32 = 2048;

/// PEM encoded certificate and private key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IssuedCert {
    /// Certificate in PEM form.
    pub cert_pem: String,
    /// Private key in PEM form.
    pub key_pem: String,
}

/// Subject of a server certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerRequest {
    /// Organisation field, `<local-user>.<machine>`.
    pub organization: String,
    /// Subject alternative names, de-duplicated.
    pub sans: Vec<String>,
}

impl ServerRequest {
    /// Builds the request for machine `name`.
    #[must_use]
    pub fn for_machine(
        local_user: &str,
        name: &str,
        ip: &str,
        ssh_hostname: &str,
        extra_sans: &[String],
    ) -> Self {
        Self {
            organization: format!("{local_user}.{name}"),
            sans: server_sans(extra_sans, ip, ssh_hostname, name),
        }
    }
}

/// Returns the SAN list for a server certificate: the extra names, then the
/// machine IP, `localhost`, `127.0.0.1`, the SSH hostname and the machine
/// name. Blank entries are skipped and duplicates keep their first position.
#[must_use]
pub fn server_sans(extra: &[String], ip: &str, ssh_hostname: &str, name: &str) -> Vec<String> {
    let mut sans: Vec<String> = Vec::new();
    let candidates = extra
        .iter()
        .map(String::as_str)
        .chain([ip, "localhost", "127.0.0.1", ssh_hostname, name]);
    for candidate in candidates.map(str::trim) {
        if !candidate.is_empty() && !sans.iter().any(|known| known == candidate) {
            sans.push(candidate.to_owned());
        }
    }
    sans
}

fn san_entry(value: &str) -> SanType {
    value.parse::<IpAddr>().map_or_else(
        |_| SanType::DnsName(value.to_owned()),
        SanType::IpAddress,
    )
}

/// rcgen cannot generate RSA keys, so openssl mints them.
fn rsa_key_pair() -> Result<KeyPair, CertError> {
    let der = Rsa::generate(KEY_BITS)
        .and_then(PKey::from_rsa)
        .and_then(|key| key.private_key_to_pkcs8())
        .map_err(|err| CertError::Generate {
            message: err.to_string(),
        })?;
    Ok(KeyPair::from_der(&der)?)
}

fn base_params(organization: &str) -> Result<CertificateParams, CertError> {
    let mut params = CertificateParams::default();
    params.alg = &PKCS_RSA_SHA256;
    params.key_pair = Some(rsa_key_pair()?);
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(BACKDATE_MINUTES);
    params.not_after = now + Duration::days(CERT_VALIDITY_DAYS);
    let mut name = DistinguishedName::new();
    name.push(DnType::OrganizationName, organization);
    params.distinguished_name = name;
    Ok(params)
}

pub(super) fn ca(organization: &str) -> Result<Certificate, CertError> {
    let mut params = base_params(organization)?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyAgreement,
    ];
    Ok(Certificate::from_params(params)?)
}

fn sign(ca: &Certificate, params: CertificateParams) -> Result<IssuedCert, CertError> {
    let leaf = Certificate::from_params(params)?;
    Ok(IssuedCert {
        cert_pem: leaf.serialize_pem_with_signer(ca)?,
        key_pem: leaf.serialize_private_key_pem(),
    })
}

pub(super) fn client(ca: &Certificate, organization: &str) -> Result<IssuedCert, CertError> {
    let mut params = base_params(organization)?;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    sign(ca, params)
}

pub(super) fn server(ca: &Certificate, request: &ServerRequest) -> Result<IssuedCert, CertError> {
    let mut params = base_params(&request.organization)?;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyAgreement,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.subject_alt_names = request.sans.iter().map(|san| san_entry(san)).collect();
    sign(ca, params)
}
