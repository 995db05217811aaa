//! Certificate helpers for the registry PKI
//!
//! A [`CertKey`] is a validated certificate/private-key pair held as PEM.
//! [`CertModel`] is its serialized form; converting back with
//! [`CertModel::to_pki`] re-validates the pair.

use crate::error::{RiggerError, RiggerResult};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::debug;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{parse_x509_certificate, X509Certificate};

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 3650;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertKey {
    cert_pem: String,
    key_pem: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertModel {
    pub cert: String,
    pub key: String,
}

impl CertKey {
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn to_model(&self) -> CertModel {
        CertModel {
            cert: self.cert_pem.clone(),
            key: self.key_pem.clone(),
        }
    }

    fn signer(&self) -> RiggerResult<Certificate> {
        let key_pair = KeyPair::from_pem(&self.key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&self.cert_pem, key_pair)?;
        Ok(Certificate::from_params(params)?)
    }
}

impl CertModel {
    /// Decode and validate the pair: the certificate must parse and the key
    /// must match the certificate's public key.
    pub fn to_pki(&self) -> RiggerResult<CertKey> {
        if self.cert.is_empty() || self.key.is_empty() {
            return Err(RiggerError::security("certificate or key is empty"));
        }

        let der = cert_der(&self.cert)?;
        let cert = parse_cert(&der)?;
        let key_pair = KeyPair::from_pem(&self.key)
            .map_err(|e| RiggerError::security(format!("cannot decode private key: {}", e)))?;

        if cert.public_key().subject_public_key.data.as_ref() != key_pair.public_key_raw() {
            return Err(RiggerError::security(
                "private key does not match certificate",
            ));
        }

        Ok(CertKey {
            cert_pem: self.cert.clone(),
            key_pem: self.key.clone(),
        })
    }
}

impl From<&CertKey> for CertModel {
    fn from(value: &CertKey) -> Self {
        value.to_model()
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

fn validity(params: &mut CertificateParams, days: i64) {
    params.not_before = time::OffsetDateTime::now_utc() - time::Duration::hours(1);
    params.not_after = params.not_before + time::Duration::days(days);
}

/// Generate a self-signed CA.
pub fn generate_ca(common_name: &str) -> RiggerResult<CertKey> {
    debug!(common_name, "Generating CA certificate");

    let mut params = CertificateParams::new(Vec::<String>::new());
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    validity(&mut params, CA_VALIDITY_DAYS);

    let cert = Certificate::from_params(params)?;
    Ok(CertKey {
        cert_pem: cert.serialize_pem()?,
        key_pem: cert.serialize_private_key_pem(),
    })
}

/// Generate a leaf certificate signed by `ca`. IP literals in `sans` become
/// IP SANs, everything else a DNS SAN.
pub fn generate_cert(ca: &CertKey, common_name: &str, sans: &[&str]) -> RiggerResult<CertKey> {
    debug!(common_name, ?sans, "Generating certificate");

    let signer = ca.signer()?;

    let mut params = CertificateParams::new(Vec::<String>::new());
    params.distinguished_name = distinguished_name(common_name);
    params.subject_alt_names = sans
        .iter()
        .map(|san| match san.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(san.to_string()),
        })
        .collect();
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    validity(&mut params, LEAF_VALIDITY_DAYS);

    let cert = Certificate::from_params(params)?;
    Ok(CertKey {
        cert_pem: cert.serialize_pem_with_signer(&signer)?,
        key_pem: cert.serialize_private_key_pem(),
    })
}

fn cert_der(pem_text: &str) -> RiggerResult<Vec<u8>> {
    let block = pem::parse(pem_text)
        .map_err(|e| RiggerError::security(format!("cannot decode certificate PEM: {}", e)))?;
    if block.tag() != "CERTIFICATE" {
        return Err(RiggerError::security(format!(
            "unexpected PEM block {:?}",
            block.tag()
        )));
    }
    Ok(block.into_contents())
}

fn parse_cert(der: &[u8]) -> RiggerResult<X509Certificate<'_>> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| RiggerError::security(format!("cannot parse certificate: {}", e)))?;
    Ok(cert)
}

/// Check that `cert` was signed by `ca`.
pub fn verify_signature(cert: &CertKey, ca: &CertKey) -> RiggerResult<()> {
    let leaf_der = cert_der(&cert.cert_pem)?;
    let ca_der = cert_der(&ca.cert_pem)?;
    let leaf = parse_cert(&leaf_der)?;
    let issuer = parse_cert(&ca_der)?;

    leaf.verify_signature(Some(issuer.public_key()))
        .map_err(|e| RiggerError::security(format!("certificate is not signed by CA: {}", e)))
}

/// Check that `cert` is signed by `ca`, currently valid and covers every
/// entry of `sans`.
pub fn validate_cert(cert: &CertKey, ca: &CertKey, sans: &[&str]) -> RiggerResult<()> {
    verify_signature(cert, ca)?;

    let der = cert_der(&cert.cert_pem)?;
    let parsed = parse_cert(&der)?;

    if !parsed.validity().is_valid() {
        return Err(RiggerError::security("certificate is expired or not yet valid"));
    }

    let mut dns = Vec::new();
    let mut ips = Vec::new();
    if let Ok(Some(ext)) = parsed.subject_alternative_name() {
        for name in &ext.value.general_names {
            match name {
                GeneralName::DNSName(host) => dns.push(host.to_string()),
                GeneralName::IPAddress(raw) => {
                    let ip = match raw.len() {
                        4 => <[u8; 4]>::try_from(*raw).ok().map(IpAddr::from),
                        16 => <[u8; 16]>::try_from(*raw).ok().map(IpAddr::from),
                        _ => None,
                    };
                    if let Some(ip) = ip {
                        ips.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    for san in sans {
        let covered = match san.parse::<IpAddr>() {
            Ok(ip) => ips.contains(&ip),
            Err(_) => dns.iter().any(|d| d == san),
        };
        if !covered {
            return Err(RiggerError::security(format!(
                "certificate does not cover {:?}",
                san
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SANS: &[&str] = &["127.0.0.1", "localhost", "registry.d8-system.svc"];

    #[test]
    fn test_model_round_trip() {
        let ca = generate_ca("registry-ca").unwrap();
        assert_eq!(ca.to_model().to_pki().unwrap(), ca);
    }

    #[test]
    fn test_mismatched_pair_is_rejected() {
        let a = generate_ca("a").unwrap();
        let b = generate_ca("b").unwrap();
        let model = CertModel {
            cert: a.cert_pem().to_string(),
            key: b.key_pem().to_string(),
        };
        assert!(model.to_pki().is_err());
        assert!(CertModel::default().to_pki().is_err());
    }

    #[test]
    fn test_leaf_validation() {
        let ca = generate_ca("registry-ca").unwrap();
        let leaf = generate_cert(&ca, "registry-distribution", SANS).unwrap();
        validate_cert(&leaf, &ca, SANS).unwrap();

        assert!(validate_cert(&leaf, &ca, &["other.svc"]).is_err());

        let other_ca = generate_ca("other-ca").unwrap();
        assert!(verify_signature(&leaf, &other_ca).is_err());
    }
}
