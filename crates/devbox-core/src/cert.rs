//! Certificate material for the interceptor's HTTPS endpoint.

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};

use crate::error::CertError;

/// Self-signed CA plus a leaf certificate it signed. PEM encoded.
#[derive(Clone)]
pub struct CertificateBundle {
    pub ca_cert: String,
    pub ca_key: String,
    pub leaf_cert: String,
    pub leaf_key: String,
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("ca_cert", &self.ca_cert.len())
            .field("leaf_cert", &self.leaf_cert.len())
            .finish_non_exhaustive()
    }
}

/// In-cluster DNS names of a service.
pub fn service_dns_names(service: &str, namespace: &str) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{service}.{namespace}"),
        format!("{service}.{namespace}.svc"),
        format!("{service}.{namespace}.svc.cluster.local"),
    ]
}

impl CertificateBundle {
    /// Generate a CA and a server certificate for `dns_names`, valid for a year.
    pub fn generate(common_name: &str, dns_names: &[String]) -> Result<Self, CertError> {
        let now = OffsetDateTime::now_utc();

        let mut ca_params = CertificateParams::default();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, format!("{common_name} CA"));
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params.not_before = now - Duration::hours(1);
        ca_params.not_after = now + Duration::days(365);
        let ca_key = KeyPair::generate()?;
        let ca_cert = ca_params.self_signed(&ca_key)?;

        let mut leaf_params = CertificateParams::new(dns_names.to_vec())?;
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        leaf_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        leaf_params.not_before = now - Duration::hours(1);
        leaf_params.not_after = now + Duration::days(365);
        let leaf_key = KeyPair::generate()?;
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key)?;

        Ok(Self {
            ca_cert: ca_cert.pem(),
            ca_key: ca_key.serialize_pem(),
            leaf_cert: leaf_cert.pem(),
            leaf_key: leaf_key.serialize_pem(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_names_cover_service_forms() {
        let names = service_dns_names("devbox-interceptor", "devbox-abc");
        assert!(names.contains(&"devbox-interceptor.devbox-abc.svc".to_string()));
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn bundle_is_pem_encoded() {
        let names = service_dns_names("devbox-interceptor", "devbox-abc");
        let bundle = CertificateBundle::generate("devbox-interceptor", &names).unwrap();
        assert!(bundle.ca_cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(bundle.leaf_cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(bundle.leaf_key.contains("PRIVATE KEY"));
        assert!(bundle.ca_key.contains("PRIVATE KEY"));
        assert_ne!(bundle.ca_cert, bundle.leaf_cert);
    }

    #[test]
    fn every_bundle_is_fresh() {
        let names = vec!["svc".to_string()];
        let a = CertificateBundle::generate("svc", &names).unwrap();
        let b = CertificateBundle::generate("svc", &names).unwrap();
        assert_ne!(a.ca_key, b.ca_key);
    }

    #[test]
    fn debug_hides_keys() {
        let bundle = CertificateBundle::generate("svc", &["svc".to_string()]).unwrap();
        let rendered = format!("{bundle:?}");
        assert!(!rendered.contains("PRIVATE KEY"));
    }
}
