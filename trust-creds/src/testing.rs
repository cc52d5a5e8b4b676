//! Throwaway PKI for unit tests.

use crate::paths::CredentialPaths;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use std::path::Path;

pub(crate) struct TestPki {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
}

pub(crate) struct Issued {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "trust-creds test ca");
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self { ca_cert, ca_key }
    }

    pub fn issue(&self, dns_name: &str) -> Issued {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec![dns_name.to_string()]).unwrap();
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        Issued {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().to_vec(),
        }
    }

    /// Writes `issued` and the CA certificate under the default file names in `dir`.
    pub fn write(&self, dir: &Path, issued: &Issued) -> CredentialPaths {
        let paths = CredentialPaths::from_dir(dir);
        std::fs::write(paths.certificate_file(), &issued.cert_pem).unwrap();
        std::fs::write(paths.key_file(), &issued.key_pem).unwrap();
        std::fs::write(paths.ca_certificate_file(), self.ca_cert.pem()).unwrap();
        paths
    }
}
