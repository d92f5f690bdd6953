// pws_exporter - Prometheus metrics exporter for personal weather stations
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Temporary, in-memory TLS identity for the submission endpoint.
//!
//! This is not meant to be trusted by anything. It only exists so that stations
//! which don't validate certificates (most of them) can complete a handshake.

use chrono::{Months, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{SslContext, SslMethod, SslVersion};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509};
use std::error;
use std::fmt;

const KEY_BITS: u32 = 2048;
const SERIAL_BITS: i32 = 128;
const VALIDITY_MONTHS: u32 = 12 * 10;
const ORGANIZATION: &str = "WU Weather Station Exporter";

// Stations are often stuck on TLS 1.0 and its cipher suites. OpenSSL 3 refuses
// those at its default security level.
const CIPHER_LIST: &str = "DEFAULT:@SECLEVEL=0";

#[derive(Debug)]
pub enum TlsError {
    Openssl(ErrorStack),
    NoDomains,
    Validity,
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Openssl(e) => write!(f, "{}", e),
            Self::NoDomains => write!(f, "at least one domain is required for a certificate"),
            Self::Validity => write!(f, "unable to compute certificate validity period"),
        }
    }
}

impl error::Error for TlsError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Openssl(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ErrorStack> for TlsError {
    fn from(e: ErrorStack) -> Self {
        Self::Openssl(e)
    }
}

/// Self-signed certificate and RSA key issued for a set of domains.
pub struct TlsIdentity {
    certificate: X509,
    key: PKey<Private>,
}

impl TlsIdentity {
    /// Generate a new RSA 2048-bit key and a self-signed certificate for `domains`.
    ///
    /// The certificate has a random 128-bit serial, is valid for ten years from now,
    /// and is usable for server authentication by every one of `domains`.
    pub fn generate<S: AsRef<str>>(domains: &[S]) -> Result<Self, TlsError> {
        if domains.is_empty() {
            return Err(TlsError::NoDomains);
        }

        let key = PKey::from_rsa(Rsa::generate(KEY_BITS)?)?;

        let mut serial = BigNum::new()?;
        serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("O", ORGANIZATION)?;
        let name = name.build();

        let now = Utc::now();
        let expires = now
            .checked_add_months(Months::new(VALIDITY_MONTHS))
            .ok_or(TlsError::Validity)?;

        let serial = serial.to_asn1_integer()?;
        let not_before = Asn1Time::from_unix(now.timestamp())?;
        let not_after = Asn1Time::from_unix(expires.timestamp())?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(KeyUsage::new().digital_signature().key_encipherment().build()?)?;
        builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

        let mut san = SubjectAlternativeName::new();
        for domain in domains {
            san.dns(domain.as_ref());
        }
        let san = san.build(&builder.x509v3_context(None, None))?;
        builder.append_extension(san)?;
        builder.sign(&key, MessageDigest::sha256())?;

        Ok(TlsIdentity {
            certificate: builder.build(),
            key,
        })
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    /// Build a server context using this identity that will negotiate anything
    /// from TLS 1.0 upwards.
    pub fn server_context(&self) -> Result<SslContext, TlsError> {
        let mut builder = SslContext::builder(SslMethod::tls())?;
        builder.set_min_proto_version(Some(SslVersion::TLS1))?;
        builder.set_cipher_list(CIPHER_LIST)?;
        builder.set_certificate(&self.certificate)?;
        builder.set_private_key(&self.key)?;
        builder.check_private_key()?;
        Ok(builder.build())
    }

    fn domains(&self) -> Vec<String> {
        self.certificate
            .subject_alt_names()
            .map(|names| names.iter().filter_map(|n| n.dnsname().map(str::to_owned)).collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("subject_alt_names", &self.domains())
            .finish_non_exhaustive()
    }
}
