// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PKCS#7 verification of signed MFCI policies against a single trust anchor.

use openssl::error::ErrorStack;
use openssl::pkcs7::Pkcs7;
use openssl::pkcs7::Pkcs7Flags;
use openssl::pkey::PKeyRef;
use openssl::pkey::Private;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::X509PurposeId;
use openssl::x509::X509Ref;
use openssl::x509::X509;
use thiserror::Error;
use x509_parser::extensions::ExtendedKeyUsage;
use x509_parser::extensions::ParsedExtension;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signed policy is not PKCS#7 DER")]
    Pkcs7Der(#[source] ErrorStack),
    #[error("trust anchor is not a DER x509 certificate")]
    TrustAnchorDer(#[source] ErrorStack),
    #[error("could not build certificate store")]
    Store(#[source] ErrorStack),
    #[error("signature does not chain to the trust anchor")]
    Verify(#[source] ErrorStack),
    #[error("could not extract signer certificate")]
    Signer(#[source] ErrorStack),
    #[error("signed policy has no signer")]
    NoSigner,
    #[error("signer certificate could not be parsed: {0}")]
    SignerParse(String),
    #[error("signer certificate lacks required EKU {0}")]
    MissingEku(String),
}

/// Verifies a PKCS#7 signed blob with attached content.
pub trait Pkcs7Verifier {
    /// Verify `signed` against the single certificate `trust_anchor` (DER),
    /// requiring every EKU in `required_ekus` on the leaf signer.
    ///
    /// Returns the verified attached content.
    fn verify(
        &self,
        signed: &[u8],
        trust_anchor: &[u8],
        required_ekus: &[&str],
    ) -> Result<Vec<u8>, SignatureError>;
}

/// [`Pkcs7Verifier`] backed by openssl.
#[derive(Debug, Default, Copy, Clone)]
pub struct OpensslPkcs7Verifier;

impl Pkcs7Verifier for OpensslPkcs7Verifier {
    fn verify(
        &self,
        signed: &[u8],
        trust_anchor: &[u8],
        required_ekus: &[&str],
    ) -> Result<Vec<u8>, SignatureError> {
        let pkcs7 = Pkcs7::from_der(signed).map_err(SignatureError::Pkcs7Der)?;
        let anchor = X509::from_der(trust_anchor).map_err(SignatureError::TrustAnchorDer)?;

        let store = {
            let mut store = X509StoreBuilder::new().map_err(SignatureError::Store)?;
            store.add_cert(anchor).map_err(SignatureError::Store)?;
            // the anchor is usually an intermediate, and policy signing
            // certificates are not renewed on a schedule firmware can track
            store
                .set_flags(X509VerifyFlags::PARTIAL_CHAIN | X509VerifyFlags::NO_CHECK_TIME)
                .map_err(SignatureError::Store)?;
            // policy signers do not carry the S/MIME purposes openssl checks
            // for by default
            store
                .set_purpose(X509PurposeId::ANY)
                .map_err(SignatureError::Store)?;
            store.build()
        };

        let no_certs: Stack<X509> = Stack::new().map_err(SignatureError::Store)?;
        let mut content = Vec::new();
        pkcs7
            .verify(
                &no_certs,
                &store,
                None,
                Some(&mut content),
                Pkcs7Flags::empty(),
            )
            .map_err(SignatureError::Verify)?;

        let signers = pkcs7
            .signers(&no_certs, Pkcs7Flags::empty())
            .map_err(SignatureError::Signer)?;
        let mut has_signer = false;
        for signer in &signers {
            has_signer = true;
            check_required_ekus(signer, required_ekus)?;
        }
        if !has_signer {
            return Err(SignatureError::NoSigner);
        }

        Ok(content)
    }
}

/// Every EKU OID `eku` carries. x509-parser decodes the well-known ones into
/// flags rather than leaving them in `other`.
fn eku_oids(eku: &ExtendedKeyUsage<'_>) -> Vec<String> {
    [
        (eku.any, "2.5.29.37.0"),
        (eku.server_auth, "1.3.6.1.5.5.7.3.1"),
        (eku.client_auth, "1.3.6.1.5.5.7.3.2"),
        (eku.code_signing, "1.3.6.1.5.5.7.3.3"),
        (eku.email_protection, "1.3.6.1.5.5.7.3.4"),
        (eku.time_stamping, "1.3.6.1.5.5.7.3.8"),
        (eku.ocsp_signing, "1.3.6.1.5.5.7.3.9"),
    ]
    .into_iter()
    .filter_map(|(set, oid)| set.then(|| oid.to_owned()))
    .chain(eku.other.iter().map(|oid| oid.to_id_string()))
    .collect()
}

fn check_required_ekus(cert: &X509Ref, required_ekus: &[&str]) -> Result<(), SignatureError> {
    if required_ekus.is_empty() {
        return Ok(());
    }

    let der = cert.to_der().map_err(SignatureError::Signer)?;
    let (_, cert) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| SignatureError::SignerParse(e.to_string()))?;

    let present = cert
        .extensions()
        .iter()
        .filter_map(|ext| match ext.parsed_extension() {
            ParsedExtension::ExtendedKeyUsage(eku) => Some(eku),
            _ => None,
        })
        .flat_map(eku_oids)
        .collect::<Vec<_>>();

    for &required in required_ekus {
        if !present.iter().any(|oid| oid == required) {
            tracing::debug!(required, ?present, "signer is missing required EKU");
            return Err(SignatureError::MissingEku(required.into()));
        }
    }
    Ok(())
}

/// Sign `payload` as PKCS#7 SignedData with the content attached.
pub fn sign_policy(
    payload: &[u8],
    signer: &X509Ref,
    key: &PKeyRef<Private>,
    chain: &[X509],
) -> Result<Vec<u8>, ErrorStack> {
    let mut certs = Stack::new()?;
    for cert in chain {
        certs.push(cert.clone())?;
    }
    Pkcs7::sign(signer, key, &certs, payload, Pkcs7Flags::BINARY)?.to_der()
}
