// ── Chain parsing and validation ──
//
// A submitted PEM buffer is accepted in any order. It must relink into a
// single path from one self-signed CA root down to a leaf, with every
// member passing the algorithm, key-size and validity checks.

use std::collections::HashSet;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::objects::{oid_registry, oid2sn};
use x509_parser::oid_registry::{
    OID_PKCS1_SHA256WITHRSA, OID_PKCS1_SHA384WITHRSA, OID_PKCS1_SHA512WITHRSA,
    OID_SIG_ECDSA_WITH_SHA256, Oid,
};
use x509_parser::pem::Pem;
use x509_parser::public_key::PublicKey;
use x509_parser::time::ASN1Time;

use crate::error::CoreError;

pub(crate) const LABEL_CERT: &str = "CERTIFICATE";
pub(crate) const LABEL_CRL: &str = "X509 CRL";

const MIN_RSA_BITS: usize = 3072;
const MIN_EC_BITS: usize = 256;

/// A chain that passed every check, in leaf-first order.
#[derive(Debug, Clone)]
pub(crate) struct ValidatedChain {
    pub pems: Vec<String>,
    pub fingerprint: String,
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
}

/// Every PEM block in `content`, in file order.
pub(crate) fn pem_blocks(content: &[u8]) -> Result<Vec<Pem>, String> {
    Pem::iter_from_buffer(content)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("malformed PEM: {e}"))
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::CertificateInvalid {
        reason: reason.into(),
    }
}

pub(crate) fn to_datetime(time: ASN1Time) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| format!("timestamp {} out of range", time.timestamp()))
}

/// Re-encode DER as a PEM block with 64-column lines.
pub(crate) fn encode_pem(label: &str, der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    let chars: Vec<char> = body.chars().collect();
    for line in chars.chunks(64) {
        out.extend(line);
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

fn algorithm_name(oid: &Oid<'_>) -> String {
    oid2sn(oid, oid_registry()).map_or_else(|_| oid.to_id_string(), str::to_owned)
}

fn is_allowed_algorithm(oid: &Oid<'_>) -> bool {
    [
        &OID_PKCS1_SHA256WITHRSA,
        &OID_PKCS1_SHA384WITHRSA,
        &OID_PKCS1_SHA512WITHRSA,
        &OID_SIG_ECDSA_WITH_SHA256,
    ]
    .iter()
    .any(|allowed| allowed.as_bytes() == oid.as_bytes())
}

/// Per-certificate checks, independent of chain position.
fn check_member(cert: &X509Certificate<'_>, now: DateTime<Utc>) -> Result<(), CoreError> {
    let oid = &cert.signature_algorithm.algorithm;
    if !is_allowed_algorithm(oid) {
        return Err(CoreError::AlgorithmUnsafe {
            algorithm: algorithm_name(oid),
        });
    }

    match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => {
            let bits = rsa.key_size();
            if bits < MIN_RSA_BITS {
                return Err(CoreError::RsaKeyTooShort { bits });
            }
        }
        Ok(PublicKey::EC(point)) => {
            let bits = point.key_size();
            if bits < MIN_EC_BITS {
                return Err(CoreError::EcKeyTooShort { bits });
            }
        }
        Ok(_) => return Err(CoreError::PubkeyTypeInvalid),
        Err(e) => return Err(invalid(format!("unreadable public key: {e}"))),
    }

    let validity = cert.validity();
    let ts = now.timestamp();
    if ts < validity.not_before.timestamp() || ts > validity.not_after.timestamp() {
        return Err(CoreError::CertificateExpired);
    }
    Ok(())
}

fn is_self_issued(cert: &X509Certificate<'_>) -> bool {
    cert.subject().as_raw() == cert.issuer().as_raw()
}

/// Order `certs` root-first by following issuer -> subject links.
fn linearize(certs: &[X509Certificate<'_>]) -> Result<Vec<usize>, CoreError> {
    let roots: Vec<usize> = (0..certs.len()).filter(|&i| is_self_issued(&certs[i])).collect();
    let root = match roots.as_slice() {
        [] => {
            return Err(CoreError::CaSignatureInvalid {
                reason: "no self-signed root in chain".into(),
            });
        }
        [one] => *one,
        _ => return Err(invalid("more than one root certificate in chain")),
    };

    let mut order = vec![root];
    let mut used = vec![false; certs.len()];
    used[root] = true;
    let mut current = root;
    loop {
        let subject = certs[current].subject().as_raw();
        let children: Vec<usize> = (0..certs.len())
            .filter(|&i| !used[i] && certs[i].issuer().as_raw() == subject)
            .collect();
        match children.as_slice() {
            [] => break,
            [child] => {
                used[*child] = true;
                order.push(*child);
                current = *child;
            }
            _ => return Err(invalid("chain branches below one issuer")),
        }
    }

    if order.len() != certs.len() {
        return Err(invalid("certificate does not belong to the chain"));
    }
    Ok(order)
}

/// Check signatures and CA flags along a root-first order.
fn verify_links(certs: &[X509Certificate<'_>], order: &[usize]) -> Result<(), CoreError> {
    let root = &certs[order[0]];
    if !root.is_ca() {
        return Err(CoreError::NotCa {
            subject: root.subject().to_string(),
        });
    }
    root.verify_signature(None)
        .map_err(|e| CoreError::CaSignatureInvalid {
            reason: format!("root self-signature: {e}"),
        })?;

    for pair in order.windows(2) {
        let (parent, child) = (&certs[pair[0]], &certs[pair[1]]);
        if !parent.is_ca() {
            return Err(CoreError::NotCa {
                subject: parent.subject().to_string(),
            });
        }
        child
            .verify_signature(Some(parent.public_key()))
            .map_err(|e| CoreError::CaSignatureInvalid {
                reason: format!("{} not signed by {}: {e}", child.subject(), parent.subject()),
            })?;
    }
    Ok(())
}

/// Parse and validate a submitted chain.
pub(crate) fn validate(
    content: &[u8],
    max_chain: usize,
    now: DateTime<Utc>,
) -> Result<ValidatedChain, CoreError> {
    let blocks = pem_blocks(content).map_err(invalid)?;
    if blocks.is_empty() {
        return Err(invalid("no certificate found"));
    }
    if blocks.iter().any(|b| b.label == LABEL_CRL) {
        return Err(invalid("certificate and CRL in one file"));
    }
    if let Some(other) = blocks.iter().find(|b| b.label != LABEL_CERT) {
        return Err(invalid(format!("unexpected PEM block '{}'", other.label)));
    }

    let mut seen = HashSet::new();
    if !blocks.iter().all(|b| seen.insert(b.contents.as_slice())) {
        return Err(invalid("same certificate submitted twice"));
    }
    if blocks.len() > max_chain {
        return Err(CoreError::ChainTooLong {
            len: blocks.len(),
            max: max_chain,
        });
    }

    let certs = blocks
        .iter()
        .map(|b| {
            b.parse_x509()
                .map_err(|e| invalid(format!("unparsable certificate: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    for cert in &certs {
        check_member(cert, now)?;
    }

    let mut order = linearize(&certs)?;
    verify_links(&certs, &order)?;
    order.reverse();

    let mut hasher = Sha256::new();
    let mut pems = Vec::with_capacity(order.len());
    let mut not_before = DateTime::<Utc>::MIN_UTC;
    let mut not_after = DateTime::<Utc>::MAX_UTC;
    for &i in &order {
        hasher.update(&blocks[i].contents);
        pems.push(encode_pem(LABEL_CERT, &blocks[i].contents));
        let validity = certs[i].validity();
        not_before = not_before.max(to_datetime(validity.not_before).map_err(invalid)?);
        not_after = not_after.min(to_datetime(validity.not_after).map_err(invalid)?);
    }

    let leaf = &certs[order[0]];
    Ok(ValidatedChain {
        pems,
        fingerprint: hex::encode(hasher.finalize()),
        subject: leaf.subject().to_string(),
        issuer: leaf.issuer().to_string(),
        not_before,
        not_after,
        is_ca: leaf.is_ca(),
    })
}
