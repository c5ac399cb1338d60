// ── CRL parsing and chain matching ──

use chrono::{DateTime, Utc};
use x509_parser::pem::Pem;
use x509_parser::revocation_list::CertificateRevocationList;

use super::chain::{LABEL_CERT, LABEL_CRL, encode_pem, pem_blocks, to_datetime};
use crate::error::CoreError;
use crate::model::CertEntry;

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::CrlInvalid {
        reason: reason.into(),
    }
}

/// The single CRL block of a submitted file.
pub(crate) struct CrlFile {
    block: Pem,
}

/// Fields copied out of a parsed CRL.
#[derive(Debug, Clone)]
pub(crate) struct CrlFacts {
    pub issuer: String,
    pub last_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
    pub pem: String,
}

impl CrlFile {
    pub(crate) fn read(content: &[u8]) -> Result<Self, CoreError> {
        let mut blocks = pem_blocks(content).map_err(invalid)?;
        if blocks.iter().any(|b| b.label == LABEL_CERT) {
            return Err(invalid("certificate and CRL in one file"));
        }
        if blocks.iter().any(|b| b.label != LABEL_CRL) {
            return Err(invalid("unexpected PEM block"));
        }
        match blocks.len() {
            0 => Err(invalid("no CRL found")),
            1 => Ok(Self {
                block: blocks.remove(0),
            }),
            n => Err(invalid(format!("{n} CRLs in one file"))),
        }
    }

    fn parse(&self) -> Result<CertificateRevocationList<'_>, CoreError> {
        x509_parser::parse_x509_crl(&self.block.contents)
            .map(|(_, crl)| crl)
            .map_err(|e| invalid(format!("unparsable CRL: {e}")))
    }

    pub(crate) fn facts(&self) -> Result<CrlFacts, CoreError> {
        let crl = self.parse()?;
        let next = crl
            .next_update()
            .ok_or_else(|| invalid("CRL has no nextUpdate"))?;
        Ok(CrlFacts {
            issuer: crl.issuer().to_string(),
            last_update: to_datetime(crl.last_update()).map_err(invalid)?,
            next_update: to_datetime(next).map_err(invalid)?,
            pem: encode_pem(LABEL_CRL, &self.block.contents),
        })
    }

    /// Whether a member of `entry` whose subject is the CRL issuer signed it.
    pub(crate) fn signed_by(&self, entry: &CertEntry) -> Result<bool, CoreError> {
        let crl = self.parse()?;
        let issuer = crl.issuer().as_raw();
        for block in pem_blocks(entry.chain_pem().as_bytes()).map_err(invalid)? {
            let Ok(cert) = block.parse_x509() else {
                continue;
            };
            if cert.subject().as_raw() == issuer && crl.verify_signature(cert.public_key()).is_ok()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Whether stored CRL contents are still inside their update window.
pub(crate) fn is_current(contents: &str, now: DateTime<Utc>) -> bool {
    CrlFile::read(contents.as_bytes())
        .and_then(|f| f.facts())
        .is_ok_and(|facts| facts.last_update <= now && now <= facts.next_update)
}
