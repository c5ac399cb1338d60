// ── Certificate pool rows ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Who imported a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CertSource {
    /// Imported by an operator through the local interface.
    Web,
    /// Pushed by the manager over the management link.
    #[strum(to_string = "fusion_director", serialize = "fd")]
    FusionDirector,
}

/// One imported trust chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertEntry {
    pub name: String,
    /// PEM blocks, leaf first, root last.
    pub chain: Vec<String>,
    /// Hex SHA-256 over the DER of the linearized chain.
    pub fingerprint: String,
    pub subject: String,
    pub issuer: String,
    /// Latest `notBefore` across the chain.
    pub not_before: DateTime<Utc>,
    /// Earliest `notAfter` across the chain.
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
    pub source: CertSource,
    #[serde(default)]
    pub in_use: bool,
    pub imported_at: DateTime<Utc>,
}

impl CertEntry {
    pub fn chain_pem(&self) -> String {
        self.chain.concat()
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

/// A revocation list bound to one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrlEntry {
    /// Name of the [`CertEntry`] whose CA signed this list.
    pub chain: String,
    pub contents: String,
    pub issuer: String,
    pub last_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
}

impl CrlEntry {
    pub fn is_current_at(&self, now: DateTime<Utc>) -> bool {
        self.last_update <= now && now <= self.next_update
    }
}

/// Whole pool as persisted: every chain plus every CRL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertPool {
    #[serde(default)]
    pub certs: Vec<CertEntry>,
    #[serde(default)]
    pub crls: Vec<CrlEntry>,
}

impl CertPool {
    pub fn cert(&self, name: &str) -> Option<&CertEntry> {
        self.certs.iter().find(|c| c.name == name)
    }

    pub fn crl_for(&self, chain: &str) -> Option<&CrlEntry> {
        self.crls.iter().find(|c| c.chain == chain)
    }

    pub fn in_use(&self) -> Option<&CertEntry> {
        self.certs.iter().find(|c| c.in_use)
    }

    pub fn count(&self, source: CertSource) -> usize {
        self.certs.iter().filter(|c| c.source == source).count()
    }
}

/// Listing row for the CLI and status replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertSummary {
    pub name: String,
    pub source: CertSource,
    pub subject: String,
    pub chain_num: usize,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub in_use: bool,
    pub has_crl: bool,
    pub fingerprint: String,
}

impl CertSummary {
    pub(crate) fn new(entry: &CertEntry, has_crl: bool) -> Self {
        Self {
            name: entry.name.clone(),
            source: entry.source,
            subject: entry.subject.clone(),
            chain_num: entry.chain.len(),
            not_before: entry.not_before,
            not_after: entry.not_after,
            in_use: entry.in_use,
            has_crl,
            fingerprint: entry.fingerprint.clone(),
        }
    }
}

/// Trust state mirrored back to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertInfoForFd {
    pub cert_name: String,
    pub content: String,
    pub is_import_crl: bool,
    pub in_use: bool,
    pub source: CertSource,
}

/// In-use chain and its CRL handed to the MEF link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MefCert {
    pub cert_name: String,
    pub cert: String,
    pub crl: Option<String>,
}
