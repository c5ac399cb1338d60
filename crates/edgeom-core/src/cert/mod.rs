// ── CertStore ──
//
// Owns the bounded pool of imported trust chains and their CRLs, and picks
// the chain presented to the manager's TLS handshake.

mod chain;
mod crl;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use edgeom_api::TlsMaterial;
use rustls::ClientConfig;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::CertPolicy;
use crate::error::CoreError;
use crate::model::{
    CertEntry, CertInfoForFd, CertPool, CertSource, CertSummary, CrlEntry, MefCert,
};
use crate::store::CertRepository;

/// Name reserved for the manager-pushed CRL alarm; never a chain name.
pub const FD_CRL_NAME: &str = "FD.crl";

const MAX_NAME_LEN: usize = 64;

/// Where a handshake probe connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeTarget {
    pub addr: SocketAddr,
    /// SNI and certificate name; the IP text when no server name is set.
    pub server_name: String,
}

/// Live TLS handshake used to confirm the peer accepts a candidate chain.
#[async_trait]
pub trait HandshakeProbe: Send + Sync {
    async fn handshake(
        &self,
        target: &HandshakeTarget,
        tls: Arc<ClientConfig>,
    ) -> Result<(), CoreError>;
}

/// The chain chosen for a connection.
#[derive(Debug, Clone)]
pub struct SelectedTls {
    pub name: String,
    pub material: TlsMaterial,
    pub config: Arc<ClientConfig>,
}

/// Validate a slot name.
pub fn validate_name(name: &str) -> Result<(), CoreError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name != "."
        && name != ".."
        && name != FD_CRL_NAME
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(CoreError::ValidationFailed {
            message: format!("invalid certificate name '{name}'"),
        })
    }
}

// ── CertStore ────────────────────────────────────────────────────────

pub struct CertStore {
    repo: Arc<dyn CertRepository>,
    policy: CertPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CertStore {
    pub fn new(repo: Arc<dyn CertRepository>, policy: CertPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &CertPolicy {
        &self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ── Imports ──────────────────────────────────────────────────────

    /// Validate `content` as a trust chain and store it under `name`.
    ///
    /// An entry with the same name is replaced together with its CRL. A
    /// Web import also replaces the previous Web entry. Manager-pushed
    /// chains never evict: once `fd_limit` is reached the import fails.
    pub fn import_cert(
        &self,
        source: CertSource,
        name: &str,
        content: &[u8],
    ) -> Result<CertSummary, CoreError> {
        validate_name(name)?;
        if content.len() > self.policy.max_file_bytes {
            return Err(CoreError::CertificateTooLarge {
                size: content.len(),
                limit: self.policy.max_file_bytes,
            });
        }

        let now = self.clock.now();
        let chain = chain::validate(content, self.policy.max_chain, now)?;
        let entry = CertEntry {
            name: name.to_owned(),
            chain: chain.pems,
            fingerprint: chain.fingerprint,
            subject: chain.subject,
            issuer: chain.issuer,
            not_before: chain.not_before,
            not_after: chain.not_after,
            is_ca: chain.is_ca,
            source,
            in_use: false,
            imported_at: now,
        };

        let policy = &self.policy;
        self.repo.transaction(&mut |pool| {
            if pool.certs.iter().any(|c| c.fingerprint == entry.fingerprint) {
                return Err(CoreError::DuplicateFinger);
            }
            let replaced: Vec<String> = pool
                .certs
                .iter()
                .filter(|c| c.name == name || (source == CertSource::Web && c.source == source))
                .map(|c| c.name.clone())
                .collect();

            let kept_fd = pool
                .certs
                .iter()
                .filter(|c| c.source == CertSource::FusionDirector && !replaced.contains(&c.name))
                .count();
            if source == CertSource::FusionDirector && kept_fd >= policy.fd_limit {
                return Err(CoreError::PoolFull {
                    limit: policy.fd_limit,
                });
            }
            if pool.certs.len() - replaced.len() >= policy.total_limit {
                return Err(CoreError::PoolFull {
                    limit: policy.total_limit,
                });
            }

            pool.certs.retain(|c| !replaced.contains(&c.name));
            pool.crls.retain(|c| !replaced.contains(&c.chain));
            pool.certs.push(entry.clone());
            Ok(())
        })?;

        info!(name, %source, chain_num = entry.chain.len(), "certificate imported");
        Ok(CertSummary::new(&entry, false))
    }

    /// Validate a CRL and bind it to the chain whose CA signed it.
    ///
    /// Returns the name of that chain.
    pub fn import_crl(&self, content: &[u8]) -> Result<String, CoreError> {
        if content.len() > self.policy.max_file_bytes {
            return Err(CoreError::CertificateTooLarge {
                size: content.len(),
                limit: self.policy.max_file_bytes,
            });
        }
        let file = crl::CrlFile::read(content)?;
        let facts = file.facts()?;
        let now = self.clock.now();

        let mut bound = None;
        self.repo.transaction(&mut |pool| {
            let mut owner = None;
            for entry in &pool.certs {
                if file.signed_by(entry)? {
                    owner = Some(entry.name.clone());
                    break;
                }
            }
            let Some(owner) = owner else {
                return Err(CoreError::CrlInvalid {
                    reason: "no imported chain issued this CRL".into(),
                });
            };
            if facts.last_update > now || now > facts.next_update {
                return Err(CoreError::CrlExpired);
            }
            if pool.crl_for(&owner).is_some() {
                return Err(CoreError::CrlDuplicate { name: owner });
            }
            pool.crls.push(CrlEntry {
                chain: owner.clone(),
                contents: facts.pem.clone(),
                issuer: facts.issuer.clone(),
                last_update: facts.last_update,
                next_update: facts.next_update,
            });
            bound = Some(owner);
            Ok(())
        })?;

        let chain = bound.ok_or_else(|| CoreError::Internal("CRL import lost its chain".into()))?;
        info!(chain = %chain, next_update = %facts.next_update, "CRL imported");
        Ok(chain)
    }

    // ── Deletes ──────────────────────────────────────────────────────

    /// Remove a chain and its CRL. The in-use chain cannot be removed.
    pub fn delete_cert(&self, name: &str) -> Result<(), CoreError> {
        self.repo.transaction(&mut |pool| {
            let entry = pool.cert(name).ok_or_else(|| CoreError::CertNotFound {
                name: name.to_owned(),
            })?;
            if entry.in_use {
                return Err(CoreError::CertInUse {
                    name: name.to_owned(),
                });
            }
            pool.certs.retain(|c| c.name != name);
            pool.crls.retain(|c| c.chain != name);
            Ok(())
        })?;
        info!(name, "certificate deleted");
        Ok(())
    }

    pub fn delete_crl(&self, chain: &str) -> Result<(), CoreError> {
        if self.repo.delete_crl(chain)? {
            info!(chain, "CRL deleted");
            Ok(())
        } else {
            Err(CoreError::CertNotFound {
                name: chain.to_owned(),
            })
        }
    }

    /// Drop every chain and CRL.
    pub fn clear_all(&self) -> Result<(), CoreError> {
        self.repo.transaction(&mut |pool| {
            *pool = CertPool::default();
            Ok(())
        })
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn is_pool_full(&self) -> Result<bool, CoreError> {
        let pool = self.repo.snapshot()?;
        Ok(pool.count(CertSource::FusionDirector) >= self.policy.fd_limit)
    }

    pub fn cert_is_in_using(&self, name: &str) -> Result<bool, CoreError> {
        Ok(self.repo.snapshot()?.in_use().is_some_and(|c| c.name == name))
    }

    /// Chains currently inside their validity window.
    pub fn valid_certs(&self) -> Result<Vec<CertEntry>, CoreError> {
        let now = self.clock.now();
        let mut certs = self.repo.all_including_expired()?;
        certs.retain(|c| c.is_valid_at(now));
        Ok(certs)
    }

    pub fn cert_summaries(&self) -> Result<Vec<CertSummary>, CoreError> {
        let pool = self.repo.snapshot()?;
        Ok(pool
            .certs
            .iter()
            .map(|c| CertSummary::new(c, pool.crl_for(&c.name).is_some()))
            .collect())
    }

    /// Trust state mirrored back to the manager, one item per chain.
    ///
    /// Reads a snapshot up front, so the iterator is finite and calling
    /// this again starts over.
    pub fn cert_info_for_fd(&self) -> Result<impl Iterator<Item = CertInfoForFd>, CoreError> {
        let CertPool { certs, crls } = self.repo.snapshot()?;
        Ok(certs.into_iter().map(move |c| CertInfoForFd {
            is_import_crl: crls.iter().any(|crl| crl.chain == c.name),
            content: c.chain_pem(),
            in_use: c.in_use,
            source: c.source,
            cert_name: c.name,
        }))
    }

    /// Chains that are still valid but expire within `threshold_days`.
    pub fn expiring_certs(&self, threshold_days: i64) -> Result<Vec<CertEntry>, CoreError> {
        let now = self.clock.now();
        let horizon = now + Duration::days(threshold_days);
        let mut certs = self.repo.all_including_expired()?;
        certs.retain(|c| c.is_valid_at(now) && c.not_after <= horizon);
        Ok(certs)
    }

    pub fn expired_certs(&self) -> Result<Vec<CertEntry>, CoreError> {
        let now = self.clock.now();
        let mut certs = self.repo.all_including_expired()?;
        certs.retain(|c| c.not_after < now);
        Ok(certs)
    }

    /// CRLs whose update window has passed.
    pub fn expired_crls(&self) -> Result<Vec<CrlEntry>, CoreError> {
        let now = self.clock.now();
        let mut crls = self.repo.crls()?;
        crls.retain(|c| c.next_update < now);
        Ok(crls)
    }

    pub fn is_crl_expired(&self, chain: &str) -> Result<bool, CoreError> {
        let now = self.clock.now();
        Ok(self
            .repo
            .snapshot()?
            .crl_for(chain)
            .is_some_and(|c| c.next_update < now))
    }

    /// The in-use chain and its CRL, for the MEF link.
    pub fn cert_to_mef(&self) -> Result<Option<MefCert>, CoreError> {
        let pool = self.repo.snapshot()?;
        Ok(pool.in_use().map(|c| MefCert {
            cert_name: c.name.clone(),
            cert: c.chain_pem(),
            crl: pool.crl_for(&c.name).map(|crl| crl.contents.clone()),
        }))
    }

    // ── TLS selection ────────────────────────────────────────────────

    /// Usable chains, in-use first. A chain whose bound CRL is outside its
    /// update window is skipped.
    fn candidates(&self) -> Result<Vec<(String, TlsMaterial)>, CoreError> {
        let now = self.clock.now();
        let pool = self.repo.snapshot()?;
        let mut out: Vec<(bool, String, TlsMaterial)> = Vec::new();
        for cert in pool.certs.iter().filter(|c| c.is_valid_at(now)) {
            let crl = pool.crl_for(&cert.name);
            if let Some(crl) = crl {
                if !crl::is_current(&crl.contents, now) {
                    debug!(name = %cert.name, "skipping chain with stale CRL");
                    continue;
                }
            }
            out.push((
                cert.in_use,
                cert.name.clone(),
                TlsMaterial {
                    ca_chain_pem: cert.chain_pem(),
                    crl_pem: crl.map(|c| c.contents.clone()),
                },
            ));
        }
        out.sort_by_key(|(in_use, ..)| !*in_use);
        Ok(out.into_iter().map(|(_, name, m)| (name, m)).collect())
    }

    /// Pick the chain for a connection to `target`.
    ///
    /// Without `verify_peer` the first buildable candidate wins. With it,
    /// each candidate is tried in a live handshake; the first one the peer
    /// accepts is persisted as in use. When every candidate failed and at
    /// least one failure was transient, that failure is returned so the
    /// caller retries instead of giving up.
    pub async fn client_tls<P>(
        &self,
        target: &HandshakeTarget,
        probe: &P,
        verify_peer: bool,
    ) -> Result<SelectedTls, CoreError>
    where
        P: HandshakeProbe + ?Sized,
    {
        let mut transient = None;
        for (name, material) in self.candidates()? {
            let config = match edgeom_api::tls::client_config(&material) {
                Ok(config) => config,
                Err(e) => {
                    warn!(name = %name, error = %e, "unusable trust chain");
                    continue;
                }
            };
            if !verify_peer {
                return Ok(SelectedTls {
                    name,
                    material,
                    config,
                });
            }

            match probe.handshake(target, Arc::clone(&config)).await {
                Ok(()) => {
                    if !self.cert_is_in_using(&name)? {
                        self.repo.set_in_use(Some(&name))?;
                        info!(name = %name, "trust chain selected");
                    }
                    return Ok(SelectedTls {
                        name,
                        material,
                        config,
                    });
                }
                Err(e) => {
                    warn!(name = %name, addr = %target.addr, error = %e, "handshake with candidate chain failed");
                    if e.is_transient() {
                        transient = Some(e);
                    }
                }
            }
        }
        Err(transient.unwrap_or(CoreError::NoAvailableCertificate))
    }
}
