// ── Persistence seams ──
//
// The lifecycle layer treats storage as a transactional row store. Both
// seams expose a single atomic read-modify-write primitive; the named
// operations are built on top of it so every implementation gets the
// same all-or-nothing behaviour.

mod file;
mod memory;

pub use file::{JsonCertRepository, JsonNetConfigStore};
pub use memory::{MemoryCertRepository, MemoryNetConfigStore};

use crate::error::CoreError;
use crate::model::{CertEntry, CertPool, CrlEntry, NetConfig, NetConfigPatch};

/// Single-row store for the active [`NetConfig`].
pub trait NetConfigStore: Send + Sync {
    fn load(&self) -> Result<NetConfig, CoreError>;

    /// Apply `f` to the stored row and persist the result atomically.
    fn modify(&self, f: &mut dyn FnMut(&mut NetConfig)) -> Result<NetConfig, CoreError>;

    fn update(&self, patch: NetConfigPatch) -> Result<NetConfig, CoreError> {
        let mut patch = Some(patch);
        self.modify(&mut |cfg| {
            if let Some(p) = patch.take() {
                p.apply(cfg);
            }
        })
    }

    fn replace(&self, config: NetConfig) -> Result<(), CoreError> {
        let mut config = Some(config);
        self.modify(&mut |cfg| {
            if let Some(c) = config.take() {
                *cfg = c;
            }
        })
        .map(|_| ())
    }
}

/// Store for the certificate pool.
pub trait CertRepository: Send + Sync {
    fn snapshot(&self) -> Result<CertPool, CoreError>;

    /// Run `f` against a copy of the pool and persist it only if `f`
    /// returns `Ok`.
    fn transaction(
        &self,
        f: &mut dyn FnMut(&mut CertPool) -> Result<(), CoreError>,
    ) -> Result<(), CoreError>;

    /// Every stored chain, expired or not. Validity filtering happens in
    /// [`CertStore`](crate::cert::CertStore), which owns the clock.
    fn all_including_expired(&self) -> Result<Vec<CertEntry>, CoreError> {
        Ok(self.snapshot()?.certs)
    }

    fn crls(&self) -> Result<Vec<CrlEntry>, CoreError> {
        Ok(self.snapshot()?.crls)
    }

    fn upsert_cert(&self, entry: CertEntry) -> Result<(), CoreError> {
        self.transaction(&mut |pool| {
            pool.certs.retain(|c| c.name != entry.name);
            pool.certs.push(entry.clone());
            Ok(())
        })
    }

    /// Remove a chain and any CRL bound to it. Returns whether it existed.
    fn delete_cert(&self, name: &str) -> Result<bool, CoreError> {
        let mut existed = false;
        self.transaction(&mut |pool| {
            let before = pool.certs.len();
            pool.certs.retain(|c| c.name != name);
            existed = pool.certs.len() != before;
            pool.crls.retain(|c| c.chain != name);
            Ok(())
        })?;
        Ok(existed)
    }

    fn upsert_crl(&self, entry: CrlEntry) -> Result<(), CoreError> {
        self.transaction(&mut |pool| {
            pool.crls.retain(|c| c.chain != entry.chain);
            pool.crls.push(entry.clone());
            Ok(())
        })
    }

    fn delete_crl(&self, chain: &str) -> Result<bool, CoreError> {
        let mut existed = false;
        self.transaction(&mut |pool| {
            let before = pool.crls.len();
            pool.crls.retain(|c| c.chain != chain);
            existed = pool.crls.len() != before;
            Ok(())
        })?;
        Ok(existed)
    }

    /// Mark `name` as the in-use chain, clearing every other flag in the
    /// same write. `None` clears all flags.
    fn set_in_use(&self, name: Option<&str>) -> Result<(), CoreError> {
        self.transaction(&mut |pool| {
            if let Some(name) = name {
                if pool.cert(name).is_none() {
                    return Err(CoreError::CertNotFound { name: name.into() });
                }
            }
            for cert in &mut pool.certs {
                cert.in_use = Some(cert.name.as_str()) == name;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::model::CertSource;

    pub(crate) fn entry(name: &str) -> CertEntry {
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        CertEntry {
            name: name.into(),
            chain: vec!["-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n".into()],
            fingerprint: format!("fp-{name}"),
            subject: format!("CN={name}"),
            issuer: format!("CN={name}"),
            not_before: at,
            not_after: at,
            is_ca: true,
            source: CertSource::FusionDirector,
            in_use: false,
            imported_at: at,
        }
    }

    pub(crate) fn exercise_cert_repository(repo: &dyn CertRepository) {
        repo.upsert_cert(entry("a")).unwrap();
        repo.upsert_cert(entry("b")).unwrap();
        repo.upsert_crl(CrlEntry {
            chain: "a".into(),
            contents: "crl".into(),
            issuer: "CN=a".into(),
            last_update: Utc::now(),
            next_update: Utc::now(),
        })
        .unwrap();

        repo.set_in_use(Some("b")).unwrap();
        repo.set_in_use(Some("a")).unwrap();
        let pool = repo.snapshot().unwrap();
        assert_eq!(pool.in_use().map(|c| c.name.as_str()), Some("a"));
        assert_eq!(pool.certs.iter().filter(|c| c.in_use).count(), 1);

        assert!(repo.set_in_use(Some("missing")).is_err());

        assert!(repo.delete_cert("a").unwrap());
        assert!(!repo.delete_cert("a").unwrap());
        assert!(repo.crls().unwrap().is_empty());
        assert_eq!(repo.all_including_expired().unwrap().len(), 1);
    }

    pub(crate) fn exercise_net_store(store: &dyn NetConfigStore) {
        assert_eq!(store.load().unwrap(), NetConfig::web_defaults());
        let updated = store
            .update(NetConfigPatch {
                ip: Some("10.0.0.8".into()),
                ..NetConfigPatch::default()
            })
            .unwrap();
        assert_eq!(updated.ip, "10.0.0.8");
        assert_eq!(store.load().unwrap().ip, "10.0.0.8");

        store.replace(NetConfig::web_defaults()).unwrap();
        assert_eq!(store.load().unwrap().ip, "");
    }
}
