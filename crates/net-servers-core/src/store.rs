//! Atomic, typed, cached persistence for the YAML documents.
//!
//! Every read goes parse → validate; every write goes validate → canonical
//! emit → `path.tmp` → fsync → rename, so a crash at any point leaves the
//! previously committed file intact. Parsed documents are cached keyed by
//! absolute path and (mtime, size); any save or external change invalidates.

use crate::error::{parse_error, validation_error, CoreError, CoreResult, ErrorKind};
use crate::fsutil::{sibling, write_atomic};
use crate::paths::Paths;
use crate::schema::yaml::to_canonical_string;
use crate::schema::{
    DocKind, Document, DomainsFile, GlobalConfig, ServicesFile, UsersFile,
};
use crate::schema::validate::validate_composite;
use crate::secrets::SecretsFile;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info};

struct CacheEntry {
    mtime: SystemTime,
    size: u64,
    value: Arc<dyn Any + Send + Sync>,
}

pub struct ConfigStore {
    paths: Paths,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    backed_up: Mutex<HashSet<PathBuf>>,
}

impl ConfigStore {
    #[must_use]
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            backed_up: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Drop every cached document. Called on environment switch and by the
    /// watcher when it observes external changes.
    pub async fn invalidate(&self) {
        self.cache.lock().await.clear();
    }

    async fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load, parse and validate a document. A missing file yields the
    /// documented default without touching disk.
    pub async fn load<D: Document>(&self) -> CoreResult<D> {
        let path = self.paths.document_path(D::KIND);

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(D::default_document());
            }
            Err(e) => return Err(CoreError::from_io(&e, &path)),
        };
        let mtime = meta.modified().map_err(|e| CoreError::from_io(&e, &path))?;
        let size = meta.len();

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&path) {
                if entry.mtime == mtime && entry.size == size {
                    if let Some(value) = entry.value.downcast_ref::<D>() {
                        return Ok(value.clone());
                    }
                }
            }
        }

        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CoreError::from_io(&e, &path))?;
        let doc = parse_document::<D>(&path, &text)?;

        let mut cache = self.cache.lock().await;
        cache.insert(
            path,
            CacheEntry {
                mtime,
                size,
                value: Arc::new(doc.clone()),
            },
        );
        Ok(doc)
    }

    /// Validate and atomically persist a document.
    ///
    /// The per-path lock is held across the whole validate-write-rename
    /// sequence; readers keep seeing the previous committed version until
    /// the rename lands.
    pub async fn save<D: Document>(&self, doc: &D) -> CoreResult<()> {
        let path = self.paths.document_path(D::KIND);
        let lock = self.path_lock(&path).await;
        let _guard = lock.lock().await;
        self.save_locked(doc, &path).await
    }

    async fn save_locked<D: Document>(&self, doc: &D, path: &Path) -> CoreResult<()> {
        let issues = doc.validate();
        if !issues.is_empty() {
            return Err(validation_error(D::KIND.name(), &issues));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::from_io(&e, parent))?;
        }

        // First write of a session keeps a backup of the prior version.
        {
            let mut backed_up = self.backed_up.lock().await;
            if backed_up.insert(path.to_path_buf()) && tokio::fs::metadata(path).await.is_ok() {
                let bak = sibling(path, "bak");
                tokio::fs::copy(path, &bak)
                    .await
                    .map_err(|e| CoreError::from_io(&e, &bak))?;
                debug!(path = %path.display(), "kept session backup");
            }
        }

        let text = to_canonical_string(&doc.emit());
        write_atomic(path, text.as_bytes(), mode_for(D::KIND)).await?;

        // Refresh the cache from the just-written file's metadata.
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| CoreError::from_io(&e, path))?;
        if let (Ok(mtime), size) = (meta.modified(), meta.len()) {
            let mut cache = self.cache.lock().await;
            cache.insert(
                path.to_path_buf(),
                CacheEntry {
                    mtime,
                    size,
                    value: Arc::new(doc.clone()),
                },
            );
        }
        Ok(())
    }

    /// Write documented minimal defaults for any missing file. Returns the
    /// kinds that were created.
    pub async fn initialize_defaults(&self) -> CoreResult<Vec<DocKind>> {
        self.paths.ensure_directories()?;
        let mut created = Vec::new();

        let global = GlobalConfig::default_document();
        if self.write_default(&global).await? {
            created.push(DocKind::Global);
        }

        let mut users = UsersFile::default_document();
        users.users.push(crate::schema::User {
            username: "admin".to_string(),
            email: format!("admin@{}", global.system.domain),
            domains: vec![global.system.domain.clone()],
            roles: vec!["admin".to_string()],
            mailbox_quota: "1G".to_string(),
            enabled: true,
            aliases: Vec::new(),
            password_hashes: Default::default(),
        });
        if self.write_default(&users).await? {
            created.push(DocKind::Users);
        }

        let mut domains = DomainsFile::default_document();
        domains.domains.push(crate::schema::Domain {
            name: global.system.domain.clone(),
            enabled: true,
            mx_records: vec!["mail".to_string()],
            a_records: [
                ("mail".to_string(), "172.20.0.10".to_string()),
                ("www".to_string(), "172.20.0.20".to_string()),
                ("dns".to_string(), "172.20.0.30".to_string()),
            ]
            .into_iter()
            .collect(),
            cname_records: Default::default(),
            txt_records: Default::default(),
            external_mx: Vec::new(),
            certificate_mode: crate::schema::CertificateMode::SelfSigned,
            reverse_zone: false,
        });
        if self.write_default(&domains).await? {
            created.push(DocKind::Domains);
        }

        if self.write_default(&ServicesFile::default_document()).await? {
            created.push(DocKind::Services);
        }
        if self.write_default(&SecretsFile::default_document()).await? {
            created.push(DocKind::Secrets);
        }

        if !created.is_empty() {
            info!(?created, "initialized default configuration files");
        }
        Ok(created)
    }

    async fn write_default<D: Document>(&self, doc: &D) -> CoreResult<bool> {
        let path = self.paths.document_path(D::KIND);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(false);
        }
        self.save(doc).await?;
        Ok(true)
    }

    /// Apply a set of saves only if the composite post-state validates.
    ///
    /// Nothing is written until every changed document passes its own rules
    /// and the cross-document rules against the would-be state.
    pub async fn commit(&self, tx: Transaction) -> CoreResult<()> {
        let users = match &tx.users {
            Some(u) => u.clone(),
            None => self.load::<UsersFile>().await?,
        };
        let domains = match &tx.domains {
            Some(d) => d.clone(),
            None => self.load::<DomainsFile>().await?,
        };

        let mut issues = Vec::new();
        if let Some(doc) = &tx.global {
            issues.extend(doc.validate());
        }
        if let Some(doc) = &tx.services {
            issues.extend(doc.validate());
        }
        issues.extend(users.validate());
        issues.extend(domains.validate());
        issues.extend(validate_composite(&users, &domains));
        if !issues.is_empty() {
            return Err(validation_error("transaction", &issues));
        }

        if let Some(doc) = &tx.global {
            self.save(doc).await?;
        }
        if let Some(doc) = &tx.users {
            self.save(doc).await?;
        }
        if let Some(doc) = &tx.domains {
            self.save(doc).await?;
        }
        if let Some(doc) = &tx.services {
            self.save(doc).await?;
        }
        if let Some(doc) = &tx.secrets {
            self.save(doc).await?;
        }
        Ok(())
    }
}

/// A buffered set of saves committed together.
#[derive(Default)]
pub struct Transaction {
    pub global: Option<GlobalConfig>,
    pub users: Option<UsersFile>,
    pub domains: Option<DomainsFile>,
    pub services: Option<ServicesFile>,
    pub secrets: Option<SecretsFile>,
}

fn mode_for(kind: DocKind) -> u32 {
    match kind {
        DocKind::Secrets => 0o600,
        _ => 0o644,
    }
}

fn parse_document<D: Document>(path: &Path, text: &str) -> CoreResult<D> {
    let value: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| {
        let mut err = CoreError::new(
            ErrorKind::ConfigParse,
            format!("{}: {e}", path.display()),
        )
        .with("file", path.display());
        if let Some(location) = e.location() {
            err = err
                .with("line", location.line())
                .with("column", location.column());
        }
        err
    })?;

    let file = path.display().to_string();
    let doc = D::parse(&value).map_err(|issues| parse_error(&file, &issues))?;
    let issues = doc.validate();
    if issues.is_empty() {
        Ok(doc)
    } else {
        Err(validation_error(&file, &issues))
    }
}
