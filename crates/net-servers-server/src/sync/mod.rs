//! Synchronizer framework: plan/apply reconciliation from validated
//! configuration to service-owned projection directories.
//!
//! A synchronizer declares the channels it subscribes to, produces a [`Plan`]
//! (the complete desired state of its projection directories) and lets the
//! framework drive the filesystem there with the smallest set of writes,
//! renames and deletes. Certificate issuance and environment switches are
//! published on the [`EventBus`]; neither the certificate manager nor the
//! synchronizers hold handles to each other.

pub mod dns;
pub mod http_auth;
pub mod mail;

use crate::reload::{ReloadCoordinator, ReloadRequest};
use async_trait::async_trait;
use net_servers_core::error::{CoreError, CoreResult, ErrorKind};
use net_servers_core::fsutil::write_atomic;
use net_servers_core::paths::Paths;
use net_servers_core::schema::{DomainsFile, GlobalConfig, ServicesFile, UsersFile};
use net_servers_core::secrets::SecretsFile;
use net_servers_core::CoreContext;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Logical config channels the watcher debounces on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Users,
    Domains,
    Global,
    Services,
    Secrets,
    Environments,
}

impl Channel {
    pub const ALL: [Self; 6] = [
        Self::Users,
        Self::Domains,
        Self::Global,
        Self::Services,
        Self::Secrets,
        Self::Environments,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Domains => "domains",
            Self::Global => "global",
            Self::Services => "services",
            Self::Secrets => "secrets",
            Self::Environments => "environments",
        }
    }
}

/// Cross-component notifications routed through the framework.
#[derive(Debug, Clone)]
pub enum Event {
    EnvironmentSwitched { name: String },
    CertificatesChanged { domain: String },
}

/// Broadcast bus decoupling the certificate manager from the synchronizers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: Event) {
        // No receivers is fine; the CLI one-shot paths never subscribe.
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

/// A consistent view of every document a plan may read, loaded once per
/// reconcile.
pub struct SyncSnapshot {
    pub environment: String,
    pub global: GlobalConfig,
    pub users: UsersFile,
    pub domains: DomainsFile,
    pub services: ServicesFile,
    pub secrets: SecretsFile,
    pub paths: Paths,
}

impl SyncSnapshot {
    pub async fn load(ctx: &CoreContext) -> CoreResult<Self> {
        Ok(Self {
            environment: ctx.environment()?.name.clone(),
            global: ctx.store().load().await?,
            users: ctx.store().load().await?,
            domains: ctx.store().load().await?,
            services: ctx.store().load().await?,
            secrets: ctx.store().load().await?,
            paths: ctx.paths().clone(),
        })
    }

    /// `net-servers-<service>-<environment>`, the container naming scheme
    /// shared with the supervisor.
    #[must_use]
    pub fn container_name(&self, service: &str) -> String {
        format!("net-servers-{service}-{}", self.environment)
    }
}

/// One desired artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanEntry {
    File {
        path: PathBuf,
        content: Vec<u8>,
        mode: u32,
    },
    Dir {
        path: PathBuf,
        owner: Option<(u32, u32)>,
    },
}

impl PlanEntry {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::File { path, .. } | Self::Dir { path, .. } => path,
        }
    }
}

/// The complete desired state of a synchronizer's projection directories.
/// Anything under `owned_roots` that the plan does not name is a stray and
/// will be removed.
#[derive(Debug, Default)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
    pub owned_roots: Vec<PathBuf>,
}

impl Plan {
    pub fn file(&mut self, path: PathBuf, content: impl Into<Vec<u8>>, mode: u32) {
        self.entries.push(PlanEntry::File {
            path,
            content: content.into(),
            mode,
        });
    }

    pub fn dir(&mut self, path: PathBuf, owner: Option<(u32, u32)>) {
        self.entries.push(PlanEntry::Dir { path, owner });
    }
}

/// What one apply changed, plus per-file failures for aggregation.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub written: Vec<PathBuf>,
    pub moved: Vec<(PathBuf, PathBuf)>,
    pub deleted: Vec<PathBuf>,
    pub unchanged: usize,
    pub errors: Vec<(PathBuf, CoreError)>,
}

impl ApplyReport {
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.written.is_empty() || !self.moved.is_empty() || !self.deleted.is_empty()
    }

    /// True when every change stayed within `paths`.
    #[must_use]
    pub fn only_touched(&self, paths: &[&Path]) -> bool {
        self.written
            .iter()
            .chain(self.deleted.iter())
            .chain(self.moved.iter().flat_map(|(a, b)| [a, b]))
            .all(|p| paths.iter().any(|allowed| p == allowed))
    }
}

/// Dry-run diff of one plan against the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffAction {
    Create,
    Update,
    Delete,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub path: PathBuf,
    pub action: DiffAction,
}

#[async_trait]
pub trait Synchronizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Channels whose dispatch should reconcile this synchronizer.
    fn channels(&self) -> &'static [Channel];

    /// Compute the complete desired state from the snapshot.
    async fn plan(&self, snap: &SyncSnapshot) -> CoreResult<Plan>;

    /// Validate a plan before installation (e.g. zone-check). Default: ok.
    async fn check(&self, _plan: &Plan) -> CoreResult<()> {
        Ok(())
    }

    /// Reload request derived from what actually changed.
    fn reload(&self, report: &ApplyReport, snap: &SyncSnapshot) -> Option<ReloadRequest>;
}

/// Registry of synchronizers plus the reconciliation entry points.
pub struct SyncRegistry {
    synchronizers: Vec<Arc<dyn Synchronizer>>,
    reload: Option<Arc<ReloadCoordinator>>,
    bus: EventBus,
    pub dry_run: bool,
}

impl SyncRegistry {
    #[must_use]
    pub fn new(bus: EventBus, reload: Option<Arc<ReloadCoordinator>>) -> Self {
        Self {
            synchronizers: Vec::new(),
            reload,
            bus,
            dry_run: false,
        }
    }

    pub fn register(&mut self, sync: Arc<dyn Synchronizer>) {
        info!(name = sync.name(), "registered synchronizer");
        self.synchronizers.push(sync);
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Synchronizer>> {
        self.synchronizers
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    fn subscribed(&self, channel: Channel) -> Vec<Arc<dyn Synchronizer>> {
        self.synchronizers
            .iter()
            .filter(|s| s.channels().contains(&channel))
            .cloned()
            .collect()
    }

    /// Reconcile every synchronizer subscribed to `channel`.
    pub async fn reconcile_channel(
        &self,
        snap: &SyncSnapshot,
        channel: Channel,
    ) -> CoreResult<Vec<(String, ApplyReport)>> {
        self.reconcile_set(snap, self.subscribed(channel)).await
    }

    /// Reconcile a single synchronizer by name.
    pub async fn reconcile_one(
        &self,
        snap: &SyncSnapshot,
        name: &str,
    ) -> CoreResult<Vec<(String, ApplyReport)>> {
        let set = self.get(name).into_iter().collect();
        self.reconcile_set(snap, set).await
    }

    /// Reconcile every registered synchronizer.
    pub async fn reconcile_all(
        &self,
        snap: &SyncSnapshot,
    ) -> CoreResult<Vec<(String, ApplyReport)>> {
        self.reconcile_set(snap, self.synchronizers.clone()).await
    }

    /// Compute diffs without touching disk.
    pub async fn diff_all(&self, snap: &SyncSnapshot) -> CoreResult<Vec<(String, Vec<DiffEntry>)>> {
        let mut out = Vec::new();
        for sync in &self.synchronizers {
            let plan = sync.plan(snap).await?;
            out.push((sync.name().to_string(), diff_plan(&plan).await));
        }
        Ok(out)
    }

    async fn reconcile_set(
        &self,
        snap: &SyncSnapshot,
        set: Vec<Arc<dyn Synchronizer>>,
    ) -> CoreResult<Vec<(String, ApplyReport)>> {
        // Plans are computed first so cross-synchronizer output claims can
        // be rejected before anything is written.
        let mut plans = Vec::new();
        for sync in &set {
            let plan = sync.plan(snap).await?;
            sync.check(&plan).await?;
            plans.push((sync.clone(), plan));
        }
        check_plan_conflicts(&plans)?;

        // The synchronizers own disjoint projection directories (just
        // verified), so their applies run concurrently.
        let applies = plans.into_iter().map(|(sync, plan)| async move {
            if self.dry_run {
                let diff = diff_plan(&plan).await;
                let changed = diff
                    .iter()
                    .filter(|d| d.action != DiffAction::Unchanged)
                    .count();
                info!(name = sync.name(), changed, "dry-run: skipping apply");
                return (sync.name().to_string(), ApplyReport::default());
            }
            let report = apply_plan(&plan).await;
            for (path, err) in &report.errors {
                warn!(name = sync.name(), path = %path.display(), "apply failure: {err}");
            }
            if report.changed() {
                if let (Some(reload), Some(request)) = (&self.reload, sync.reload(&report, snap))
                {
                    reload.request(request).await;
                }
            }
            (sync.name().to_string(), report)
        });
        Ok(futures::future::join_all(applies).await)
    }
}

fn check_plan_conflicts(plans: &[(Arc<dyn Synchronizer>, Plan)]) -> CoreResult<()> {
    let mut claimed: BTreeMap<&Path, &str> = BTreeMap::new();
    for (sync, plan) in plans {
        for entry in &plan.entries {
            if let PlanEntry::File { path, .. } = entry {
                if let Some(other) = claimed.insert(path.as_path(), sync.name()) {
                    if other != sync.name() {
                        return Err(CoreError::new(
                            ErrorKind::PlanConflict,
                            format!(
                                "synchronizers {:?} and {:?} both claim {}",
                                other,
                                sync.name(),
                                path.display()
                            ),
                        )
                        .with("path", path.display())
                        .with("first", other)
                        .with("second", sync.name()));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Diff a plan against the filesystem without modifying it.
pub async fn diff_plan(plan: &Plan) -> Vec<DiffEntry> {
    let mut out = Vec::new();
    let desired: BTreeSet<&Path> = plan.entries.iter().map(PlanEntry::path).collect();
    for entry in &plan.entries {
        match entry {
            PlanEntry::File { path, content, .. } => {
                let action = match tokio::fs::read(path).await {
                    Ok(existing) if existing == *content => DiffAction::Unchanged,
                    Ok(_) => DiffAction::Update,
                    Err(_) => DiffAction::Create,
                };
                out.push(DiffEntry {
                    path: path.clone(),
                    action,
                });
            }
            PlanEntry::Dir { path, .. } => {
                let action = if path.is_dir() {
                    DiffAction::Unchanged
                } else {
                    DiffAction::Create
                };
                out.push(DiffEntry {
                    path: path.clone(),
                    action,
                });
            }
        }
    }
    for root in &plan.owned_roots {
        for stray in collect_strays(root, &desired) {
            out.push(DiffEntry {
                path: stray,
                action: DiffAction::Delete,
            });
        }
    }
    out
}

/// Drive the filesystem to the plan: identical files are skipped (their
/// mtime is preserved), changed files are replaced atomically, strays under
/// the owned roots are removed. Per-file failures are collected, not
/// short-circuited.
pub async fn apply_plan(plan: &Plan) -> ApplyReport {
    let mut report = ApplyReport::default();

    // Directory moves first, so a renamed domain's mailboxes carry over
    // instead of being recreated empty next to the stale tree.
    let desired: BTreeSet<PathBuf> = plan.entries.iter().map(|e| e.path().to_path_buf()).collect();
    move_renamed_dirs(plan, &desired, &mut report).await;

    for entry in &plan.entries {
        match entry {
            PlanEntry::Dir { path, owner } => {
                if let Err(e) = tokio::fs::create_dir_all(path).await {
                    report.errors.push((path.clone(), CoreError::from_io(&e, path)));
                    continue;
                }
                if let Some((uid, gid)) = owner {
                    if let Err(e) = chown_dir(path, *uid, *gid) {
                        report.errors.push((path.clone(), e));
                    }
                }
            }
            PlanEntry::File {
                path,
                content,
                mode,
            } => match write_file(path, content, *mode).await {
                Ok(true) => report.written.push(path.clone()),
                Ok(false) => report.unchanged += 1,
                Err(e) => report.errors.push((path.clone(), e)),
            },
        }
    }

    let desired_paths: BTreeSet<&Path> = desired.iter().map(PathBuf::as_path).collect();
    for root in &plan.owned_roots {
        for stray in collect_strays(root, &desired_paths) {
            let result = if stray.is_dir() {
                tokio::fs::remove_dir_all(&stray).await
            } else {
                tokio::fs::remove_file(&stray).await
            };
            match result {
                Ok(()) => report.deleted.push(stray),
                Err(e) => {
                    let err = CoreError::from_io(&e, &stray);
                    report.errors.push((stray, err));
                }
            }
        }
    }

    report
}

async fn write_file(path: &Path, content: &[u8], mode: u32) -> CoreResult<bool> {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(existing) = tokio::fs::read(path).await {
        if existing == content {
            // Identical bytes: at most refresh the mode, keep the mtime.
            if let Ok(meta) = tokio::fs::metadata(path).await {
                if meta.permissions().mode() & 0o777 != mode {
                    let mut perms = meta.permissions();
                    perms.set_mode(mode);
                    tokio::fs::set_permissions(path, perms)
                        .await
                        .map_err(|e| CoreError::from_io(&e, path))?;
                }
            }
            return Ok(false);
        }
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CoreError::from_io(&e, parent))?;
    }
    write_atomic(path, content, mode).await?;
    Ok(true)
}

fn chown_dir(path: &Path, uid: u32, gid: u32) -> CoreResult<()> {
    use nix::unistd::{chown, Gid, Uid};
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|e| {
        CoreError::from_io(&std::io::Error::from_raw_os_error(e as i32), path)
    })
}

/// A stray top-level directory whose name left the desired set while a new
/// directory with the same children arrived is a rename: move it.
async fn move_renamed_dirs(plan: &Plan, desired: &BTreeSet<PathBuf>, report: &mut ApplyReport) {
    let desired_dirs: BTreeSet<&PathBuf> = plan
        .entries
        .iter()
        .filter_map(|e| match e {
            PlanEntry::Dir { path, .. } => Some(path),
            PlanEntry::File { .. } => None,
        })
        .collect();

    // Renames can happen directly under an owned root or inside a desired
    // directory (a domain directory under the vhosts tree), so scan both.
    let mut scan_dirs: BTreeSet<&Path> = plan.owned_roots.iter().map(PathBuf::as_path).collect();
    scan_dirs.extend(desired_dirs.iter().map(|d| d.as_path()));

    for root in scan_dirs {
        let Ok(mut read_dir) = tokio::fs::read_dir(root).await else {
            continue;
        };
        let mut existing = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let path = entry.path();
            if path.is_dir() && !desired.contains(&path) {
                existing.push(path);
            }
        }
        for stray in existing {
            let Some(stray_name) = stray.file_name() else {
                continue;
            };
            let stray_children = child_names(&stray);
            // A unique missing desired sibling with the same child set.
            let mut candidates = desired_dirs.iter().filter(|d| {
                d.parent() == stray.parent()
                    && d.file_name() != Some(stray_name)
                    && !d.exists()
                    && desired_children(plan, d) == stray_children
            });
            if let (Some(target), None) = (candidates.next(), candidates.next()) {
                match tokio::fs::rename(&stray, target).await {
                    Ok(()) => {
                        info!(from = %stray.display(), to = %target.display(), "moved directory");
                        report.moved.push((stray, (*target).clone()));
                    }
                    Err(e) => {
                        let err = CoreError::from_io(&e, &stray);
                        report.errors.push((stray, err));
                    }
                }
            }
        }
    }
}

fn child_names(dir: &Path) -> BTreeSet<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.file_name().into_string().ok())
                .collect()
        })
        .unwrap_or_default()
}

fn desired_children(plan: &Plan, dir: &Path) -> BTreeSet<String> {
    plan.entries
        .iter()
        .filter_map(|e| {
            let path = e.path();
            if path.parent() == Some(dir) {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            } else {
                None
            }
        })
        .collect()
}

/// Files and directories under `root` that the plan does not account for.
/// A desired descendant keeps its ancestors alive.
fn collect_strays(root: &Path, desired: &BTreeSet<&Path>) -> Vec<PathBuf> {
    let mut strays = Vec::new();
    collect_strays_inner(root, desired, &mut strays);
    strays
}

fn collect_strays_inner(dir: &Path, desired: &BTreeSet<&Path>, strays: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".tmp") || name.ends_with(".bak") {
            continue;
        }
        if desired.contains(path.as_path()) {
            // A desired directory may still contain strays of its own... but
            // only when the plan names children inside it.
            if path.is_dir() && desired.iter().any(|d| d.starts_with(&path) && *d != path) {
                collect_strays_inner(&path, desired, strays);
            }
            continue;
        }
        if desired.iter().any(|d| d.starts_with(&path)) {
            // An ancestor of desired entries: recurse, keep it.
            collect_strays_inner(&path, desired, strays);
            continue;
        }
        strays.push(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn plan_with(root: &Path, files: &[(&str, &str)], dirs: &[&str]) -> Plan {
        let mut plan = Plan {
            owned_roots: vec![root.to_path_buf()],
            ..Default::default()
        };
        for dir in dirs {
            plan.dir(root.join(dir), None);
        }
        for (name, content) in files {
            plan.file(root.join(name), content.as_bytes().to_vec(), 0o644);
        }
        plan
    }

    #[tokio::test]
    async fn apply_is_idempotent_and_preserves_mtime() {
        let dir = TempDir::new().unwrap();
        let plan = plan_with(dir.path(), &[("virtual_domains", "local.dev OK\n")], &[]);

        let first = apply_plan(&plan).await;
        assert_eq!(first.written.len(), 1);

        let path = dir.path().join("virtual_domains");
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        let second = apply_plan(&plan).await;
        assert!(!second.changed(), "second apply must be a no-op");
        assert_eq!(second.unchanged, 1);
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), mtime);
    }

    #[tokio::test]
    async fn strays_are_removed_from_owned_roots() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("stale_file"), b"old").unwrap();
        std::fs::create_dir_all(dir.path().join("stale_dir/inner")).unwrap();

        let plan = plan_with(dir.path(), &[("kept", "x\n")], &[]);
        let report = apply_plan(&plan).await;
        assert!(!dir.path().join("stale_file").exists());
        assert!(!dir.path().join("stale_dir").exists());
        assert!(dir.path().join("kept").exists());
        assert_eq!(report.deleted.len(), 2);
    }

    #[tokio::test]
    async fn renamed_directory_is_moved_not_duplicated() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("local.dev/admin");
        std::fs::create_dir_all(&old).unwrap();
        std::fs::write(old.join("keepsake"), b"mail").unwrap();

        let plan = plan_with(
            dir.path(),
            &[],
            &["dev.local", "dev.local/admin"],
        );
        let report = apply_plan(&plan).await;
        assert_eq!(report.moved.len(), 1);
        assert!(dir.path().join("dev.local/admin/keepsake").exists());
        assert!(!dir.path().join("local.dev").exists());
    }

    #[tokio::test]
    async fn plan_conflicts_are_detected_before_apply() {
        struct Claimer(&'static str, PathBuf);
        #[async_trait]
        impl Synchronizer for Claimer {
            fn name(&self) -> &'static str {
                self.0
            }
            fn channels(&self) -> &'static [Channel] {
                &[Channel::Users]
            }
            async fn plan(&self, _snap: &SyncSnapshot) -> CoreResult<Plan> {
                let mut plan = Plan::default();
                plan.file(self.1.clone(), b"x".to_vec(), 0o644);
                Ok(plan)
            }
            fn reload(&self, _: &ApplyReport, _: &SyncSnapshot) -> Option<ReloadRequest> {
                None
            }
        }

        let dir = TempDir::new().unwrap();
        let contested = dir.path().join("contested");
        let a: Arc<dyn Synchronizer> = Arc::new(Claimer("a", contested.clone()));
        let b: Arc<dyn Synchronizer> = Arc::new(Claimer("b", contested.clone()));
        let plans = vec![
            (a.clone(), a.plan(&dummy_snapshot(dir.path())).await.unwrap()),
            (b.clone(), b.plan(&dummy_snapshot(dir.path())).await.unwrap()),
        ];
        let err = check_plan_conflicts(&plans).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PlanConflict);
    }

    #[tokio::test]
    async fn diff_reports_create_update_delete() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("update_me"), b"old\n").unwrap();
        std::fs::write(dir.path().join("stray"), b"gone\n").unwrap();

        let plan = plan_with(
            dir.path(),
            &[("update_me", "new\n"), ("create_me", "hello\n")],
            &[],
        );
        let diff = diff_plan(&plan).await;
        let action_of = |name: &str| {
            diff.iter()
                .find(|d| d.path == dir.path().join(name))
                .map(|d| d.action.clone())
        };
        assert_eq!(action_of("update_me"), Some(DiffAction::Update));
        assert_eq!(action_of("create_me"), Some(DiffAction::Create));
        assert_eq!(action_of("stray"), Some(DiffAction::Delete));
        // Dry run leaves the filesystem alone.
        assert_eq!(std::fs::read(dir.path().join("update_me")).unwrap(), b"old\n");
    }

    pub(crate) fn dummy_snapshot(base: &Path) -> SyncSnapshot {
        SyncSnapshot {
            environment: "testing".to_string(),
            global: GlobalConfig::default(),
            users: UsersFile::default(),
            domains: DomainsFile::default(),
            services: ServicesFile::default(),
            secrets: SecretsFile::default(),
            paths: Paths::from_base(base.to_path_buf()),
        }
    }
}
