//! Public mutating operations: add, update, del, enable, disable and
//! validate.
//!
//! Each operation is a fixed pipeline: take the store lock, load the stored
//! rules and remote instances, build the lookup tables, work out what changed
//! and which instances it affects, render their configuration, persist, and
//! finally ask the filter-control collaborator to reload.

use crate::affected::{self, AffectedSet, Change, Delta};
use crate::compiler::{compile, CompileContext};
use crate::config::Config;
use crate::control::FilterControl;
use crate::core::{Instance, InstanceRecord, RemoteInstance, Rule, RuleInput};
use crate::errors::{FwError, Result};
use crate::lookup::Catalog;
use crate::pipeline::{OpContext, Pipeline};
use crate::resolve::unresolved_targets;
use crate::store::{Store, StoreEntry, StoreLock};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Payload for `add`, `update` and `validate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeRequest {
    /// Rules to add, or patches to apply on update.
    #[serde(default)]
    pub rules: Vec<RuleInput>,
    /// Ids of local instances introduced by this request. Each must be
    /// present in `instances`.
    #[serde(default)]
    pub local_instances: Vec<String>,
    /// Remote instances to add or replace.
    #[serde(default)]
    pub remote_instances: Vec<InstanceRecord>,
    /// Every local instance on the host.
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
    /// Accept instance and tag targets that match nothing (add only).
    #[serde(default)]
    pub allow_unresolved: bool,
    /// Treat unknown rule ids as additions (update only).
    #[serde(default)]
    pub allow_adds: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub file_contents: bool,
}

/// Payload for `del`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    pub rule_ids: Vec<String>,
    #[serde(default)]
    pub remote_instance_ids: Vec<String>,
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub file_contents: bool,
}

/// Payload for `enable`, `disable` and the per-instance queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub id: String,
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub file_contents: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadFailure {
    pub instance: String,
    pub message: String,
}

/// Result of a mutating operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpReport {
    /// Serialized rules that changed (or were deleted).
    pub rules: Vec<serde_json::Value>,
    /// Ids of the instances whose configuration was rendered, sorted.
    pub instances: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote_instances: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<BTreeMap<PathBuf, String>>,
    /// Filter-control failures after the configuration was persisted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reload_failures: Vec<ReloadFailure>,
}

impl OpReport {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.instances.is_empty() && self.remote_instances.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeMode {
    Add,
    Update,
    Validate,
}

impl ChangeMode {
    fn op(self) -> &'static str {
        match self {
            ChangeMode::Add => "add",
            ChangeMode::Update => "update",
            ChangeMode::Validate => "validate",
        }
    }
}

/// The computed state of a change, before anything is rendered.
struct Prepared {
    merged: Vec<Rule>,
    catalog: Catalog,
    delta: Delta,
}

/// The policy convergence engine.
#[derive(Clone)]
pub struct Engine {
    store: Store,
    control: Arc<dyn FilterControl>,
    audit_tags: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("audit_tags", &self.audit_tags)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(store: Store, control: Arc<dyn FilterControl>) -> Self {
        Self {
            store,
            control,
            audit_tags: false,
        }
    }

    pub fn from_config(config: &Config, control: Arc<dyn FilterControl>) -> Self {
        Self::new(Store::from_config(config), control).with_audit_tags(config.render.audit_tags)
    }

    pub fn with_audit_tags(mut self, audit_tags: bool) -> Self {
        self.audit_tags = audit_tags;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn control(&self) -> &dyn FilterControl {
        self.control.as_ref()
    }

    /// Adds rules, local instances and remote instances.
    pub async fn add(&self, req: ChangeRequest) -> Result<OpReport> {
        self.change(ChangeMode::Add, req).await
    }

    /// Merges rule patches over stored rules and replaces remote instances.
    pub async fn update(&self, req: ChangeRequest) -> Result<OpReport> {
        self.change(ChangeMode::Update, req).await
    }

    /// Runs the construction and validation steps of `add` without touching
    /// the store.
    pub async fn validate(&self, req: ChangeRequest) -> Result<()> {
        self.change(ChangeMode::Validate, req).await.map(|_| ())
    }

    async fn change(&self, mode: ChangeMode, req: ChangeRequest) -> Result<OpReport> {
        let ctx = OpContext::new(mode.op())
            .dry_run(req.dry_run || mode == ChangeMode::Validate)
            .file_contents(req.file_contents);
        let span = info_span!("operation", op = ctx.op, dry_run = ctx.dry_run);

        async move {
            if req.rules.is_empty()
                && req.local_instances.is_empty()
                && req.remote_instances.is_empty()
            {
                return Err(FwError::InvalidRequest(format!(
                    "{} payload must contain rules, local instances or remote instances",
                    ctx.op
                )));
            }

            let _lock = self.lock_unless(mode == ChangeMode::Validate).await?;
            let mut pipeline = Pipeline::new(&ctx);

            let stored_rules = pipeline.step("load_rules", self.store.rules.load_all()).await?;
            let stored_mirrors = pipeline
                .step("load_remote_instances", self.store.mirrors.load_all())
                .await?;

            let mirror_changes = pipeline.sync_step("build_remote_instances", || {
                remote_changes(&stored_mirrors, req.remote_instances)
            })?;
            let catalog = pipeline.sync_step("build_catalog", || {
                Catalog::from_records(req.instances, overlay(&stored_mirrors, &mirror_changes))
            })?;
            let rule_changes = pipeline.sync_step("build_rules", || {
                rule_changes(mode, &stored_rules, req.rules, &ctx.token, req.allow_adds)
            })?;

            let relaxed = match mode {
                ChangeMode::Update => req.allow_adds,
                _ => req.allow_unresolved,
            };
            pipeline.sync_step("check_targets", || {
                if relaxed {
                    return Ok(());
                }
                FwError::check(
                    rule_changes
                        .iter()
                        .filter_map(|c| c.new.as_ref())
                        .flat_map(|rule| unresolved_targets(rule, &catalog))
                        .collect(),
                )
            })?;
            let new_locals = pipeline.sync_step("check_local_instances", || {
                known_instances(&catalog, req.local_instances)
            })?;

            let prepared = Prepared {
                merged: overlay(&stored_rules, &rule_changes),
                catalog,
                delta: Delta {
                    rules: rule_changes,
                    mirrors: mirror_changes,
                    instances: new_locals,
                },
            };
            if mode == ChangeMode::Validate {
                debug!(rules = prepared.delta.rules.len(), "Validation passed");
                return Ok(OpReport::default());
            }
            self.converge(&ctx, &mut pipeline, prepared).await
        }
        .instrument(span)
        .await
    }

    /// Deletes rules and remote instances by id.
    pub async fn del(&self, req: DeleteRequest) -> Result<OpReport> {
        let ctx = OpContext::new("del")
            .dry_run(req.dry_run)
            .file_contents(req.file_contents);
        let span = info_span!("operation", op = ctx.op, dry_run = ctx.dry_run);

        async move {
            if req.rule_ids.is_empty() && req.remote_instance_ids.is_empty() {
                return Err(FwError::InvalidRequest(
                    "del payload must contain rule ids or remote instance ids".to_string(),
                ));
            }

            let _lock = self.lock_unless(false).await?;
            let mut pipeline = Pipeline::new(&ctx);

            let stored_rules = pipeline.step("load_rules", self.store.rules.load_all()).await?;
            let stored_mirrors = pipeline
                .step("load_remote_instances", self.store.mirrors.load_all())
                .await?;

            let (rule_changes, mirror_changes) = pipeline.sync_step("find_entries", || {
                let rules = removals(&stored_rules, &req.rule_ids);
                let mirrors = removals(&stored_mirrors, &req.remote_instance_ids);
                match (rules, mirrors) {
                    (Ok(r), Ok(m)) => Ok((r, m)),
                    (r, m) => Err(FwError::from_many(
                        r.err().into_iter().chain(m.err()).collect(),
                    )),
                }
            })?;
            let catalog = pipeline.sync_step("build_catalog", || {
                Catalog::from_records(req.instances, overlay(&stored_mirrors, &mirror_changes))
            })?;

            let prepared = Prepared {
                merged: overlay(&stored_rules, &rule_changes),
                catalog,
                delta: Delta {
                    rules: rule_changes,
                    mirrors: mirror_changes,
                    instances: Vec::new(),
                },
            };
            self.converge(&ctx, &mut pipeline, prepared).await
        }
        .instrument(span)
        .await
    }

    /// Enables the filter for one instance: renders and writes its
    /// configuration, then enables and reloads the live filter if the
    /// instance is running.
    pub async fn enable(&self, req: InstanceRequest) -> Result<OpReport> {
        let ctx = OpContext::new("enable")
            .dry_run(req.dry_run)
            .file_contents(req.file_contents);
        let span = info_span!("operation", op = ctx.op, dry_run = ctx.dry_run, instance = %req.id);

        async move {
            let _lock = self.lock_unless(false).await?;
            let mut pipeline = Pipeline::new(&ctx);

            let rules = pipeline.step("load_rules", self.store.rules.load_all()).await?;
            let mirrors = pipeline
                .step("load_remote_instances", self.store.mirrors.load_all())
                .await?;

            let id = req.id.clone();
            let catalog = pipeline.sync_step("build_catalog", || {
                let mut records = req.instances;
                let record = records
                    .iter_mut()
                    .find(|r| r.id.as_deref() == Some(id.as_str()))
                    .ok_or_else(|| FwError::not_found("instance", id.clone()))?;
                record.filter_enabled = Some(true);
                Catalog::from_records(records, mirrors)
            })?;
            let instance = catalog
                .local
                .get(&req.id)
                .ok_or_else(|| FwError::not_found("instance", req.id.clone()))?;

            let affected = affected::for_instances(&rules, [instance]);
            let files = pipeline.sync_step("compile", || {
                Ok(self.compile_all(&catalog, &affected, &ctx))
            })?;
            if !ctx.dry_run {
                pipeline
                    .step("save_configs", self.store.conf.write_all(&files, &ctx.token))
                    .await?;
            }

            let mut reload_failures = Vec::new();
            if !ctx.dry_run && instance.running {
                let paths = self.store.conf.paths_for(instance);
                let result = match self.control.enable(instance, &paths).await {
                    Ok(()) => self.control.reload(instance, &paths).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(instance = %instance.id, error = %e, "Failed to enable filter");
                    reload_failures.push(ReloadFailure {
                        instance: instance.id.clone(),
                        message: e.to_string(),
                    });
                }
            }

            info!(instance = %instance.id, "Filter enabled");
            Ok(OpReport {
                instances: vec![instance.id.clone()],
                files: ctx.file_contents.then_some(files),
                reload_failures,
                ..Default::default()
            })
        }
        .instrument(span)
        .await
    }

    /// Disables the filter for one instance. Its configuration is moved to
    /// the `.old` backup; no rules change.
    pub async fn disable(&self, req: InstanceRequest) -> Result<OpReport> {
        let ctx = OpContext::new("disable").dry_run(req.dry_run);
        let span = info_span!("operation", op = ctx.op, dry_run = ctx.dry_run, instance = %req.id);

        async move {
            let _lock = self.lock_unless(false).await?;
            let mut pipeline = Pipeline::new(&ctx);

            let catalog = pipeline.sync_step("build_catalog", || {
                Catalog::from_records(req.instances, Vec::new())
            })?;
            let instance = catalog
                .local
                .get(&req.id)
                .ok_or_else(|| FwError::not_found("instance", req.id.clone()))?;

            let mut reload_failures = Vec::new();
            if !ctx.dry_run {
                pipeline
                    .step("retire_config", self.store.conf.retire(instance))
                    .await?;
                if instance.running {
                    if let Err(e) = self.control.disable(instance).await {
                        warn!(instance = %instance.id, error = %e, "Failed to disable filter");
                        reload_failures.push(ReloadFailure {
                            instance: instance.id.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }

            info!(instance = %instance.id, "Filter disabled");
            Ok(OpReport {
                instances: vec![instance.id.clone()],
                reload_failures,
                ..Default::default()
            })
        }
        .instrument(span)
        .await
    }

    async fn lock_unless(&self, skip: bool) -> Result<Option<StoreLock>> {
        if skip {
            return Ok(None);
        }
        self.store.lock().await.map(Some)
    }

    /// Affected set, compile, persist and reload for a prepared change.
    async fn converge(
        &self,
        ctx: &OpContext,
        pipeline: &mut Pipeline,
        prepared: Prepared,
    ) -> Result<OpReport> {
        let Prepared {
            merged,
            catalog,
            delta,
        } = prepared;

        let affected = pipeline.sync_step("affected_set", || {
            Ok(affected::compute(&merged, &catalog, &delta))
        })?;
        let files = pipeline.sync_step("compile", || {
            Ok(self.compile_all(&catalog, &affected, ctx))
        })?;

        let mut reload_failures = Vec::new();
        if !ctx.dry_run {
            pipeline
                .step("save_rules", self.persist(&self.store.rules, &delta.rules, &ctx.token))
                .await?;
            metrics::counter!("fw_rules_written_total")
                .increment(delta.rules.iter().filter(|c| c.new.is_some()).count() as u64);
            pipeline
                .step(
                    "save_remote_instances",
                    self.persist(&self.store.mirrors, &delta.mirrors, &ctx.token),
                )
                .await?;
            pipeline
                .step("save_configs", self.store.conf.write_all(&files, &ctx.token))
                .await?;
            reload_failures = self.reload_all(&catalog, &affected).await;
        }

        metrics::counter!("fw_instances_affected_total").increment(affected.len() as u64);
        let report = OpReport {
            rules: delta
                .rules
                .iter()
                .filter_map(Change::latest)
                .map(Rule::serialize)
                .collect(),
            instances: affected.ids(),
            remote_instances: delta
                .mirrors
                .iter()
                .filter_map(Change::latest)
                .map(|m| m.id.clone())
                .collect(),
            files: ctx.file_contents.then_some(files),
            reload_failures,
        };
        info!(
            op = ctx.op,
            rules = report.rules.len(),
            instances = report.instances.len(),
            remote_instances = report.remote_instances.len(),
            "Operation complete"
        );
        Ok(report)
    }

    pub(crate) fn compile_all(
        &self,
        catalog: &Catalog,
        affected: &AffectedSet,
        ctx: &OpContext,
    ) -> BTreeMap<PathBuf, String> {
        let compile_ctx = CompileContext {
            catalog,
            generated_at: ctx.generated_at,
            audit_tags: self.audit_tags,
        };
        affected
            .instances
            .iter()
            .filter_map(|(id, rules)| catalog.local.get(id).map(|inst| (inst, rules)))
            .map(|(inst, rules)| {
                (
                    self.store.conf.path_for(inst),
                    compile(inst, rules, &compile_ctx),
                )
            })
            .collect()
    }

    /// Writes new versions and removes deleted entries.
    async fn persist<T: StoreEntry + Clone>(
        &self,
        store: &crate::store::JsonStore<T>,
        changes: &[Change<T>],
        token: &str,
    ) -> Result<()> {
        let written: Vec<T> = changes.iter().filter_map(|c| c.new.clone()).collect();
        let removed: Vec<String> = changes
            .iter()
            .filter(|c| c.new.is_none())
            .filter_map(|c| c.old.as_ref().map(|o| o.store_id().to_string()))
            .collect();
        store.write_all(&written, token).await?;
        store.remove_all(&removed).await?;
        debug!(
            kind = T::KIND,
            written = written.len(),
            removed = removed.len(),
            "Persisted store changes"
        );
        Ok(())
    }

    /// Reloads every running instance in `affected`. Failures are returned,
    /// not raised: the configuration is already on disk.
    async fn reload_all(&self, catalog: &Catalog, affected: &AffectedSet) -> Vec<ReloadFailure> {
        let running: Vec<&Instance> = affected
            .instances
            .keys()
            .filter_map(|id| catalog.local.get(id))
            .filter(|inst| inst.running)
            .collect();

        let results = join_all(running.iter().map(|inst| {
            let paths = self.store.conf.paths_for(inst);
            async move { (inst, self.control.reload(inst, &paths).await) }
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(inst, result)| {
                result.err().map(|e| {
                    warn!(instance = %inst.id, error = %e, "Failed to reload filter");
                    ReloadFailure {
                        instance: inst.id.clone(),
                        message: e.to_string(),
                    }
                })
            })
            .collect()
    }
}

/// `stored` with every change applied, sorted by id.
fn overlay<T: StoreEntry + Clone>(stored: &[T], changes: &[Change<T>]) -> Vec<T> {
    let mut by_id: BTreeMap<String, T> = stored
        .iter()
        .map(|item| (item.store_id().to_string(), item.clone()))
        .collect();
    for change in changes {
        if let Some(old) = &change.old {
            by_id.remove(old.store_id());
        }
        if let Some(new) = &change.new {
            by_id.insert(new.store_id().to_string(), new.clone());
        }
    }
    by_id.into_values().collect()
}

/// Builds the rule changes requested by `inputs`, pruning no-ops.
fn rule_changes(
    mode: ChangeMode,
    stored: &[Rule],
    inputs: Vec<RuleInput>,
    version: &str,
    allow_adds: bool,
) -> Result<Vec<Change<Rule>>> {
    let existing: BTreeMap<&str, &Rule> = stored.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut seen = BTreeSet::new();
    let mut changes = Vec::new();
    let mut errs = Vec::new();

    for input in inputs {
        if !seen.insert(input.id.clone()) {
            errs.push(FwError::validation(format!(
                "rule \"{}\" appears more than once",
                input.id
            )));
            continue;
        }
        let original = existing.get(input.id.as_str()).copied();
        if let (Some(orig), Some(v)) = (original, input.version.as_deref()) {
            if orig.version == v {
                debug!(rule = %orig.id, version = v, "Version unchanged, skipping");
                continue;
            }
        }

        let base = match (mode, original) {
            (ChangeMode::Update, None) if !allow_adds => {
                errs.push(FwError::not_found("rule", input.id));
                continue;
            }
            (ChangeMode::Update, Some(orig)) => Some(orig),
            _ => None,
        };

        match input.build(base, version) {
            Ok(rule) => match original {
                Some(orig) if orig.same_content(&rule) => {
                    debug!(rule = %rule.id, "Content unchanged, skipping");
                }
                Some(orig) => changes.push(Change::replaced(orig.clone(), rule)),
                None => changes.push(Change::added(rule)),
            },
            Err(e) => errs.push(e),
        }
    }

    FwError::check(errs)?;
    Ok(changes)
}

/// Validates remote instance records and keeps those that differ from what
/// is stored.
fn remote_changes(
    stored: &[RemoteInstance],
    records: Vec<InstanceRecord>,
) -> Result<Vec<Change<RemoteInstance>>> {
    let existing: BTreeMap<&str, &RemoteInstance> =
        stored.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut seen = BTreeSet::new();
    let mut changes = Vec::new();
    let mut errs = Vec::new();

    for record in records {
        let remote = match RemoteInstance::try_from(record) {
            Ok(remote) => remote,
            Err(e) => {
                errs.push(e);
                continue;
            }
        };
        if !seen.insert(remote.id.clone()) {
            errs.push(FwError::validation(format!(
                "remote instance \"{}\" appears more than once",
                remote.id
            )));
            continue;
        }
        match existing.get(remote.id.as_str()) {
            Some(old) if **old == remote => {
                debug!(remote = %remote.id, "Remote instance unchanged, skipping");
            }
            Some(old) => changes.push(Change::replaced((*old).clone(), remote)),
            None => changes.push(Change::added(remote)),
        }
    }

    FwError::check(errs)?;
    Ok(changes)
}

/// Removal changes for `ids`; unknown ids are aggregated `NotFound` errors.
fn removals<T: StoreEntry + Clone>(stored: &[T], ids: &[String]) -> Result<Vec<Change<T>>> {
    let mut seen = BTreeSet::new();
    let mut changes = Vec::new();
    let mut errs = Vec::new();
    for id in ids {
        if !seen.insert(id.as_str()) {
            continue;
        }
        match stored.iter().find(|item| item.store_id() == id) {
            Some(item) => changes.push(Change::removed(item.clone())),
            None => errs.push(FwError::not_found(T::KIND, id.clone())),
        }
    }
    FwError::check(errs)?;
    Ok(changes)
}

/// Checks that every introduced local instance id is in the catalog.
fn known_instances(catalog: &Catalog, ids: Vec<String>) -> Result<Vec<String>> {
    FwError::check(
        ids.iter()
            .filter(|id| !catalog.local.contains(id))
            .map(|id| FwError::not_found("instance", id.clone()))
            .collect(),
    )?;
    Ok(ids)
}
