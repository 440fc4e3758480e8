//! Feed provisioning orchestrator.
//!
//! A provisioning request moves through
//!
//! ```text
//! Requested → Authorized → Built → Persisted
//!                            ↘        ↘
//!                             RolledBack
//! ```
//!
//! The flow engine is always called before the metadata commit. A graph left
//! behind by a failed commit can be rolled back; a committed feed pointing at
//! a half-built graph could not.
//!
//! Expected failures come back as a [`ProvisionOutcome`] with `success: false`.
//! Only storage errors raised before anything was built are returned as `Err`.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::authz::{AccessController, CallerContext, Entity, EntityAction, ServiceAction};
use crate::engine::{assemble_request, FlowEngine, MaterializeOutcome, RequestParts};
use crate::error::{FailureKind, FeedMgrError, Result};
use crate::expression::ExpressionContext;
use crate::paths;
use crate::properties::{locate_template, resolve_properties};
use crate::secrets::{decrypt_sensitive, SensitiveValueDecryptor};
use crate::store::{MetadataAccess, ReadTxExt, WriteTxExt};
use crate::types::{qualified_name, Feed, FeedId, FeedState, GraphRef, Property, Schedule, Template};

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// A create-or-update request for one feed. No `id` means create.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FeedId>,
    pub category: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    /// Requested lifecycle state; unrecognized values count as `NEW`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_processor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStage {
    Requested,
    Authorized,
    Built,
    Persisted,
    RolledBack,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    pub success: bool,
    pub stage: ProvisionStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<Feed>,
    /// The feed was requested active but saved disabled; the caller should
    /// enable it now that it is persisted.
    pub enable_after_save: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Set when cleanup after the primary failure also failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ProvisionOutcome {
    fn rejected(stage: ProvisionStage, err: &FeedMgrError) -> Self {
        Self {
            success: false,
            stage,
            feed: None,
            enable_after_save: false,
            failure: err.kind(),
            errors: vec![err.to_string()],
            rollback_error: None,
            warnings: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Activation {
    /// Tell the engine to start the graph now.
    enabled: bool,
    /// Start it only after the feed record is committed.
    enable_later: bool,
    state: FeedState,
}

fn decide_activation(requested: FeedState, active: bool, is_new: bool) -> Activation {
    let wants_enabled =
        (requested == FeedState::New && active) || requested == FeedState::Enabled;
    if wants_enabled && is_new {
        return Activation {
            enabled: false,
            enable_later: true,
            state: FeedState::Disabled,
        };
    }
    let state = if wants_enabled {
        FeedState::Enabled
    } else if is_new && requested == FeedState::New {
        FeedState::New
    } else {
        FeedState::Disabled
    };
    Activation {
        enabled: wants_enabled,
        enable_later: false,
        state,
    }
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// Rolls back the graph built for this request at most once.
struct RollbackGuard<'e> {
    engine: &'e dyn FlowEngine,
    graph: Option<GraphRef>,
    performed: bool,
}

impl<'e> RollbackGuard<'e> {
    fn new(engine: &'e dyn FlowEngine, graph: Option<GraphRef>, already_rolled_back: bool) -> Self {
        Self {
            engine,
            graph,
            performed: already_rolled_back,
        }
    }

    /// Returns the rollback error, if the rollback ran and failed.
    fn trigger(&mut self, feed: &str) -> Option<FeedMgrError> {
        if std::mem::replace(&mut self.performed, true) {
            return None;
        }
        let graph = self.graph.as_ref()?;
        tracing::warn!("rolling back graph {graph} for feed {feed}");
        match self.engine.rollback(graph) {
            Ok(()) => None,
            Err(e) => {
                tracing::error!("error rolling back feed {feed}: {e}");
                Some(match e {
                    FeedMgrError::Rollback(_) => e,
                    other => FeedMgrError::Rollback(other.to_string()),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FeedProvisioner
// ---------------------------------------------------------------------------

pub struct FeedProvisioner<'a, M> {
    store: &'a M,
    engine: &'a dyn FlowEngine,
    access: &'a dyn AccessController,
    decryptor: &'a dyn SensitiveValueDecryptor,
    remove_inactive_versioned_graphs: bool,
}

/// Stages reached before anything was built; failures here need no cleanup.
enum Prepared {
    Ready {
        existing: Option<Feed>,
        template: Template,
        properties: Vec<Property>,
    },
    Rejected(ProvisionOutcome),
}

impl<'a, M: MetadataAccess> FeedProvisioner<'a, M> {
    pub fn new(
        store: &'a M,
        engine: &'a dyn FlowEngine,
        access: &'a dyn AccessController,
        decryptor: &'a dyn SensitiveValueDecryptor,
    ) -> Self {
        Self {
            store,
            engine,
            access,
            decryptor,
            remove_inactive_versioned_graphs: true,
        }
    }

    pub fn remove_inactive_versioned_graphs(mut self, remove: bool) -> Self {
        self.remove_inactive_versioned_graphs = remove;
        self
    }

    /// Create or update a feed.
    pub fn provision(
        &self,
        caller: &CallerContext,
        request: &FeedRequest,
    ) -> Result<ProvisionOutcome> {
        let feed_name = qualified_name(&request.category, &request.name);
        tracing::debug!("provisioning {feed_name}: requested by {}", caller.user);

        let (existing, template, properties) = match self.prepare(caller, request)? {
            Prepared::Ready {
                existing,
                template,
                properties,
            } => (existing, template, properties),
            Prepared::Rejected(outcome) => return Ok(outcome),
        };

        let mut engine_properties = properties.clone();
        if let Err(e) = decrypt_sensitive(&mut engine_properties, self.decryptor) {
            return Ok(ProvisionOutcome::rejected(ProvisionStage::Authorized, &e));
        }

        let is_new = existing.is_none();
        let activation = decide_activation(
            FeedState::parse_or_new(request.state.as_deref()),
            request.active,
            is_new,
        );
        let existing_graph = existing.as_ref().and_then(|f| f.graph.clone());
        let materialize = assemble_request(RequestParts {
            feed_id: request.id.as_ref(),
            category: &request.category,
            feed_name: &request.name,
            template: &template,
            properties: engine_properties,
            enabled: activation.enabled,
            input_processor_type: request.input_processor_type.as_deref(),
            schedule: request.schedule.as_ref(),
            existing_graph: existing_graph.as_ref(),
            remove_inactive_versioned_graphs: self.remove_inactive_versioned_graphs,
        });

        let built = match self.engine.materialize(&materialize) {
            Ok(outcome) => outcome,
            Err(e) => MaterializeOutcome {
                errors: vec![e.to_string()],
                ..MaterializeOutcome::default()
            },
        };
        // Only a graph the engine reported for this request is ever rolled back.
        let mut rollback = RollbackGuard::new(self.engine, built.graph.clone(), built.rolled_back);

        let mut outcome = ProvisionOutcome {
            success: false,
            stage: ProvisionStage::Authorized,
            feed: None,
            enable_after_save: false,
            failure: None,
            errors: Vec::new(),
            rollback_error: None,
            warnings: Vec::new(),
        };

        match (&built.graph, built.success) {
            (Some(graph), true) => {
                outcome.stage = ProvisionStage::Built;
                tracing::debug!("{feed_name}: built graph {graph}");
                let feed = self.feed_record(existing, request, &template, properties, activation, graph);
                match self.commit(&feed) {
                    Ok(()) => {
                        outcome.stage = ProvisionStage::Persisted;
                        outcome.success = true;
                        outcome.enable_after_save = activation.enable_later;
                        outcome.feed = Some(feed);
                    }
                    Err(e) => {
                        let e = match e {
                            FeedMgrError::Persist(_) => e,
                            other => FeedMgrError::Persist(other.to_string()),
                        };
                        tracing::warn!("{feed_name}: {e}");
                        outcome.failure = e.kind();
                        outcome.errors.push(e.to_string());
                        if let Some(rb) = rollback.trigger(&feed_name) {
                            outcome.rollback_error = Some(rb.to_string());
                        }
                    }
                }
            }
            _ => {
                let detail = if built.errors.is_empty() {
                    "flow engine reported failure".to_string()
                } else {
                    built.errors.join("; ")
                };
                let e = FeedMgrError::Build(detail);
                tracing::warn!("{feed_name}: {e}");
                outcome.failure = e.kind();
                outcome.errors.push(e.to_string());
                if let Some(rb) = rollback.trigger(&feed_name) {
                    outcome.rollback_error = Some(rb.to_string());
                }
            }
        }

        if !outcome.success {
            // No-op when the failure branch above already rolled back.
            if let Some(rb) = rollback.trigger(&feed_name) {
                outcome.rollback_error = Some(rb.to_string());
            }
            if let Some(rb) = &outcome.rollback_error {
                outcome
                    .errors
                    .push(format!("Error occurred in rolling back the feed: {rb}"));
            }
            outcome.stage = ProvisionStage::RolledBack;
            return Ok(outcome);
        }

        if self.remove_inactive_versioned_graphs {
            if let Some(old) = built.superseded.as_ref().filter(|g| Some(*g) != built.graph.as_ref()) {
                if let Err(e) = self.engine.delete(old) {
                    tracing::warn!("{feed_name}: could not remove superseded graph {old}: {e}");
                    outcome
                        .warnings
                        .push(format!("superseded graph {old} was not removed: {e}"));
                }
            }
        }

        tracing::info!(
            "provisioned {feed_name} (state {}, enable after save: {})",
            activation.state,
            activation.enable_later
        );
        Ok(outcome)
    }

    /// Requested → Authorized, plus template and property resolution.
    fn prepare(&self, caller: &CallerContext, request: &FeedRequest) -> Result<Prepared> {
        let reject = |stage, e: FeedMgrError| -> Result<Prepared> {
            match e {
                FeedMgrError::Storage(_) => Err(e),
                e => {
                    tracing::debug!("rejecting {}.{}: {e}", request.category, request.name);
                    Ok(Prepared::Rejected(ProvisionOutcome::rejected(stage, &e)))
                }
            }
        };

        for name in [&request.category, &request.name] {
            if let Err(e) = paths::validate_system_name(name) {
                return reject(ProvisionStage::Requested, e);
            }
        }

        let existing = match self.authorize(caller, request) {
            Ok(existing) => existing,
            Err(e) => return reject(ProvisionStage::Requested, e),
        };
        tracing::debug!("{}.{}: authorized", request.category, request.name);

        let template = match self.store.read(|tx| {
            locate_template(
                tx,
                request.template_id.as_deref(),
                request.template_name.as_deref(),
            )
        }) {
            Ok(t) => t,
            Err(e) => return reject(ProvisionStage::Authorized, e),
        };

        let feed_name = request
            .display_name
            .as_deref()
            .unwrap_or(request.name.as_str());
        let ctx = ExpressionContext {
            category: &request.category,
            system_feed_name: &request.name,
            feed_name,
            user_fields: &request.metadata,
        };
        let resolution = resolve_properties(&template, &request.properties, &ctx);

        Ok(Prepared::Ready {
            existing,
            template,
            properties: resolution.properties,
        })
    }

    /// Check permissions and return the feed being edited, if any.
    fn authorize(&self, caller: &CallerContext, request: &FeedRequest) -> Result<Option<Feed>> {
        let existing = match &request.id {
            None => {
                self.access
                    .check_permission(caller, ServiceAction::CreateFeeds)?;
                None
            }
            Some(id) => {
                let feed = self
                    .store
                    .read(|tx| tx.feed(id))?
                    .ok_or_else(|| FeedMgrError::FeedNotFound(id.to_string()))?;
                self.access
                    .allowed_actions(caller, &Entity::Feed(id.clone()))?
                    .check(EntityAction::EditDetails)?;
                Some(feed)
            }
        };

        self.access
            .allowed_actions(caller, &Entity::Category(request.category.clone()))?
            .check(EntityAction::CreateFeed)?;

        let clash = self
            .store
            .read(|tx| tx.find_feed(&request.category, &request.name))?;
        if let Some(other) = clash {
            if Some(&other.id) != request.id.as_ref() {
                return Err(FeedMgrError::DuplicateFeed(other.qualified_name()));
            }
        }
        Ok(existing)
    }

    fn feed_record(
        &self,
        existing: Option<Feed>,
        request: &FeedRequest,
        template: &Template,
        properties: Vec<Property>,
        activation: Activation,
        graph: &GraphRef,
    ) -> Feed {
        let now = Utc::now();
        let (id, created_at) = match existing {
            Some(f) => (f.id, f.created_at),
            None => (FeedId::generate(), now),
        };
        Feed {
            id,
            category: request.category.clone(),
            name: request.name.clone(),
            description: request.description.clone(),
            state: activation.state,
            properties,
            template_id: template.id.clone(),
            template_name: template.name.clone(),
            graph: Some(graph.clone()),
            reusable: template.reusable,
            input_processor_type: request.input_processor_type.clone(),
            schedule: request.schedule.clone(),
            metadata: request.metadata.clone(),
            created_at,
            updated_at: now,
        }
    }

    /// Built → Persisted. Re-checks name uniqueness inside the write.
    fn commit(&self, feed: &Feed) -> Result<()> {
        self.store.write(|tx| {
            if let Some(other) = tx.find_feed(&feed.category, &feed.name)? {
                if other.id != feed.id {
                    return Err(FeedMgrError::Persist(format!(
                        "feed {} was created concurrently",
                        feed.qualified_name()
                    )));
                }
            }
            tx.put_feed(feed)
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn enable_feed(&self, caller: &CallerContext, id: &FeedId) -> Result<Feed> {
        self.set_enabled(caller, id, true)
    }

    pub fn disable_feed(&self, caller: &CallerContext, id: &FeedId) -> Result<Feed> {
        self.set_enabled(caller, id, false)
    }

    fn set_enabled(&self, caller: &CallerContext, id: &FeedId, enable: bool) -> Result<Feed> {
        let feed = self
            .store
            .read(|tx| tx.feed(id))?
            .ok_or_else(|| FeedMgrError::FeedNotFound(id.to_string()))?;
        self.access
            .allowed_actions(caller, &Entity::Feed(id.clone()))?
            .check(EntityAction::EnableDisable)?;
        let graph = feed.graph.clone().ok_or_else(|| {
            FeedMgrError::Build(format!("feed {} has no process graph", feed.qualified_name()))
        })?;

        if enable {
            self.engine.enable(&graph)?;
        } else {
            self.engine.disable(&graph)?;
        }

        let state = if enable {
            FeedState::Enabled
        } else {
            FeedState::Disabled
        };
        let updated = self.store.write(|tx| {
            let mut f = tx
                .feed(id)?
                .ok_or_else(|| FeedMgrError::FeedNotFound(id.to_string()))?;
            f.state = state;
            f.updated_at = Utc::now();
            tx.put_feed(&f)?;
            Ok(f)
        })?;
        tracing::info!("{} is now {state}", updated.qualified_name());
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    pub fn register_template(&self, caller: &CallerContext, template: &Template) -> Result<()> {
        self.access
            .check_permission(caller, ServiceAction::EditTemplates)?;
        self.store.write(|tx| tx.put_template(template))?;
        tracing::info!("registered template {} ({})", template.name, template.id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{PermissionPolicy, PolicyAccessController};
    use crate::engine::MaterializeRequest;
    use crate::secrets::NoDecryptor;
    use crate::store::{ReadTx, RedbStore, WriteTx};
    use crate::types::Principal;
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    // -- fakes --------------------------------------------------------------

    #[derive(Default)]
    struct FakeEngine {
        fail_build: bool,
        unreachable: bool,
        self_rolled_back: bool,
        fail_rollback: bool,
        superseded: Option<GraphRef>,
        requests: RefCell<Vec<MaterializeRequest>>,
        rollbacks: Cell<usize>,
        enabled: RefCell<Vec<GraphRef>>,
        deleted: RefCell<Vec<GraphRef>>,
    }

    impl FlowEngine for FakeEngine {
        fn materialize(&self, request: &MaterializeRequest) -> Result<MaterializeOutcome> {
            self.requests.borrow_mut().push(request.clone());
            if self.unreachable {
                return Err(FeedMgrError::Engine("connection refused".into()));
            }
            let n = self.requests.borrow().len();
            Ok(MaterializeOutcome {
                graph: Some(GraphRef::new(format!("g-{n}"))),
                success: !self.fail_build,
                rolled_back: self.self_rolled_back,
                errors: if self.fail_build {
                    vec!["processor 'Put' is invalid".into()]
                } else {
                    vec![]
                },
                superseded: self.superseded.clone(),
            })
        }

        fn rollback(&self, _graph: &GraphRef) -> Result<()> {
            self.rollbacks.set(self.rollbacks.get() + 1);
            if self.fail_rollback {
                return Err(FeedMgrError::Rollback("engine refused".into()));
            }
            Ok(())
        }

        fn enable(&self, graph: &GraphRef) -> Result<()> {
            self.enabled.borrow_mut().push(graph.clone());
            Ok(())
        }

        fn disable(&self, _graph: &GraphRef) -> Result<()> {
            Ok(())
        }

        fn delete(&self, graph: &GraphRef) -> Result<()> {
            self.deleted.borrow_mut().push(graph.clone());
            Ok(())
        }
    }

    /// Delegates reads, counts writes, and optionally fails them.
    struct CountingStore {
        inner: RedbStore,
        fail_writes: Cell<bool>,
        writes: Cell<usize>,
    }

    impl MetadataAccess for CountingStore {
        fn read<T, F>(&self, f: F) -> Result<T>
        where
            F: FnOnce(&dyn ReadTx) -> Result<T>,
        {
            self.inner.read(f)
        }

        fn write<T, F>(&self, f: F) -> Result<T>
        where
            F: FnOnce(&mut dyn WriteTx) -> Result<T>,
        {
            self.writes.set(self.writes.get() + 1);
            if self.fail_writes.get() {
                return Err(FeedMgrError::Storage("disk full".into()));
            }
            self.inner.write(f)
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: CountingStore,
        access: PolicyAccessController,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let inner = RedbStore::open(&dir.path().join("meta.db")).unwrap();
        inner
            .write(|tx| {
                tx.put_template(&Template {
                    id: "t1".into(),
                    name: "ingest".into(),
                    flow_template_id: "flow-1".into(),
                    properties: vec![
                        Property::new("src", "GetFile", "dir", Some("/in")).input(),
                        Property::new("put", "PutFile", "target", Some("/out/${metadata.systemFeedName}")),
                        Property::new("put", "PutFile", "mode", Some("append")),
                        Property::new("db", "PutDb", "password", None).sensitive(),
                    ],
                    reusable: false,
                    connections: vec![],
                })
            })
            .unwrap();
        let policy: PermissionPolicy = serde_yaml::from_str(
            r#"
services:
  designers: [create_feeds]
categories:
  sales:
    designers: [create_feed]
    editors: [create_feed]
"#,
        )
        .unwrap();
        Fixture {
            _dir: dir,
            store: CountingStore {
                inner,
                fail_writes: Cell::new(false),
                writes: Cell::new(0),
            },
            access: PolicyAccessController::new(policy),
        }
    }

    fn designer() -> CallerContext {
        CallerContext::new("dana").with_group("designers")
    }

    fn new_request() -> FeedRequest {
        FeedRequest {
            category: "sales".into(),
            name: "orders".into(),
            template_id: Some("t1".into()),
            properties: vec![Property::new("put", "PutFile", "mode", Some("overwrite"))],
            ..FeedRequest::default()
        }
    }

    fn provisioner<'a>(fx: &'a Fixture, engine: &'a FakeEngine) -> FeedProvisioner<'a, CountingStore> {
        FeedProvisioner::new(&fx.store, engine, &fx.access, &NoDecryptor)
    }

    // -- tests --------------------------------------------------------------

    #[test]
    fn new_feed_is_built_then_persisted() {
        let fx = fixture();
        let engine = FakeEngine::default();
        let out = provisioner(&fx, &engine)
            .provision(&designer(), &new_request())
            .unwrap();

        assert!(out.success, "{:?}", out.errors);
        assert_eq!(out.stage, ProvisionStage::Persisted);
        let feed = out.feed.unwrap();
        assert_eq!(feed.state, FeedState::New);
        assert_eq!(feed.graph, Some(GraphRef::new("g-1")));

        let names: Vec<_> = feed.properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["dir", "target", "mode"]);

        let stored = fx.store.read(|tx| tx.feed(&feed.id)).unwrap().unwrap();
        assert_eq!(stored.name, "orders");
        assert_eq!(engine.requests.borrow()[0].flow_template_id, "flow-1");
    }

    #[test]
    fn new_active_feed_defers_enable_until_after_save() {
        let fx = fixture();
        let engine = FakeEngine::default();
        let mut req = new_request();
        req.active = true;
        let out = provisioner(&fx, &engine)
            .provision(&designer(), &req)
            .unwrap();

        assert!(out.success);
        assert!(out.enable_after_save);
        assert_eq!(out.feed.as_ref().unwrap().state, FeedState::Disabled);
        assert!(!engine.requests.borrow()[0].enabled);
        assert!(engine.enabled.borrow().is_empty());
    }

    #[test]
    fn build_failure_writes_nothing_and_rolls_back_once() {
        let fx = fixture();
        let engine = FakeEngine {
            fail_build: true,
            ..FakeEngine::default()
        };
        let out = provisioner(&fx, &engine)
            .provision(&designer(), &new_request())
            .unwrap();

        assert!(!out.success);
        assert_eq!(out.failure, Some(FailureKind::Build));
        assert_eq!(out.stage, ProvisionStage::RolledBack);
        assert!(out.errors[0].contains("processor 'Put' is invalid"));
        assert_eq!(fx.store.writes.get(), 0);
        assert_eq!(engine.rollbacks.get(), 1);
    }

    #[test]
    fn engine_that_already_rolled_back_is_not_rolled_back_again() {
        let fx = fixture();
        let engine = FakeEngine {
            fail_build: true,
            self_rolled_back: true,
            ..FakeEngine::default()
        };
        let out = provisioner(&fx, &engine)
            .provision(&designer(), &new_request())
            .unwrap();
        assert!(!out.success);
        assert_eq!(engine.rollbacks.get(), 0);
    }

    #[test]
    fn unreachable_engine_is_a_build_failure() {
        let fx = fixture();
        let engine = FakeEngine {
            unreachable: true,
            ..FakeEngine::default()
        };
        let out = provisioner(&fx, &engine)
            .provision(&designer(), &new_request())
            .unwrap();
        assert_eq!(out.failure, Some(FailureKind::Build));
        assert!(out.errors[0].contains("connection refused"));
        assert_eq!(fx.store.writes.get(), 0);
        // Nothing was created, so there is nothing to roll back.
        assert_eq!(engine.rollbacks.get(), 0);
    }

    #[test]
    fn failed_edit_never_rolls_back_the_live_graph() {
        let fx = fixture();
        let created = provisioner(&fx, &FakeEngine::default())
            .provision(&designer(), &new_request())
            .unwrap()
            .feed
            .unwrap();
        assert_eq!(created.graph, Some(GraphRef::new("g-1")));

        let engine = FakeEngine {
            unreachable: true,
            ..FakeEngine::default()
        };
        let policy: PermissionPolicy = serde_yaml::from_str("admins: [root]\n").unwrap();
        let access = PolicyAccessController::new(policy);
        let mut req = new_request();
        req.id = Some(created.id.clone());
        let out = FeedProvisioner::new(&fx.store, &engine, &access, &NoDecryptor)
            .provision(&CallerContext::new("root"), &req)
            .unwrap();

        assert_eq!(out.failure, Some(FailureKind::Build));
        assert_eq!(out.stage, ProvisionStage::RolledBack);
        assert_eq!(engine.requests.borrow()[0].existing_graph, Some(GraphRef::new("g-1")));
        assert_eq!(engine.rollbacks.get(), 0);
        assert!(out.rollback_error.is_none());
        let stored = fx.store.read(|tx| tx.feed(&created.id)).unwrap().unwrap();
        assert_eq!(stored.graph, Some(GraphRef::new("g-1")));
    }

    #[test]
    fn rollback_guard_fires_at_most_once() {
        let engine = FakeEngine::default();
        let mut guard = RollbackGuard::new(&engine, Some(GraphRef::new("g-1")), false);
        assert!(guard.trigger("sales.orders").is_none());
        assert!(guard.trigger("sales.orders").is_none());
        assert_eq!(engine.rollbacks.get(), 1);
    }

    #[test]
    fn persist_failure_rolls_back_and_reports_persist() {
        let fx = fixture();
        fx.store.fail_writes.set(true);
        let engine = FakeEngine::default();
        let out = provisioner(&fx, &engine)
            .provision(&designer(), &new_request())
            .unwrap();

        assert!(!out.success);
        assert_eq!(out.failure, Some(FailureKind::Persist));
        assert_eq!(out.stage, ProvisionStage::RolledBack);
        assert_eq!(engine.rollbacks.get(), 1);
        fx.store.fail_writes.set(false);
        assert!(fx.store.read(|tx| tx.feeds()).unwrap().is_empty());
    }

    #[test]
    fn rollback_failure_is_reported_without_masking_primary_cause() {
        let fx = fixture();
        fx.store.fail_writes.set(true);
        let engine = FakeEngine {
            fail_rollback: true,
            ..FakeEngine::default()
        };
        let out = provisioner(&fx, &engine)
            .provision(&designer(), &new_request())
            .unwrap();

        assert_eq!(out.failure, Some(FailureKind::Persist));
        assert!(out.rollback_error.as_deref().unwrap().contains("engine refused"));
        assert_eq!(out.errors.len(), 2);
        assert!(out.errors[1].starts_with("Error occurred in rolling back the feed"));
        assert_eq!(engine.rollbacks.get(), 1);
    }

    #[test]
    fn caller_without_create_permission_is_rejected_without_side_effects() {
        let fx = fixture();
        let engine = FakeEngine::default();
        let out = provisioner(&fx, &engine)
            .provision(&CallerContext::new("mallory"), &new_request())
            .unwrap();

        assert_eq!(out.failure, Some(FailureKind::Authorization));
        assert_eq!(out.stage, ProvisionStage::Requested);
        assert!(engine.requests.borrow().is_empty());
        assert_eq!(fx.store.writes.get(), 0);
    }

    #[test]
    fn category_permission_is_required_for_new_feeds() {
        let fx = fixture();
        let engine = FakeEngine::default();
        let mut req = new_request();
        req.category = "finance".into();
        let out = provisioner(&fx, &engine)
            .provision(&designer(), &req)
            .unwrap();
        assert_eq!(out.failure, Some(FailureKind::Authorization));
        assert!(out.errors[0].contains("category finance"));
    }

    #[test]
    fn edit_uses_feed_entity_permission_not_service_permission() {
        let fx = fixture();
        let engine = FakeEngine::default();
        let created = provisioner(&fx, &engine)
            .provision(&designer(), &new_request())
            .unwrap()
            .feed
            .unwrap();

        // Editors hold category create_feed and entity edit_details, but not
        // the service-wide create_feeds permission.
        let mut policy: PermissionPolicy = serde_yaml::from_str(
            "categories:\n  sales:\n    editors: [create_feed]\n",
        )
        .unwrap();
        policy.feeds.insert(
            created.id.to_string(),
            BTreeMap::from([(
                Principal::new("editors"),
                BTreeSet::from([EntityAction::EditDetails]),
            )]),
        );
        let access = PolicyAccessController::new(policy);
        let editor = CallerContext::new("ed").with_group("editors");

        let mut req = new_request();
        req.id = Some(created.id.clone());
        let out = FeedProvisioner::new(&fx.store, &engine, &access, &NoDecryptor)
            .provision(&editor, &req)
            .unwrap();
        assert!(out.success, "{:?}", out.errors);
        assert_eq!(out.feed.as_ref().unwrap().id, created.id);
        assert_eq!(out.feed.as_ref().unwrap().created_at, created.created_at);

        // Without the entity grant the same edit is refused.
        let out = FeedProvisioner::new(&fx.store, &engine, &fx.access, &NoDecryptor)
            .provision(&editor, &req)
            .unwrap();
        assert_eq!(out.failure, Some(FailureKind::Authorization));
    }

    #[test]
    fn unknown_template_is_a_resolution_failure() {
        let fx = fixture();
        let engine = FakeEngine::default();
        let mut req = new_request();
        req.template_id = Some("nope".into());
        let out = provisioner(&fx, &engine)
            .provision(&designer(), &req)
            .unwrap();
        assert_eq!(out.failure, Some(FailureKind::TemplateResolution));
        assert!(engine.requests.borrow().is_empty());
    }

    #[test]
    fn duplicate_category_and_name_is_rejected() {
        let fx = fixture();
        let engine = FakeEngine::default();
        let p = provisioner(&fx, &engine);
        assert!(p.provision(&designer(), &new_request()).unwrap().success);
        let out = p.provision(&designer(), &new_request()).unwrap();
        assert_eq!(out.failure, Some(FailureKind::Rejected));
        assert_eq!(engine.requests.borrow().len(), 1);
    }

    #[test]
    fn encrypted_secret_without_identity_is_rejected_before_build() {
        let fx = fixture();
        let engine = FakeEngine::default();
        let mut req = new_request();
        req.properties
            .push(Property::new("db", "PutDb", "password", Some("{cipher}xyz")).sensitive());
        let out = provisioner(&fx, &engine)
            .provision(&designer(), &req)
            .unwrap();
        assert_eq!(out.failure, Some(FailureKind::Rejected));
        assert!(engine.requests.borrow().is_empty());
    }

    #[test]
    fn engine_receives_decrypted_values_but_feed_keeps_cipher_text() {
        struct Upper;
        impl SensitiveValueDecryptor for Upper {
            fn decrypt(&self, payload: &str) -> Result<String> {
                Ok(payload.to_uppercase())
            }
        }
        let fx = fixture();
        let engine = FakeEngine::default();
        let mut req = new_request();
        req.properties
            .push(Property::new("db", "PutDb", "password", Some("{cipher}xyz")).sensitive());
        let out = FeedProvisioner::new(&fx.store, &engine, &fx.access, &Upper)
            .provision(&designer(), &req)
            .unwrap();
        assert!(out.success);

        let sent = &engine.requests.borrow()[0].properties;
        let pw = sent.iter().find(|p| p.name == "password").unwrap();
        assert_eq!(pw.value.as_deref(), Some("XYZ"));
        let kept = out.feed.unwrap();
        let pw = kept.properties.iter().find(|p| p.name == "password").unwrap();
        assert_eq!(pw.value.as_deref(), Some("{cipher}xyz"));
    }

    #[test]
    fn superseded_graph_is_removed_after_commit() {
        let fx = fixture();
        let engine = FakeEngine {
            superseded: Some(GraphRef::new("g-old")),
            ..FakeEngine::default()
        };
        let out = provisioner(&fx, &engine)
            .provision(&designer(), &new_request())
            .unwrap();
        assert!(out.success);
        assert_eq!(*engine.deleted.borrow(), vec![GraphRef::new("g-old")]);

        let keep = FakeEngine {
            superseded: Some(GraphRef::new("g-old")),
            ..FakeEngine::default()
        };
        let mut req = new_request();
        req.name = "returns".into();
        provisioner(&fx, &keep)
            .remove_inactive_versioned_graphs(false)
            .provision(&designer(), &req)
            .unwrap();
        assert!(keep.deleted.borrow().is_empty());
    }

    #[test]
    fn enable_after_save_is_a_separate_call() {
        let fx = fixture();
        let engine = FakeEngine::default();
        let mut req = new_request();
        req.active = true;
        let p = provisioner(&fx, &engine);
        let feed = p.provision(&designer(), &req).unwrap().feed.unwrap();

        let mut policy = PermissionPolicy::default();
        policy.feeds.insert(
            feed.id.to_string(),
            BTreeMap::from([(
                Principal::new("dana"),
                BTreeSet::from([EntityAction::EnableDisable]),
            )]),
        );
        let access = PolicyAccessController::new(policy);
        let enabled = FeedProvisioner::new(&fx.store, &engine, &access, &NoDecryptor)
            .enable_feed(&designer(), &feed.id)
            .unwrap();
        assert_eq!(enabled.state, FeedState::Enabled);
        assert_eq!(*engine.enabled.borrow(), vec![GraphRef::new("g-1")]);

        // The fixture policy grants no enable_disable on this feed.
        assert!(matches!(
            p.disable_feed(&designer(), &feed.id),
            Err(FeedMgrError::Authorization { .. })
        ));
    }

    #[test]
    fn activation_rules() {
        let a = decide_activation(FeedState::Enabled, false, false);
        assert!(a.enabled && !a.enable_later);
        assert_eq!(a.state, FeedState::Enabled);

        let a = decide_activation(FeedState::New, true, true);
        assert!(!a.enabled && a.enable_later);
        assert_eq!(a.state, FeedState::Disabled);

        let a = decide_activation(FeedState::Disabled, true, false);
        assert!(!a.enabled);
        assert_eq!(a.state, FeedState::Disabled);
    }
}
