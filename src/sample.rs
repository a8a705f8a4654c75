//! Sample `WebApp` controller and a scripted demo against the in-memory cluster.
//!
//! A `WebApp` owns one `ConfigMap`, a set of `Pod`s sized by `spec.replicas`,
//! and an `Ingress` while `spec.expose` is true. Pods wait for the config map;
//! the ingress waits for the pods and is deleted once `expose` turns false.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use steward_core::{
    ApiClient, EngineSettings, Error, InMemoryCluster, ManagedObject, ObjectCache, ResourceId,
    Result,
};
use steward_reconciler::{
    Controller, DeleteControl, ErrorStatusControl, Reconciler, SchedulerStats, Shutdown,
    ShutdownSignal, UpdateControl,
};
use steward_workflow::{Context, Dependent, OwnedObject, OwnedObjects, WorkflowBuilder, WorkflowResult};
use tracing::{info, warn};

pub const KIND: &str = "WebApp";
pub const FINALIZER: &str = "webapps.steward.io/cleanup";
pub const MAX_REPLICAS: u64 = 32;

/// Settings for the sample controller: file, then `STEWARD_*` overrides.
///
/// The kind defaults to `WebApp` and must not name anything else. A finalizer
/// is set unless the file or environment configures one.
///
/// # Errors
///
/// Propagates file, parse, and validation errors.
pub fn load_settings<F>(path: Option<&Path>, lookup: F) -> Result<EngineSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = match path {
        Some(path) => EngineSettings::parse_file(path)?,
        None => EngineSettings::default(),
    };
    if settings.kind.is_empty() {
        settings.kind = KIND.to_string();
    }
    if settings.kind != KIND {
        return Err(Error::invalid_config(format!(
            "sample controller only manages {KIND}, not {}",
            settings.kind
        )));
    }
    if settings.name == EngineSettings::default().name {
        settings.name = "webapp-controller".to_string();
    }
    if settings.finalizer.is_none() {
        settings.finalizer = Some(FINALIZER.to_string());
    }
    settings.apply_env_overrides(lookup)
}

fn replicas(primary: &ManagedObject) -> Result<u64> {
    match primary.spec.get("replicas") {
        None => Ok(1),
        Some(value) => value
            .as_u64()
            .filter(|count| *count <= MAX_REPLICAS)
            .ok_or_else(|| {
                Error::reconciler(format!(
                    "spec.replicas must be an integer in 0..={MAX_REPLICAS}, got {value}"
                ))
            }),
    }
}

fn exposed(primary: &ManagedObject) -> bool {
    primary.spec.get("expose").and_then(Value::as_bool).unwrap_or(false)
}

/// Dependents of a `WebApp`.
pub fn webapp_workflow() -> WorkflowBuilder {
    let config = OwnedObject::new("ConfigMap", |primary: &ManagedObject| {
        let greeting = primary
            .spec
            .get("greeting")
            .cloned()
            .unwrap_or_else(|| json!("hello"));
        Ok((
            format!("{}-config", primary.id.name),
            json!({"greeting": greeting}),
        ))
    });
    let pods = OwnedObjects::new("Pod", |primary: &ManagedObject| {
        Ok((0..replicas(primary)?)
            .map(|index| {
                (
                    format!("{}-{index}", primary.id.name),
                    json!({"image": "webapp:latest", "config": format!("{}-config", primary.id.name)}),
                )
            })
            .collect::<BTreeMap<_, _>>())
    });
    let ingress = OwnedObject::new("Ingress", |primary: &ManagedObject| {
        Ok((
            primary.id.name.clone(),
            json!({"backend": primary.id.name, "port": 8080}),
        ))
    });

    WorkflowBuilder::new("webapp")
        .add(
            Dependent::mutating("config", config)
                .ready_when(|_, observed, _| Ok(observed.is_present())),
        )
        .add(Dependent::bulk("pods", pods).depends_on("config"))
        .add(
            Dependent::mutating("ingress", ingress)
                .depends_on("pods")
                .reconcile_when(|primary, _, _| Ok(exposed(primary))),
        )
}

/// Reports pod counts and workflow readiness in the primary's status.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebAppReconciler;

#[async_trait]
impl Reconciler for WebAppReconciler {
    async fn reconcile(&self, primary: &ManagedObject, ctx: &Context) -> Result<UpdateControl> {
        let desired = replicas(primary)?;
        let pods = ctx.secondaries("Pod").await.len();
        let ready = ctx.workflow_result().is_none_or(WorkflowResult::all_ready);
        Ok(UpdateControl::patch_status(json!({
            "observedGeneration": primary.generation,
            "replicas": desired,
            "currentReplicas": pods,
            "ready": ready,
        })))
    }

    async fn cleanup(&self, primary: &ManagedObject, _ctx: &Context) -> Result<DeleteControl> {
        info!(id = %primary.id, "WebApp released");
        Ok(DeleteControl::Proceed)
    }

    async fn update_error_status(
        &self,
        primary: &ManagedObject,
        ctx: &Context,
        error: &Error,
    ) -> ErrorStatusControl {
        warn!(id = %primary.id, %error, last_attempt = ctx.is_last_attempt(), "WebApp reconcile failed");
        let attempts = ctx.retry_info().map_or(0, |info| info.attempt_count);
        ErrorStatusControl::patch_status(json!({
            "observedGeneration": primary.generation,
            "ready": false,
            "error": error.to_string(),
            "attempts": attempts,
        }))
    }
}

/// Knobs for [`run_demo`].
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub apps: usize,
    pub replicas: u64,
    /// Pause between scripted steps.
    pub settle: Duration,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            apps: 3,
            replicas: 2,
            settle: Duration::from_millis(500),
        }
    }
}

/// Final state of a demo run.
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub interrupted_by: Option<String>,
    pub webapps: Vec<WebAppSummary>,
    pub config_maps: usize,
    pub pods: usize,
    pub ingresses: usize,
    pub writes: usize,
    pub stats: SchedulerStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebAppSummary {
    pub id: String,
    pub generation: u64,
    pub status: Option<Value>,
}

/// Run the sample controller over a scripted sequence of user edits:
/// create `apps` web apps, scale the first one up, delete the last one.
///
/// Stops early when `shutdown` is triggered.
///
/// # Errors
///
/// Returns controller construction errors and cluster write errors from the
/// script.
pub async fn run_demo(
    settings: EngineSettings,
    options: DemoOptions,
    shutdown: Shutdown,
) -> Result<DemoReport> {
    let namespace = settings
        .namespaces
        .first()
        .cloned()
        .unwrap_or_else(|| "default".to_string());
    let cluster = InMemoryCluster::new_arc();
    let controller = Controller::builder(WebAppReconciler, settings)
        .cluster(Arc::clone(&cluster))
        .with_workflow(webapp_workflow())
        .with_shutdown(shutdown.clone())
        .build()?;

    let feed = cluster.watch();
    let script = async {
        let outcome = run_script(&cluster, &namespace, &options, &shutdown).await;
        shutdown.trigger(ShutdownSignal::Programmatic);
        outcome
    };
    let (run, scripted) = tokio::join!(controller.run(feed), script);
    run?;
    scripted?;

    let webapps = cluster
        .list(KIND)
        .await
        .into_iter()
        .map(|object| WebAppSummary {
            id: object.id.to_string(),
            generation: object.generation,
            status: object.status,
        })
        .collect();
    Ok(DemoReport {
        interrupted_by: shutdown
            .signal()
            .filter(|signal| *signal != ShutdownSignal::Programmatic)
            .map(|signal| signal.to_string()),
        webapps,
        config_maps: cluster.list("ConfigMap").await.len(),
        pods: cluster.list("Pod").await.len(),
        ingresses: cluster.list("Ingress").await.len(),
        writes: cluster.write_count(),
        stats: controller.scheduler().stats(),
    })
}

async fn run_script(
    cluster: &InMemoryCluster,
    namespace: &str,
    options: &DemoOptions,
    shutdown: &Shutdown,
) -> Result<()> {
    let ids: Vec<ResourceId> = (0..options.apps)
        .map(|index| ResourceId::namespaced(KIND, namespace, format!("app-{index}")))
        .collect();

    for (index, id) in ids.iter().enumerate() {
        let spec = json!({"replicas": options.replicas, "expose": index % 2 == 0});
        cluster
            .create(ManagedObject::new(id.clone(), spec).with_label("demo", "true"))
            .await?;
        info!(%id, "WebApp created");
    }
    if !pause(shutdown, options.settle).await {
        return Ok(());
    }

    if let Some(first) = ids.first() {
        let scaled = options.replicas.saturating_add(1).min(MAX_REPLICAS);
        cluster
            .update_spec(first, json!({"replicas": scaled, "expose": true}))
            .await?;
        info!(id = %first, replicas = scaled, "WebApp scaled");
        if !pause(shutdown, options.settle).await {
            return Ok(());
        }
    }

    if let Some(last) = ids.last().filter(|_| ids.len() > 1) {
        cluster.delete(last).await?;
        info!(id = %last, "WebApp deletion requested");
        pause(shutdown, options.settle).await;
    }
    Ok(())
}

/// Sleep for `duration` unless shutdown comes first. Returns false on shutdown.
async fn pause(shutdown: &Shutdown, duration: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        signal = shutdown.wait() => {
            info!(%signal, "Demo interrupted");
            false
        }
    }
}
