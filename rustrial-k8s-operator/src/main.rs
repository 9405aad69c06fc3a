#[macro_use]
extern crate log;

use async_trait::async_trait;
use kube::Client;
use rustrial_k8s_operator::{
    Action, ConfigurationService, Context, KubeApi, Operator, ReconcileError, Reconciler,
    ResourceModifications,
};
use rustrial_k8s_operator_apis::{Condition, ControllerConfiguration, Echo, RetryConfiguration};
use std::{collections::BTreeSet, sync::Arc, time::Duration};

/// The controller name, also the key of its configuration.
const ECHO_CONTROLLER: &str = "echo";

const READY: &str = "Ready";

const SUCCESS: &str = "Success";

/// Echoes `spec.message` into `status.echoed`.
struct EchoReconciler;

#[async_trait]
impl Reconciler<Echo> for EchoReconciler {
    fn name(&self) -> String {
        ECHO_CONTROLLER.to_string()
    }

    async fn reconcile(
        &self,
        echo: Arc<Echo>,
        ctx: &Context<Echo>,
    ) -> Result<Action, ReconcileError> {
        let mut modifications = ResourceModifications::new(echo.as_ref().clone());
        let generation = modifications.metadata.generation;
        let message = modifications.spec.message.clone();
        modifications.update_echoed(message.clone(), generation);
        modifications.update_condition(
            Condition::new(READY, Some(true), SUCCESS, format!("echoed {:?}", message))
                .with_observed_generation(generation),
        );
        if modifications.replace_status(ctx).await? {
            info!("Echoed {:?} for {}", message, echo.versioned_id());
        }
        Ok(Action::requeue(Duration::from_secs(3600)))
    }

    async fn cleanup(&self, echo: Arc<Echo>, ctx: &Context<Echo>) -> Result<(), ReconcileError> {
        info!(
            "Cleaning up {} (attempt {})",
            echo.id(),
            ctx.retry_info().attempt
        );
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env_var<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(v) => match v.parse::<T>() {
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(anyhow::anyhow!("invalid value {:?} of {}: {}", v, name, e)),
        },
        None => Ok(None),
    }
}

/// Configuration from the file named by `OPERATOR_CONFIG` or, if unset, from
/// environment variables.
fn configuration_service() -> anyhow::Result<ConfigurationService> {
    if let Some(path) = env_var("OPERATOR_CONFIG") {
        return Ok(ConfigurationService::from_file(path)?);
    }
    let mut configuration = ControllerConfiguration::new(ECHO_CONTROLLER);
    if let Some(namespaces) = env_var("WATCH_NAMESPACES") {
        let namespaces: BTreeSet<String> =
            namespaces.split(",").map(|v| v.trim().to_string()).collect();
        configuration = configuration.with_namespaces(namespaces);
    }
    if let Some(generation_aware) = parse_env_var::<bool>("GENERATION_AWARE")? {
        configuration = configuration.with_generation_aware(generation_aware);
    }
    if let Some(max) = parse_env_var::<usize>("MAX_CONCURRENT_RECONCILES")? {
        configuration = configuration.with_max_concurrent_reconciles(max);
    }
    let max_attempts = parse_env_var::<u32>("RETRY_MAX_ATTEMPTS")?;
    let initial_interval = parse_env_var::<u64>("RETRY_INITIAL_INTERVAL_MS")?;
    let multiplier = parse_env_var::<f64>("RETRY_INTERVAL_MULTIPLIER")?;
    let max_interval = parse_env_var::<u64>("RETRY_MAX_INTERVAL_MS")?;
    if max_attempts.is_some()
        || initial_interval.is_some()
        || multiplier.is_some()
        || max_interval.is_some()
    {
        let mut retry = RetryConfiguration::default();
        if let Some(v) = max_attempts {
            retry.max_attempts = v;
        }
        if let Some(v) = initial_interval {
            retry.initial_interval_ms = v;
        }
        if let Some(v) = multiplier {
            retry.interval_multiplier = v;
        }
        retry.max_interval_ms = max_interval;
        configuration = configuration.with_retry(retry);
    }
    let mut service = ConfigurationService::new();
    service.register(configuration)?;
    Ok(service)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    let configuration_service = configuration_service()?;
    let client = Client::try_default().await?;
    let mut operator = Operator::new(configuration_service);
    operator.register_controller::<Echo, _, _>(
        EchoReconciler,
        Arc::new(KubeApi::<Echo>::namespaced(client)),
        None,
    )?;
    info!("start controllers ...");
    tokio::signal::ctrl_c().await?;
    info!("shutting down ...");
    operator.stop().await;
    Ok(())
}
