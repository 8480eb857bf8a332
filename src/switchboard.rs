//! The switchboard facade.
//!
//! Owns the deployment pool, the session-affinity map, and the background
//! supervisor, and runs the outer failover loop: select a deployment,
//! dispatch, and on a retryable failure exclude that deployment and try
//! another. Deployment-local retries (transient noise) happen below, in
//! the deployment client; this loop exists for deployment-wide failures.

use crate::balancer;
use crate::client::{ChatClient, HttpChatClient};
use crate::config::{ConfigFile, DeploymentConfig};
use crate::deployment::{DeploymentClient, DeploymentSnapshot, RetryPolicy};
use crate::errors::{AttemptFailure, SwitchboardError};
use crate::models::{ChatCompletion, ChatCompletionRequest};
use crate::session::SessionMap;
use crate::stream::CompletionStream;
use crate::supervisor::Supervisor;
use crate::telemetry::{self, AffinityEvent};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, bon::Builder)]
#[builder(derive(Clone))]
pub struct SwitchboardOptions {
    /// Cadence of the background health loop. Zero disables probing.
    #[builder(default = Duration::from_secs(10))]
    pub healthcheck_interval: Duration,
    /// Usage counters reset every window. Zero disables the reset loop;
    /// counters then grow monotonically.
    #[builder(default = Duration::from_secs(60))]
    pub ratelimit_window: Duration,
    #[builder(default = 1024)]
    pub session_capacity: usize,
    /// Bound on the outer failover loop.
    #[builder(default = 3)]
    pub max_attempts: usize,
    /// Deployment-local retry policy for transient upstream errors.
    #[builder(default)]
    pub retry: RetryPolicy,
}

impl Default for SwitchboardOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// What a completion call produced: a full response object, or a lazy
/// chunk stream. Either passes through from the deployment unmodified.
pub enum ChatCompletionResponse {
    Completion(ChatCompletion),
    Stream(CompletionStream),
}

impl std::fmt::Debug for ChatCompletionResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatCompletionResponse::Completion(completion) => {
                f.debug_tuple("Completion").field(completion).finish()
            }
            ChatCompletionResponse::Stream(stream) => {
                f.debug_tuple("Stream").field(stream).finish()
            }
        }
    }
}

impl ChatCompletionResponse {
    pub fn into_completion(self) -> Option<ChatCompletion> {
        match self {
            ChatCompletionResponse::Completion(completion) => Some(completion),
            ChatCompletionResponse::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<CompletionStream> {
        match self {
            ChatCompletionResponse::Stream(stream) => Some(stream),
            ChatCompletionResponse::Completion(_) => None,
        }
    }
}

/// Tracks what the affinity lookup found, for the event counter.
enum AffinityLookup {
    NoSession,
    Miss,
    Stale,
}

pub struct Switchboard {
    deployments: HashMap<String, Arc<DeploymentClient>>,
    sessions: Mutex<SessionMap>,
    options: SwitchboardOptions,
    supervisor: Mutex<Option<Supervisor>>,
}

impl std::fmt::Debug for Switchboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switchboard")
            .field("deployments", &self.deployments.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Switchboard {
    /// Build a switchboard over the given deployments with the default
    /// HTTP client.
    pub fn new(
        configs: Vec<DeploymentConfig>,
        options: SwitchboardOptions,
    ) -> Result<Self, SwitchboardError> {
        Self::with_client_factory(configs, options, |config| {
            HttpChatClient::new(config).map(|client| Arc::new(client) as Arc<dyn ChatClient>)
        })
    }

    /// Build a switchboard with a custom client per deployment. This is
    /// the substitution point for test doubles and alternative
    /// transports.
    pub fn with_client_factory<F>(
        configs: Vec<DeploymentConfig>,
        options: SwitchboardOptions,
        factory: F,
    ) -> Result<Self, SwitchboardError>
    where
        F: Fn(&DeploymentConfig) -> Result<Arc<dyn ChatClient>, SwitchboardError>,
    {
        if configs.is_empty() {
            return Err(SwitchboardError::NoDeployments);
        }

        let mut deployments = HashMap::new();
        for config in configs {
            if deployments.contains_key(&config.name) {
                return Err(SwitchboardError::DuplicateDeployment(config.name));
            }
            let client = factory(&config)?;
            let name = config.name.clone();
            deployments.insert(
                name,
                Arc::new(DeploymentClient::new(config, client, options.retry.clone())),
            );
        }

        Ok(Self {
            sessions: Mutex::new(SessionMap::new(options.session_capacity)),
            deployments,
            options,
            supervisor: Mutex::new(None),
        })
    }

    pub async fn from_config_file(
        path: &Path,
        options: SwitchboardOptions,
    ) -> Result<Self, anyhow::Error> {
        let config = ConfigFile::load(path).await?;
        Self::new(config.deployments, options).map_err(Into::into)
    }

    /// Launch the background supervisor. Idempotent.
    pub fn start(&self) {
        let mut supervisor = self.supervisor.lock().unwrap();
        if supervisor.is_some() {
            return;
        }
        info!(
            deployments = self.deployments.len(),
            "starting switchboard supervisor"
        );
        *supervisor = Some(Supervisor::spawn(
            self.deployments.values().cloned().collect(),
            self.options.healthcheck_interval,
            self.options.ratelimit_window,
        ));
    }

    /// Cancel the background supervisor and wait for it to wind down.
    /// Idempotent.
    pub async fn stop(&self) {
        let supervisor = self.supervisor.lock().unwrap().take();
        if let Some(supervisor) = supervisor {
            info!("stopping switchboard supervisor");
            supervisor.shutdown().await;
        }
    }

    /// Send a chat completion to the best deployment, with failover.
    ///
    /// Streaming requests (`request.stream`) resolve to a chunk stream;
    /// failover applies only until the stream is handed over. Dropping
    /// the returned future (or the stream) cancels the underlying call.
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn create(
        &self,
        request: ChatCompletionRequest,
        session_id: Option<&str>,
    ) -> Result<ChatCompletionResponse, SwitchboardError> {
        let mut excluded = HashSet::new();
        let mut causes = Vec::new();

        for attempt in 1..=self.options.max_attempts {
            let deployment = match self.select(session_id, &excluded) {
                Ok(deployment) => deployment,
                Err(e) => {
                    debug!(attempt, error = %e, "selection failed");
                    causes.push(AttemptFailure {
                        deployment: None,
                        cause: Box::new(e),
                    });
                    continue;
                }
            };

            debug!(attempt, deployment = %deployment.name(), "dispatching completion");
            let result = if request.stream {
                deployment
                    .create_stream(&request)
                    .await
                    .map(ChatCompletionResponse::Stream)
            } else {
                deployment
                    .create(&request)
                    .await
                    .map(ChatCompletionResponse::Completion)
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        deployment = %deployment.name(),
                        error = %e,
                        "attempt failed, excluding deployment"
                    );
                    excluded.insert(deployment.name().to_string());
                    if let Some(sid) = session_id {
                        self.sessions.lock().unwrap().remove(sid);
                    }
                    causes.push(AttemptFailure {
                        deployment: Some(deployment.name().to_string()),
                        cause: Box::new(e),
                    });
                }
            }
        }

        if causes
            .iter()
            .all(|c| matches!(*c.cause, SwitchboardError::NoHealthyDeployment))
        {
            Err(SwitchboardError::NoHealthyDeployment)
        } else {
            Err(SwitchboardError::AllDeploymentsFailed { causes })
        }
    }

    /// Pick the deployment a request would go to right now. Exposed for
    /// inspection and testing.
    pub fn select_deployment(
        &self,
        session_id: Option<&str>,
    ) -> Result<Arc<DeploymentClient>, SwitchboardError> {
        self.select(session_id, &HashSet::new())
    }

    fn select(
        &self,
        session_id: Option<&str>,
        excluded: &HashSet<String>,
    ) -> Result<Arc<DeploymentClient>, SwitchboardError> {
        let lookup = match session_id {
            None => AffinityLookup::NoSession,
            Some(sid) => {
                let bound = self.sessions.lock().unwrap().get(sid).map(str::to_string);
                match bound {
                    None => AffinityLookup::Miss,
                    Some(name) => {
                        if !excluded.contains(&name)
                            && let Some(deployment) = self.deployments.get(&name)
                            && deployment.is_healthy()
                        {
                            telemetry::record_affinity(AffinityEvent::Hit);
                            debug!(session = sid, deployment = %name, "session affinity hit");
                            return Ok(Arc::clone(deployment));
                        }
                        debug!(session = sid, deployment = %name, "bound deployment unusable");
                        AffinityLookup::Stale
                    }
                }
            }
        };

        let healthy: Vec<_> = self
            .deployments
            .values()
            .filter(|d| d.is_healthy() && !excluded.contains(d.name()))
            .cloned()
            .collect();

        let selected = balancer::pick(&healthy)
            .cloned()
            .ok_or(SwitchboardError::NoHealthyDeployment)?;

        if let Some(sid) = session_id {
            self.sessions.lock().unwrap().insert(sid, selected.name());
            match lookup {
                AffinityLookup::Miss => telemetry::record_affinity(AffinityEvent::Miss),
                AffinityLookup::Stale => telemetry::record_affinity(AffinityEvent::Rebind),
                AffinityLookup::NoSession => {}
            }
        }

        debug!(deployment = %selected.name(), "selected deployment");
        Ok(selected)
    }

    /// Look up a deployment by name.
    pub fn deployment(&self, name: &str) -> Option<&Arc<DeploymentClient>> {
        self.deployments.get(name)
    }

    /// Point-in-time state of every deployment.
    pub fn stats(&self) -> HashMap<String, DeploymentSnapshot> {
        self.deployments
            .iter()
            .map(|(name, deployment)| (name.clone(), deployment.snapshot()))
            .collect()
    }

    /// Roll every deployment's usage window immediately.
    pub fn reset_usage(&self) {
        for deployment in self.deployments.values() {
            deployment.reset_usage();
        }
    }

    /// Number of live session bindings.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{StubChatClient, test_config};

    fn stub_factory(
        _config: &DeploymentConfig,
    ) -> Result<Arc<dyn ChatClient>, SwitchboardError> {
        Ok(Arc::new(StubChatClient::healthy()))
    }

    fn stub_switchboard(names: &[&str]) -> Switchboard {
        let configs = names.iter().map(|n| test_config(n, 0, 0)).collect();
        Switchboard::with_client_factory(configs, SwitchboardOptions::default(), stub_factory)
            .unwrap()
    }

    #[test]
    fn rejects_empty_deployment_list() {
        let result = Switchboard::with_client_factory(
            Vec::new(),
            SwitchboardOptions::default(),
            stub_factory,
        );
        assert!(matches!(result, Err(SwitchboardError::NoDeployments)));
    }

    #[test]
    fn rejects_duplicate_deployment_names() {
        let configs = vec![test_config("east", 0, 0), test_config("east", 0, 0)];
        let result =
            Switchboard::with_client_factory(configs, SwitchboardOptions::default(), stub_factory);
        assert!(matches!(
            result,
            Err(SwitchboardError::DuplicateDeployment(name)) if name == "east"
        ));
    }

    #[test]
    fn selection_skips_unhealthy_deployments() {
        let switchboard = stub_switchboard(&["east", "west"]);
        switchboard.deployment("east").unwrap().cooldown(None);

        for _ in 0..25 {
            let selected = switchboard.select_deployment(None).unwrap();
            assert_eq!(selected.name(), "west");
        }
    }

    #[test]
    fn selection_fails_when_everything_is_cooling_down() {
        let switchboard = stub_switchboard(&["east", "west"]);
        switchboard.deployment("east").unwrap().cooldown(None);
        switchboard.deployment("west").unwrap().cooldown(None);

        assert!(matches!(
            switchboard.select_deployment(None),
            Err(SwitchboardError::NoHealthyDeployment)
        ));
    }

    #[test]
    fn session_binding_sticks_while_healthy() {
        let switchboard = stub_switchboard(&["east", "west"]);
        let first = switchboard.select_deployment(Some("s-1")).unwrap();
        for _ in 0..10 {
            let again = switchboard.select_deployment(Some("s-1")).unwrap();
            assert_eq!(again.name(), first.name());
        }
        assert_eq!(switchboard.session_count(), 1);
    }

    #[test]
    fn session_rebinds_away_from_unhealthy_deployment() {
        let switchboard = stub_switchboard(&["east", "west"]);
        let first = switchboard.select_deployment(Some("s-1")).unwrap();
        first.cooldown(None);

        let second = switchboard.select_deployment(Some("s-1")).unwrap();
        assert_ne!(second.name(), first.name());

        // The rebind must stick.
        let third = switchboard.select_deployment(Some("s-1")).unwrap();
        assert_eq!(third.name(), second.name());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let switchboard = stub_switchboard(&["east"]);
        switchboard.start();
        switchboard.start();
        switchboard.stop().await;
        switchboard.stop().await;
    }
}
