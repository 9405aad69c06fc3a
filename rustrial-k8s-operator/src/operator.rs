use std::{collections::BTreeMap, path::Path, sync::Arc};

use rustrial_k8s_operator_apis::{
    ConfigurationError, ControllerConfiguration, OperatorConfiguration,
};

use crate::{
    client::{ResourceClient, WatchProvider},
    controller::{Controller, ControllerHandle},
    errors::OperatorError,
    reconciler::Reconciler,
    resource::ManagedResource,
};

/// Resolves controller configurations by controller name.
#[derive(Clone, Debug, Default)]
pub struct ConfigurationService {
    configurations: BTreeMap<String, ControllerConfiguration>,
}

impl ConfigurationService {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, OperatorError> {
        let configuration = OperatorConfiguration::from_yaml(yaml)?;
        let mut service = Self::new();
        for controller in configuration.controllers {
            service.register(controller)?;
        }
        Ok(service)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OperatorError> {
        let path = path.as_ref();
        info!("Loading controller configurations from {}", path.display());
        Self::from_yaml(std::fs::read_to_string(path)?.as_str())
    }

    pub fn register(
        &mut self,
        configuration: ControllerConfiguration,
    ) -> Result<(), OperatorError> {
        configuration.validate()?;
        if self.configurations.contains_key(&configuration.name) {
            return Err(ConfigurationError::Duplicate(configuration.name).into());
        }
        self.configurations
            .insert(configuration.name.clone(), configuration);
        Ok(())
    }

    pub fn configuration_for(&self, controller: &str) -> Option<&ControllerConfiguration> {
        self.configurations.get(controller)
    }

    pub fn known_controller_names(&self) -> Vec<&str> {
        self.configurations.keys().map(|v| v.as_str()).collect()
    }
}

/// Registry of the controllers of one process.
pub struct Operator {
    configuration_service: ConfigurationService,
    controllers: Vec<ControllerHandle>,
}

impl Operator {
    pub fn new(configuration_service: ConfigurationService) -> Self {
        Self {
            configuration_service,
            controllers: Vec::new(),
        }
    }

    pub fn configuration_service(&self) -> &ConfigurationService {
        &self.configuration_service
    }

    /// Starts the pipeline of `reconciler`. An explicit `configuration` takes
    /// precedence over the one registered for the controller's name, if none
    /// resolves the controller is not started.
    pub fn register_controller<K, R, C>(
        &mut self,
        reconciler: R,
        client: Arc<C>,
        configuration: Option<ControllerConfiguration>,
    ) -> Result<Arc<Controller<K, R>>, OperatorError>
    where
        K: ManagedResource,
        K::DynamicType: Default,
        R: Reconciler<K>,
        C: WatchProvider<K> + ResourceClient<K> + 'static,
    {
        let name = reconciler.name();
        let configuration = match configuration {
            Some(configuration) => Some(configuration),
            None => self.configuration_service.configuration_for(&name).cloned(),
        };
        let Some(configuration) = configuration else {
            warn!(
                "Skipping registration of controller {} because its configuration cannot be found, known controllers are: {}",
                name,
                self.configuration_service.known_controller_names().join(",")
            );
            return Err(OperatorError::ConfigurationMissing(name));
        };
        let controller = Controller::start(reconciler, client, configuration)?;
        self.controllers.push(controller.clone().into());
        Ok(controller)
    }

    pub fn controllers(&self) -> &[ControllerHandle] {
        self.controllers.as_slice()
    }

    /// Stops all controllers in registration order.
    pub async fn stop(&mut self) {
        for controller in self.controllers.drain(..) {
            controller.stop().await;
        }
    }
}
