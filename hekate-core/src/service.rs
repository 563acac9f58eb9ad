//! Service lifecycle kernel: dependency-ordered bring-up and shutdown.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::error::HekateError;

/// Collects the dependencies a service declares during configuration.
#[derive(Debug, Default)]
pub struct DependencyContext {
    dependencies: BTreeSet<&'static str>,
}

impl DependencyContext {
    /// Declares a dependency on another service by name.
    pub fn depends_on(&mut self, service: &'static str) {
        self.dependencies.insert(service);
    }
}

/// A managed service with ordered lifecycle hooks.
///
/// The kernel topologically orders services by their declared dependencies,
/// runs `pre_initialize → initialize → post_initialize` in that order on
/// bring-up and `terminate` in reverse on shutdown.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable service name used for dependency resolution.
    fn name(&self) -> &'static str;

    /// Declares dependencies; runs before any initialization.
    fn configure(&self, ctx: &mut DependencyContext) {
        let _ = ctx;
    }

    /// Early hook before dependencies are guaranteed usable.
    async fn pre_initialize(&self) -> Result<(), HekateError> {
        Ok(())
    }

    /// Brings the service up; dependencies are already initialized.
    async fn initialize(&self) -> Result<(), HekateError>;

    /// Late hook after every service initialized.
    async fn post_initialize(&self) -> Result<(), HekateError> {
        Ok(())
    }

    /// Shuts the service down; dependents are already terminated.
    async fn terminate(&self);
}

/// Dependency-ordered collection of services.
pub struct ServiceKernel {
    ordered: Vec<Arc<dyn Service>>,
}

impl ServiceKernel {
    /// Resolves the dependency graph; fails on unknown names or cycles.
    pub fn resolve(services: Vec<Arc<dyn Service>>) -> Result<Self, HekateError> {
        let mut dependencies: BTreeMap<&'static str, BTreeSet<&'static str>> = BTreeMap::new();
        let mut by_name: BTreeMap<&'static str, Arc<dyn Service>> = BTreeMap::new();

        for service in services {
            let mut ctx = DependencyContext::default();
            service.configure(&mut ctx);
            if by_name.insert(service.name(), Arc::clone(&service)).is_some() {
                return Err(ConfigError::DuplicateName {
                    kind: "service",
                    name: service.name().to_string(),
                }
                .into());
            }
            dependencies.insert(service.name(), ctx.dependencies);
        }

        for (name, deps) in &dependencies {
            for dep in deps {
                if !by_name.contains_key(dep) {
                    return Err(ConfigError::InvalidValue {
                        option: "services",
                        reason: format!("service '{name}' depends on unknown service '{dep}'"),
                    }
                    .into());
                }
            }
        }

        // Kahn's algorithm; the BTreeMap keeps the order deterministic.
        let mut ordered = Vec::with_capacity(by_name.len());
        let mut remaining = dependencies;
        while !remaining.is_empty() {
            let ready: Vec<&'static str> = remaining
                .iter()
                .filter(|(_, deps)| deps.iter().all(|dep| !remaining.contains_key(dep)))
                .map(|(name, _)| *name)
                .collect();
            if ready.is_empty() {
                return Err(ConfigError::InvalidValue {
                    option: "services",
                    reason: "service dependency cycle detected".to_string(),
                }
                .into());
            }
            for name in ready {
                remaining.remove(name);
                ordered.push(Arc::clone(&by_name[name]));
            }
        }

        Ok(Self { ordered })
    }

    /// Service names in initialization order.
    pub fn order(&self) -> Vec<&'static str> {
        self.ordered.iter().map(|service| service.name()).collect()
    }

    /// Runs the bring-up sequence; on failure already-initialized services
    /// are torn down in reverse.
    pub async fn initialize(&self) -> Result<(), HekateError> {
        for service in &self.ordered {
            service.pre_initialize().await?;
        }
        let mut brought_up = 0usize;
        for service in &self.ordered {
            debug!(service = service.name(), "initializing");
            if let Err(err) = service.initialize().await {
                warn!(service = service.name(), "initialization failed: {err}");
                for service in self.ordered[..brought_up].iter().rev() {
                    service.terminate().await;
                }
                return Err(err);
            }
            brought_up += 1;
        }
        for service in &self.ordered {
            service.post_initialize().await?;
        }
        Ok(())
    }

    /// Terminates every service in reverse initialization order.
    pub async fn terminate(&self) {
        for service in self.ordered.iter().rev() {
            debug!(service = service.name(), "terminating");
            service.terminate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        deps: Vec<&'static str>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Service for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn configure(&self, ctx: &mut DependencyContext) {
            for dep in &self.deps {
                ctx.depends_on(dep);
            }
        }

        async fn initialize(&self) -> Result<(), HekateError> {
            self.log.lock().push(format!("init:{}", self.name));
            Ok(())
        }

        async fn terminate(&self) {
            self.log.lock().push(format!("term:{}", self.name));
        }
    }

    fn recorder(
        name: &'static str,
        deps: Vec<&'static str>,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn Service> {
        Arc::new(Recorder {
            name,
            deps,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn initialization_respects_dependencies() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let kernel = ServiceKernel::resolve(vec![
            recorder("messaging", vec!["network", "cluster"], &log),
            recorder("cluster", vec!["network"], &log),
            recorder("network", vec![], &log),
        ])
        .unwrap();

        assert_eq!(kernel.order(), vec!["network", "cluster", "messaging"]);

        kernel.initialize().await.unwrap();
        kernel.terminate().await;
        assert_eq!(
            log.lock().as_slice(),
            &[
                "init:network",
                "init:cluster",
                "init:messaging",
                "term:messaging",
                "term:cluster",
                "term:network",
            ]
        );
    }

    #[tokio::test]
    async fn cycle_is_a_configuration_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let result = ServiceKernel::resolve(vec![
            recorder("a", vec!["b"], &log),
            recorder("b", vec!["a"], &log),
        ]);
        assert!(matches!(result, Err(HekateError::Config(_))));
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let result = ServiceKernel::resolve(vec![recorder("a", vec!["ghost"], &log)]);
        assert!(matches!(result, Err(HekateError::Config(_))));
    }

    #[tokio::test]
    async fn failed_initialize_rolls_back() {
        struct Failing {
            log: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl Service for Failing {
            fn name(&self) -> &'static str {
                "failing"
            }

            fn configure(&self, ctx: &mut DependencyContext) {
                ctx.depends_on("network");
            }

            async fn initialize(&self) -> Result<(), HekateError> {
                self.log.lock().push("init:failing".to_string());
                Err(HekateError::IllegalState {
                    component: "failing",
                    state: "TEST",
                })
            }

            async fn terminate(&self) {
                self.log.lock().push("term:failing".to_string());
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let kernel = ServiceKernel::resolve(vec![
            recorder("network", vec![], &log),
            Arc::new(Failing {
                log: Arc::clone(&log),
            }),
        ])
        .unwrap();

        assert!(kernel.initialize().await.is_err());
        // The failing service never came up, so only its dependency rolls
        // back.
        assert_eq!(
            log.lock().as_slice(),
            &["init:network", "init:failing", "term:network"]
        );
    }
}
