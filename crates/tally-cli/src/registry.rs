//! Type-keyed service lookup threaded through every invocation.
//!
//! The registry replaces ambient globals: a function implementation asks
//! the envelope's registry for the capability it needs and supplies a
//! default when nothing is registered. The registry performs no locking;
//! everything stored in it must be `Send + Sync`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::connector::ConnectorContext;
use crate::services::{
    ClockService, DefaultRandom, Locale, RandomService, SystemClock, TimeZoneInfo,
};

#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.len())
            .finish()
    }
}

impl ServiceRegistry {
    /// An empty registry. Typed accessors fall back to defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding one instance of each default service, so every
    /// evaluation using it shares the same random source.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.insert::<Arc<dyn ClockService>>(Arc::new(SystemClock));
        reg.insert::<Arc<dyn RandomService>>(Arc::new(DefaultRandom::new()));
        reg.insert(Locale::default());
        reg.insert(TimeZoneInfo::utc());
        reg
    }

    /// Register `service` under its own type, replacing any previous one.
    ///
    /// Trait-object services are registered as `Arc<dyn Trait>`.
    pub fn insert<T: Any + Send + Sync>(&mut self, service: T) -> &mut Self {
        self.services.insert(TypeId::of::<T>(), Arc::new(service));
        self
    }

    /// Builder form of `insert`.
    pub fn with<T: Any + Send + Sync>(mut self, service: T) -> Self {
        self.insert(service);
        self
    }

    /// Look up a service by type. Absence is not an error.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.services
            .get(&TypeId::of::<T>())
            .and_then(|s| s.as_ref().downcast_ref::<T>())
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<T>())
    }

    pub fn clock(&self) -> Arc<dyn ClockService> {
        self.get::<Arc<dyn ClockService>>()
            .cloned()
            .unwrap_or_else(|| Arc::new(SystemClock))
    }

    pub fn random(&self) -> Arc<dyn RandomService> {
        self.get::<Arc<dyn RandomService>>()
            .cloned()
            .unwrap_or_else(|| Arc::new(DefaultRandom::new()))
    }

    pub fn locale(&self) -> Locale {
        self.get::<Locale>().cloned().unwrap_or_default()
    }

    pub fn timezone(&self) -> TimeZoneInfo {
        self.get::<TimeZoneInfo>().copied().unwrap_or_default()
    }

    /// Connector context, if this evaluation can reach external functions.
    pub fn connector(&self) -> Option<Arc<dyn ConnectorContext>> {
        self.get::<Arc<dyn ConnectorContext>>().cloned()
    }
}
