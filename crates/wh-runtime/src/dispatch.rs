//! Name-keyed dispatch for `Receptor` and `PerspectiveApplier`
//! implementations.
//!
//! `wh_ports::Receptor`/`PerspectiveApplier` use `-> impl Future + Send`
//! return types (matching the teacher's own `EventStore` trait shape in
//! `sr-ports`), which makes them ergonomic to implement but not
//! object-safe — `dyn Receptor` does not compile. A worker that must
//! route a claimed item to one of many named handlers therefore cannot
//! hold a `Vec<Box<dyn Receptor>>`. Instead each handler is wrapped in a
//! boxed closure returning a boxed future, and the registries below key
//! those closures by name, the same shape `tower`/`axum` use internally
//! to erase handler types behind `BoxFuture`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use wh_ports::{PerspectiveEffect, PerspectiveError, ReceptorOutcome};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type ReceptorFn =
    Arc<dyn Fn(String, serde_json::Value) -> BoxFuture<'static, ReceptorOutcome> + Send + Sync>;

type ApplierFn = Arc<
    dyn Fn(String, String, serde_json::Value) -> BoxFuture<'static, Result<PerspectiveEffect, PerspectiveError>>
        + Send
        + Sync,
>;

/// Maps inbox `handler_name` to the receptor that should process it.
#[derive(Clone, Default)]
pub struct ReceptorRegistry {
    handlers: HashMap<String, ReceptorFn>,
}

impl ReceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `receptor` under `name`, adapting its RPITIT `handle`
    /// method into a boxed future so it can live in the map.
    pub fn register<R>(&mut self, name: impl Into<String>, receptor: R)
    where
        R: wh_ports::Receptor + 'static,
    {
        let receptor = Arc::new(receptor);
        let entry: ReceptorFn = Arc::new(move |envelope_type, envelope_data| {
            let receptor = receptor.clone();
            Box::pin(async move { receptor.handle(&envelope_type, &envelope_data).await })
        });
        self.handlers.insert(name.into(), entry);
    }

    pub async fn dispatch(
        &self,
        handler_name: &str,
        envelope_type: &str,
        envelope_data: &serde_json::Value,
    ) -> ReceptorOutcome {
        match self.handlers.get(handler_name) {
            Some(handler) => handler(envelope_type.to_string(), envelope_data.clone()).await,
            None => ReceptorOutcome::Failed {
                error_kind: "no_handler".to_string(),
                message: format!("no receptor registered for handler_name {handler_name}"),
            },
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

/// Maps `perspective_name` to the applier that should advance it.
#[derive(Clone, Default)]
pub struct ApplierRegistry {
    appliers: HashMap<String, ApplierFn>,
}

impl ApplierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A>(&mut self, name: impl Into<String>, applier: A)
    where
        A: wh_ports::PerspectiveApplier + 'static,
    {
        let applier = Arc::new(applier);
        let entry: ApplierFn = Arc::new(move |stream_id, event_type, event_data| {
            let applier = applier.clone();
            Box::pin(async move { applier.apply(&stream_id, &event_type, &event_data).await })
        });
        self.appliers.insert(name.into(), entry);
    }

    pub async fn dispatch(
        &self,
        perspective_name: &str,
        stream_id: &str,
        event_type: &str,
        event_data: &serde_json::Value,
    ) -> Result<PerspectiveEffect, PerspectiveError> {
        match self.appliers.get(perspective_name) {
            Some(applier) => {
                applier(
                    stream_id.to_string(),
                    event_type.to_string(),
                    event_data.clone(),
                )
                .await
            }
            None => Err(PerspectiveError::NoApplier {
                perspective_name: perspective_name.to_string(),
            }),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.appliers.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoReceptor;

    impl wh_ports::Receptor for EchoReceptor {
        async fn handle(
            &self,
            _envelope_type: &str,
            envelope_data: &serde_json::Value,
        ) -> ReceptorOutcome {
            ReceptorOutcome::Ok(envelope_data.clone())
        }
    }

    struct NoopApplier;

    impl wh_ports::PerspectiveApplier for NoopApplier {
        async fn apply(
            &self,
            _stream_id: &str,
            _event_type: &str,
            _event_data: &serde_json::Value,
        ) -> Result<PerspectiveEffect, PerspectiveError> {
            Ok(PerspectiveEffect::None)
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_the_registered_handler() {
        let mut registry = ReceptorRegistry::new();
        registry.register("orders.created", EchoReceptor);

        let outcome = registry
            .dispatch("orders.created", "OrderCreated", &serde_json::json!({"id": 1}))
            .await;

        assert!(matches!(outcome, ReceptorOutcome::Ok(v) if v == serde_json::json!({"id": 1})));
    }

    #[tokio::test]
    async fn dispatch_with_unknown_handler_name_fails_without_panicking() {
        let registry = ReceptorRegistry::new();
        let outcome = registry
            .dispatch("missing", "X", &serde_json::json!({}))
            .await;
        assert!(matches!(outcome, ReceptorOutcome::Failed { error_kind, .. } if error_kind == "no_handler"));
    }

    #[tokio::test]
    async fn applier_registry_dispatches_by_name() {
        let mut registry = ApplierRegistry::new();
        registry.register("order_summary", NoopApplier);
        assert!(registry.contains("order_summary"));

        let effect = registry
            .dispatch("order_summary", "stream-1", "OrderCreated", &serde_json::json!({}))
            .await
            .unwrap();
        assert!(matches!(effect, PerspectiveEffect::None));
    }

    #[tokio::test]
    async fn applier_registry_unknown_name_returns_no_applier_error() {
        let registry = ApplierRegistry::new();
        let err = registry
            .dispatch("missing", "stream-1", "X", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PerspectiveError::NoApplier { .. }));
    }
}
