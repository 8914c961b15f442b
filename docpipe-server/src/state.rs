use std::{sync::Arc, time::Duration};

use docpipe::{
    ingress::{WebhookIngress, WorkerSecret},
    notifier::Notifier,
    progress::ProgressStream,
    queue::Dispatcher,
    store::JobStore,
};

use crate::auth::JwtVerifier;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub dispatcher: Dispatcher,
    pub ingress: WebhookIngress,
    pub jwt: JwtVerifier,
    pub worker_secret: WorkerSecret,
    pub stream_interval: Duration,
    pub expose_internal_errors: bool,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Dispatcher,
        jwt: JwtVerifier,
        worker_secret: WorkerSecret,
    ) -> Self {
        Self {
            ingress: WebhookIngress::new(store.clone(), dispatcher.clone()),
            store,
            dispatcher,
            jwt,
            worker_secret,
            stream_interval: ProgressStream::DEFAULT_INTERVAL,
            expose_internal_errors: false,
        }
    }

    pub fn with_notifier(self, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            ingress: self.ingress.with_notifier(notifier),
            ..self
        }
    }

    pub fn with_stream_interval(self, stream_interval: Duration) -> Self {
        Self {
            stream_interval,
            ..self
        }
    }

    pub fn expose_internal_errors(self, expose_internal_errors: bool) -> Self {
        Self {
            expose_internal_errors,
            ..self
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("dispatcher", &self.dispatcher)
            .field("jwt", &self.jwt)
            .field("stream_interval", &self.stream_interval)
            .field("expose_internal_errors", &self.expose_internal_errors)
            .finish_non_exhaustive()
    }
}
