//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::domain::channel::{
    AdapterRegistry, EmailAdapter, PushAdapter, SlackAdapter, SmsAdapter, TelegramAdapter,
};
use crate::domain::dispatch::{DispatchService, JobProcessor, WorkerPool};
use crate::domain::queue::JobQueue;
use crate::domain::retry::RetryPolicySet;
use crate::domain::store::NotificationStore;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn NotificationStore>,
    pub queue: Arc<dyn JobQueue>,
    pub adapters: Arc<AdapterRegistry>,
    /// Concrete push adapter for the multicast/topic admin operations
    pub push: Arc<PushAdapter>,
    pub dispatch: Arc<DispatchService>,
    pub worker_pool: Arc<WorkerPool>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        store: Arc<dyn NotificationStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.worker.adapter_timeout_seconds))
            .build()
            .expect("failed to build HTTP client");

        let push = Arc::new(PushAdapter::new(http.clone(), &settings.push));
        let adapters = Arc::new(
            AdapterRegistry::new()
                .register(Arc::new(EmailAdapter::new(&settings.smtp)))
                .register(Arc::new(SmsAdapter::new(http.clone(), settings.sms.clone())))
                .register(push.clone())
                .register(Arc::new(SlackAdapter::new(http.clone(), &settings.slack)))
                .register(Arc::new(TelegramAdapter::new(http, &settings.telegram))),
        );

        let policies = RetryPolicySet::default();
        let processor = Arc::new(JobProcessor::new(
            store.clone(),
            queue.clone(),
            adapters.clone(),
            policies.clone(),
            Duration::from_secs(settings.worker.adapter_timeout_seconds),
        ));
        let worker_pool = Arc::new(WorkerPool::new(
            queue.clone(),
            processor,
            settings.worker.clone(),
        ));
        let dispatch = Arc::new(DispatchService::new(
            store.clone(),
            queue.clone(),
            policies,
        ));

        Self {
            settings: Arc::new(settings),
            store,
            queue,
            adapters,
            push,
            dispatch,
            worker_pool,
        }
    }
}
