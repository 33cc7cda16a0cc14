use event_hub::HubConfig;
use server_api::ApiContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    /// Batching and heartbeat tuning applied to every `/events` connection.
    pub(crate) hub_config: HubConfig,
}
