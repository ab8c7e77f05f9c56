/// Source of the three settings the proxy needs before it can connect.
///
/// Values are read when [`crate::RelayExecutor::connect`] is called, so a front-end may change
/// them between connections.
pub trait OptionsProvider: Send + Sync {
    /// Gateway URL including the prefix, e.g. `https://gateway.example.com/portunnel`.
    fn host_url(&self) -> String;
    /// Shared secret presented to the host.
    fn host_api_key(&self) -> String;
    /// Base URL of the local service requests are relayed to.
    fn target_service_url(&self) -> String;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host_url: String,
    pub host_api_key: String,
    pub target_service_url: String,
}

impl OptionsProvider for ConnectionOptions {
    fn host_url(&self) -> String {
        self.host_url.clone()
    }

    fn host_api_key(&self) -> String {
        self.host_api_key.clone()
    }

    fn target_service_url(&self) -> String {
        self.target_service_url.clone()
    }
}
