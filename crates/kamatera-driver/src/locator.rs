use std::collections::HashMap;

use kamatera_api::{KamateraClient, ServerSummary};
use tracing::debug;

use crate::retry::{Cancellation, RetryPolicy, with_retry};
use crate::{Error, Result};

/// Resolves logical server names to provider server ids. Resolved ids are
/// cached for the lifetime of the locator.
pub struct ServerLocator {
    client: KamateraClient,
    retry: RetryPolicy,
    ids: HashMap<String, String>,
}

impl ServerLocator {
    pub fn new(client: KamateraClient, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            ids: HashMap::new(),
        }
    }

    /// Seed the cache with an id learned elsewhere (e.g. persisted state).
    pub fn remember(&mut self, name: impl Into<String>, id: impl Into<String>) {
        self.ids.insert(name.into(), id.into());
    }

    pub fn cached(&self, name: &str) -> Option<&str> {
        self.ids.get(name).map(String::as_str)
    }

    pub async fn resolve_id(&mut self, name: &str, cancel: &Cancellation) -> Result<String> {
        if let Some(id) = self.ids.get(name) {
            return Ok(id.clone());
        }

        let servers = list_servers(&self.client, &self.retry, cancel).await?;
        let id = servers
            .into_iter()
            .find(|server| server.name == name)
            .map(|server| server.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;

        debug!(server = name, server_id = %id, "resolved kamatera server id");
        self.ids.insert(name.to_string(), id.clone());
        Ok(id)
    }
}

/// `GET /service/servers`, retrying transient failures.
pub async fn list_servers(
    client: &KamateraClient,
    retry: &RetryPolicy,
    cancel: &Cancellation,
) -> Result<Vec<ServerSummary>> {
    with_retry("list servers", retry, cancel, Error::is_transient, |_| async move {
        Ok(client.list_servers().await?)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use mockito::Server;
    use std::time::Duration;

    const SERVERS: &str = r#"[
        {"id": "a1", "datacenter": "EU", "name": "web-aaaaaa", "power": "on"},
        {"id": "b2", "datacenter": "EU", "name": "db-bbbbbb", "power": "off"}
    ]"#;

    fn locator(server: &Server) -> ServerLocator {
        ServerLocator::new(
            KamateraClient::new("id", "secret").with_base_url(server.url()),
            RetryPolicy::new(
                10,
                Backoff::Linear {
                    base: Duration::ZERO,
                    step: Duration::ZERO,
                },
            ),
        )
    }

    #[tokio::test]
    async fn resolves_by_exact_name_and_memoizes() {
        let mut server = Server::new_async().await;
        let list = server
            .mock("GET", "/service/servers")
            .with_status(200)
            .with_body(SERVERS)
            .expect(1)
            .create_async()
            .await;

        let mut locator = locator(&server);
        let cancel = Cancellation::none();
        assert_eq!(locator.resolve_id("db-bbbbbb", &cancel).await.unwrap(), "b2");
        assert_eq!(locator.resolve_id("db-bbbbbb", &cancel).await.unwrap(), "b2");
        assert_eq!(locator.cached("db-bbbbbb"), Some("b2"));
        list.assert_async().await;
    }

    #[tokio::test]
    async fn missing_name_is_server_not_found() {
        let mut server = Server::new_async().await;
        let _list = server
            .mock("GET", "/service/servers")
            .with_status(200)
            .with_body(SERVERS)
            .create_async()
            .await;

        let err = locator(&server)
            .resolve_id("web", &Cancellation::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServerNotFound(ref name) if name == "web"));
    }

    #[tokio::test]
    async fn transient_list_failures_are_retried() {
        let mut server = Server::new_async().await;
        let busy = server
            .mock("GET", "/service/servers")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;
        let _list = server
            .mock("GET", "/service/servers")
            .with_status(200)
            .with_body(SERVERS)
            .create_async()
            .await;

        let id = locator(&server)
            .resolve_id("web-aaaaaa", &Cancellation::none())
            .await
            .unwrap();
        busy.assert_async().await;
        assert_eq!(id, "a1");
    }

    #[tokio::test]
    async fn remembered_ids_skip_the_lookup() {
        let mut server = Server::new_async().await;
        let list = server
            .mock("GET", "/service/servers")
            .expect(0)
            .create_async()
            .await;

        let mut locator = locator(&server);
        locator.remember("web-aaaaaa", "a1");
        let id = locator
            .resolve_id("web-aaaaaa", &Cancellation::none())
            .await
            .unwrap();
        assert_eq!(id, "a1");
        list.assert_async().await;
    }
}
