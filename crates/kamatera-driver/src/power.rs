use std::time::Duration;

use kamatera_api::{CommandId, KamateraClient, Power};
use tracing::{debug, info, warn};

use crate::command::CommandTracker;
use crate::locator::{ServerLocator, list_servers};
use crate::retry::{Cancellation, RetryPolicy, with_retry};
use crate::types::MachineState;
use crate::{Error, Result};

/// Power transitions and state queries for an existing server.
pub struct PowerController {
    client: KamateraClient,
    tracker: CommandTracker,
    retry: RetryPolicy,
    poll_interval: Duration,
    max_restarts: u32,
}

impl PowerController {
    pub fn new(
        client: KamateraClient,
        tracker: CommandTracker,
        retry: RetryPolicy,
        poll_interval: Duration,
        max_restarts: u32,
    ) -> Self {
        Self {
            client,
            tracker,
            retry,
            poll_interval,
            max_restarts,
        }
    }

    /// Switch the server named `server_name` to `power` and wait until the
    /// provider reports the command complete.
    ///
    /// A 500 while waiting resubmits the whole operation, at most
    /// `max_restarts` times.
    pub async fn set_power(
        &self,
        locator: &mut ServerLocator,
        server_name: &str,
        power: Power,
        cancel: &Cancellation,
    ) -> Result<()> {
        let server_id = locator.resolve_id(server_name, cancel).await?;
        info!(server = server_name, %server_id, %power, "starting power operation");

        let mut restarts = 0;
        loop {
            let command_id = self.submit(&server_id, power, cancel).await?;
            info!(%command_id, "waiting for power operation to complete");

            match self
                .tracker
                .wait_complete("power operation", command_id, self.poll_interval, cancel)
                .await
            {
                Ok(_) => {
                    info!(server = server_name, %power, "power operation completed");
                    return Ok(());
                }
                Err(e) if e.is_rejected() && restarts < self.max_restarts => {
                    restarts += 1;
                    warn!(
                        %command_id,
                        restart = restarts,
                        max_restarts = self.max_restarts,
                        error = %e,
                        "power operation rejected while waiting, resubmitting"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn submit(&self, server_id: &str, power: Power, cancel: &Cancellation) -> Result<CommandId> {
        let client = &self.client;
        with_retry("power operation", &self.retry, cancel, Error::is_transient, |attempt| async move {
            debug!(server_id, %power, attempt, "submitting power operation");
            Ok(client.set_power(server_id, power).await?)
        })
        .await
    }

    /// State of `server_name` as the orchestration tool sees it.
    ///
    /// Any lookup failure (no name yet, network error, unknown server)
    /// reports [`MachineState::Starting`]: callers poll this while a server
    /// boots and a missing entry usually means it is not listed yet.
    pub async fn get_state(&self, server_name: Option<&str>, cancel: &Cancellation) -> MachineState {
        let Some(name) = server_name else {
            return MachineState::Starting;
        };

        match list_servers(&self.client, &self.retry, cancel).await {
            Ok(servers) => match servers.iter().find(|s| s.name == name) {
                Some(server) => MachineState::from_power(&server.power),
                None => {
                    debug!(server = name, "server not listed yet");
                    MachineState::Starting
                }
            },
            Err(e) => {
                debug!(server = name, error = %e, "state lookup failed, assuming starting");
                MachineState::Starting
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use kamatera_api::StatusCode;
    use mockito::{Matcher, Server};

    const SERVERS: &str = r#"[{"id": "srv-1", "datacenter": "EU", "name": "web-aaaaaa", "power": "off"}]"#;

    fn no_wait(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Backoff::Linear {
                base: Duration::ZERO,
                step: Duration::ZERO,
            },
        )
    }

    fn setup(server: &Server) -> (PowerController, ServerLocator) {
        let client = KamateraClient::new("id", "secret").with_base_url(server.url());
        let power = PowerController::new(
            client.clone(),
            CommandTracker::new(client.clone(), 10),
            no_wait(10),
            Duration::ZERO,
            3,
        );
        let mut locator = ServerLocator::new(client, no_wait(10));
        locator.remember("web-aaaaaa", "srv-1");
        (power, locator)
    }

    #[tokio::test]
    async fn power_on_waits_for_completion() {
        let mut server = Server::new_async().await;
        let put = server
            .mock("PUT", "/service/server/srv-1/power")
            .match_body(Matcher::UrlEncoded("power".into(), "on".into()))
            .with_status(200)
            .with_body("31")
            .expect(1)
            .create_async()
            .await;
        let queue = server
            .mock("GET", "/service/queue/31")
            .with_status(200)
            .with_body(r#"{"status":"complete"}"#)
            .expect(1)
            .create_async()
            .await;

        let (power, mut locator) = setup(&server);
        power
            .set_power(&mut locator, "web-aaaaaa", Power::On, &Cancellation::none())
            .await
            .unwrap();
        put.assert_async().await;
        queue.assert_async().await;
    }

    #[tokio::test]
    async fn transient_status_retried_to_the_cap() {
        let mut server = Server::new_async().await;
        let put = server
            .mock("PUT", "/service/server/srv-1/power")
            .with_status(503)
            .with_body("try later")
            .expect(10)
            .create_async()
            .await;

        let (power, mut locator) = setup(&server);
        let err = power
            .set_power(&mut locator, "web-aaaaaa", Power::Off, &Cancellation::none())
            .await
            .unwrap_err();

        put.assert_async().await;
        assert!(matches!(err, Error::RetriesExhausted { attempts: 10, .. }));
        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn not_found_fails_without_retrying() {
        let mut server = Server::new_async().await;
        let put = server
            .mock("PUT", "/service/server/srv-1/power")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let (power, mut locator) = setup(&server);
        let err = power
            .set_power(&mut locator, "web-aaaaaa", Power::Restart, &Cancellation::none())
            .await
            .unwrap_err();

        put.assert_async().await;
        assert!(matches!(err, Error::Api(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn rejection_while_waiting_resubmits_a_bounded_number_of_times() {
        let mut server = Server::new_async().await;
        let put = server
            .mock("PUT", "/service/server/srv-1/power")
            .with_status(200)
            .with_body("40")
            .expect(4)
            .create_async()
            .await;
        let queue = server
            .mock("GET", "/service/queue/40")
            .with_status(500)
            .with_body("backend failure")
            .expect(4)
            .create_async()
            .await;

        let (power, mut locator) = setup(&server);
        let err = power
            .set_power(&mut locator, "web-aaaaaa", Power::On, &Cancellation::none())
            .await
            .unwrap_err();

        put.assert_async().await;
        queue.assert_async().await;
        assert!(err.is_rejected());
        assert!(err.to_string().contains("backend failure"));
    }

    #[tokio::test]
    async fn resubmission_recovers_after_one_rejection() {
        let mut server = Server::new_async().await;
        let _put = server
            .mock("PUT", "/service/server/srv-1/power")
            .with_status(200)
            .with_body("41")
            .expect(2)
            .create_async()
            .await;
        let _rejected = server
            .mock("GET", "/service/queue/41")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;
        let _done = server
            .mock("GET", "/service/queue/41")
            .with_status(200)
            .with_body(r#"{"status":"complete"}"#)
            .create_async()
            .await;

        let (power, mut locator) = setup(&server);
        power
            .set_power(&mut locator, "web-aaaaaa", Power::On, &Cancellation::none())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn state_maps_power_and_swallows_failures() {
        let mut server = Server::new_async().await;
        let (power, _) = setup(&server);
        let cancel = Cancellation::none();

        assert_eq!(power.get_state(None, &cancel).await, MachineState::Starting);

        let list = server
            .mock("GET", "/service/servers")
            .with_status(200)
            .with_body(SERVERS)
            .create_async()
            .await;
        assert_eq!(
            power.get_state(Some("web-aaaaaa"), &cancel).await,
            MachineState::Stopped
        );
        assert_eq!(
            power.get_state(Some("web-zzzzzz"), &cancel).await,
            MachineState::Starting
        );
        list.remove_async().await;

        let _broken = server
            .mock("GET", "/service/servers")
            .with_status(404)
            .create_async()
            .await;
        assert_eq!(
            power.get_state(Some("web-aaaaaa"), &cancel).await,
            MachineState::Starting
        );
    }
}
