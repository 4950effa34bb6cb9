use std::time::Duration;

use kamatera_api::{CommandId, CommandInfo, CommandStatus, KamateraClient};
use tracing::{debug, info, warn};

use crate::retry::Cancellation;
use crate::{Error, Result};

/// Polls the provider's command queue until a command reaches a terminal
/// status. Shared by server creation and power operations.
#[derive(Clone)]
pub struct CommandTracker {
    client: KamateraClient,
    max_transient_polls: u32,
}

impl CommandTracker {
    pub fn new(client: KamateraClient, max_transient_polls: u32) -> Self {
        Self {
            client,
            max_transient_polls,
        }
    }

    /// Wait for `command_id`, sleeping `poll_interval` before every poll.
    ///
    /// - 404: the queue has not registered the command yet, keep polling.
    /// - 500: fatal, the provider's message is returned as is.
    /// - other non-200 or transport failure: retried, up to
    ///   `max_transient_polls` in a row.
    /// - 200: `is_done` returns the record (its `log` holds the output),
    ///   `is_fatal` fails with [`Error::CommandFailed`], anything else
    ///   keeps polling.
    pub async fn wait(
        &self,
        operation: &'static str,
        command_id: CommandId,
        poll_interval: Duration,
        cancel: &Cancellation,
        is_fatal: impl Fn(&CommandStatus) -> bool,
        is_done: impl Fn(&CommandStatus) -> bool,
    ) -> Result<CommandInfo> {
        let mut transient_failures = 0;
        loop {
            cancel.sleep(operation, poll_interval).await?;

            let info = match self.client.command_info(command_id).await {
                Ok(info) => info,
                Err(e) if e.is_not_found() => {
                    info!(%command_id, "waiting for command to start");
                    continue;
                }
                Err(e) if e.is_transient() => {
                    transient_failures += 1;
                    if transient_failures >= self.max_transient_polls {
                        return Err(Error::RetriesExhausted {
                            operation,
                            attempts: transient_failures,
                            last: Box::new(e.into()),
                        });
                    }
                    warn!(
                        %command_id,
                        attempt = transient_failures,
                        error = %e,
                        "command status poll failed, retrying"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            transient_failures = 0;

            let status = info.command_status();
            debug!(%command_id, %status, "command status");

            if is_done(&status) {
                return Ok(info);
            }
            if is_fatal(&status) {
                return Err(Error::CommandFailed {
                    operation,
                    command_id,
                    status: status.to_string(),
                    description: if info.description.is_empty() {
                        info.log
                    } else {
                        info.description
                    },
                });
            }
        }
    }

    /// The usual predicates: `complete` finishes, `error` and `cancelled` fail.
    pub async fn wait_complete(
        &self,
        operation: &'static str,
        command_id: CommandId,
        poll_interval: Duration,
        cancel: &Cancellation,
    ) -> Result<CommandInfo> {
        self.wait(
            operation,
            command_id,
            poll_interval,
            cancel,
            |s| matches!(s, CommandStatus::Error | CommandStatus::Cancelled),
            |s| *s == CommandStatus::Complete,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn tracker(server: &Server) -> CommandTracker {
        CommandTracker::new(
            KamateraClient::new("id", "secret").with_base_url(server.url()),
            3,
        )
    }

    #[tokio::test]
    async fn not_found_means_not_ready_yet() {
        let mut server = Server::new_async().await;
        // A mock still owed hits is served first, so three 404s precede the record.
        let not_yet = server
            .mock("GET", "/service/queue/42")
            .with_status(404)
            .expect(3)
            .create_async()
            .await;
        let done = server
            .mock("GET", "/service/queue/42")
            .with_status(200)
            .with_body(r#"{"status":"complete","log":"Server ready at 203.0.113.42 (eth0)"}"#)
            .expect(1)
            .create_async()
            .await;

        let info = tracker(&server)
            .wait_complete("create server", CommandId(42), Duration::ZERO, &Cancellation::none())
            .await
            .unwrap();

        not_yet.assert_async().await;
        done.assert_async().await;
        assert_eq!(info.log, "Server ready at 203.0.113.42 (eth0)");
    }

    #[tokio::test]
    async fn pending_keeps_polling() {
        let mut server = Server::new_async().await;
        let pending = server
            .mock("GET", "/service/queue/43")
            .with_status(200)
            .with_body(r#"{"status":"pending"}"#)
            .expect(2)
            .create_async()
            .await;
        let _done = server
            .mock("GET", "/service/queue/43")
            .with_status(200)
            .with_body(r#"{"status":"complete","log":"ok"}"#)
            .create_async()
            .await;

        let info = tracker(&server)
            .wait_complete("create server", CommandId(43), Duration::ZERO, &Cancellation::none())
            .await
            .unwrap();
        pending.assert_async().await;
        assert_eq!(info.log, "ok");
    }

    #[tokio::test]
    async fn error_status_is_fatal_immediately() {
        let mut server = Server::new_async().await;
        let failed = server
            .mock("GET", "/service/queue/7")
            .with_status(200)
            .with_body(r#"{"status":"error","description":"out of capacity"}"#)
            .expect(1)
            .create_async()
            .await;

        let err = tracker(&server)
            .wait_complete("power operation", CommandId(7), Duration::ZERO, &Cancellation::none())
            .await
            .unwrap_err();

        failed.assert_async().await;
        match err {
            Error::CommandFailed {
                command_id,
                status,
                description,
                ..
            } => {
                assert_eq!(command_id, CommandId(7));
                assert_eq!(status, "error");
                assert_eq!(description, "out of capacity");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_status_is_fatal() {
        let mut server = Server::new_async().await;
        let _cancelled = server
            .mock("GET", "/service/queue/8")
            .with_status(200)
            .with_body(r#"{"status":"cancelled"}"#)
            .create_async()
            .await;

        let err = tracker(&server)
            .wait_complete("create server", CommandId(8), Duration::ZERO, &Cancellation::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { ref status, .. } if status == "cancelled"));
    }

    #[tokio::test]
    async fn server_error_is_fatal() {
        let mut server = Server::new_async().await;
        let rejected = server
            .mock("GET", "/service/queue/9")
            .with_status(500)
            .with_body("queue unavailable")
            .expect(1)
            .create_async()
            .await;

        let err = tracker(&server)
            .wait_complete("create server", CommandId(9), Duration::ZERO, &Cancellation::none())
            .await
            .unwrap_err();
        rejected.assert_async().await;
        assert!(err.is_rejected());
    }

    #[tokio::test]
    async fn transient_statuses_are_capped() {
        let mut server = Server::new_async().await;
        let busy = server
            .mock("GET", "/service/queue/10")
            .with_status(502)
            .expect(3)
            .create_async()
            .await;

        let err = tracker(&server)
            .wait_complete("create server", CommandId(10), Duration::ZERO, &Cancellation::none())
            .await
            .unwrap_err();
        busy.assert_async().await;
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.status(), Some(kamatera_api::StatusCode::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let server = Server::new_async().await;
        let (tx, rx) = tokio::sync::watch::channel(true);
        let cancel = Cancellation::none().with_shutdown(rx);

        let err = tracker(&server)
            .wait_complete("create server", CommandId(11), Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        drop(tx);
        assert!(matches!(err, Error::Cancelled { .. }));
    }
}
