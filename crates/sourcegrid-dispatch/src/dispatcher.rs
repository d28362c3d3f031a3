//! The command dispatcher.
//!
//! Wraps a [`WorkerTransport`] with per-call timeouts, verb-aware retries
//! with exponential backoff, a global in-flight bound, and caller
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use sourcegrid_state::{InstanceKey, WorkerNode};

use crate::command::{Command, CommandReply, Verb};
use crate::error::{DispatchError, DispatchResult, TransportError};
use crate::transport::WorkerTransport;

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Upper bound on a single transport call.
    pub call_timeout: Duration,
    /// Retries after the first attempt for stop and status.
    pub max_idempotent_retries: u32,
    /// Retries after the first attempt for start and restart. Capped at 1.
    pub max_start_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Ceiling for the doubling backoff.
    pub max_backoff: Duration,
    /// Transport calls allowed in flight across all callers.
    pub max_in_flight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            max_idempotent_retries: 3,
            max_start_retries: 1,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            max_in_flight: 64,
        }
    }
}

/// One entry of a fan-out.
#[derive(Debug, Clone)]
pub struct DispatchTarget {
    pub node: WorkerNode,
    pub key: InstanceKey,
    pub command: Command,
}

/// Sends commands to workers. Cheap to clone; clones share the in-flight bound.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn WorkerTransport>,
    config: Arc<DispatchConfig>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn WorkerTransport>, config: DispatchConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            transport,
            config: Arc::new(config),
            permits,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn max_attempts(&self, verb: Verb) -> u32 {
        let retries = if verb.is_idempotent() {
            self.config.max_idempotent_retries
        } else {
            self.config.max_start_retries.min(1)
        };
        retries + 1
    }

    /// Send one command, retrying transient failures as the verb allows.
    ///
    /// A rejection is returned immediately. When `cancel` fires the call is
    /// abandoned and [`DispatchError::Cancelled`] is returned.
    pub async fn dispatch(
        &self,
        node: &WorkerNode,
        target: &InstanceKey,
        command: &Command,
        cancel: &CancellationToken,
    ) -> DispatchResult<CommandReply> {
        let verb = command.verb();
        let max_attempts = self.max_attempts(verb);
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(DispatchError::Cancelled { target: target.clone() });
                }
                outcome = self.attempt(node, target, command) => outcome,
            };

            match outcome {
                Ok(reply) => {
                    debug!(node = %node.id, %target, verb = verb.as_str(), attempt, "command delivered");
                    return Ok(reply);
                }
                Err(TransportError::Rejected(reason)) => {
                    warn!(node = %node.id, %target, verb = verb.as_str(), %reason, "command rejected");
                    return Err(DispatchError::Rejected {
                        node: node.id.clone(),
                        target: target.clone(),
                        reason,
                    });
                }
                Err(e) if attempt >= max_attempts => {
                    warn!(
                        node = %node.id,
                        %target,
                        verb = verb.as_str(),
                        attempts = attempt,
                        error = %e,
                        "worker unreachable"
                    );
                    return Err(DispatchError::Unreachable {
                        node: node.id.clone(),
                        target: target.clone(),
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    debug!(
                        node = %node.id,
                        %target,
                        verb = verb.as_str(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient dispatch failure, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(DispatchError::Cancelled { target: target.clone() });
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }

    async fn attempt(
        &self,
        node: &WorkerNode,
        target: &InstanceKey,
        command: &Command,
    ) -> Result<CommandReply, TransportError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Request("dispatcher closed".to_string()))?;

        match tokio::time::timeout(
            self.config.call_timeout,
            self.transport.send(node, target, command),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.config.call_timeout)),
        }
    }

    /// Dispatch to many targets concurrently.
    ///
    /// Results come back in input order. The in-flight bound still applies.
    pub async fn dispatch_all(
        &self,
        targets: Vec<DispatchTarget>,
        cancel: &CancellationToken,
    ) -> Vec<(InstanceKey, DispatchResult<CommandReply>)> {
        let mut slots: Vec<(InstanceKey, DispatchResult<CommandReply>)> = targets
            .iter()
            .map(|t| {
                (
                    t.key.clone(),
                    Err(DispatchError::Unreachable {
                        node: t.node.id.clone(),
                        target: t.key.clone(),
                        attempts: 0,
                    }),
                )
            })
            .collect();

        let mut set = JoinSet::new();
        for (idx, target) in targets.into_iter().enumerate() {
            let this = self.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let result = this
                    .dispatch(&target.node, &target.key, &target.command, &cancel)
                    .await;
                (idx, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx].1 = result,
                Err(e) => error!(error = %e, "dispatch task failed"),
            }
        }

        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use sourcegrid_state::{DefinitionId, ResourceLimits};

    use crate::command::StartPayload;

    /// Fails the first `failures` calls with the given error, then succeeds.
    struct Flaky {
        failures: u32,
        error: TransportError,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, error: TransportError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkerTransport for Flaky {
        async fn send(
            &self,
            _node: &WorkerNode,
            _target: &InstanceKey,
            _command: &Command,
        ) -> Result<CommandReply, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(CommandReply {
                    running: true,
                    ..Default::default()
                })
            }
        }
    }

    struct Hang;

    #[async_trait]
    impl WorkerTransport for Hang {
        async fn send(
            &self,
            _node: &WorkerNode,
            _target: &InstanceKey,
            _command: &Command,
        ) -> Result<CommandReply, TransportError> {
            std::future::pending::<()>().await;
            Err(TransportError::Request("unreachable".to_string()))
        }
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            call_timeout: Duration::from_millis(50),
            max_idempotent_retries: 3,
            max_start_retries: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_in_flight: 8,
        }
    }

    fn node() -> WorkerNode {
        WorkerNode::new("node-a", "127.0.0.1", 7000, ResourceLimits::new(4.0, 1 << 30, 1 << 30))
    }

    fn key(ordinal: u32) -> InstanceKey {
        InstanceKey::new(&DefinitionId::new("t1", "ns1", "src1"), ordinal)
    }

    fn start() -> Command {
        let def = sourcegrid_state::ConnectorDefinition::new(
            DefinitionId::new("t1", "ns1", "src1"),
            "com.example.Source",
            "builtin://kafka",
            "persistent://t1/ns1/out",
            1,
        );
        Command::Start(StartPayload::for_definition(&def))
    }

    #[tokio::test]
    async fn stop_retried_until_success() {
        let transport = Arc::new(Flaky::new(2, TransportError::Connect("refused".into())));
        let dispatcher = Dispatcher::new(transport.clone(), fast_config());

        let reply = dispatcher
            .dispatch(&node(), &key(0), &Command::Stop, &CancellationToken::new())
            .await
            .unwrap();
        assert!(reply.running);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn idempotent_verb_exhausts_retries() {
        let transport = Arc::new(Flaky::new(100, TransportError::Connect("refused".into())));
        let dispatcher = Dispatcher::new(transport.clone(), fast_config());

        let err = dispatcher
            .dispatch(&node(), &key(0), &Command::FetchStatus, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unreachable { attempts: 4, .. }));
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn start_retried_at_most_once() {
        let transport = Arc::new(Flaky::new(100, TransportError::Connect("refused".into())));
        let mut config = fast_config();
        config.max_start_retries = 5;
        let dispatcher = Dispatcher::new(transport.clone(), config);

        let err = dispatcher
            .dispatch(&node(), &key(0), &start(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unreachable { attempts: 2, .. }));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn rejection_not_retried() {
        let transport = Arc::new(Flaky::new(100, TransportError::Rejected("bad config".into())));
        let dispatcher = Dispatcher::new(transport.clone(), fast_config());

        let err = dispatcher
            .dispatch(&node(), &key(0), &Command::Stop, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DispatchError::Rejected { reason, .. } => assert_eq!(reason, "bad config"),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn hanging_worker_times_out() {
        let dispatcher = Dispatcher::new(Arc::new(Hang), fast_config());

        let err = dispatcher
            .dispatch(&node(), &key(0), &Command::FetchStatus, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn cancellation_abandons_call() {
        let mut config = fast_config();
        config.call_timeout = Duration::from_secs(30);
        let dispatcher = Dispatcher::new(Arc::new(Hang), config);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = dispatcher
            .dispatch(&node(), &key(0), &Command::Stop, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn dispatch_all_preserves_input_order() {
        let transport = Arc::new(Flaky::new(0, TransportError::Connect("unused".into())));
        let dispatcher = Dispatcher::new(transport, fast_config());

        let targets: Vec<DispatchTarget> = (0..5)
            .rev()
            .map(|ordinal| DispatchTarget {
                node: node(),
                key: key(ordinal),
                command: Command::FetchStatus,
            })
            .collect();

        let results = dispatcher
            .dispatch_all(targets, &CancellationToken::new())
            .await;
        let ordinals: Vec<u32> = results.iter().map(|(k, _)| k.ordinal).collect();
        assert_eq!(ordinals, vec![4, 3, 2, 1, 0]);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }
}
