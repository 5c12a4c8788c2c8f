use std::{
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use tokio::sync::broadcast;

use super::{
    description::server::ServerDescription,
    topology::TopologyCheckRequestReceiver,
    TopologyUpdater,
    TopologyWatcher,
};
use crate::{
    cmap::{
        establish::handshake::{Handshaker, HandshakerOptions},
        Connection,
    },
    error::{Error, Result},
    event::sdam::{
        SdamEvent,
        SdamEventEmitter,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, run_hello, AwaitableHelloOptions, HelloReply},
    metrics::TopologyMetrics,
    options::{ClientOptions, ServerAddress},
    runtime,
    sdam::TopologyVersion,
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// The minimum amount of time a monitor waits between checks of the same server.
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// The smoothing factor of the round-trip-time exponentially weighted moving average.
const RTT_SMOOTHING_FACTOR: f64 = 0.2;

/// Monitor that performs regular heartbeats to determine server status.
///
/// A monitor issues one of three probe variants: a plain polling hello, an awaitable hello
/// carrying the last seen `topologyVersion` (which the server holds open until its view
/// changes), or a direct read of an already-streaming exhaust response when the previous
/// reply had `moreToCome` set.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    handshaker: Handshaker,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    event_emitter: Option<SdamEventEmitter>,
    update_request_receiver: TopologyCheckRequestReceiver,
    cancellation_receiver: broadcast::Receiver<()>,
    metrics: Arc<TopologyMetrics>,
    client_options: ClientOptions,

    /// The `topologyVersion` from the most recent successful reply, if the server reported
    /// one. Its presence switches this monitor into awaitable mode.
    topology_version: Option<TopologyVersion>,

    /// The RTT statistic shared with this monitor's RTT monitor sibling.
    round_trip_time: Arc<RoundTripTimeTracker>,

    /// Whether the RTT monitor sibling has been spawned yet. It is only needed once the
    /// monitor enters awaitable mode, since awaitable probes suspend on the server and would
    /// skew the estimate.
    rtt_monitor_running: bool,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        event_emitter: Option<SdamEventEmitter>,
        update_request_receiver: TopologyCheckRequestReceiver,
        cancellation_receiver: broadcast::Receiver<()>,
        metrics: Arc<TopologyMetrics>,
        client_options: ClientOptions,
    ) {
        let handshaker = match Handshaker::new(HandshakerOptions::from(&client_options)) {
            Ok(handshaker) => handshaker,
            // The options were validated at client construction; this can only fail then.
            Err(_) => return,
        };

        let monitor = Self {
            address,
            client_options,
            handshaker,
            topology_updater,
            topology_watcher,
            event_emitter,
            update_request_receiver,
            cancellation_receiver,
            metrics,
            connection: None,
            topology_version: None,
            round_trip_time: Arc::new(RoundTripTimeTracker::new()),
            rtt_monitor_running: false,
        };
        runtime::spawn(monitor.execute());
    }

    fn is_alive(&self) -> bool {
        self.topology_watcher.is_alive() && self.topology_watcher.server_exists(&self.address)
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self
            .client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);

        while self.is_alive() {
            self.check_server().await;

            // In awaitable mode the next hello is issued immediately; the server itself
            // paces replies by holding the request until its view changes or
            // maxAwaitTimeMS elapses.
            if self.topology_version.is_some() && self.connection.is_some() && self.is_alive() {
                continue;
            }

            #[cfg(test)]
            let min_frequency = self
                .client_options
                .test_options
                .as_ref()
                .and_then(|to| to.min_heartbeat_freq)
                .unwrap_or(MIN_HEARTBEAT_FREQUENCY);

            #[cfg(not(test))]
            let min_frequency = MIN_HEARTBEAT_FREQUENCY;

            runtime::delay_for(min_frequency).await;
            self.update_request_receiver
                .wait_for_check_request(heartbeat_frequency.saturating_sub(min_frequency))
                .await;
        }
    }

    /// Checks the server by running a hello command, publishing the resulting description to
    /// the topology. If an I/O error occurs, the connection will be replaced with a new one.
    ///
    /// Returns true if the topology has changed and false otherwise.
    async fn check_server(&mut self) -> bool {
        self.update_request_receiver.clear_check_requests();
        let mut retried = false;
        let check_result = match self.perform_hello().await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let previous_description =
                    self.topology_watcher.server_description(&self.address);
                if e.is_network_error()
                    && !matches!(*e.kind, crate::error::ErrorKind::Cancelled { .. })
                    && previous_description
                        .map(|sd| sd.is_available())
                        .unwrap_or(false)
                {
                    self.handle_error(e).await;
                    retried = true;
                    self.perform_hello().await
                } else {
                    Err(e)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                self.topology_version = reply.command_response.topology_version;

                if self.topology_version.is_some() && !self.rtt_monitor_running {
                    RttMonitor::start(
                        self.address.clone(),
                        self.topology_watcher.clone(),
                        self.round_trip_time.clone(),
                        self.handshaker.clone(),
                        self.client_options.clone(),
                    );
                    self.rtt_monitor_running = true;
                }

                let average_rtt = self
                    .round_trip_time
                    .average()
                    .unwrap_or(Duration::from_millis(0));
                let server_description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    average_rtt,
                );
                self.topology_updater.update(server_description).await
            }
            Err(e) => self.handle_error(e).await || retried,
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        self.metrics.increment_heartbeats_started();

        let streaming = self
            .connection
            .as_ref()
            .map(|conn| conn.is_streaming())
            .unwrap_or(false);
        let awaited = self.topology_version.is_some() && self.connection.is_some();

        self.emit_event(|| {
            SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                awaited,
            })
        })
        .await;

        let heartbeat_frequency = self
            .client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);
        let connect_timeout = self
            .client_options
            .connect_timeout
            .unwrap_or(crate::runtime::DEFAULT_CONNECT_TIMEOUT);

        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) => {
                if streaming {
                    // The previous reply had moreToCome set; the next reply arrives without
                    // another request.
                    conn.set_socket_timeout(Some(heartbeat_frequency + connect_timeout));
                    let response = tokio::select! {
                        response = conn.receive_message() => response,
                        _ = self.cancellation_receiver.recv() => {
                            Err(Error::cancelled("monitor check interrupted"))
                        }
                    };
                    response.and_then(|r| r.into_hello_reply())
                } else {
                    let hello_ok = conn.stream_description()?.hello_ok;
                    let command = match self.topology_version {
                        Some(topology_version) => {
                            // Awaitable hello: the server holds the request until its view
                            // of the topology changes or maxAwaitTimeMS elapses.
                            conn.set_socket_timeout(Some(heartbeat_frequency + connect_timeout));
                            hello_command(
                                self.client_options.load_balanced,
                                Some(hello_ok),
                                Some(AwaitableHelloOptions {
                                    topology_version,
                                    max_await_time: heartbeat_frequency,
                                }),
                            )
                        }
                        None => {
                            conn.set_socket_timeout(Some(connect_timeout));
                            let mut command = hello_command(
                                self.client_options.load_balanced,
                                Some(hello_ok),
                                None,
                            );
                            if let Some(cluster_time) = self
                                .topology_watcher
                                .peek_latest()
                                .description
                                .cluster_time()
                            {
                                command.set_cluster_time(cluster_time);
                            }
                            command
                        }
                    };

                    let awaitable = self.topology_version.is_some();
                    let response = tokio::select! {
                        response = run_hello(conn, command) => response,
                        _ = self.cancellation_receiver.recv(), if awaitable => {
                            Err(Error::cancelled("monitor check interrupted"))
                        }
                    };

                    // Only polling round trips measure RTT; awaitable replies are paced by
                    // the server.
                    if !awaitable && response.is_ok() {
                        self.round_trip_time.add_sample(start.elapsed());
                    }

                    response
                }
            }
            None => {
                let mut connection = Connection::connect_monitoring(
                    self.address.clone(),
                    self.client_options.connect_timeout,
                    self.client_options.tls_options(),
                )
                .await?;

                let res = self.handshaker.handshake(&mut connection).await;
                if res.is_ok() {
                    self.round_trip_time.add_sample(start.elapsed());
                }

                self.connection = Some(connection);
                res
            }
        };
        let duration = start.elapsed();

        match result {
            Ok(ref reply) => {
                self.metrics.increment_heartbeats_succeeded();
                self.emit_event(|| {
                    SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                        duration,
                        reply: reply.raw_command_response.clone(),
                        server_address: self.address.clone(),
                        awaited,
                    })
                })
                .await;
            }
            Err(ref e) => {
                self.metrics.increment_heartbeats_failed();
                self.connection.take();
                self.emit_event(|| {
                    SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                        duration,
                        failure: e.clone(),
                        server_address: self.address.clone(),
                        awaited,
                    })
                })
                .await;
            }
        }

        result
    }

    async fn handle_error(&mut self, error: Error) -> bool {
        self.topology_version = None;
        self.connection.take();
        self.round_trip_time.reset();
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error)
            .await
    }

    async fn emit_event<F>(&self, event: F)
    where
        F: FnOnce() -> SdamEvent,
    {
        if let Some(ref emitter) = self.event_emitter {
            emitter.emit(event()).await
        }
    }
}

/// A monitor's sibling task that keeps the round-trip-time statistic fresh with short polling
/// hellos on a dedicated stream while the monitor itself is suspended in awaitable hellos.
struct RttMonitor {
    address: ServerAddress,
    topology_watcher: TopologyWatcher,
    round_trip_time: Arc<RoundTripTimeTracker>,
    handshaker: Handshaker,
    client_options: ClientOptions,
    connection: Option<Connection>,
}

impl RttMonitor {
    fn start(
        address: ServerAddress,
        topology_watcher: TopologyWatcher,
        round_trip_time: Arc<RoundTripTimeTracker>,
        handshaker: Handshaker,
        client_options: ClientOptions,
    ) {
        let monitor = Self {
            address,
            topology_watcher,
            round_trip_time,
            handshaker,
            client_options,
            connection: None,
        };
        runtime::spawn(monitor.execute());
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self
            .client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
            .max(MIN_HEARTBEAT_FREQUENCY);

        while self.topology_watcher.is_alive()
            && self.topology_watcher.server_exists(&self.address)
        {
            // Errors only drop the dedicated stream; the main monitor is responsible for
            // reporting the server as unreachable.
            let _: Result<()> = self.ping().await;
            runtime::delay_for(heartbeat_frequency).await;
        }
    }

    async fn ping(&mut self) -> Result<()> {
        let start = Instant::now();
        match self.connection {
            Some(ref mut conn) => {
                let hello_ok = conn.stream_description()?.hello_ok;
                let command = hello_command(self.client_options.load_balanced, Some(hello_ok), None);
                let result = run_hello(conn, command).await;
                if result.is_err() {
                    self.connection.take();
                    self.round_trip_time.reset();
                }
                result?;
            }
            None => {
                let mut connection = Connection::connect_monitoring(
                    self.address.clone(),
                    self.client_options.connect_timeout,
                    self.client_options.tls_options(),
                )
                .await?;
                self.handshaker.handshake(&mut connection).await?;
                self.connection = Some(connection);
            }
        }

        self.round_trip_time.add_sample(start.elapsed());
        Ok(())
    }
}

/// An exponentially weighted moving average of a server's round trip time, shared between a
/// monitor and its RTT monitor sibling.
#[derive(Debug)]
pub(crate) struct RoundTripTimeTracker {
    average: RwLock<Option<Duration>>,
}

impl RoundTripTimeTracker {
    fn new() -> Self {
        Self {
            average: RwLock::new(None),
        }
    }

    fn add_sample(&self, sample: Duration) {
        let mut average = self.average.write().unwrap();
        *average = Some(match *average {
            Some(old) => old.mul_f64(1.0 - RTT_SMOOTHING_FACTOR)
                + sample.mul_f64(RTT_SMOOTHING_FACTOR),
            // The first sample seeds the average.
            None => sample,
        });
    }

    /// A failed measurement invalidates the average; the next successful sample reseeds it.
    fn reset(&self) {
        *self.average.write().unwrap() = None;
    }

    pub(crate) fn average(&self) -> Option<Duration> {
        *self.average.read().unwrap()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use approx::assert_relative_eq;

    use super::RoundTripTimeTracker;

    #[test]
    fn rtt_average_is_exponentially_weighted() {
        let tracker = RoundTripTimeTracker::new();
        assert_eq!(tracker.average(), None);

        tracker.add_sample(Duration::from_millis(100));
        assert_eq!(tracker.average(), Some(Duration::from_millis(100)));

        tracker.add_sample(Duration::from_millis(200));
        let average = tracker.average().unwrap();
        assert_relative_eq!(average.as_secs_f64(), 0.120, epsilon = 0.001);

        tracker.reset();
        assert_eq!(tracker.average(), None);

        tracker.add_sample(Duration::from_millis(50));
        assert_eq!(tracker.average(), Some(Duration::from_millis(50)));
    }
}
