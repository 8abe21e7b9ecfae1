//! Transport adapters for the WiFi add-on.
//!
//! Two interchangeable transports feed the same event stream: a request/
//! response HTTP adapter that polls the add-on's `api.html` endpoint, and an
//! MQTT adapter that subscribes to the topics the add-on publishes. Which one
//! drives inbound state is decided once, from static configuration. The HTTP
//! client is constructed either way, because the HTTP API is always served by
//! the add-on and doubles as the outbound command fallback.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::broadcast;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{ApiProtocol, Config};
use crate::speed::VirtualRemoteCommand;
use crate::status::{self, DeviceStatus};

/// Full status dictionary, published by the add-on as a JSON object.
pub const MQTT_STATUS_TOPIC: &str = "itho/ithostatus";
/// Raw 0–254 speed echoed by the device as a bare integer string.
pub const MQTT_STATE_TOPIC: &str = "itho/state";
/// Command topic the add-on listens on.
pub const MQTT_CMD_TOPIC: &str = "itho/cmd";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{0}` could not be turned into an API URL")]
    BadAddress(String),
    #[error("HTTP request to the device failed")]
    Request(#[source] reqwest::Error),
    #[error("the device rejected the request (NOK)")]
    Nok,
    #[error("the device reported a speed that is not a number: {0:?}")]
    UnparsableSpeed(String),
    #[error("the device reported a malformed status payload")]
    Status(#[source] status::Error),
}

/// Inbound telemetry, regardless of transport.
#[derive(Clone, Debug)]
pub enum FanEvent {
    Status(DeviceStatus),
    /// Raw 0–254 speed reported by the device.
    Speed(u8),
    /// A cycle failed. Previously observed state is untouched and polling
    /// continues at the usual interval.
    TransportError(Arc<Error>),
}

/// Thin wrapper around the add-on's `GET /api.html` query interface.
pub struct HttpClient {
    http: reqwest::Client,
    base_url: reqwest::Url,
}

impl HttpClient {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let base_url = reqwest::Url::parse(&format!("http://{}/api.html", config.ip))
            .map_err(|_| Error::BadAddress(config.ip.to_string()))?;
        Ok(Self::from_api_url(base_url, config.username.as_deref(), config.password.as_deref()))
    }

    /// The `api.html` endpoint URL directly, when the add-on is not at the
    /// default port 80.
    pub fn from_api_url(
        mut base_url: reqwest::Url,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        if let Some(username) = username {
            base_url.query_pairs_mut().append_pair("username", username);
        }
        if let Some(password) = password {
            base_url.query_pairs_mut().append_pair("password", password);
        }
        // No request timeout. A hung request stalls the polling method that
        // issued it until the device responds.
        Self { http: reqwest::Client::new(), base_url }
    }

    async fn request(&self, param: &str, value: &str) -> Result<String, Error> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().append_pair(param, value);
        trace!(message = "requesting", %url);
        let response = self.http.get(url).send().await.map_err(Error::Request)?;
        let text = response.text().await.map_err(Error::Request)?;
        if text == "NOK" {
            return Err(Error::Nok);
        }
        Ok(text)
    }

    /// The current raw speed, 0–254.
    pub async fn get_speed(&self) -> Result<u8, Error> {
        let text = self.request("get", "currentspeed").await?;
        text.trim().parse().map_err(|_| Error::UnparsableSpeed(text))
    }

    pub async fn get_status(&self) -> Result<DeviceStatus, Error> {
        let text = self.request("get", "ithostatus").await?;
        DeviceStatus::from_json(&text).map_err(Error::Status)
    }

    pub async fn set_speed(&self, raw: u8) -> Result<(), Error> {
        self.request("speed", &raw.to_string()).await.map(drop)
    }

    pub async fn set_virtual_remote(&self, command: VirtualRemoteCommand) -> Result<(), Error> {
        self.request("vremote", &command.to_string()).await.map(drop)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PollMethod {
    GetSpeed,
    GetStatus,
}

/// Stop switch for one polling loop.
///
/// The loop observes the flag at the top of each cycle, so a request that is
/// already in flight completes and its result is still emitted.
pub struct PollHandle {
    method: PollMethod,
    running: Arc<AtomicBool>,
}

impl PollHandle {
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            debug!(method = %self.method, "stopping polling");
        } else {
            debug!(method = %self.method, "polling is not started or already stopped");
        }
    }
}

fn poll_stream(
    http: Arc<HttpClient>,
    method: PollMethod,
    interval: Duration,
    running: Arc<AtomicBool>,
) -> impl futures::Stream<Item = FanEvent> {
    async_stream::stream! {
        while running.load(Ordering::Relaxed) {
            let outcome = match method {
                PollMethod::GetSpeed => http.get_speed().await.map(FanEvent::Speed),
                PollMethod::GetStatus => http.get_status().await.map(FanEvent::Status),
            };
            match outcome {
                Ok(event) => yield event,
                Err(error) => {
                    debug!(
                        method = %method,
                        error = &error as &dyn std::error::Error,
                        "polling cycle failed, will retry at the next interval"
                    );
                    yield FanEvent::TransportError(Arc::new(error));
                }
            }
            // Fixed interval regardless of outcome; no backoff.
            tokio::time::sleep(interval).await;
        }
    }
}

fn spawn_poll_loop(
    http: Arc<HttpClient>,
    events: broadcast::Sender<FanEvent>,
    method: PollMethod,
    interval: Duration,
) -> PollHandle {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    tokio::spawn(async move {
        let mut stream = pin!(poll_stream(http, method, interval, flag));
        while let Some(event) = stream.next().await {
            let _ = events.send(event);
        }
        debug!(method = %method, "polling loop finished");
    });
    PollHandle { method, running }
}

struct MqttWorker {
    client: rumqttc::AsyncClient,
    eventloop: rumqttc::EventLoop,
    events: broadcast::Sender<FanEvent>,
    reconnect_period: Duration,
}

impl MqttWorker {
    fn connect(
        config: &Config,
        events: broadcast::Sender<FanEvent>,
    ) -> (rumqttc::AsyncClient, AbortOnDropHandle<()>) {
        let client_id = format!("itho-wifi-tools-{}", std::process::id());
        let mut options = rumqttc::MqttOptions::new(client_id, config.ip.to_string(), config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or(""));
        }
        let (client, eventloop) = rumqttc::AsyncClient::new(options, 16);
        let worker = MqttWorker {
            client: client.clone(),
            eventloop,
            events,
            reconnect_period: config.reconnect_period,
        };
        let handle = AbortOnDropHandle::new(tokio::task::spawn(worker.main_loop()));
        (client, handle)
    }

    async fn main_loop(mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    info!(message = "connected to the MQTT broker");
                    // Resubscribe on every connection so a broker restart does
                    // not leave us deaf.
                    for topic in [MQTT_STATUS_TOPIC, MQTT_STATE_TOPIC] {
                        let subscribed =
                            self.client.subscribe(topic, rumqttc::QoS::AtLeastOnce).await;
                        if let Err(error) = subscribed {
                            warn!(
                                topic,
                                error = &error as &dyn std::error::Error,
                                "could not subscribe"
                            );
                        }
                    }
                }
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                    self.handle_publish(publish);
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        error = &error as &dyn std::error::Error,
                        "MQTT connection error, will reconnect"
                    );
                    tokio::time::sleep(self.reconnect_period).await;
                }
            }
        }
    }

    fn handle_publish(&self, publish: rumqttc::Publish) {
        let payload = String::from_utf8_lossy(&publish.payload);
        trace!(topic = publish.topic, payload = %payload, "received a message");
        match publish.topic.as_str() {
            MQTT_STATUS_TOPIC => match DeviceStatus::from_json(&payload) {
                Ok(device_status) => {
                    let _ = self.events.send(FanEvent::Status(device_status));
                }
                Err(error) => {
                    warn!(
                        error = &error as &dyn std::error::Error,
                        "discarding a malformed status message"
                    );
                    let _ = self
                        .events
                        .send(FanEvent::TransportError(Arc::new(Error::Status(error))));
                }
            },
            MQTT_STATE_TOPIC => match payload.trim().parse::<u8>() {
                Ok(raw) => {
                    let _ = self.events.send(FanEvent::Speed(raw));
                }
                Err(_) => {
                    warn!(payload = %payload, "discarding a non-numeric state message");
                    let _ = self.events.send(FanEvent::TransportError(Arc::new(
                        Error::UnparsableSpeed(payload.into_owned()),
                    )));
                }
            },
            other => debug!(topic = other, "message on an unexpected topic"),
        }
    }
}

/// The single transport front the rest of the crate talks to.
pub struct Connection {
    http: Arc<HttpClient>,
    mqtt: Option<rumqttc::AsyncClient>,
    events: broadcast::Sender<FanEvent>,
    poll_interval: Duration,
    polls: Vec<PollHandle>,
    #[allow(unused)] // holds the worker task alive
    mqtt_worker: Option<AbortOnDropHandle<()>>,
}

impl Connection {
    pub fn new(config: &Config) -> Result<Connection, Error> {
        let (events, _) = broadcast::channel(64);
        let http = Arc::new(HttpClient::new(config)?);
        let (mqtt, mqtt_worker) = match config.protocol {
            ApiProtocol::Mqtt => {
                let (client, worker) = MqttWorker::connect(config, events.clone());
                (Some(client), Some(worker))
            }
            ApiProtocol::Http => (None, None),
        };
        Ok(Self {
            http,
            mqtt,
            events,
            poll_interval: config.poll_interval,
            polls: Vec::new(),
            mqtt_worker,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FanEvent> {
        self.events.subscribe()
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Starts one polling loop per tracked method. Only meaningful when HTTP
    /// is the inbound transport; MQTT feeds the event stream on its own.
    pub fn start_polling(&mut self) {
        for method in [PollMethod::GetSpeed, PollMethod::GetStatus] {
            debug!(method = %method, interval = ?self.poll_interval, "starting polling");
            self.polls.push(spawn_poll_loop(
                Arc::clone(&self.http),
                self.events.clone(),
                method,
                self.poll_interval,
            ));
        }
    }

    pub fn stop_polling(&self) {
        for poll in &self.polls {
            poll.stop();
        }
    }

    /// Sets the raw 0–254 speed. Over MQTT delivery is fire-and-forget:
    /// failures are logged, never returned.
    pub async fn set_speed(&self, raw: u8) -> Result<(), Error> {
        if let Some(mqtt) = &self.mqtt {
            let payload = serde_json::json!({ "speed": raw.to_string() }).to_string();
            debug!(topic = MQTT_CMD_TOPIC, payload = %payload, "publishing a speed command");
            let published =
                mqtt.publish(MQTT_CMD_TOPIC, rumqttc::QoS::AtLeastOnce, false, payload).await;
            if let Err(error) = published {
                warn!(
                    error = &error as &dyn std::error::Error,
                    "could not queue the speed command"
                );
            }
            return Ok(());
        }
        self.http.set_speed(raw).await
    }

    pub async fn set_virtual_remote(&self, command: VirtualRemoteCommand) -> Result<(), Error> {
        if let Some(mqtt) = &self.mqtt {
            let payload = serde_json::json!({ "vremote": command.to_string() }).to_string();
            debug!(topic = MQTT_CMD_TOPIC, payload = %payload, "publishing a remote command");
            let published =
                mqtt.publish(MQTT_CMD_TOPIC, rumqttc::QoS::AtLeastOnce, false, payload).await;
            if let Err(error) = published {
                warn!(
                    error = &error as &dyn std::error::Error,
                    "could not queue the remote command"
                );
            }
            return Ok(());
        }
        self.http.set_virtual_remote(command).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn client(server: &MockServer) -> HttpClient {
        let url = reqwest::Url::parse(&format!("{}/api.html", server.uri())).unwrap();
        HttpClient::from_api_url(url, None, None)
    }

    #[tokio::test]
    async fn polling_emits_an_event_per_cycle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api.html"))
            .and(query_param("get", "currentspeed"))
            .respond_with(ResponseTemplate::new(200).set_body_string("127"))
            .mount(&server)
            .await;
        let http = Arc::new(client(&server).await);
        let (events, mut receiver) = broadcast::channel(16);
        let poll = spawn_poll_loop(
            http,
            events,
            PollMethod::GetSpeed,
            Duration::from_millis(10),
        );
        for _ in 0..3 {
            let event = receiver.recv().await.unwrap();
            assert!(matches!(event, FanEvent::Speed(127)), "{event:?}");
        }
        poll.stop();
    }

    #[tokio::test]
    async fn polling_failures_are_reported_and_do_not_stop_the_loop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("NOK"))
            .mount(&server)
            .await;
        let http = Arc::new(client(&server).await);
        let (events, mut receiver) = broadcast::channel(16);
        let poll = spawn_poll_loop(
            http,
            events,
            PollMethod::GetStatus,
            Duration::from_millis(10),
        );
        for _ in 0..2 {
            let event = receiver.recv().await.unwrap();
            let FanEvent::TransportError(error) = event else {
                panic!("expected a transport error, got {event:?}");
            };
            assert!(matches!(*error, Error::Nok));
        }
        poll.stop();
    }

    #[tokio::test]
    async fn a_stopped_loop_polls_no_further() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("0"))
            .mount(&server)
            .await;
        let http = Arc::new(client(&server).await);
        let (events, mut receiver) = broadcast::channel(16);
        let poll = spawn_poll_loop(
            http,
            events,
            PollMethod::GetSpeed,
            Duration::from_millis(10),
        );
        receiver.recv().await.unwrap();
        poll.stop();
        // Stopping twice only logs.
        poll.stop();
        // At most the cycle that was already in flight can still arrive.
        let mut remaining = 0;
        while tokio::time::timeout(Duration::from_millis(100), receiver.recv())
            .await
            .ok()
            .and_then(Result::ok)
            .is_some()
        {
            remaining += 1;
        }
        assert!(remaining <= 1, "{remaining} events after stop");
    }
}
