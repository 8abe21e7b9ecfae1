pub mod status {
    use crate::connection::HttpClient;
    use crate::{config, connection, output};

    /// Fetch and display the device status dictionary.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        config: config::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        CreateRuntime(#[source] std::io::Error),
        #[error("configuration is invalid")]
        Config(#[source] config::Error),
        #[error("could not set up the device connection")]
        Connect(#[source] connection::Error),
        #[error("could not fetch the device status")]
        GetStatus(#[source] connection::Error),
        #[error("could not produce the output")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Record<'a> {
        field: &'a str,
        value: &'a serde_json::Value,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let config = args.config.into_config().map_err(Error::Config)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::CreateRuntime)?;
        // One-shot commands always go over HTTP, even when the tracked
        // transport is MQTT. The add-on serves the HTTP API either way and a
        // request/response exchange does not need a broker round-trip.
        let http = HttpClient::new(&config).map_err(Error::Connect)?;
        let device_status = runtime.block_on(http.get_status()).map_err(Error::GetStatus)?;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers(vec!["Field", "Value"]).map_err(Error::Output)?;
        for (field, value) in device_status.fields() {
            output
                .result(
                    || vec![field.clone(), display_value(value)],
                    || Record { field, value },
                )
                .map_err(Error::Output)?;
        }
        let mode = device_status
            .fan_mode()
            .map_or_else(String::new, |mode| mode.to_string());
        let mode_value = serde_json::Value::String(mode.clone());
        output
            .result(
                || vec!["fan mode (derived)".to_string(), mode],
                || Record { field: "fan mode (derived)", value: &mode_value },
            )
            .map_err(Error::Output)?;
        let air_quality = device_status.air_quality().to_string();
        let air_quality_value = serde_json::Value::String(air_quality.clone());
        output
            .result(
                || vec!["air quality (derived)".to_string(), air_quality],
                || Record { field: "air quality (derived)", value: &air_quality_value },
            )
            .map_err(Error::Output)?;
        output.commit().map_err(Error::Output)
    }

    fn display_value(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

pub mod speed {
    use crate::{config, connection, output, speed};

    /// Fetch and display the current fan speed.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        config: config::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        CreateRuntime(#[source] std::io::Error),
        #[error("configuration is invalid")]
        Config(#[source] config::Error),
        #[error("could not set up the device connection")]
        Connect(#[source] connection::Error),
        #[error("could not fetch the current speed")]
        GetSpeed(#[source] connection::Error),
        #[error("could not produce the output")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Record {
        raw: u8,
        percent: f64,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let config = args.config.into_config().map_err(Error::Config)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::CreateRuntime)?;
        let http = connection::HttpClient::new(&config).map_err(Error::Connect)?;
        let raw = runtime.block_on(http.get_speed()).map_err(Error::GetSpeed)?;
        let percent = speed::percent_for_raw_speed(raw);
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers(vec!["Raw", "Percent"]).map_err(Error::Output)?;
        output
            .result(
                || vec![raw.to_string(), percent.to_string()],
                || Record { raw, percent },
            )
            .map_err(Error::Output)?;
        output.commit().map_err(Error::Output)
    }
}

pub mod set_speed {
    use crate::{config, connection, speed};

    /// Set the fan speed as a percentage of the full scale.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        config: config::Args,

        /// The rotation speed to set, 0–100.
        #[arg(conflicts_with = "raw", required_unless_present = "raw")]
        percent: Option<f64>,

        /// Set the raw 0–254 wire speed instead.
        #[arg(long)]
        raw: Option<u8>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        CreateRuntime(#[source] std::io::Error),
        #[error("configuration is invalid")]
        Config(#[source] config::Error),
        #[error("{0} is outside of the 0–100 speed scale")]
        PercentOutOfRange(f64),
        #[error("could not set up the device connection")]
        Connect(#[source] connection::Error),
        #[error("could not set the speed")]
        SetSpeed(#[source] connection::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let config = args.config.into_config().map_err(Error::Config)?;
        let raw = match (args.raw, args.percent) {
            (Some(raw), _) => raw,
            (None, Some(percent)) => {
                if !(0.0..=speed::MAX_ROTATION_SPEED).contains(&percent) {
                    return Err(Error::PercentOutOfRange(percent));
                }
                speed::raw_speed_for_percent(percent)
            }
            (None, None) => unreachable!("clap requires a percent or --raw"),
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::CreateRuntime)?;
        let http = connection::HttpClient::new(&config).map_err(Error::Connect)?;
        runtime.block_on(http.set_speed(raw)).map_err(Error::SetSpeed)?;
        tracing::info!(raw, "speed set");
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::Args;
        use clap::Parser as _;

        #[test]
        fn a_percent_or_a_raw_speed_is_required() {
            assert!(Args::try_parse_from(["test", "--ip", "192.168.1.50"]).is_err());
            assert!(Args::try_parse_from(["test", "--ip", "192.168.1.50", "50"]).is_ok());
            assert!(
                Args::try_parse_from(["test", "--ip", "192.168.1.50", "--raw", "127"]).is_ok()
            );
            assert!(
                Args::try_parse_from(["test", "--ip", "192.168.1.50", "50", "--raw", "127"])
                    .is_err()
            );
        }
    }
}

pub mod vremote {
    use crate::speed::VirtualRemoteCommand;
    use crate::{config, connection};

    /// Press a virtual remote button.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        config: config::Args,

        /// The button to press.
        #[arg(value_enum)]
        command: VirtualRemoteCommand,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        CreateRuntime(#[source] std::io::Error),
        #[error("configuration is invalid")]
        Config(#[source] config::Error),
        #[error("could not set up the device connection")]
        Connect(#[source] connection::Error),
        #[error("could not send the remote command")]
        SetVirtualRemote(#[source] connection::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let config = args.config.into_config().map_err(Error::Config)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::CreateRuntime)?;
        let http = connection::HttpClient::new(&config).map_err(Error::Connect)?;
        runtime.block_on(http.set_virtual_remote(args.command)).map_err(Error::SetVirtualRemote)?;
        tracing::info!(command = %args.command, "virtual remote command sent");
        Ok(())
    }
}

pub mod watch {
    use futures::StreamExt as _;
    use tokio_stream::wrappers::BroadcastStream;
    use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
    use tracing::warn;

    use crate::config::ApiProtocol;
    use crate::connection::{Connection, FanEvent};
    use crate::{config, connection, output, speed};

    /// Stream device telemetry as it arrives.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        config: config::Args,
        #[clap(flatten)]
        output: output::Args,

        /// Stop after this many events.
        #[arg(long)]
        count: Option<u64>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        CreateRuntime(#[source] std::io::Error),
        #[error("configuration is invalid")]
        Config(#[source] config::Error),
        #[error("could not set up the device connection")]
        Connect(#[source] connection::Error),
        #[error("could not produce the output")]
        Output(#[source] output::Error),
    }

    #[derive(Default, serde::Serialize)]
    struct Record {
        time: String,
        event: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        co2: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        humidity: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        temperature: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    }

    impl Record {
        fn from_event(event: &FanEvent) -> Self {
            let time = jiff::Zoned::now().to_string();
            match event {
                FanEvent::Status(device_status) => Record {
                    time,
                    event: "status",
                    speed: device_status.speed_status(),
                    mode: device_status.fan_mode().map(|mode| mode.to_string()),
                    co2: device_status.co2_ppm(),
                    humidity: device_status.humidity(),
                    temperature: device_status.temperature(),
                    ..Default::default()
                },
                FanEvent::Speed(raw) => Record {
                    time,
                    event: "speed",
                    speed: Some(speed::percent_for_raw_speed(*raw)),
                    ..Default::default()
                },
                FanEvent::TransportError(error) => {
                    let mut rendered = error.to_string();
                    let mut cause = std::error::Error::source(&**error);
                    while let Some(e) = cause {
                        rendered.push_str(": ");
                        rendered.push_str(&e.to_string());
                        cause = e.source();
                    }
                    Record { time, event: "error", error: Some(rendered), ..Default::default() }
                }
            }
        }

        fn table_row(&self) -> Vec<String> {
            let opt = |v: &Option<f64>| v.map_or_else(String::new, |v| v.to_string());
            vec![
                self.time.clone(),
                self.event.to_string(),
                opt(&self.speed),
                self.mode.clone().unwrap_or_default(),
                opt(&self.co2),
                opt(&self.humidity),
                opt(&self.temperature),
                self.error.clone().unwrap_or_default(),
            ]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let config = args.config.into_config().map_err(Error::Config)?;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::CreateRuntime)?;
        runtime.block_on(async {
            let mut connection = Connection::new(&config).map_err(Error::Connect)?;
            let mut events = BroadcastStream::new(connection.subscribe());
            if config.protocol == ApiProtocol::Http {
                connection.start_polling();
            }
            output
                .table_headers(vec![
                    "Time",
                    "Event",
                    "Speed (%)",
                    "Mode",
                    "CO2 (ppm)",
                    "Humidity (%)",
                    "Temperature (°C)",
                    "Error",
                ])
                .map_err(Error::Output)?;
            let mut seen = 0u64;
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(BroadcastStreamRecvError::Lagged(count)) => {
                        warn!(count, "dropped events, the output cannot keep up");
                        continue;
                    }
                };
                let record = Record::from_event(&event);
                output.result(|| record.table_row(), || &record).map_err(Error::Output)?;
                output.flush().map_err(Error::Output)?;
                seen += 1;
                if args.count.is_some_and(|count| seen >= count) {
                    break;
                }
            }
            connection.stop_polling();
            output.commit().map_err(Error::Output)
        })
    }
}

pub mod serve {
    use std::sync::{Arc, Mutex};

    use homie5::{Homie5DeviceProtocol, HomieDomain, HomieID};
    use tokio::sync::{broadcast, mpsc};
    use tracing::{debug, info, warn};

    use crate::config::ApiProtocol;
    use crate::connection::{Connection, FanEvent};
    use crate::engine::{FanController, SpeedCommand};
    use crate::homie::{FanDevice, convert_qos};
    use crate::{config, connection};

    /// Track the device and expose it as a Homie 5 fan over MQTT.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        config: config::Args,

        /// Host of the MQTT broker the Homie device is published to.
        #[arg(long, default_value = "localhost")]
        homie_host: String,

        /// Port of the MQTT broker the Homie device is published to.
        #[arg(long, default_value_t = 1883)]
        homie_port: u16,

        /// Username for the Homie-side broker.
        #[arg(long)]
        homie_username: Option<String>,

        /// Password for the Homie-side broker.
        #[arg(long)]
        homie_password: Option<String>,

        /// Homie device ID to publish under.
        #[arg(long, default_value = "itho-fan")]
        device_id: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        CreateRuntime(#[source] std::io::Error),
        #[error("configuration is invalid")]
        Config(#[source] config::Error),
        #[error("`{0}` is not a valid homie device ID")]
        DeviceId(String),
        #[error("could not set up the device connection")]
        Connect(#[source] connection::Error),
        #[error("the device event stream closed unexpectedly")]
        EventStreamClosed,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let config = args.config.into_config().map_err(Error::Config)?;
        let device_id = HomieID::try_from(args.device_id.clone())
            .map_err(|_| Error::DeviceId(args.device_id.clone()))?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::CreateRuntime)?;
        runtime.block_on(async {
            let mut connection = Connection::new(&config).map_err(Error::Connect)?;
            let mut events = connection.subscribe();
            if config.protocol == ApiProtocol::Http {
                connection.start_polling();
            }

            let (update_sender, mut updates) = mpsc::unbounded_channel();
            let (command_sender, mut commands) = mpsc::unbounded_channel();
            let controller =
                Arc::new(Mutex::new(FanController::new(&config, update_sender, command_sender)));

            let (protocol, last_will) =
                Homie5DeviceProtocol::new(device_id.clone(), HomieDomain::Default);
            let client_id = format!("itho-wifi-tools-homie-{}", std::process::id());
            let mut options =
                rumqttc::v5::MqttOptions::new(client_id, &args.homie_host, args.homie_port);
            options.set_last_will(rumqttc::v5::mqttbytes::v5::LastWill::new(
                last_will.topic,
                last_will.message,
                convert_qos(last_will.qos),
                last_will.retain,
                None,
            ));
            if let Some(username) = &args.homie_username {
                options
                    .set_credentials(username, args.homie_password.as_deref().unwrap_or(""));
            }
            let (homie_mqtt, mut homie_eventloop) = rumqttc::v5::AsyncClient::new(options, 16);
            let mut device = FanDevice::new(
                homie_mqtt,
                protocol,
                Arc::clone(&controller),
                config.allows_manual_speed_control(),
            );

            info!(device_id = %device_id, "serving the fan as a homie device");
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(FanEvent::Status(device_status)) => {
                            {
                                let mut controller =
                                    controller.lock().unwrap_or_else(|e| e.into_inner());
                                controller.on_status(device_status.clone());
                            }
                            if let Err(error) = device.publish_sensors(&device_status).await {
                                warn!(
                                    error = &error as &dyn std::error::Error,
                                    "could not publish sensor values"
                                );
                            }
                        }
                        Ok(FanEvent::Speed(raw)) => {
                            let mut controller =
                                controller.lock().unwrap_or_else(|e| e.into_inner());
                            controller.on_speed_echo(raw);
                        }
                        Ok(FanEvent::TransportError(error)) => {
                            debug!(
                                error = &*error as &dyn std::error::Error,
                                "a transport error, continuing with the last known state"
                            );
                        }
                        Err(broadcast::error::RecvError::Lagged(count)) => {
                            warn!(count, "event handling lagged, some reports were dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(Error::EventStreamClosed);
                        }
                    },
                    update = updates.recv() => {
                        // The engine owns the senders through `controller`, so
                        // this channel cannot close while the loop runs.
                        let Some(update) = update else { return Err(Error::EventStreamClosed) };
                        if let Err(error) = device.publish_update(update).await {
                            warn!(
                                error = &error as &dyn std::error::Error,
                                "could not publish a characteristic update"
                            );
                        }
                    },
                    command = commands.recv() => {
                        let Some(command) = command else { return Err(Error::EventStreamClosed) };
                        let sent = match command {
                            SpeedCommand::Raw(raw) => connection.set_speed(raw).await,
                            SpeedCommand::VirtualRemote(remote) => {
                                connection.set_virtual_remote(remote).await
                            }
                        };
                        if let Err(error) = sent {
                            warn!(
                                error = &error as &dyn std::error::Error,
                                "could not deliver a speed command to the device"
                            );
                        }
                    },
                    polled = homie_eventloop.poll() => match polled {
                        Ok(rumqttc::v5::Event::Incoming(
                            rumqttc::v5::mqttbytes::v5::Packet::ConnAck(_),
                        )) => {
                            info!(message = "connected to the homie broker");
                            if let Err(error) = device.publish_device().await {
                                warn!(
                                    error = &error as &dyn std::error::Error,
                                    "could not publish the device description"
                                );
                            }
                        }
                        Ok(rumqttc::v5::Event::Incoming(
                            rumqttc::v5::mqttbytes::v5::Packet::Publish(message),
                        )) => {
                            device.handle_mqtt_message(message);
                        }
                        Ok(_) => {}
                        Err(error) => {
                            warn!(
                                error = &error as &dyn std::error::Error,
                                "homie broker connection error, will reconnect"
                            );
                            tokio::time::sleep(config.reconnect_period).await;
                        }
                    },
                }
            }
        })
    }
}
