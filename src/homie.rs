//! The Homie 5 surface for the fan.
//!
//! Exposes the reconciled fan model as a Homie device with two nodes: `fan`
//! with the three controller-facing characteristics and `sensors` with the
//! telemetry a unit may or may not measure. Inbound `set` messages are
//! translated into [`FanController`] writes, with rotation speed writes going
//! through a debouncer so slider drags collapse into one device command.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use homie5::device_description::{
    DeviceDescriptionBuilder, FloatRange, HomieDeviceDescription, HomieNodeDescription,
    HomiePropertyFormat, PropertyDescriptionBuilder,
};
use homie5::client::{Publish, QoS, Subscription};
use homie5::{
    Homie5DeviceProtocol, Homie5Message, HomieDataType, HomieDeviceStatus, HomieID, PropertyRef,
};
use tracing::{debug, warn};

use crate::debounce::{DEFAULT_DEBOUNCE_DELAY, Debouncer};
use crate::engine::{Active, CharacteristicUpdate, CurrentFanState, FanController};
use crate::speed::MAX_ROTATION_SPEED;
use crate::status::{AirQuality, DeviceStatus};

const FAN_NODE: HomieID = HomieID::new_const("fan");
const ACTIVE_PROPERTY: HomieID = HomieID::new_const("active");
const ROTATION_SPEED_PROPERTY: HomieID = HomieID::new_const("rotation-speed");
const FAN_STATE_PROPERTY: HomieID = HomieID::new_const("fan-state");

const SENSORS_NODE: HomieID = HomieID::new_const("sensors");
const CO2_PROPERTY: HomieID = HomieID::new_const("co2");
const AIR_QUALITY_PROPERTY: HomieID = HomieID::new_const("air-quality");
const HUMIDITY_PROPERTY: HomieID = HomieID::new_const("humidity");
const TEMPERATURE_PROPERTY: HomieID = HomieID::new_const("temperature");

fn homie_enum<T: strum::VariantNames>() -> PropertyDescriptionBuilder {
    PropertyDescriptionBuilder::new(HomieDataType::Enum)
        .format(HomiePropertyFormat::Enum(T::VARIANTS.iter().copied().map(Into::into).collect()))
}

fn describe(allows_manual_speed_control: bool) -> HomieDeviceDescription {
    let mut active = homie_enum::<Active>().build();
    active.settable = true;
    // Discrete-control units snap to the three remote levels, so advertising
    // a finer step would promise precision the device does not have.
    let step = if allows_manual_speed_control { 1.0 } else { MAX_ROTATION_SPEED / 3.0 };
    let mut rotation_speed = PropertyDescriptionBuilder::new(HomieDataType::Float)
        .format(FloatRange { min: Some(0.0), max: Some(MAX_ROTATION_SPEED), step: Some(step) })
        .unit("%")
        .build();
    rotation_speed.settable = true;
    let fan_state = homie_enum::<CurrentFanState>().build();
    let fan_properties = [
        (ACTIVE_PROPERTY, active),
        (ROTATION_SPEED_PROPERTY, rotation_speed),
        (FAN_STATE_PROPERTY, fan_state),
    ]
    .into_iter()
    .collect::<BTreeMap<_, _>>();

    let sensor_properties = [
        (
            CO2_PROPERTY,
            PropertyDescriptionBuilder::new(HomieDataType::Float).unit("ppm").build(),
        ),
        (AIR_QUALITY_PROPERTY, homie_enum::<AirQuality>().build()),
        (
            HUMIDITY_PROPERTY,
            PropertyDescriptionBuilder::new(HomieDataType::Float).unit("%").build(),
        ),
        (
            TEMPERATURE_PROPERTY,
            PropertyDescriptionBuilder::new(HomieDataType::Float)
                .unit(homie5::HOMIE_UNIT_DEGREE_CELSIUS)
                .build(),
        ),
    ]
    .into_iter()
    .collect::<BTreeMap<_, _>>();

    DeviceDescriptionBuilder::new()
        .name("Itho Daalderop fan")
        .add_node(
            FAN_NODE,
            HomieNodeDescription {
                name: Some("ventilation fan".to_string()),
                r#type: None,
                properties: fan_properties,
            },
        )
        .add_node(
            SENSORS_NODE,
            HomieNodeDescription {
                name: Some("built-in sensors".to_string()),
                r#type: None,
                properties: sensor_properties,
            },
        )
        .build()
}

pub struct FanDevice {
    mqtt: rumqttc::v5::AsyncClient,
    protocol: Homie5DeviceProtocol,
    state: HomieDeviceStatus,
    description: HomieDeviceDescription,
    controller: Arc<Mutex<FanController>>,
    speed_debouncer: Debouncer,
    published_sensors: BTreeMap<HomieID, String>,
}

impl FanDevice {
    pub fn new(
        mqtt: rumqttc::v5::AsyncClient,
        protocol: Homie5DeviceProtocol,
        controller: Arc<Mutex<FanController>>,
        allows_manual_speed_control: bool,
    ) -> Self {
        Self {
            mqtt,
            protocol,
            state: HomieDeviceStatus::Init,
            description: describe(allows_manual_speed_control),
            controller,
            speed_debouncer: Debouncer::new(DEFAULT_DEBOUNCE_DELAY),
            published_sensors: BTreeMap::new(),
        }
    }

    pub async fn publish_device(&mut self) -> Result<(), rumqttc::v5::ClientError> {
        for step in homie5::homie_device_publish_steps() {
            match step {
                homie5::DevicePublishStep::DeviceStateInit => {
                    self.state = HomieDeviceStatus::Init;
                    let p = self.protocol.publish_state(self.state);
                    self.mqtt.homie_publish(p).await?;
                }
                homie5::DevicePublishStep::DeviceDescription => {
                    let Ok(p) = self.protocol.publish_description(&self.description) else {
                        // Only possible with a malformed description, which
                        // `describe` cannot produce.
                        continue;
                    };
                    self.mqtt.homie_publish(p).await?;
                }
                homie5::DevicePublishStep::PropertyValues => {
                    // Characteristic and sensor values only exist once the
                    // first device report arrives; they are published from the
                    // event loop as they do.
                }
                homie5::DevicePublishStep::SubscribeProperties => {
                    let Ok(subscriptions) = self.protocol.subscribe_props(&self.description)
                    else {
                        continue;
                    };
                    let mut subscriptions = subscriptions.peekable();
                    if subscriptions.peek().is_some() {
                        self.mqtt.homie_subscribe(subscriptions).await?;
                    }
                }
                homie5::DevicePublishStep::DeviceStateReady => {
                    debug!("device becomes ready...");
                    self.state = HomieDeviceStatus::Ready;
                    let p = self.protocol.publish_state(self.state);
                    self.mqtt.homie_publish(p).await?;
                }
            }
        }
        Ok(())
    }

    /// Pushes one changed characteristic out to the controller topics.
    pub async fn publish_update(
        &self,
        update: CharacteristicUpdate,
    ) -> Result<(), rumqttc::v5::ClientError> {
        let (prop_id, value) = match update {
            CharacteristicUpdate::Active(value) => (ACTIVE_PROPERTY, value.to_string()),
            CharacteristicUpdate::CurrentFanState(value) => {
                (FAN_STATE_PROPERTY, value.to_string())
            }
            CharacteristicUpdate::RotationSpeed(value) => {
                (ROTATION_SPEED_PROPERTY, value.to_string())
            }
        };
        let retained = self
            .description
            .get_property_by_id(&FAN_NODE, &prop_id)
            .is_none_or(|description| description.retained);
        let p = self.protocol.publish_value(&FAN_NODE, &prop_id, value, retained);
        self.mqtt.homie_publish(p).await
    }

    /// Publishes the sensor properties a status report carries.
    ///
    /// Sensor values bypass the reconciliation engine entirely: they have no
    /// writable side and no manual write hold-off. Values a unit does not
    /// measure stay unpublished, and unchanged values are not republished.
    pub async fn publish_sensors(
        &mut self,
        device_status: &DeviceStatus,
    ) -> Result<(), rumqttc::v5::ClientError> {
        let air_quality = device_status.air_quality().to_string();
        self.publish_sensor(CO2_PROPERTY, device_status.co2_ppm().map(|v| v.to_string()))
            .await?;
        self.publish_sensor(AIR_QUALITY_PROPERTY, Some(air_quality)).await?;
        self.publish_sensor(HUMIDITY_PROPERTY, device_status.humidity().map(|v| v.to_string()))
            .await?;
        self.publish_sensor(
            TEMPERATURE_PROPERTY,
            device_status.temperature().map(|v| v.to_string()),
        )
        .await
    }

    async fn publish_sensor(
        &mut self,
        prop_id: HomieID,
        value: Option<String>,
    ) -> Result<(), rumqttc::v5::ClientError> {
        let Some(value) = value else { return Ok(()) };
        if self.published_sensors.get(&prop_id) == Some(&value) {
            return Ok(());
        }
        let p = self.protocol.publish_value(&SENSORS_NODE, &prop_id, &value, true);
        self.mqtt.homie_publish(p).await?;
        self.published_sensors.insert(prop_id, value);
        Ok(())
    }

    /// Handles a message from the controller-side MQTT connection.
    pub fn handle_mqtt_message(&mut self, message: rumqttc::v5::mqttbytes::v5::Publish) {
        let Ok(topic) = str::from_utf8(&message.topic) else {
            warn!("a message with a non-UTF-8 topic");
            return;
        };
        match homie5::parse_mqtt_message(topic, &message.payload) {
            Ok(Homie5Message::PropertySet { property, set_value }) => {
                self.handle_set(property, set_value);
            }
            Ok(_) => {}
            Err(error) => {
                debug!(
                    topic,
                    error = &error as &dyn std::error::Error,
                    "not a homie message, ignoring"
                );
            }
        }
    }

    fn handle_set(&mut self, property: PropertyRef, value: String) {
        if property.device_id() != self.protocol.device_ref().device_id() {
            return;
        }
        if *property.node_id() != FAN_NODE {
            debug!(node_id = %property.node_id(), "set for a node without writable properties");
            return;
        }
        let prop_id = property.prop_id();
        if *prop_id == ACTIVE_PROPERTY {
            let Ok(active) = value.parse::<Active>() else {
                warn!(value, "not a valid active state");
                return;
            };
            let mut controller = self.controller.lock().unwrap_or_else(|e| e.into_inner());
            controller.set_active(active);
        } else if *prop_id == ROTATION_SPEED_PROPERTY {
            let Ok(percent) = value.parse::<f64>() else {
                warn!(value, "not a valid rotation speed");
                return;
            };
            let percent = percent.clamp(0.0, MAX_ROTATION_SPEED);
            let controller = Arc::clone(&self.controller);
            // Slider drags arrive as a burst of writes; only the final one
            // reaches the device.
            self.speed_debouncer.invoke(async move {
                let mut controller = controller.lock().unwrap_or_else(|e| e.into_inner());
                controller.set_rotation_speed(percent);
            });
        } else {
            debug!(prop_id = %prop_id, "set for a property that is not writable");
        }
    }
}

trait MqttClientExt {
    type PublishError;
    type SubscribeError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError>;
    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError>;
}

impl MqttClientExt for rumqttc::v5::AsyncClient {
    type PublishError = rumqttc::v5::ClientError;
    type SubscribeError = rumqttc::v5::ClientError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError> {
        self.publish(p.topic, convert_qos(p.qos), p.retain, p.payload).await
    }

    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError> {
        self.subscribe_many(
            subs.map(|sub| {
                rumqttc::v5::mqttbytes::v5::Filter::new(sub.topic, convert_qos(sub.qos))
            }),
        )
        .await
    }
}

pub fn convert_qos(homie: QoS) -> rumqttc::v5::mqttbytes::QoS {
    match homie {
        QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_speed_step_follows_the_control_mode() {
        for (manual, step) in [(true, 1.0), (false, MAX_ROTATION_SPEED / 3.0)] {
            let description = describe(manual);
            let property = description
                .get_property_by_id(&FAN_NODE, &ROTATION_SPEED_PROPERTY)
                .expect("the rotation speed is described");
            assert!(property.settable);
            let HomiePropertyFormat::FloatRange(range) = &property.format else {
                panic!("the rotation speed must carry a float range");
            };
            assert_eq!(range.min, Some(0.0));
            assert_eq!(range.max, Some(MAX_ROTATION_SPEED));
            assert_eq!(range.step, Some(step));
        }
    }

    #[test]
    fn only_the_fan_controls_are_settable() {
        let description = describe(true);
        for (node, prop, settable) in [
            (&FAN_NODE, &ACTIVE_PROPERTY, true),
            (&FAN_NODE, &FAN_STATE_PROPERTY, false),
            (&SENSORS_NODE, &CO2_PROPERTY, false),
            (&SENSORS_NODE, &AIR_QUALITY_PROPERTY, false),
        ] {
            let property = description
                .get_property_by_id(node, prop)
                .expect("the property is described");
            assert_eq!(property.settable, settable, "{prop}");
        }
    }
}
