// src/objects.rs - Pin document to BACnet object translation
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::pins::{Direction, PinDocument, SignalType};
use crate::store::{persist_json, StoreError};

/// BACnet object types the stack exposes for GPIO pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    BinaryInput,
    BinaryOutput,
    AnalogInput,
    AnalogOutput,
}

impl ObjectType {
    pub fn for_pin(direction: Direction, signal_type: SignalType) -> Self {
        match (direction, signal_type) {
            (Direction::Input, SignalType::Digital) => ObjectType::BinaryInput,
            (Direction::Output, SignalType::Digital) => ObjectType::BinaryOutput,
            (Direction::Input, SignalType::Analog) => ObjectType::AnalogInput,
            (Direction::Output, SignalType::Analog) => ObjectType::AnalogOutput,
        }
    }

    pub fn is_binary(self) -> bool {
        matches!(self, ObjectType::BinaryInput | ObjectType::BinaryOutput)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::BinaryInput => "binary_input",
            ObjectType::BinaryOutput => "binary_output",
            ObjectType::AnalogInput => "analog_input",
            ObjectType::AnalogOutput => "analog_output",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How configured instance numbers become BACnet instance numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceNumbering {
    /// The configured instance is used as-is.
    #[default]
    Direct,
    /// Inputs are offset by 3000 and outputs by 4000.
    TypeOffset,
}

impl InstanceNumbering {
    pub fn apply(self, object_type: ObjectType, instance: u32) -> u32 {
        match self {
            InstanceNumbering::Direct => instance,
            InstanceNumbering::TypeOffset => match object_type {
                ObjectType::BinaryInput | ObjectType::AnalogInput => 3000 + instance,
                ObjectType::BinaryOutput | ObjectType::AnalogOutput => 4000 + instance,
            },
        }
    }
}

/// One BACnet object definition consumed by the protocol stack.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProtocolObjectDescriptor {
    pub object_type: ObjectType,
    pub instance: u32,
    pub name: String,
    pub gpio_pin: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// Translate the pin document into object descriptors.
///
/// Disabled pins are skipped. Output order follows pin order, so identical
/// documents always produce identical lists. Pins without an explicit instance
/// are numbered as on a header with `pin_count` pins.
pub fn map_objects(
    document: &PinDocument,
    numbering: InstanceNumbering,
    pin_count: u8,
) -> Vec<ProtocolObjectDescriptor> {
    document
        .enabled()
        .map(|(pin, config)| {
            let object_type = ObjectType::for_pin(config.direction, config.signal_type);
            let base = config.instance_or_default(pin, pin_count);
            let instance = numbering.apply(object_type, base);

            let (active_text, inactive_text, units) = if object_type.is_binary() {
                (
                    Some(config.active_text.clone()),
                    Some(config.inactive_text.clone()),
                    None,
                )
            } else {
                let units = config.units.clone().unwrap_or_else(|| "volts".to_string());
                (None, None, Some(units))
            };

            ProtocolObjectDescriptor {
                object_type,
                instance,
                name: config.name.clone(),
                gpio_pin: pin,
                active_text,
                inactive_text,
                units,
            }
        })
        .collect()
}

/// The persisted object document read by the protocol stack at startup.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObjectDocument {
    pub device_id: u32,
    pub device_name: String,
    pub total_objects: usize,
    pub objects: Vec<ProtocolObjectDescriptor>,
}

impl ObjectDocument {
    pub fn build(
        device_id: u32,
        device_name: &str,
        document: &PinDocument,
        numbering: InstanceNumbering,
        pin_count: u8,
    ) -> Self {
        let objects = map_objects(document, numbering, pin_count);
        Self {
            device_id,
            device_name: device_name.to_string(),
            total_objects: objects.len(),
            objects,
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<(), StoreError> {
        persist_json(path, self)?;
        tracing::info!(
            "Generated BACnet configuration with {} objects at {}",
            self.total_objects,
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pins::PinConfig;

    fn sample_document() -> PinDocument {
        let mut document = PinDocument::new();
        document.insert(
            18,
            PinConfig {
                direction: Direction::Output,
                name: "Test LED".to_string(),
                active_text: "ON".to_string(),
                inactive_text: "OFF".to_string(),
                instance: Some(18),
                ..PinConfig::default()
            },
        );
        document.insert(
            19,
            PinConfig {
                name: "Motion Sensor".to_string(),
                instance: Some(19),
                ..PinConfig::default()
            },
        );
        document.insert(
            20,
            PinConfig {
                signal_type: SignalType::Analog,
                name: "Temperature Sensor".to_string(),
                instance: Some(20),
                ..PinConfig::default()
            },
        );
        document.insert(
            5,
            PinConfig {
                name: "Spare".to_string(),
                enabled: false,
                ..PinConfig::default()
            },
        );
        document
    }

    #[test]
    fn test_object_types_follow_direction_and_signal() {
        let objects = map_objects(&sample_document(), InstanceNumbering::Direct, 24);
        let types: Vec<_> = objects.iter().map(|o| (o.gpio_pin, o.object_type)).collect();
        assert_eq!(
            types,
            vec![
                (18, ObjectType::BinaryOutput),
                (19, ObjectType::BinaryInput),
                (20, ObjectType::AnalogInput),
            ]
        );
        assert_eq!(objects[0].active_text.as_deref(), Some("ON"));
        assert_eq!(objects[2].units.as_deref(), Some("volts"));
        assert!(objects[2].active_text.is_none());
    }

    #[test]
    fn test_mapping_is_deterministic_and_skips_disabled() {
        let document = sample_document();
        let first = map_objects(&document, InstanceNumbering::Direct, 24);
        let second = map_objects(&document, InstanceNumbering::Direct, 24);
        assert_eq!(first, second);
        assert!(first.iter().all(|o| o.gpio_pin != 5));
    }

    #[test]
    fn test_type_offset_numbering() {
        let objects = map_objects(&sample_document(), InstanceNumbering::TypeOffset, 24);
        assert_eq!(objects[0].instance, 4018);
        assert_eq!(objects[1].instance, 3019);
    }

    #[test]
    fn test_pin_zero_never_maps_to_instance_zero() {
        let mut document = PinDocument::new();
        document.insert(0, PinConfig::default());
        let objects = map_objects(&document, InstanceNumbering::Direct, 24);
        assert_eq!(objects[0].instance, 24);
    }

    #[test]
    fn test_pin_zero_follows_header_size() {
        let mut document = PinDocument::new();
        document.insert(0, PinConfig::default());
        document.insert(
            28,
            PinConfig {
                instance: Some(28),
                ..PinConfig::default()
            },
        );
        assert!(document.validate(24).is_ok());
        // On a 28-pin header pin 0 takes instance 28, which pin 28 already holds.
        assert!(document.validate(28).is_err());

        let objects = map_objects(&document, InstanceNumbering::Direct, 40);
        assert_eq!(objects[0].instance, 40);
    }

    #[test]
    fn test_object_document_shape() {
        let doc = ObjectDocument::build(
            25411,
            "RPi GPIO Controller",
            &sample_document(),
            InstanceNumbering::Direct,
            24,
        );
        assert_eq!(doc.total_objects, 3);

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["device_id"], 25411);
        assert_eq!(json["objects"][1]["object_type"], "binary_input");
        assert_eq!(json["objects"][1]["inactive_text"], "Low");
    }
}
