//! Property model and the property store.
//!
//! A property is a named vector of typed items with a state
//! (`Idle`, `Ok`, `Busy`, `Alert`). Drivers never talk to clients directly:
//! they mutate properties through a [`PropertyStore`] and call
//! [`PropertyStore::publish`] when a change should reach clients.
//!
//! [`MemoryPropertyStore`] is the in-process implementation. It keeps every
//! property in a `parking_lot::RwLock` map and emits [`PropertyEvent`]s on a
//! `tokio::sync::broadcast` channel. Events are sent while the write lock is
//! held, so subscribers observe transitions in publish order.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = MemoryPropertyStore::new();
//! let mut events = store.subscribe();
//!
//! store.define(
//!     Property::new(names::WHEEL_SLOT, "Slot", PropertyKind::Number)
//!         .for_device("Wheel")
//!         .with_item(Item::number(names::WHEEL_SLOT_ITEM, "Slot", 1.0, 5.0, 1.0)),
//! )?;
//! store.set_values("Wheel", names::WHEEL_SLOT, &[ItemUpdate::target("SLOT", 3.0)])?;
//! store.set_state("Wheel", names::WHEEL_SLOT, PropertyState::Busy)?;
//! store.publish("Wheel", names::WHEEL_SLOT, None)?;
//! ```

use crate::error::{AppResult, AstroError};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Standard property and item names.
pub mod names {
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECTION_CONNECTED: &str = "CONNECTED";
    pub const CONNECTION_DISCONNECTED: &str = "DISCONNECTED";

    pub const CCD_INFO: &str = "CCD_INFO";
    pub const CCD_INFO_WIDTH: &str = "WIDTH";
    pub const CCD_INFO_HEIGHT: &str = "HEIGHT";
    pub const CCD_INFO_BITS_PER_PIXEL: &str = "BITS_PER_PIXEL";
    pub const CCD_INFO_PIXEL_SIZE: &str = "PIXEL_SIZE";
    pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
    pub const CCD_EXPOSURE_ITEM: &str = "EXPOSURE";
    pub const CCD_ABORT_EXPOSURE: &str = "CCD_ABORT_EXPOSURE";
    pub const CCD_ABORT_EXPOSURE_ITEM: &str = "ABORT_EXPOSURE";
    pub const CCD_IMAGE: &str = "CCD_IMAGE";
    pub const CCD_IMAGE_ITEM: &str = "IMAGE";
    pub const CCD_COOLER: &str = "CCD_COOLER";
    pub const CCD_COOLER_ON: &str = "ON";
    pub const CCD_COOLER_OFF: &str = "OFF";
    pub const CCD_COOLER_POWER: &str = "CCD_COOLER_POWER";
    pub const CCD_COOLER_POWER_ITEM: &str = "POWER";
    pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";
    pub const CCD_TEMPERATURE_ITEM: &str = "TEMPERATURE";

    pub const WHEEL_SLOT: &str = "WHEEL_SLOT";
    pub const WHEEL_SLOT_ITEM: &str = "SLOT";

    pub const GUIDER_GUIDE_RA: &str = "GUIDER_GUIDE_RA";
    pub const GUIDER_GUIDE_EAST: &str = "EAST";
    pub const GUIDER_GUIDE_WEST: &str = "WEST";
    pub const GUIDER_GUIDE_DEC: &str = "GUIDER_GUIDE_DEC";
    pub const GUIDER_GUIDE_NORTH: &str = "NORTH";
    pub const GUIDER_GUIDE_SOUTH: &str = "SOUTH";

    pub const MOUNT_INFO: &str = "MOUNT_INFO";
    pub const MOUNT_INFO_VENDOR: &str = "VENDOR";
    pub const MOUNT_INFO_MODEL: &str = "MODEL";
    pub const MOUNT_INFO_FIRMWARE: &str = "FIRMWARE";
    pub const MOUNT_GEOGRAPHIC_COORDINATES: &str = "MOUNT_GEOGRAPHIC_COORDINATES";
    pub const MOUNT_GEOGRAPHIC_LATITUDE: &str = "LATITUDE";
    pub const MOUNT_GEOGRAPHIC_LONGITUDE: &str = "LONGITUDE";
    pub const MOUNT_EQUATORIAL_COORDINATES: &str = "MOUNT_EQUATORIAL_COORDINATES";
    pub const MOUNT_EQUATORIAL_RA: &str = "RA";
    pub const MOUNT_EQUATORIAL_DEC: &str = "DEC";
    pub const MOUNT_ON_COORDINATES_SET: &str = "MOUNT_ON_COORDINATES_SET";
    pub const MOUNT_ON_COORDINATES_SET_TRACK: &str = "TRACK";
    pub const MOUNT_ON_COORDINATES_SET_SLEW: &str = "SLEW";
    pub const MOUNT_ON_COORDINATES_SET_SYNC: &str = "SYNC";
    pub const MOUNT_TRACKING: &str = "MOUNT_TRACKING";
    pub const MOUNT_TRACKING_ON: &str = "ON";
    pub const MOUNT_TRACKING_OFF: &str = "OFF";
    pub const MOUNT_TRACK_RATE: &str = "MOUNT_TRACK_RATE";
    pub const MOUNT_TRACK_RATE_SIDEREAL: &str = "SIDEREAL";
    pub const MOUNT_TRACK_RATE_SOLAR: &str = "SOLAR";
    pub const MOUNT_TRACK_RATE_LUNAR: &str = "LUNAR";
    pub const MOUNT_SLEW_RATE: &str = "MOUNT_SLEW_RATE";
    pub const MOUNT_SLEW_RATE_GUIDE: &str = "GUIDE";
    pub const MOUNT_SLEW_RATE_CENTERING: &str = "CENTERING";
    pub const MOUNT_SLEW_RATE_FIND: &str = "FIND";
    pub const MOUNT_SLEW_RATE_MAX: &str = "MAX";
    pub const MOUNT_MOTION_DEC: &str = "MOUNT_MOTION_DEC";
    pub const MOUNT_MOTION_NORTH: &str = "NORTH";
    pub const MOUNT_MOTION_SOUTH: &str = "SOUTH";
    pub const MOUNT_MOTION_RA: &str = "MOUNT_MOTION_RA";
    pub const MOUNT_MOTION_WEST: &str = "WEST";
    pub const MOUNT_MOTION_EAST: &str = "EAST";
    pub const MOUNT_ABORT_MOTION: &str = "MOUNT_ABORT_MOTION";
    pub const MOUNT_ABORT_MOTION_ITEM: &str = "ABORT_MOTION";
    pub const MOUNT_PARK: &str = "MOUNT_PARK";
    pub const MOUNT_PARK_PARKED: &str = "PARKED";
    pub const MOUNT_PARK_UNPARKED: &str = "UNPARKED";
    pub const MOUNT_PARK_POSITION: &str = "MOUNT_PARK_POSITION";
    pub const MOUNT_PARK_POSITION_HA: &str = "HA";
    pub const MOUNT_PARK_POSITION_DEC: &str = "DEC";
    pub const MOUNT_GUIDE_RATE: &str = "MOUNT_GUIDE_RATE";
    pub const MOUNT_GUIDE_RATE_RA: &str = "RA";
    pub const MOUNT_GUIDE_RATE_DEC: &str = "DEC";
    pub const MOUNT_POLARSCOPE: &str = "MOUNT_POLARSCOPE";
    pub const MOUNT_POLARSCOPE_BRIGHTNESS: &str = "BRIGHTNESS";
}

// =============================================================================
// Property Types
// =============================================================================

/// Client-visible state of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    Switch,
    Number,
    Text,
    Light,
    Blob,
}

/// How many switches of a switch property may be on at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchRule {
    OneOfMany,
    AtMostOne,
    AnyOfMany,
}

/// Numeric item payload. `target` is what a client asked for, `value` is
/// what the hardware reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumberValue {
    pub value: f64,
    pub target: f64,
    pub min: f64,
    pub max: f64,
}

impl NumberValue {
    pub fn new(min: f64, max: f64, value: f64) -> Self {
        Self {
            value,
            target: value,
            min,
            max,
        }
    }

    /// Whether `v` lies inside `[min, max]`.
    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemValue {
    Switch(bool),
    Number(NumberValue),
    Text(String),
    Light(PropertyState),
    Blob(Bytes),
}

impl ItemValue {
    fn kind_name(&self) -> &'static str {
        match self {
            ItemValue::Switch(_) => "switch",
            ItemValue::Number(_) => "number",
            ItemValue::Text(_) => "text",
            ItemValue::Light(_) => "light",
            ItemValue::Blob(_) => "blob",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub name: String,
    pub label: String,
    pub value: ItemValue,
}

impl Item {
    pub fn switch(name: &str, label: &str, on: bool) -> Self {
        Self::with_value(name, label, ItemValue::Switch(on))
    }

    pub fn number(name: &str, label: &str, min: f64, max: f64, value: f64) -> Self {
        Self::with_value(name, label, ItemValue::Number(NumberValue::new(min, max, value)))
    }

    pub fn text(name: &str, label: &str, value: &str) -> Self {
        Self::with_value(name, label, ItemValue::Text(value.to_string()))
    }

    pub fn light(name: &str, label: &str, state: PropertyState) -> Self {
        Self::with_value(name, label, ItemValue::Light(state))
    }

    pub fn blob(name: &str, label: &str) -> Self {
        Self::with_value(name, label, ItemValue::Blob(Bytes::new()))
    }

    fn with_value(name: &str, label: &str, value: ItemValue) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            value,
        }
    }
}

// =============================================================================
// Item Updates
// =============================================================================

/// A single mutation of one item.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateValue {
    Switch(bool),
    /// Number: hardware-reported value.
    Value(f64),
    /// Number: requested target.
    Target(f64),
    /// Number: value and target together.
    ValueAndTarget(f64),
    Text(String),
    Light(PropertyState),
    Blob(Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemUpdate {
    pub item: String,
    pub value: UpdateValue,
}

impl ItemUpdate {
    pub fn switch(item: &str, on: bool) -> Self {
        Self::new(item, UpdateValue::Switch(on))
    }

    pub fn value(item: &str, value: f64) -> Self {
        Self::new(item, UpdateValue::Value(value))
    }

    pub fn target(item: &str, target: f64) -> Self {
        Self::new(item, UpdateValue::Target(target))
    }

    pub fn number(item: &str, value: f64) -> Self {
        Self::new(item, UpdateValue::ValueAndTarget(value))
    }

    pub fn text(item: &str, text: &str) -> Self {
        Self::new(item, UpdateValue::Text(text.to_string()))
    }

    pub fn light(item: &str, state: PropertyState) -> Self {
        Self::new(item, UpdateValue::Light(state))
    }

    pub fn blob(item: &str, data: Bytes) -> Self {
        Self::new(item, UpdateValue::Blob(data))
    }

    fn new(item: &str, value: UpdateValue) -> Self {
        Self {
            item: item.to_string(),
            value,
        }
    }

    fn fits(&self, value: &ItemValue) -> bool {
        matches!(
            (&self.value, value),
            (UpdateValue::Switch(_), ItemValue::Switch(_))
                | (
                    UpdateValue::Value(_)
                        | UpdateValue::Target(_)
                        | UpdateValue::ValueAndTarget(_),
                    ItemValue::Number(_)
                )
                | (UpdateValue::Text(_), ItemValue::Text(_))
                | (UpdateValue::Light(_), ItemValue::Light(_))
                | (UpdateValue::Blob(_), ItemValue::Blob(_))
        )
    }
}

// =============================================================================
// Property
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub device: String,
    pub name: String,
    pub label: String,
    pub kind: PropertyKind,
    pub perm: Permission,
    pub rule: SwitchRule,
    pub state: PropertyState,
    pub items: Vec<Item>,
}

impl Property {
    /// Read-write property with no items, not yet bound to a device.
    pub fn new(name: &str, label: &str, kind: PropertyKind) -> Self {
        Self {
            device: String::new(),
            name: name.to_string(),
            label: label.to_string(),
            kind,
            perm: Permission::ReadWrite,
            rule: SwitchRule::OneOfMany,
            state: PropertyState::Idle,
            items: Vec::new(),
        }
    }

    pub fn for_device(mut self, device: &str) -> Self {
        self.device = device.to_string();
        self
    }

    pub fn read_only(mut self) -> Self {
        self.perm = Permission::ReadOnly;
        self
    }

    pub fn with_rule(mut self, rule: SwitchRule) -> Self {
        self.rule = rule;
        self
    }

    pub fn with_state(mut self, state: PropertyState) -> Self {
        self.state = state;
        self
    }

    pub fn with_item(mut self, item: Item) -> Self {
        self.items.push(item);
        self
    }

    pub fn item(&self, name: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.name == name)
    }

    pub fn number(&self, item: &str) -> Option<NumberValue> {
        match self.item(item)?.value {
            ItemValue::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn value(&self, item: &str) -> Option<f64> {
        self.number(item).map(|n| n.value)
    }

    pub fn target(&self, item: &str) -> Option<f64> {
        self.number(item).map(|n| n.target)
    }

    pub fn is_on(&self, item: &str) -> bool {
        matches!(
            self.item(item).map(|i| &i.value),
            Some(ItemValue::Switch(true))
        )
    }

    /// Name of the first switch that is on.
    pub fn first_on(&self) -> Option<&str> {
        self.items
            .iter()
            .find(|i| matches!(i.value, ItemValue::Switch(true)))
            .map(|i| i.name.as_str())
    }

    pub fn text(&self, item: &str) -> Option<&str> {
        match &self.item(item)?.value {
            ItemValue::Text(t) => Some(t.as_str()),
            _ => None,
        }
    }

    pub fn blob(&self, item: &str) -> Option<&Bytes> {
        match &self.item(item)?.value {
            ItemValue::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Apply updates atomically: either every update fits an item or none is applied.
    pub fn apply(&mut self, updates: &[ItemUpdate]) -> AppResult<()> {
        for update in updates {
            let fits = self
                .item(&update.item)
                .map(|i| update.fits(&i.value))
                .unwrap_or(false);
            if !fits {
                return Err(AstroError::UnknownItem {
                    property: self.name.clone(),
                    item: update.item.clone(),
                    kind: self
                        .item(&update.item)
                        .map(|i| i.value.kind_name())
                        .unwrap_or("any"),
                });
            }
        }

        for update in updates {
            if let UpdateValue::Switch(true) = update.value {
                if matches!(self.rule, SwitchRule::OneOfMany | SwitchRule::AtMostOne) {
                    for item in &mut self.items {
                        if let ItemValue::Switch(on) = &mut item.value {
                            *on = false;
                        }
                    }
                }
            }
            let Some(item) = self.items.iter_mut().find(|i| i.name == update.item) else {
                continue;
            };
            match (&update.value, &mut item.value) {
                (UpdateValue::Switch(v), ItemValue::Switch(on)) => *on = *v,
                (UpdateValue::Value(v), ItemValue::Number(n)) => n.value = *v,
                (UpdateValue::Target(v), ItemValue::Number(n)) => n.target = *v,
                (UpdateValue::ValueAndTarget(v), ItemValue::Number(n)) => {
                    n.value = *v;
                    n.target = *v;
                }
                (UpdateValue::Text(v), ItemValue::Text(t)) => *t = v.clone(),
                (UpdateValue::Light(v), ItemValue::Light(s)) => *s = *v,
                (UpdateValue::Blob(v), ItemValue::Blob(b)) => *b = v.clone(),
                _ => {}
            }
        }
        Ok(())
    }
}

// =============================================================================
// Property Store
// =============================================================================

/// Store of properties, shared by every endpoint of a driver process.
///
/// `set_values` and `set_state` only mutate; clients learn about the change
/// once `publish` is called.
pub trait PropertyStore: Send + Sync {
    fn get(&self, device: &str, name: &str) -> Option<Property>;
    fn set_values(&self, device: &str, name: &str, updates: &[ItemUpdate]) -> AppResult<()>;
    fn set_state(&self, device: &str, name: &str, state: PropertyState) -> AppResult<()>;
    fn publish(&self, device: &str, name: &str, message: Option<&str>) -> AppResult<()>;
    fn define(&self, property: Property) -> AppResult<()>;
    fn undefine(&self, device: &str, name: &str) -> AppResult<()>;
}

/// Notification sent to store subscribers.
#[derive(Debug, Clone)]
pub enum PropertyEvent {
    Defined(Property),
    Updated {
        property: Property,
        message: Option<String>,
    },
    Deleted {
        device: String,
        name: String,
    },
}

const EVENT_CAPACITY: usize = 1024;

pub struct MemoryPropertyStore {
    properties: RwLock<HashMap<String, HashMap<String, Property>>>,
    events: broadcast::Sender<PropertyEvent>,
}

impl Default for MemoryPropertyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            properties: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to definitions, updates and deletions in publish order.
    pub fn subscribe(&self) -> broadcast::Receiver<PropertyEvent> {
        self.events.subscribe()
    }

    /// Properties of one device, sorted by name.
    pub fn properties(&self, device: &str) -> Vec<Property> {
        let guard = self.properties.read();
        let mut props: Vec<Property> = guard
            .get(device)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        props.sort_by(|a, b| a.name.cmp(&b.name));
        props
    }

    /// Names of devices with at least one defined property.
    pub fn devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self
            .properties
            .read()
            .iter()
            .filter(|(_, props)| !props.is_empty())
            .map(|(d, _)| d.clone())
            .collect();
        devices.sort();
        devices
    }

    fn unknown(device: &str, name: &str) -> AstroError {
        AstroError::UnknownProperty {
            device: device.to_string(),
            name: name.to_string(),
        }
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn get(&self, device: &str, name: &str) -> Option<Property> {
        self.properties.read().get(device)?.get(name).cloned()
    }

    fn set_values(&self, device: &str, name: &str, updates: &[ItemUpdate]) -> AppResult<()> {
        let mut guard = self.properties.write();
        let property = guard
            .get_mut(device)
            .and_then(|m| m.get_mut(name))
            .ok_or_else(|| Self::unknown(device, name))?;
        property.apply(updates)
    }

    fn set_state(&self, device: &str, name: &str, state: PropertyState) -> AppResult<()> {
        let mut guard = self.properties.write();
        let property = guard
            .get_mut(device)
            .and_then(|m| m.get_mut(name))
            .ok_or_else(|| Self::unknown(device, name))?;
        property.state = state;
        Ok(())
    }

    fn publish(&self, device: &str, name: &str, message: Option<&str>) -> AppResult<()> {
        let guard = self.properties.write();
        let property = guard
            .get(device)
            .and_then(|m| m.get(name))
            .ok_or_else(|| Self::unknown(device, name))?;
        let _ = self.events.send(PropertyEvent::Updated {
            property: property.clone(),
            message: message.map(str::to_string),
        });
        Ok(())
    }

    fn define(&self, property: Property) -> AppResult<()> {
        let mut guard = self.properties.write();
        let props = guard.entry(property.device.clone()).or_default();
        if props.contains_key(&property.name) {
            return Err(AstroError::AlreadyDefined {
                device: property.device,
                name: property.name,
            });
        }
        props.insert(property.name.clone(), property.clone());
        let _ = self.events.send(PropertyEvent::Defined(property));
        Ok(())
    }

    fn undefine(&self, device: &str, name: &str) -> AppResult<()> {
        let mut guard = self.properties.write();
        let removed = guard.get_mut(device).and_then(|m| m.remove(name));
        if removed.is_none() {
            return Err(Self::unknown(device, name));
        }
        let _ = self.events.send(PropertyEvent::Deleted {
            device: device.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }
}
