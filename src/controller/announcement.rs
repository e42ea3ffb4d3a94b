//! Home Assistant discovery announcements
//!
//! Every topic is a pure function of the device id:
//!
//! ```text
//! homeassistant/cover/<id>/config     retained discovery document
//! homeassistant/cover/<id>/position   "0".."100", 0 = open
//! homeassistant/cover/<id>/set        "OPEN" | "CLOSE"  (writable blinds only)
//! ```
//!
//! [`AnnouncementSet`] builds all announcements once and keeps the reverse
//! topic → device map used to route inbound messages.

use crate::config::ConfigError;
use crate::devices::{Device, DeviceRegistry};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

pub const DISCOVERY_NAMESPACE: &str = "homeassistant/cover";

/// QoS level advertised to consumers and used for every publish/subscribe
pub const BRIDGE_QOS: u8 = 2;

pub const POSITION_OPEN: u8 = 0;
pub const POSITION_CLOSED: u8 = 100;

pub const PAYLOAD_OPEN: &str = "OPEN";
pub const PAYLOAD_CLOSE: &str = "CLOSE";

/// Discovery document published to `<prefix>/config`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryPayload {
    pub name: String,
    pub unique_id: String,
    pub object_id: String,
    pub device_class: &'static str,
    pub platform: &'static str,
    pub qos: u8,
    pub position_topic: String,
    pub position_open: u8,
    pub position_closed: u8,
    #[serde(flatten)]
    pub commands: Option<CommandVocabulary>,
    pub device: DeviceInfo,
}

/// Command side of the discovery document, absent for read-only blinds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandVocabulary {
    pub command_topic: String,
    pub payload_open: &'static str,
    pub payload_close: &'static str,
    /// Always `null`: the blinds cannot be stopped mid-travel
    pub payload_stop: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub suggested_area: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub device_id: String,
    pub topic_prefix: String,
    pub position_topic: String,
    pub command_topic: Option<String>,
    pub config_topic: String,
    pub discovery: DiscoveryPayload,
}

impl Announcement {
    pub fn discovery_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.discovery)
    }

    /// Every topic owned by this device, with what it carries
    pub fn topics(&self) -> impl Iterator<Item = (&str, TopicRole)> {
        [
            Some((self.position_topic.as_str(), TopicRole::Position)),
            self.command_topic
                .as_deref()
                .map(|topic| (topic, TopicRole::Command)),
            Some((self.config_topic.as_str(), TopicRole::Config)),
        ]
        .into_iter()
        .flatten()
    }
}

pub fn topic_prefix(device_id: &str) -> String {
    format!("{DISCOVERY_NAMESPACE}/{device_id}")
}

pub fn build(device: &Device) -> Announcement {
    let prefix = topic_prefix(&device.id);
    let position_topic = format!("{prefix}/position");
    let command_topic = device.writable.then(|| format!("{prefix}/set"));

    let discovery = DiscoveryPayload {
        name: device.name.clone(),
        unique_id: format!("blindbridge_{}", device.id),
        object_id: device.id.clone(),
        device_class: "cover",
        platform: "mqtt",
        qos: BRIDGE_QOS,
        position_topic: position_topic.clone(),
        position_open: POSITION_OPEN,
        position_closed: POSITION_CLOSED,
        commands: command_topic.as_ref().map(|topic| CommandVocabulary {
            command_topic: topic.clone(),
            payload_open: PAYLOAD_OPEN,
            payload_close: PAYLOAD_CLOSE,
            payload_stop: None,
        }),
        device: DeviceInfo {
            identifiers: vec![format!("blindbridge_{}", device.id)],
            name: device.name.clone(),
            suggested_area: device.location.clone(),
        },
    };

    Announcement {
        device_id: device.id.clone(),
        config_topic: format!("{prefix}/config"),
        topic_prefix: prefix,
        position_topic,
        command_topic,
        discovery,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRole {
    Position,
    Command,
    Config,
}

/// Where an inbound topic belongs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<'a> {
    pub device_id: &'a str,
    pub role: TopicRole,
}

/// All announcements of the registry plus the reverse topic map
#[derive(Debug, Clone)]
pub struct AnnouncementSet {
    announcements: Vec<Announcement>,
    by_device: HashMap<String, usize>,
    routes: HashMap<String, (usize, TopicRole)>,
}

impl AnnouncementSet {
    pub fn build(registry: &DeviceRegistry) -> Result<Self, ConfigError> {
        let mut announcements: Vec<Announcement> = Vec::with_capacity(registry.len());
        let mut by_device = HashMap::with_capacity(registry.len());
        let mut routes: HashMap<String, (usize, TopicRole)> = HashMap::new();

        for device in registry.all() {
            let announcement = build(device);
            let slot = announcements.len();

            for (topic, role) in announcement.topics() {
                if let Some(&(other, _)) = routes.get(topic) {
                    return Err(ConfigError::TopicCollision {
                        topic: topic.to_string(),
                        first: announcements[other].device_id.clone(),
                        second: device.id.clone(),
                    });
                }
                routes.insert(topic.to_string(), (slot, role));
            }

            if by_device.insert(device.id.clone(), slot).is_some() {
                return Err(ConfigError::DuplicateDevice(device.id.clone()));
            }
            debug!(device = %device.id, prefix = %announcement.topic_prefix, "Built announcement");
            announcements.push(announcement);
        }

        Ok(Self {
            announcements,
            by_device,
            routes,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Announcement> {
        self.announcements.iter()
    }

    pub fn get(&self, device_id: &str) -> Option<&Announcement> {
        self.by_device.get(device_id).map(|&i| &self.announcements[i])
    }

    pub fn route(&self, topic: &str) -> Option<Route<'_>> {
        self.routes.get(topic).map(|&(slot, role)| Route {
            device_id: &self.announcements[slot].device_id,
            role,
        })
    }

    pub fn len(&self) -> usize {
        self.announcements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.announcements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::test_blind;
    use rand::seq::SliceRandom;
    use rand::Rng;
    use std::collections::HashSet;

    fn registry(ids: &[&str]) -> DeviceRegistry {
        let blinds: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| test_blind(id, &format!("AA:{i:04X}"), "Living Room"))
            .collect();
        DeviceRegistry::from_config(&blinds).unwrap()
    }

    #[test]
    fn topics_follow_the_wire_contract() {
        let set = AnnouncementSet::build(&registry(&["window1"])).unwrap();
        let a = set.get("window1").unwrap();

        assert_eq!(a.topic_prefix, "homeassistant/cover/window1");
        assert_eq!(a.position_topic, "homeassistant/cover/window1/position");
        assert_eq!(a.command_topic.as_deref(), Some("homeassistant/cover/window1/set"));
        assert_eq!(a.config_topic, "homeassistant/cover/window1/config");
    }

    #[test]
    fn discovery_document_for_writable_blind() {
        let set = AnnouncementSet::build(&registry(&["window1"])).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&set.get("window1").unwrap().discovery_json().unwrap()).unwrap();

        assert_eq!(json["object_id"], "window1");
        assert_eq!(json["name"], "Living Room Blind");
        assert_eq!(json["device_class"], "cover");
        assert_eq!(json["qos"], 2);
        assert_eq!(json["position_topic"], "homeassistant/cover/window1/position");
        assert_eq!(json["command_topic"], "homeassistant/cover/window1/set");
        assert_eq!(json["position_open"], 0);
        assert_eq!(json["position_closed"], 100);
        assert_eq!(json["payload_open"], "OPEN");
        assert_eq!(json["payload_close"], "CLOSE");
        assert!(json["payload_stop"].is_null());
        assert!(json.as_object().unwrap().contains_key("payload_stop"));
        assert_eq!(json["device"]["suggested_area"], "Living Room");
    }

    #[test]
    fn read_only_blind_has_no_command_side() {
        let mut config = test_blind("skylight", "AA:01", "Attic");
        config.read_only = true;
        let registry = DeviceRegistry::from_config(&[config]).unwrap();
        let set = AnnouncementSet::build(&registry).unwrap();
        let a = set.get("skylight").unwrap();

        assert_eq!(a.command_topic, None);
        let json: serde_json::Value = serde_json::from_str(&a.discovery_json().unwrap()).unwrap();
        let fields = json.as_object().unwrap();
        assert!(!fields.contains_key("command_topic"));
        assert!(!fields.contains_key("payload_open"));
        assert!(!fields.contains_key("payload_stop"));
        assert_eq!(set.route("homeassistant/cover/skylight/set"), None);
    }

    #[test]
    fn routes_resolve_to_device_and_role() {
        let set = AnnouncementSet::build(&registry(&["window1", "window2"])).unwrap();

        assert_eq!(
            set.route("homeassistant/cover/window2/set"),
            Some(Route {
                device_id: "window2",
                role: TopicRole::Command
            })
        );
        assert_eq!(
            set.route("homeassistant/cover/window1/position").map(|r| r.role),
            Some(TopicRole::Position)
        );
        assert_eq!(set.route("homeassistant/cover/window3/set"), None);
        assert_eq!(set.route("homeassistant/cover/window1"), None);
    }

    #[test]
    fn rebuilding_is_deterministic() {
        let ids = ["window1", "Window1", "door-2"];
        let first = AnnouncementSet::build(&registry(&ids)).unwrap();
        let second = AnnouncementSet::build(&registry(&ids)).unwrap();

        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a, b);
            assert_eq!(a.discovery_json().unwrap(), b.discovery_json().unwrap());
        }
        assert_eq!(build(registry(&ids).lookup("door-2").unwrap()), *first.get("door-2").unwrap());
    }

    #[test]
    fn topics_are_pairwise_unique_for_random_fleets() {
        const ALPHABET: &[u8] = b"abcAB01_-";
        let mut rng = rand::thread_rng();

        for _ in 0..200 {
            // short ids over a tiny alphabet plus deliberate near-collisions
            let mut ids: Vec<String> = (0..rng.gen_range(1..20))
                .map(|_| {
                    (0..rng.gen_range(1..4))
                        .map(|_| *ALPHABET.choose(&mut rng).unwrap() as char)
                        .collect()
                })
                .collect();
            let base = ids[0].clone();
            ids.extend([
                format!("{base}_"),
                format!("{base}-"),
                format!("{base}0"),
                base.to_uppercase(),
                format!("{base}{base}"),
            ]);
            let mut seen = HashSet::new();
            ids.retain(|id| seen.insert(id.clone()));

            let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            let set = AnnouncementSet::build(&registry(&refs)).unwrap();

            let mut topics = HashSet::new();
            for a in set.iter() {
                for (topic, role) in a.topics() {
                    assert!(topics.insert(topic.to_string()), "duplicate topic {topic}");
                    let route = set.route(topic).unwrap();
                    assert_eq!(route.device_id, a.device_id);
                    assert_eq!(route.role, role);
                }
            }
        }
    }
}
