// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

// Drives the orchestrator through in-memory stand-ins for the inventory,
// mastership, packet I/O, and link store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use linkd::types::Device;
use linkd::types::MastershipRole;
use linkd::types::Port;
use linkd::DeviceEvent;
use linkd::DeviceService;
use linkd::DiscoveryConfig;
use linkd::InboundPacket;
use linkd::LinkEvent;
use linkd::LinkProviderService;
use linkd::MastershipEvent;
use linkd::MastershipService;
use linkd::Orchestrator;
use linkd::PacketService;
use linkd::Services;
use protocol::ConnectPoint;
use protocol::DeviceId;
use protocol::PortNumber;
use tokio::sync::mpsc;

const NO_LLDP: &str = "no-lldp";

fn did1() -> DeviceId {
    DeviceId::from("of:0000000000000001")
}

fn did2() -> DeviceId {
    DeviceId::from("of:0000000000000002")
}

fn did3() -> DeviceId {
    DeviceId::from("of:0000000000000003")
}

fn cp(device: DeviceId, port: PortNumber) -> ConnectPoint {
    ConnectPoint::new(device, port)
}

#[derive(Default)]
struct Inventory {
    devices: Mutex<BTreeMap<DeviceId, (Device, Vec<Port>)>>,
}

impl Inventory {
    fn put_device(&self, device: Device) {
        let mut devices = self.devices.lock().unwrap();
        match devices.get_mut(&device.id) {
            Some(entry) => entry.0 = device,
            None => {
                devices.insert(device.id.clone(), (device, Vec::new()));
            }
        }
    }

    fn put_ports(&self, id: &DeviceId, ports: Vec<Port>) {
        if let Some(entry) = self.devices.lock().unwrap().get_mut(id) {
            entry.1 = ports;
        }
    }

    fn get(&self, id: &DeviceId) -> Device {
        let devices = self.devices.lock().unwrap();
        devices
            .get(id)
            .map(|(d, _)| d.clone())
            .unwrap_or_else(|| Device::new(id.clone()))
    }
}

impl DeviceService for Inventory {
    fn devices(&self) -> Vec<Device> {
        let devices = self.devices.lock().unwrap();
        devices.values().map(|(d, _)| d.clone()).collect()
    }

    fn ports(&self, id: &DeviceId) -> Vec<Port> {
        let devices = self.devices.lock().unwrap();
        devices.get(id).map(|(_, p)| p.clone()).unwrap_or_default()
    }
}

#[derive(Default)]
struct Mastership {
    roles: Mutex<BTreeMap<DeviceId, MastershipRole>>,
}

impl Mastership {
    fn set(&self, id: &DeviceId, role: MastershipRole) {
        self.roles.lock().unwrap().insert(id.clone(), role);
    }
}

impl MastershipService for Mastership {
    fn local_role(&self, id: &DeviceId) -> MastershipRole {
        self.roles
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(MastershipRole::Master)
    }
}

#[derive(Default)]
struct Wire {
    sent: Mutex<Vec<(ConnectPoint, Vec<u8>)>>,
}

impl Wire {
    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn sent_from(&self, port: &ConnectPoint) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == port)
            .map(|(_, f)| f.clone())
            .collect()
    }
}

impl PacketService for Wire {
    fn transmit(&self, port: &ConnectPoint, frame: Vec<u8>) {
        self.sent.lock().unwrap().push((port.clone(), frame));
    }
}

#[derive(Default)]
struct LinkStore {
    events: Mutex<Vec<LinkEvent>>,
}

impl LinkStore {
    fn events(&self) -> Vec<LinkEvent> {
        self.events.lock().unwrap().clone()
    }

    fn vanished_device(&self, id: &DeviceId) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, LinkEvent::DeviceVanished(d) if d == id))
            .count()
    }

    fn vanished_port(&self, port: &ConnectPoint) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, LinkEvent::Vanished(p) if p == port))
    }

    fn detected(&self, src: &ConnectPoint, dst: &ConnectPoint) -> usize {
        self.events()
            .iter()
            .filter(|e| {
                matches!(e, LinkEvent::Detected { src: s, dst: d }
                    if s == src && d == dst)
            })
            .count()
    }
}

impl LinkProviderService for LinkStore {
    fn link_detected(&self, src: &ConnectPoint, dst: &ConnectPoint) {
        self.events.lock().unwrap().push(LinkEvent::Detected {
            src: src.clone(),
            dst: dst.clone(),
        });
    }

    fn link_vanished(&self, endpoint: &ConnectPoint) {
        self.events
            .lock()
            .unwrap()
            .push(LinkEvent::Vanished(endpoint.clone()));
    }

    fn links_vanished(&self, device: &DeviceId) {
        self.events
            .lock()
            .unwrap()
            .push(LinkEvent::DeviceVanished(device.clone()));
    }
}

struct Harness {
    inventory: Arc<Inventory>,
    mastership: Arc<Mastership>,
    wire: Arc<Wire>,
    links: Arc<LinkStore>,
    provider: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(DiscoveryConfig {
            probe_interval_ms: 3_600_000,
            ..Default::default()
        })
    }

    // DID1 and DID2 are in the inventory with two enabled ports each.
    // DID3 is unknown until a test adds it.
    fn with_config(config: DiscoveryConfig) -> Self {
        let inventory = Arc::new(Inventory::default());
        for id in [did1(), did2()] {
            inventory.put_device(Device::new(id.clone()));
            let ports = vec![
                Port::new(id.clone(), 1, true),
                Port::new(id.clone(), 2, true),
            ];
            inventory.put_ports(&id, ports);
        }
        let mastership = Arc::new(Mastership::default());
        let wire = Arc::new(Wire::default());
        let links = Arc::new(LinkStore::default());
        let services = Services {
            devices: inventory.clone(),
            mastership: mastership.clone(),
            packets: wire.clone(),
            links: links.clone(),
        };
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let provider = Orchestrator::new(&log, config, services).unwrap();
        provider.start();
        Harness {
            inventory,
            mastership,
            wire,
            links,
            provider,
        }
    }

    fn device_event(&self, event: DeviceEvent) {
        self.provider.device_event(&event);
    }

    fn added(&self, id: DeviceId) {
        self.device_event(DeviceEvent::DeviceAdded(self.inventory.get(&id)));
    }

    fn removed(&self, id: DeviceId) {
        self.device_event(DeviceEvent::DeviceRemoved(self.inventory.get(&id)));
    }

    fn updated(&self, id: DeviceId) {
        self.device_event(DeviceEvent::DeviceUpdated(self.inventory.get(&id)));
    }

    fn contains_port(&self, id: &DeviceId, port: PortNumber) -> bool {
        self.provider
            .agent_for(id)
            .is_some_and(|a| a.contains_port(port))
    }

    // A probe from `src` arriving on `ingress`
    fn deliver(&self, src: &ConnectPoint, ingress: &ConnectPoint) -> bool {
        let frame =
            protocol::encode(&src.device, src.port, 0x0123_4567, 0).unwrap();
        let mut packet = InboundPacket::new(ingress.clone(), frame);
        self.provider.process(&mut packet);
        packet.is_handled()
    }
}

#[tokio::test]
async fn switch_add() {
    let h = Harness::new();
    h.added(did1());

    let agent = h.provider.agent_for(&did1()).unwrap();
    assert!(!agent.is_stopped());
    assert_eq!(agent.ports(), vec![1, 2]);
}

#[tokio::test]
async fn start_seeds_from_inventory() {
    let h = Harness::new();
    let agents = h.provider.agents();
    let devices: Vec<DeviceId> = agents.keys().cloned().collect();
    assert_eq!(devices, vec![did1(), did2()]);

    // Both ports on both devices probe immediately.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.wire.count(), 4);
    let frames = h.wire.sent_from(&cp(did2(), 2));
    assert_eq!(frames.len(), 1);
    let probe = protocol::decode(&frames[0]).unwrap();
    assert_eq!(probe.source(), cp(did2(), 2));
}

#[tokio::test]
async fn switch_add_twice() {
    let h = Harness::new();
    let first = h.provider.agent_for(&did1()).unwrap();
    h.added(did1());
    h.added(did1());

    let again = h.provider.agent_for(&did1()).unwrap();
    assert_eq!(first, again);
    assert_eq!(again.ports(), vec![1, 2]);
    assert_eq!(h.provider.agents().len(), 2);
}

#[tokio::test]
async fn switch_remove() {
    let h = Harness::new();
    h.added(did1());
    let agent = h.provider.agent_for(&did1()).unwrap();
    h.removed(did1());

    assert!(agent.is_stopped());
    assert!(h.provider.agent_for(&did1()).is_none());
    assert_eq!(h.links.vanished_device(&did1()), 1);

    // A duplicate removal changes nothing.
    h.removed(did1());
    assert_eq!(h.links.vanished_device(&did1()), 1);
}

#[tokio::test]
async fn switch_remove_stops_probes() {
    let h = Harness::with_config(DiscoveryConfig {
        probe_interval_ms: 5,
        ..Default::default()
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.removed(did1());
    let sent = h.wire.sent_from(&cp(did1(), 1)).len();
    assert!(sent > 0);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.wire.sent_from(&cp(did1(), 1)).len(), sent);
    // the other device keeps probing
    assert!(h.wire.sent_from(&cp(did2(), 1)).len() > sent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn switch_remove_stops_probes_across_workers() {
    let h = Harness::with_config(DiscoveryConfig {
        probe_interval_ms: 1,
        ..Default::default()
    });
    for round in 0..10 {
        h.added(did1());
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.removed(did1());
        let sent = h.wire.sent_from(&cp(did1(), 1)).len();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let after = h.wire.sent_from(&cp(did1(), 1)).len();
        assert_eq!(after, sent, "sent after removal in {round}");
    }
    assert_eq!(h.links.vanished_device(&did1()), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn port_removed_racing_frame() {
    let h = Arc::new(Harness::new());
    let port = Port::new(did2(), 1, true);
    for round in 0..100 {
        h.device_event(DeviceEvent::PortAdded(port.clone()));
        let rx = {
            let h = h.clone();
            tokio::spawn(
                async move { h.deliver(&cp(did1(), 1), &cp(did2(), 1)) },
            )
        };
        let removed = {
            let h = h.clone();
            let port = port.clone();
            tokio::spawn(async move {
                h.device_event(DeviceEvent::PortRemoved(port))
            })
        };
        rx.await.unwrap();
        removed.await.unwrap();

        let agent = h.provider.agent_for(&did2()).unwrap();
        assert!(!agent.contains_port(1));
        assert!(agent.neighbors().is_empty(), "neighbor left in {round}");
    }
}

#[tokio::test]
async fn switch_suppressed() {
    let h = Harness::new();
    h.inventory.put_device(Device::new(did3()));
    h.added(did3());
    assert!(h.provider.agent_for(&did3()).is_some());

    h.inventory
        .put_device(Device::new(did3()).with_annotation(NO_LLDP, "true"));
    h.updated(did3());

    assert!(h.provider.agent_for(&did3()).is_none());
    assert_eq!(h.links.vanished_device(&did3()), 1);
}

#[tokio::test]
async fn port_up() {
    let h = Harness::new();
    h.added(did1());
    h.device_event(DeviceEvent::PortAdded(Port::new(did1(), 3, true)));

    assert!(h.contains_port(&did1(), 3));
}

#[tokio::test]
async fn port_down() {
    let h = Harness::new();
    h.added(did1());
    h.device_event(DeviceEvent::PortAdded(Port::new(did1(), 1, false)));

    assert!(!h.contains_port(&did1(), 1));
    assert!(h.links.vanished_port(&cp(did1(), 1)));
}

#[tokio::test]
async fn port_removed() {
    let h = Harness::new();
    h.added(did1());
    h.device_event(DeviceEvent::PortAdded(Port::new(did1(), 3, true)));
    h.device_event(DeviceEvent::PortRemoved(Port::new(did1(), 3, true)));

    assert!(h.links.vanished_port(&cp(did1(), 3)));
    assert!(!h.contains_port(&did1(), 3));
}

#[tokio::test]
async fn port_suppressed_by_device_config() {
    let h = Harness::new();
    h.inventory
        .put_device(Device::new(did3()).with_annotation(NO_LLDP, "true"));
    h.added(did3());

    // non-suppressed port on a suppressed device
    let port3 = Port::new(did3(), 3, true);
    h.inventory.put_ports(&did3(), vec![port3.clone()]);
    h.device_event(DeviceEvent::PortAdded(port3));
    assert!(h.provider.agent_for(&did3()).is_none());

    h.inventory.put_device(Device::new(did3()));
    h.updated(did3());
    let agent = h.provider.agent_for(&did3()).unwrap();
    assert!(!agent.is_stopped());
    assert!(agent.contains_port(3));
}

#[tokio::test]
async fn port_suppressed_by_port_config() {
    let h = Harness::new();
    h.inventory.put_device(Device::new(did3()));
    h.added(did3());

    let port3 = Port::new(did3(), 3, true).with_annotation(NO_LLDP, "TRUE");
    h.inventory.put_ports(&did3(), vec![port3.clone()]);
    h.device_event(DeviceEvent::PortAdded(port3));

    let agent = h.provider.agent_for(&did3()).unwrap();
    assert!(!agent.is_stopped());
    assert!(!agent.contains_port(3));
}

#[tokio::test]
async fn port_suppressed_later() {
    let h = Harness::new();
    assert!(h.deliver(&cp(did2(), 2), &cp(did1(), 2)));

    let suppressed =
        Port::new(did1(), 2, true).with_annotation(NO_LLDP, "true");
    h.device_event(DeviceEvent::PortUpdated(suppressed));
    assert!(!h.contains_port(&did1(), 2));
    assert!(h.contains_port(&did1(), 1));
    assert!(h.links.vanished_port(&cp(did1(), 2)));
}

#[tokio::test]
async fn port_unknown() {
    let h = Harness::new();
    h.added(did1());
    h.device_event(DeviceEvent::PortAdded(Port::new(did3(), 1, false)));

    assert!(h.provider.agent_for(&did3()).is_none());
    assert!(h.links.events().is_empty());
}

#[tokio::test]
async fn unknown_packet_context() {
    let h = Harness::new();
    assert!(!h.deliver(&cp(did1(), 1), &cp(did3(), 1)));
    assert!(h.links.events().is_empty());
}

#[tokio::test]
async fn known_packet_context() {
    let h = Harness::new();
    h.added(did1());
    h.added(did2());

    assert!(h.deliver(&cp(did1(), 1), &cp(did2(), 1)));
    assert_eq!(h.links.detected(&cp(did1(), 1), &cp(did2(), 1)), 1);

    let neighbors = h.provider.agent_for(&did2()).unwrap().neighbors();
    assert_eq!(neighbors[&1].remote, cp(did1(), 1));
}

#[tokio::test]
async fn duplicate_probe() {
    let h = Harness::new();
    assert!(h.deliver(&cp(did1(), 1), &cp(did2(), 1)));
    assert!(h.deliver(&cp(did1(), 1), &cp(did2(), 1)));

    assert_eq!(h.links.events().len(), 1);
    let stats = h.provider.agent_for(&did2()).unwrap().stats();
    assert_eq!(stats.frames_in_total, 2);
}

#[tokio::test]
async fn self_probe() {
    let h = Harness::new();
    // A loopback cable between two ports of the same switch
    assert!(h.deliver(&cp(did2(), 2), &cp(did2(), 1)));

    assert!(h.links.events().is_empty());
    assert!(h.provider.agent_for(&did2()).unwrap().neighbors().is_empty());
}

#[tokio::test]
async fn foreign_frames() {
    let h = Harness::new();

    // some other protocol entirely
    let mut frame = vec![0u8; 60];
    frame[12] = 0x08;
    let mut packet = InboundPacket::new(cp(did1(), 1), frame);
    h.provider.process(&mut packet);
    assert!(!packet.is_handled());

    // one of ours, mangled in flight
    let mut frame = protocol::encode(&did2(), 1, 7, 7).unwrap();
    let last = frame.len() - 1;
    frame[last] ^= 0xff;
    let mut packet = InboundPacket::new(cp(did1(), 1), frame);
    h.provider.process(&mut packet);
    assert!(!packet.is_handled());

    assert!(h.links.events().is_empty());
    let stats = h.provider.agent_for(&did1()).unwrap().stats();
    assert_eq!(stats.frames_in_errors_total, 1);
}

#[tokio::test]
async fn mastership_change() {
    let h = Harness::new();
    h.mastership.set(&did1(), MastershipRole::Standby);
    h.provider.mastership_event(&MastershipEvent { device: did1() });

    assert!(h.provider.agent_for(&did1()).is_none());
    assert_eq!(h.links.vanished_device(&did1()), 1);

    h.mastership.set(&did1(), MastershipRole::Master);
    h.provider.mastership_event(&MastershipEvent { device: did1() });
    let agent = h.provider.agent_for(&did1()).unwrap();
    assert_eq!(agent.ports(), vec![1, 2]);
}

#[tokio::test]
async fn standby_does_not_probe() {
    let h = Harness::new();
    h.inventory.put_device(Device::new(did3()));
    h.inventory.put_ports(&did3(), vec![Port::new(did3(), 1, true)]);
    h.mastership.set(&did3(), MastershipRole::Standby);
    h.added(did3());

    assert!(h.provider.agent_for(&did3()).is_none());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.wire.sent_from(&cp(did3(), 1)).is_empty());

    // Port events for a device we don't master create no state.
    h.device_event(DeviceEvent::PortAdded(Port::new(did3(), 2, true)));
    assert!(h.provider.agent_for(&did3()).is_none());
}

#[tokio::test]
async fn availability() {
    let h = Harness::new();
    let mut device = h.inventory.get(&did2());
    device.available = false;
    h.device_event(DeviceEvent::DeviceAvailabilityChanged(device.clone()));

    assert!(h.provider.agent_for(&did2()).is_none());
    assert_eq!(h.links.vanished_device(&did2()), 1);

    device.available = true;
    h.device_event(DeviceEvent::DeviceAvailabilityChanged(device));
    assert!(h.provider.agent_for(&did2()).is_some());
}

#[tokio::test]
async fn update_resyncs_ports() {
    let h = Harness::new();
    h.inventory.put_ports(
        &did1(),
        vec![
            Port::new(did1(), 1, true),
            Port::new(did1(), 2, false),
            Port::new(did1(), 5, true),
        ],
    );
    h.updated(did1());

    let agent = h.provider.agent_for(&did1()).unwrap();
    assert_eq!(agent.ports(), vec![1, 5]);
    assert!(h.links.vanished_port(&cp(did1(), 2)));
    assert!(!h.links.vanished_port(&cp(did1(), 1)));
}

#[tokio::test]
async fn deactivate() {
    let h = Harness::with_config(DiscoveryConfig {
        probe_interval_ms: 5,
        ..Default::default()
    });
    let agent = h.provider.agent_for(&did1()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.provider.stop();

    assert!(!h.provider.is_active());
    assert!(h.provider.agents().is_empty());
    assert!(agent.is_stopped());
    let sent = h.wire.count();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.wire.count(), sent);

    // ignored while inactive
    h.added(did1());
    assert!(h.provider.agents().is_empty());
    assert!(!h.deliver(&cp(did1(), 1), &cp(did2(), 1)));

    h.provider.start();
    assert_eq!(h.provider.agents().len(), 2);
}

#[tokio::test]
async fn channel_link_store() {
    let inventory = Arc::new(Inventory::default());
    inventory.put_device(Device::new(did2()));
    inventory.put_ports(&did2(), vec![Port::new(did2(), 1, true)]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let services = Services {
        devices: inventory,
        mastership: Arc::new(Mastership::default()),
        packets: Arc::new(Wire::default()),
        links: Arc::new(tx),
    };
    let log = slog::Logger::root(slog::Discard, slog::o!());
    let provider =
        Orchestrator::new(&log, DiscoveryConfig::default(), services).unwrap();
    provider.start();

    let frame = protocol::encode(&did1(), 4, 99, 0).unwrap();
    provider.handle_frame(&cp(did2(), 1), &frame).unwrap();
    assert_eq!(
        rx.recv().await,
        Some(LinkEvent::Detected {
            src: cp(did1(), 4),
            dst: cp(did2(), 1)
        })
    );

    provider.device_event(&DeviceEvent::DeviceRemoved(Device::new(did2())));
    assert_eq!(rx.recv().await, Some(LinkEvent::DeviceVanished(did2())));
}

// Two switches cabled together on port 1.  Frames are carried across by
// hand, then the cable is cut and both ends age out.
#[tokio::test]
async fn detect_then_age_out() {
    let h = Harness::with_config(DiscoveryConfig {
        probe_interval_ms: 10,
        aging_multiplier: 3,
        ..Default::default()
    });
    tokio::time::sleep(Duration::from_millis(25)).await;

    let a = cp(did1(), 1);
    let b = cp(did2(), 1);
    for (from, to) in [(&a, &b), (&b, &a)] {
        let frames = h.wire.sent_from(from);
        assert!(!frames.is_empty());
        let mut packet = InboundPacket::new(to.clone(), frames[0].clone());
        h.provider.process(&mut packet);
        assert!(packet.is_handled());
    }
    assert_eq!(h.links.detected(&a, &b), 1);
    assert_eq!(h.links.detected(&b, &a), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.links.vanished_port(&a));
    assert!(h.links.vanished_port(&b));
    for id in [did1(), did2()] {
        let agent = h.provider.agent_for(&id).unwrap();
        assert!(agent.neighbors().is_empty());
        assert_eq!(agent.stats().ageouts_total, 1);
        assert!(agent.contains_port(1));
    }
}

#[tokio::test]
async fn unencodable_identity_ignored() {
    let h = Harness::new();
    let blank = DeviceId::from("");
    h.device_event(DeviceEvent::DeviceAdded(Device::new(blank.clone())));
    h.device_event(DeviceEvent::PortAdded(Port::new(blank.clone(), 1, true)));

    assert!(h.provider.agent_for(&blank).is_none());
    assert_eq!(h.provider.agents().len(), 2);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.wire.sent_from(&cp(blank, 1)).is_empty());
}
