//! External CAN bus gateway.
//!
//! Routes received frames by class: OBD-II requests go to the Mode 01
//! handler, vendor frames to the custom decoder, and parameter envelopes
//! into the registry (with request-tracker correlation so the response
//! finds its way back onto the wire with the requester's original
//! request id). Outbound traffic is the OBD-II responses, scheduled
//! custom frames, and forwarded parameter responses.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use ecu_common::config::ExternalCanConfig;
use ecu_common::consts::REQUEST_TIMEOUT_MS;
use ecu_common::msg::CanMessage;
use ecu_common::param::{Channel, ParamMsg, ParamOperation};
use tracing::debug;

use crate::bus::{MessageBus, handler};
use crate::params::tracker::SharedRequestTracker;

use super::cache::ExternalCanBusCache;
use super::custom::{CUSTOM_CACHE_MAPPINGS, CustomMessageHandler, CustomRxMapping, CustomTxConfig};
use super::obdii::{OBDII_CACHE_MAPPINGS, ObdiiHandler};
use super::transport::CanTransport;

/// Gateway statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanBusStats {
    pub messages_sent: u32,
    pub messages_received: u32,
    pub obdii_requests: u32,
    pub custom_messages: u32,
    pub parameter_messages: u32,
    pub unhandled_messages: u32,
    pub errors: u32,
}

/// State shared with the parameter-response subscriptions.
struct GatewayShared {
    /// Frames queued by response handlers, drained by `update`.
    tx_queue: VecDeque<CanMessage>,
    /// our request id → (original request id, original channel byte).
    pending_origin: BTreeMap<u8, (u8, u8)>,
}

/// External CAN gateway. Owns the transport; everything else is shared.
pub struct ExternalCanBus {
    transport: Box<dyn CanTransport>,
    obdii: Option<ObdiiHandler>,
    custom: Option<CustomMessageHandler>,
    cache: ExternalCanBusCache,
    bus: Rc<MessageBus>,
    tracker: SharedRequestTracker,
    shared: Rc<RefCell<GatewayShared>>,
    subscribed_param_ids: BTreeSet<u32>,
    stats: CanBusStats,
    last_cleanup_ms: u32,
}

impl ExternalCanBus {
    pub fn new(
        config: &ExternalCanConfig,
        transport: Box<dyn CanTransport>,
        cache: ExternalCanBusCache,
        bus: Rc<MessageBus>,
        tracker: SharedRequestTracker,
    ) -> Self {
        let obdii = config.enable_obdii.then(|| {
            cache.load_mappings(OBDII_CACHE_MAPPINGS);
            ObdiiHandler::new(cache.clone())
        });
        let custom = config.enable_custom_messages.then(|| {
            cache.load_mappings(CUSTOM_CACHE_MAPPINGS);
            CustomMessageHandler::new(cache.clone())
        });

        Self {
            transport,
            obdii,
            custom,
            cache,
            bus,
            tracker,
            shared: Rc::new(RefCell::new(GatewayShared {
                tx_queue: VecDeque::new(),
                pending_origin: BTreeMap::new(),
            })),
            subscribed_param_ids: BTreeSet::new(),
            stats: CanBusStats::default(),
            last_cleanup_ms: 0,
        }
    }

    /// Drain received frames, route them, and push outbound traffic.
    pub fn update(&mut self, now_us: u64) {
        let now_ms = (now_us / 1000) as u32;

        while let Some(msg) = self.transport.receive() {
            self.stats.messages_received += 1;
            self.route_incoming(&msg, now_ms);
        }

        // Scheduled custom transmissions.
        if let Some(custom) = self.custom.as_mut() {
            for frame in custom.update(now_ms) {
                Self::transmit_raw(&mut self.transport, &mut self.stats, &frame);
            }
        }

        // Parameter responses queued by the bus subscriptions.
        loop {
            let frame = self.shared.borrow_mut().tx_queue.pop_front();
            let Some(frame) = frame else { break };
            Self::transmit_raw(&mut self.transport, &mut self.stats, &frame);
        }

        self.cache.update(now_ms);

        // Expire stale request correlation once a second.
        if now_ms.saturating_sub(self.last_cleanup_ms) >= 1000 {
            self.last_cleanup_ms = now_ms;
            self.tracker
                .borrow_mut()
                .cleanup_timeouts(REQUEST_TIMEOUT_MS, now_ms);
            let tracker = self.tracker.borrow();
            self.shared
                .borrow_mut()
                .pending_origin
                .retain(|id, _| tracker.is_pending(*id, Channel::CanBus as u8));
        }
    }

    fn route_incoming(&mut self, msg: &CanMessage, now_ms: u32) {
        if let Some(obdii) = self.obdii.as_mut()
            && ObdiiHandler::is_obdii_request(msg)
        {
            self.stats.obdii_requests += 1;
            if let Some(response) = obdii.process_request(msg) {
                Self::transmit_raw(&mut self.transport, &mut self.stats, &response);
            }
            return;
        }

        if Self::is_parameter_request(msg) {
            self.stats.parameter_messages += 1;
            self.forward_parameter_request(msg, now_ms);
            return;
        }

        if let Some(custom) = self.custom.as_mut()
            && custom.is_custom_message(msg)
        {
            self.stats.custom_messages += 1;
            custom.process_message(msg, &self.bus);
            return;
        }

        self.stats.unhandled_messages += 1;
    }

    /// Extended frames carrying a full envelope with a request operation.
    fn is_parameter_request(msg: &CanMessage) -> bool {
        msg.extended
            && msg.len == 8
            && matches!(
                ParamOperation::from_u8(msg.buf[0]),
                Some(ParamOperation::ReadRequest) | Some(ParamOperation::WriteRequest)
            )
    }

    fn forward_parameter_request(&mut self, msg: &CanMessage, now_ms: u32) {
        let Some(param) = ParamMsg::from_msg(msg) else {
            return;
        };
        let our_id = self
            .tracker
            .borrow_mut()
            .add_request(Channel::CanBus as u8, msg.id, now_ms);
        self.shared
            .borrow_mut()
            .pending_origin
            .insert(our_id, (param.request_id, param.source_channel));
        self.ensure_response_subscription(msg.id);

        let rewritten = ParamMsg {
            operation: param.operation,
            value: param.value,
            source_channel: Channel::CanBus as u8,
            request_id: our_id,
        };
        self.bus.publish(msg.id, &rewritten.to_bytes());
    }

    /// Subscribe once per parameter id for responses leaving on CAN.
    fn ensure_response_subscription(&mut self, param_id: u32) {
        if !self.subscribed_param_ids.insert(param_id) {
            return;
        }
        let shared = self.shared.clone();
        let tracker = self.tracker.clone();
        self.bus.subscribe(
            param_id,
            handler(move |msg| {
                let Some(param) = ParamMsg::from_msg(msg) else {
                    return;
                };
                if param.source_channel != Channel::CanBus as u8 {
                    return;
                }
                if !matches!(
                    param.operation,
                    ParamOperation::ReadResponse | ParamOperation::WriteAck | ParamOperation::Error
                ) {
                    return;
                }
                if tracker
                    .borrow_mut()
                    .remove_request(param.request_id, Channel::CanBus as u8)
                    .is_none()
                {
                    return;
                }
                let mut shared = shared.borrow_mut();
                let (orig_id, orig_channel) = shared
                    .pending_origin
                    .remove(&param.request_id)
                    .unwrap_or((param.request_id, param.source_channel));
                let out = ParamMsg {
                    operation: param.operation,
                    value: param.value,
                    source_channel: orig_channel,
                    request_id: orig_id,
                };
                shared.tx_queue.push_back(CanMessage::new(msg.id, &out.to_bytes()));
            }),
        );
    }

    fn transmit_raw(
        transport: &mut Box<dyn CanTransport>,
        stats: &mut CanBusStats,
        frame: &CanMessage,
    ) {
        if transport.transmit(frame) {
            stats.messages_sent += 1;
        } else {
            stats.errors += 1;
            debug!(id = frame.id, "CAN transmit failed");
        }
    }

    /// Send a vendor float frame immediately.
    pub fn send_custom_float(&mut self, can_id: u32, value: f32) -> bool {
        let frame = CustomMessageHandler::float_frame(can_id, value);
        let before = self.stats.errors;
        Self::transmit_raw(&mut self.transport, &mut self.stats, &frame);
        self.stats.errors == before
    }

    /// Register an inbound vendor decode mapping.
    pub fn register_custom_rx(&mut self, mapping: CustomRxMapping) -> bool {
        match self.custom.as_mut() {
            Some(custom) => custom.register_rx_mapping(mapping),
            None => false,
        }
    }

    /// Schedule a periodic vendor frame.
    pub fn configure_custom_tx(&mut self, config: CustomTxConfig) -> bool {
        match self.custom.as_mut() {
            Some(custom) => {
                custom.configure_tx(config);
                true
            }
            None => false,
        }
    }

    /// Cached value lookup (scanner-facing convenience).
    pub fn get_cached_value(&self, external_key: u32, max_age_ms: Option<u32>) -> Option<f32> {
        self.cache.get_value(external_key, max_age_ms)
    }

    pub fn stats(&self) -> CanBusStats {
        self.stats
    }

    pub fn obdii_stats(&self) -> Option<super::obdii::ObdiiStats> {
        self.obdii.as_ref().map(|o| o.stats())
    }

    pub fn is_obdii_enabled(&self) -> bool {
        self.obdii.is_some()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::obdii::{OBDII_PID_ENGINE_RPM, OBDII_REQUEST_ID, OBDII_RESPONSE_ID};
    use crate::external::transport::MockCanTransport;
    use crate::params::ParameterRegistry;
    use crate::params::tracker::RequestTracker;
    use ecu_common::msg::{MSG_ENGINE_RPM, MSG_MANIFOLD_PRESSURE, SUBSYS_PARAMETER, make_msg_id};

    struct Rig {
        bus: Rc<MessageBus>,
        gateway: ExternalCanBus,
        can: Rc<RefCell<MockCanTransport>>,
        registry: ParameterRegistry,
    }

    /// Transport wrapper so tests can inspect frames the gateway owns.
    struct SharedTransport(Rc<RefCell<MockCanTransport>>);

    impl CanTransport for SharedTransport {
        fn receive(&mut self) -> Option<CanMessage> {
            self.0.borrow_mut().receive()
        }
        fn transmit(&mut self, msg: &CanMessage) -> bool {
            self.0.borrow_mut().transmit(msg)
        }
    }

    fn setup() -> Rig {
        let bus = Rc::new(MessageBus::new());
        let cache = ExternalCanBusCache::new(bus.clone(), 1000);
        let can = Rc::new(RefCell::new(MockCanTransport::new()));
        let tracker = RequestTracker::shared();
        let config = ExternalCanConfig::default();
        let gateway = ExternalCanBus::new(
            &config,
            Box::new(SharedTransport(can.clone())),
            cache,
            bus.clone(),
            tracker,
        );
        let registry = ParameterRegistry::new(bus.clone());
        registry.install_broadcast_handler();
        Rig {
            bus,
            gateway,
            can,
            registry,
        }
    }

    #[test]
    fn obdii_rpm_round_trip() {
        let mut rig = setup();

        // Prime the cache subscription, then feed the live value.
        rig.can
            .borrow_mut()
            .inject_frame(OBDII_REQUEST_ID, &[0x02, 0x01, OBDII_PID_ENGINE_RPM]);
        rig.gateway.update(1_000);
        rig.bus.publish_float(MSG_ENGINE_RPM, 3200.0);
        rig.bus.process();

        rig.can
            .borrow_mut()
            .inject_frame(OBDII_REQUEST_ID, &[0x02, 0x01, OBDII_PID_ENGINE_RPM]);
        rig.gateway.update(2_000);

        let can = rig.can.borrow();
        let response = can
            .tx
            .iter()
            .find(|f| f.id == OBDII_RESPONSE_ID && f.buf[1] == 0x41)
            .expect("positive response");
        assert_eq!(response.buf[2], OBDII_PID_ENGINE_RPM);
        assert_eq!(response.buf[3], 0x32);
        assert_eq!(response.buf[4], 0x00);
        assert_eq!(rig.gateway.stats().obdii_requests, 2);
    }

    #[test]
    fn parameter_read_request_round_trip() {
        let mut rig = setup();
        let param_id = make_msg_id(1, SUBSYS_PARAMETER, 0x0042);
        rig.registry.register_parameter(param_id, || 55.5, "Test");

        // External device asks with its own request id 9, channel 0.
        let request = ParamMsg {
            operation: ParamOperation::ReadRequest,
            value: 0.0,
            source_channel: 0,
            request_id: 9,
        };
        rig.can
            .borrow_mut()
            .inject(CanMessage::new(param_id, &request.to_bytes()));

        rig.gateway.update(1_000); // routes into the bus
        rig.bus.process(); // registry answers
        rig.gateway.update(2_000); // response leaves on CAN

        let can = rig.can.borrow();
        let frame = can.tx.iter().find(|f| f.id == param_id).expect("response");
        let response = ParamMsg::from_bytes(&frame.buf).unwrap();
        assert_eq!(response.operation, ParamOperation::ReadResponse);
        assert_eq!(response.value, 55.5);
        // The original correlation fields are restored.
        assert_eq!(response.request_id, 9);
        assert_eq!(response.source_channel, 0);
        assert_eq!(rig.gateway.stats().parameter_messages, 1);
    }

    #[test]
    fn custom_frame_decodes_to_internal_float() {
        let mut rig = setup();
        rig.gateway.register_custom_rx(CustomRxMapping {
            external_can_id: 0x400,
            internal_msg_id: MSG_MANIFOLD_PRESSURE,
            byte_offset: 0,
            byte_length: 2,
            big_endian: false,
            scale: 0.1,
            min: 0.0,
            max: 600.0,
        });

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        rig.bus.subscribe(
            MSG_MANIFOLD_PRESSURE,
            handler(move |m| s.borrow_mut().push(m.unpack_float().unwrap())),
        );

        // 2500 LE × 0.1 = 250.0.
        rig.can
            .borrow_mut()
            .inject_frame(0x400, &2500u16.to_le_bytes());
        rig.gateway.update(1_000);
        rig.bus.process();

        assert_eq!(seen.borrow().as_slice(), &[250.0]);
        assert_eq!(rig.gateway.stats().custom_messages, 1);
    }

    #[test]
    fn unknown_frame_is_counted_unhandled() {
        let mut rig = setup();
        rig.can.borrow_mut().inject_frame(0x299, &[1, 2, 3]);
        rig.gateway.update(1_000);
        assert_eq!(rig.gateway.stats().unhandled_messages, 1);
    }

    #[test]
    fn transmit_failure_counts_error() {
        let mut rig = setup();
        rig.can.borrow_mut().fail_transmit = true;
        assert!(!rig.gateway.send_custom_float(0x500, 1.0));
        assert_eq!(rig.gateway.stats().errors, 1);
    }

    #[test]
    fn obdii_can_be_disabled() {
        let bus = Rc::new(MessageBus::new());
        let cache = ExternalCanBusCache::new(bus.clone(), 1000);
        let can = Rc::new(RefCell::new(MockCanTransport::new()));
        let config = ExternalCanConfig {
            enable_obdii: false,
            ..Default::default()
        };
        let mut gateway = ExternalCanBus::new(
            &config,
            Box::new(SharedTransport(can.clone())),
            cache,
            bus,
            RequestTracker::shared(),
        );
        assert!(!gateway.is_obdii_enabled());

        can.borrow_mut()
            .inject_frame(OBDII_REQUEST_ID, &[0x02, 0x01, 0x0C]);
        gateway.update(1_000);
        // No response; the frame fell through to unhandled.
        assert!(can.borrow().tx.is_empty());
        assert_eq!(gateway.stats().unhandled_messages, 1);
    }
}
