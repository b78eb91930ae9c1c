//! Parameter registry: request/response routing for tunable values.
//!
//! The registry installs itself as the bus's global broadcast handler and
//! watches for 8-byte parameter envelopes. Read requests answer with the
//! handler's current value; write requests run the write handler and ack
//! with the written value; everything else (unknown id, read-only write,
//! undefined operation byte) answers with an error envelope echoing the
//! requester's channel and request id.
//!
//! A message is treated as a parameter envelope only when its payload is
//! exactly 8 bytes and its id either carries the parameter subsystem code
//! or has a registered handler — sensor floats and storage payloads never
//! alias into it.

pub mod tracker;

use std::cell::RefCell;
use std::rc::Rc;

use ecu_common::consts::MAX_PARAMETERS;
use ecu_common::msg::{CanMessage, SUBSYS_PARAMETER, msg_subsystem};
use ecu_common::param::{
    PARAM_ERROR_INVALID_OPERATION, PARAM_ERROR_OUT_OF_RANGE, PARAM_ERROR_READ_ONLY, ParamMsg,
    ParamOperation, raw_correlation,
};
use tracing::debug;

use crate::bus::{MessageBus, handler};

type ReadHandler = Box<dyn Fn() -> f32>;
type WriteHandler = Box<dyn FnMut(f32) -> bool>;

struct ParameterEntry {
    param_id: u32,
    read: ReadHandler,
    write: Option<WriteHandler>,
    description: &'static str,
}

struct RegistryInner {
    entries: heapless::Vec<ParameterEntry, MAX_PARAMETERS>,
}

/// Parameter registry handle.
#[derive(Clone)]
pub struct ParameterRegistry {
    inner: Rc<RefCell<RegistryInner>>,
    bus: Rc<MessageBus>,
}

impl ParameterRegistry {
    pub fn new(bus: Rc<MessageBus>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RegistryInner {
                entries: heapless::Vec::new(),
            })),
            bus,
        }
    }

    /// Install the registry as the bus's global broadcast handler.
    pub fn install_broadcast_handler(&self) {
        let inner = self.inner.clone();
        let bus = self.bus.clone();
        self.bus.set_global_broadcast_handler(handler(move |msg| {
            Self::dispatch(&inner, &bus, msg);
        }));
    }

    /// Register a read-only parameter.
    pub fn register_parameter<R>(&self, param_id: u32, read: R, description: &'static str) -> bool
    where
        R: Fn() -> f32 + 'static,
    {
        self.push_entry(ParameterEntry {
            param_id,
            read: Box::new(read),
            write: None,
            description,
        })
    }

    /// Register a read/write parameter.
    pub fn register_writable<R, W>(
        &self,
        param_id: u32,
        read: R,
        write: W,
        description: &'static str,
    ) -> bool
    where
        R: Fn() -> f32 + 'static,
        W: FnMut(f32) -> bool + 'static,
    {
        self.push_entry(ParameterEntry {
            param_id,
            read: Box::new(read),
            write: Some(Box::new(write)),
            description,
        })
    }

    fn push_entry(&self, entry: ParameterEntry) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.entries.iter().any(|e| e.param_id == entry.param_id) {
            debug!(param_id = entry.param_id, "duplicate parameter registration");
            return false;
        }
        inner.entries.push(entry).is_ok()
    }

    /// Number of registered parameters.
    pub fn parameter_count(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// Description of a registered parameter.
    pub fn description(&self, param_id: u32) -> Option<&'static str> {
        self.inner
            .borrow()
            .entries
            .iter()
            .find(|e| e.param_id == param_id)
            .map(|e| e.description)
    }

    /// True when a parameter id is registered.
    pub fn is_registered(&self, param_id: u32) -> bool {
        self.inner
            .borrow()
            .entries
            .iter()
            .any(|e| e.param_id == param_id)
    }

    // ─── Dispatch ───────────────────────────────────────────────────

    fn dispatch(inner: &Rc<RefCell<RegistryInner>>, bus: &Rc<MessageBus>, msg: &CanMessage) {
        // Only exact 8-byte payloads can be envelopes.
        let Some((channel, request_id)) = raw_correlation(msg) else {
            return;
        };

        let registered = inner
            .borrow()
            .entries
            .iter()
            .any(|e| e.param_id == msg.id);
        if !registered && msg_subsystem(msg.id) != SUBSYS_PARAMETER {
            return;
        }

        let Some(param) = ParamMsg::from_msg(msg) else {
            // 8 bytes on a parameter id with an undefined operation byte.
            Self::send_error(
                bus,
                msg.id,
                PARAM_ERROR_INVALID_OPERATION,
                channel,
                request_id,
            );
            return;
        };

        match param.operation {
            ParamOperation::ReadRequest => {
                let value = {
                    let inner = inner.borrow();
                    inner
                        .entries
                        .iter()
                        .find(|e| e.param_id == msg.id)
                        .map(|e| (e.read)())
                };
                match value {
                    Some(value) => {
                        let response =
                            ParamMsg::response(ParamOperation::ReadResponse, value, &param);
                        bus.publish(msg.id, &response.to_bytes());
                    }
                    None => Self::send_error(
                        bus,
                        msg.id,
                        PARAM_ERROR_INVALID_OPERATION,
                        channel,
                        request_id,
                    ),
                }
            }
            ParamOperation::WriteRequest => {
                enum WriteOutcome {
                    Ok,
                    Rejected,
                    ReadOnly,
                    Unknown,
                }
                let outcome = {
                    let mut inner = inner.borrow_mut();
                    match inner.entries.iter_mut().find(|e| e.param_id == msg.id) {
                        Some(entry) => match entry.write.as_mut() {
                            Some(write) => {
                                if write(param.value) {
                                    WriteOutcome::Ok
                                } else {
                                    WriteOutcome::Rejected
                                }
                            }
                            None => WriteOutcome::ReadOnly,
                        },
                        None => WriteOutcome::Unknown,
                    }
                };
                match outcome {
                    WriteOutcome::Ok => {
                        let ack =
                            ParamMsg::response(ParamOperation::WriteAck, param.value, &param);
                        bus.publish(msg.id, &ack.to_bytes());
                    }
                    WriteOutcome::Rejected => Self::send_error(
                        bus,
                        msg.id,
                        PARAM_ERROR_OUT_OF_RANGE,
                        channel,
                        request_id,
                    ),
                    WriteOutcome::ReadOnly => Self::send_error(
                        bus,
                        msg.id,
                        PARAM_ERROR_READ_ONLY,
                        channel,
                        request_id,
                    ),
                    WriteOutcome::Unknown => Self::send_error(
                        bus,
                        msg.id,
                        PARAM_ERROR_INVALID_OPERATION,
                        channel,
                        request_id,
                    ),
                }
            }
            // Responses and broadcasts flow to the gateways, not here.
            ParamOperation::StatusBroadcast
            | ParamOperation::ReadResponse
            | ParamOperation::WriteAck
            | ParamOperation::Error => {}
        }
    }

    fn send_error(bus: &Rc<MessageBus>, param_id: u32, code: f32, channel: u8, request_id: u8) {
        let error = ParamMsg {
            operation: ParamOperation::Error,
            value: code,
            source_channel: channel,
            request_id,
        };
        bus.publish(param_id, &error.to_bytes());
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
