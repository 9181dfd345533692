use crate::errors::Result;
use std::cell::RefCell;

/// The slice of the pub/sub client the retrieval engine needs.
///
/// Calls must not block: implementations queue the operation and return.
pub trait Bus {
    fn subscribe(&self, topic: &str) -> Result<()>;
    fn unsubscribe(&self, topic: &str) -> Result<()>;
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: Vec<u8> },
}

/// In-memory bus that records every operation in call order.
#[derive(Debug, Default)]
pub struct RecordingBus {
    ops: RefCell<Vec<BusOp>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<BusOp> {
        self.ops.borrow().clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.ops
            .borrow()
            .iter()
            .filter_map(|op| match op {
                BusOp::Publish { topic, payload } => Some((topic.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }
}

impl Bus for RecordingBus {
    fn subscribe(&self, topic: &str) -> Result<()> {
        self.ops.borrow_mut().push(BusOp::Subscribe(topic.to_string()));
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.ops
            .borrow_mut()
            .push(BusOp::Unsubscribe(topic.to_string()));
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.ops.borrow_mut().push(BusOp::Publish {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}
