//! Facilities to process messages consumed from a RabbitMq queue.
//!
//! [`HandlerRunner`] turns a delivered message into exactly one acknowledgment, whatever the
//! handler does. [`Consumer`] feeds it with the deliveries of a queue.
pub use ack_strategy::{AckStrategy, ParseAckStrategyError};
pub use consumer::{Consumer, ConsumerBuilder};
pub use error::{AckFault, FaultKind, HandlerFault};
pub use handler::{ClosureHandler, Handler};
pub use incoming_message::{MessageContext, MessageReceivedInfo};
pub use invoker::{HandlerInvoker, HandlerResult};
pub use runner::{HandlerRunner, ProcessingOutcome};

mod ack_strategy;
mod consumer;
mod error;
mod handler;
mod incoming_message;
mod invoker;
pub mod recovery;
mod runner;
