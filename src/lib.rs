//! `carrot-runner` is the message processing pipeline of a RabbitMq consumer, built on top of
//! [`lapin`].
//!
//! It takes a delivered message, runs your handler against it and turns whatever comes out of
//! it - a decision, an error, a panic, a timeout - into exactly one acknowledgment on the
//! channel the message came from.
//!
//! [`HandlerRunner`](crate::consumers::HandlerRunner) and [`Consumer`](crate::consumers::Consumer)
//! are the best starting points to learn more about what `carrot-runner` provides.
//! Check out the [`recovery`](crate::consumers::recovery) module to customise what happens to
//! messages that could not be processed.

pub mod amqp;
pub mod consumers;
