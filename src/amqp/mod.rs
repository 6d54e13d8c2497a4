//! The slice of the AMQP channel the message pipeline talks to, plus re-exports of the
//! `lapin` types that show up in our public interface.

mod channel;
pub mod convenience;

pub use channel::AckChannel;
pub use convenience::BasicPropertiesExt;
pub use lapin::{Channel, Connection};

pub use lapin::{options, types, BasicProperties};
