use lapin::{types::AMQPValue, BasicProperties};
use std::borrow::{Borrow, Cow};

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// Lookup a header string value.
    ///
    /// Returns `None` if not a string.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key) {
            Some(AMQPValue::LongString(s)) => Some(String::from_utf8_lossy(s.as_bytes())),
            Some(AMQPValue::ShortString(s)) => Some(Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }

    /// Lookup a header integer value, whatever integer width the broker encoded it with.
    ///
    /// Returns `None` if not an integer or if the value is negative.
    fn get_header_u64<Q>(&self, key: &Q) -> Option<u64>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key)? {
            AMQPValue::ShortShortUInt(v) => Some(u64::from(*v)),
            AMQPValue::ShortUInt(v) => Some(u64::from(*v)),
            AMQPValue::LongUInt(v) => Some(u64::from(*v)),
            AMQPValue::ShortShortInt(v) => u64::try_from(*v).ok(),
            AMQPValue::ShortInt(v) => u64::try_from(*v).ok(),
            AMQPValue::LongInt(v) => u64::try_from(*v).ok(),
            AMQPValue::LongLongInt(v) => u64::try_from(*v).ok(),
            AMQPValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }
}

impl BasicPropertiesExt for lapin::BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }
}

/// Set the value for a header inside a collection of AMQP properties.
///
/// # Implementation notes
///
/// `lapin` does not give us mutable access to the headers of a `BasicProperties` instance,
/// so we clone them. We consume the `properties` input to make sure the caller does not re-use
/// it under the impression that it has been mutated to add the new header.
///
/// # Example
///
/// ```rust
/// use carrot_runner::amqp::types::{AMQPValue, ShortString};
/// use carrot_runner::amqp::{BasicProperties, convenience::set_header};
///
/// let properties = BasicProperties::default();
/// let header_value = AMQPValue::LongString("orders".into());
///
/// let properties = set_header(properties, "x-original-queue", header_value.clone());
///
/// let headers = properties.headers().as_ref().unwrap().inner();
/// let header_name: ShortString = "x-original-queue".into();
/// assert_eq!(&header_value, headers.get(&header_name).unwrap());
/// ```
pub fn set_header(
    properties: BasicProperties,
    header_name: &str,
    header_value: AMQPValue,
) -> BasicProperties {
    let mut headers = properties
        .headers()
        .as_ref()
        .map(|h| h.to_owned())
        .unwrap_or_default();
    headers.insert(header_name.into(), header_value);
    properties.with_headers(headers)
}
